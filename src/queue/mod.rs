pub mod manager;
pub mod writer;

pub use manager::{AckSignal, BatchQueueManager};
pub use writer::TierWriter;
