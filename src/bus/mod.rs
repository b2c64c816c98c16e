pub mod subscriber;

pub use subscriber::{BusSubscriber, SubscriberStats};
