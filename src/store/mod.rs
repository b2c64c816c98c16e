pub mod client;
pub mod pool;
pub mod schema;

pub use client::{InsertFormat, Row, StoreClient};
pub use pool::ConnectionPool;
pub use schema::{SchemaManager, TableReport, Tier};
