pub mod engine;
pub mod order_book;
pub mod snapshot;

pub use engine::{OrderBookEngine, SnapshotSource};
pub use snapshot::RestSnapshotSource;
