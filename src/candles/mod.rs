pub mod aggregator;
pub mod buffer;

pub use aggregator::CandleAggregator;
pub use buffer::CandleBuffer;
