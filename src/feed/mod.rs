pub mod backoff;
pub mod manager;
pub mod protocol;
pub mod tick_buffer;

pub use manager::{FeedEvent, FeedSettings, FeedStatus, PriceFeedManager};
pub use protocol::protocol_for;
