// =============================================================================
// Signal ingestion — Telegram channel posts to validated signals
// =============================================================================

pub mod parser;
pub mod telegram;

pub use telegram::SignalIngester;

/// Parsed signals buffered ahead of the supervisor.
pub const SIGNAL_QUEUE_CAPACITY: usize = 64;
