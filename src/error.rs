//! Error taxonomy for the leaderboard backtest engine.
//!
//! Library-facing errors are closed `thiserror` enums so callers can match
//! on the distinction that matters operationally (retryable vs. permanent).
//! Orchestration code (the engine, the supervisor, the binaries) wraps these
//! in `anyhow::Result` with `.context(..)` at the call site.

use thiserror::Error;

/// Errors surfaced by a `MarketFeed` implementation.
///
/// The retry/backoff policy in `market_feed::http` distinguishes these:
/// `RateLimited` gets a longer backoff (`5s * attempt`), `Transport` and
/// `Timeout` use the normal exponential backoff, and `InvalidSymbol` is
/// never retried — it's treated as a negative answer (spec.md §4.2 rule 4,
/// §7).
#[derive(Debug, Error)]
pub enum MarketFeedError {
    #[error("rate limited by feed")]
    RateLimited,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid symbol ({code}): {message}")]
    InvalidSymbol { code: i64, message: String },

    #[error("failed to decode feed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("feed returned error status {status}: {body}")]
    Status { status: u16, body: String },
}

impl MarketFeedError {
    /// True for errors that represent a permanent "no" rather than a
    /// transient failure — the history probe in `EligibilityFilter` relies
    /// on this to turn -1121/400 into a negative eligibility verdict
    /// instead of a retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, MarketFeedError::InvalidSymbol { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, MarketFeedError::RateLimited)
    }
}

/// Errors surfaced by an `ObjectStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found")]
    NotFound,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Terminal error for a single `ConcurrencyPool` job after its retry budget
/// is exhausted. Generic over the job's own error type so pool users keep
/// their domain error in the `{item -> error}` map (spec.md §4.1).
#[derive(Debug, Error)]
#[error("job failed after {attempts} attempt(s): {cause}")]
pub struct ConcurrencyError<E: std::fmt::Display> {
    pub attempts: u32,
    pub cause: E,
}
