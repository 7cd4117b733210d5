use thiserror::Error;

/// Errors raised by the rollup engine.
///
/// Normalization and bucketing never fail; only request validation and the
/// event store can produce one of these.
#[derive(Error, Debug)]
pub enum RollupError {
    #[error("window length must be at least 1 day, got {days}")]
    InvalidWindow { days: i64 },

    #[error("unknown dimension: {name}")]
    UnknownDimension { name: String },

    #[error("unknown granularity: {name}")]
    UnknownGranularity { name: String },

    #[error("malformed day bucket key: {key}")]
    InvalidBucketKey { key: String },

    #[error("event store unavailable")]
    EventStoreUnavailable(#[source] anyhow::Error),
}

impl RollupError {
    /// Returns true when the error was caused by the caller's input rather
    /// than the event store.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::EventStoreUnavailable(_))
    }
}
