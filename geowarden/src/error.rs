// geowarden/src/error.rs
//
// Error kinds surfaced by the policy path.
//
// Address resolution failures never appear here: the resolver folds them into
// CountryCode::Unknown. Malformed attribute lines are dropped by the assembler.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("history store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("history store call timed out after {0:?}")]
    StoreTimeout(Duration),
    #[error("geoip database: {0}")]
    GeoipDatabase(String),
    #[error("{0} is not a valid country code")]
    InvalidCountryCode(String),
    #[error("notification delivery failed: {0}")]
    Notification(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PolicyError {
    /// True for failures of the shared history store, which trigger the
    /// configured failure policy instead of a normal verdict.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::StoreTimeout(_))
    }
}

impl From<redis::RedisError> for PolicyError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<maxminddb::MaxMindDBError> for PolicyError {
    fn from(err: maxminddb::MaxMindDBError) -> Self {
        Self::GeoipDatabase(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;
