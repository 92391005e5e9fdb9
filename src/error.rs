use thiserror::Error;

use crate::domain::VenueId;

/// Main error type for the execution core
#[derive(Error, Debug)]
pub enum BastionError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Venue errors
    #[error("Exchange error on {venue}: {source}")]
    Exchange {
        venue: VenueId,
        #[source]
        source: ExchangeError,
    },

    #[error("No adapter registered for venue {0}")]
    VenueNotConfigured(VenueId),

    // Ledger errors
    #[error("Ledger error: {0}")]
    Ledger(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for BastionError
pub type Result<T> = std::result::Result<T, BastionError>;

impl BastionError {
    pub fn exchange(venue: VenueId, source: ExchangeError) -> Self {
        BastionError::Exchange { venue, source }
    }
}

/// Faults reported by a venue adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("no open position for {0}")]
    NoPosition(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    /// Network and availability faults; always worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::Unavailable(_) | ExchangeError::RateLimited(_)
        )
    }

    /// The venue understood the request and refused it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ExchangeError::InsufficientFunds(_) | ExchangeError::InvalidOrder(_)
        )
    }
}

/// Why an execution ended without a fill
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid order: {0}")]
    Invalid(String),

    #[error("size too small: {0}")]
    SizeTooSmall(String),

    #[error("venue rejected order: {0}")]
    VenueRejected(ExchangeError),

    #[error("transient failure after {attempts} attempts: {last}")]
    TransientNetwork { attempts: u32, last: ExchangeError },

    #[error("exit failed after {attempts} attempts: {last}")]
    ExitExhausted { attempts: u32, last: ExchangeError },

    #[error("order did not fill: {0}")]
    Unfilled(String),

    #[error("entry abandoned on shutdown")]
    Cancelled,
}

impl From<ExecutionError> for BastionError {
    fn from(err: ExecutionError) -> Self {
        BastionError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_error_classes() {
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(ExchangeError::RateLimited("429".into()).is_transient());
        assert!(!ExchangeError::InsufficientFunds("x".into()).is_transient());
        assert!(ExchangeError::InvalidOrder("lot".into()).is_rejection());
        assert!(!ExchangeError::Other("boom".into()).is_rejection());
        assert!(!ExchangeError::Other("boom".into()).is_transient());
    }

    #[test]
    fn test_exchange_error_carries_venue() {
        let err = BastionError::exchange(VenueId::Bybit, ExchangeError::Network("eof".into()));
        assert_eq!(err.to_string(), "Exchange error on bybit: network error: eof");
    }
}
