use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejections raised by value-object constructors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid asset identifier: {0}")]
    InvalidAsset(String),

    #[error("Value must be non-negative")]
    MustBeNonNegative,

    #[error("Value must be finite")]
    MustBeFinite,
}

/// Errors from the position ledger. These never escape as panics: a missing
/// position is a typed result the caller decides about.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum LedgerError {
    #[error("No open position for {0}")]
    NotFound(String),

    #[error("Invalid ledger operation: {0}")]
    Invalid(String),

    #[error("Price unavailable for {asset}: {reason}")]
    PriceUnavailable { asset: String, reason: String },
}

impl From<ValidationError> for LedgerError {
    fn from(e: ValidationError) -> Self {
        LedgerError::Invalid(e.to_string())
    }
}

/// Failures reported by the trade execution collaborator.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum ExecutionError {
    #[error("Order filled zero quantity for {0}")]
    ZeroFill(String),

    #[error("Partial fill for {asset}: requested {requested}, filled {filled}")]
    PartialFill {
        asset: String,
        requested: f64,
        filled: f64,
    },

    #[error("Insufficient funds: required {required:.6}, available {available:.6}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures reported by the market data collaborator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("No market found for {0}")]
    NotFound(String),

    #[error("Malformed market data response: {0}")]
    Malformed(String),

    #[error("Market data request failed: {0}")]
    Network(String),

    #[error("Market data request timed out")]
    Timeout,
}

impl MarketDataError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MarketDataError::Network(_) | MarketDataError::Timeout)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    #[error("Live feed not configured")]
    NotConfigured,

    #[error("Invalid feed endpoint: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntrySignalError {
    #[error("Entry signal request failed: {0}")]
    Network(String),

    #[error("Malformed entry signal: {0}")]
    Malformed(String),
}

/// Top-level error for agent operations that cross component boundaries.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
