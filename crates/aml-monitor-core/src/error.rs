use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmlError {
    #[error("Duplicate transaction id: {id}")]
    DuplicateId { id: String },

    #[error("Invalid amount for transaction {id}: {amount} (must be greater than zero)")]
    InvalidAmount { id: String, amount: Decimal },

    #[error("Invalid record: {field} — {reason}")]
    InvalidRecord { field: String, reason: String },

    #[error("Scan budget exceeded: {expansions} expansions against a budget of {budget}")]
    ScanBudgetExceeded { expansions: u64, budget: u64 },

    #[error("Configuration error: {field} — {reason}")]
    ConfigurationError { field: String, reason: String },

    #[error("Detector {detector} failed: {reason}")]
    DetectorFailure { detector: String, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AmlError {
    pub(crate) fn invalid_record(field: &str, reason: impl Into<String>) -> Self {
        AmlError::InvalidRecord {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(field: &str, reason: impl Into<String>) -> Self {
        AmlError::ConfigurationError {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for AmlError {
    fn from(e: serde_json::Error) -> Self {
        AmlError::SerializationError(e.to_string())
    }
}
