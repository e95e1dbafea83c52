pub mod aggregation;
pub mod config;
pub mod detection;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod schema;
pub mod suppression;
pub mod types;

#[cfg(feature = "synthetic")]
pub mod synthetic;

pub use error::AmlError;
pub use types::*;

/// Standard result type for all monitoring operations
pub type AmlResult<T> = Result<T, AmlError>;
