//! Error types for the broker crate.

use thiserror::Error;

use moustique_persistence::StoreError;

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("client name cannot be empty")]
    EmptyClientName,

    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to decode stored value: {0}")]
    Decode(#[from] serde_json::Error),
}
