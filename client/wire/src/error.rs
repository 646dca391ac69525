//! Wire model error types.

use thiserror::Error;

/// Errors produced while parsing or validating wire data.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Malformed channel name
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// Malformed JSON payload
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
