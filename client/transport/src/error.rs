//! Transport construction errors.

use thiserror::Error;

/// Errors raised while building a transport.
#[derive(Error, Debug)]
pub enum TransportBuildError {
    /// The server URL could not be parsed
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The HTTP client could not be constructed
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}
