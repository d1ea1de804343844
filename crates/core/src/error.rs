//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Digest is not 64 lowercase hex characters.
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid hex encoding.
    #[error("Invalid hex encoding")]
    InvalidHex,

    /// Order id is zero or does not fit a signed 64-bit column.
    #[error("Invalid order id: {0}")]
    InvalidOrderId(u64),

    /// Unknown canonical encoding name.
    #[error("Unknown canonical encoding: {0}")]
    UnknownEncoding(String),
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
