//! Recoverable error channel.
//!
//! Only I/O and (de)serialization can fail at runtime. Wiring errors
//! (shape mismatches, out-of-range connections, backward before forward)
//! are programming defects and panic instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid model stream: {message}")]
    InvalidFormat { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
