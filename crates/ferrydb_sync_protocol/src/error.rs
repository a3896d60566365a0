//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON payload did not match the expected shape.
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Multipart body could not be parsed.
    #[error("malformed multipart body: {message}")]
    Multipart {
        /// Description of the parse failure.
        message: String,
    },

    /// Inline attachment data was not valid base64.
    #[error("invalid base64 attachment data: {0}")]
    Base64(#[from] base64::DecodeError),

    /// An attachment digest had an unrecognized form.
    #[error("invalid attachment digest: {digest}")]
    Digest {
        /// The offending digest string.
        digest: String,
    },
}

impl ProtocolError {
    /// Creates a multipart parse error.
    pub fn multipart(message: impl Into<String>) -> Self {
        Self::Multipart {
            message: message.into(),
        }
    }
}
