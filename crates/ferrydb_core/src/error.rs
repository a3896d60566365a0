//! Error types for the FerryDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in FerryDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Low-level SQL failure (constraint violation, I/O, schema mismatch).
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O error from the blob store or store directory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Document body could not be serialized or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A non-deleted revision already exists for this document id.
    #[error("document already exists: {doc_id}")]
    DocumentExists {
        /// The conflicting document id.
        doc_id: String,
    },

    /// An update or delete targeted a revision that is not a current leaf.
    #[error("conflict: revision {rev_id} of {doc_id} is not a current leaf")]
    Conflict {
        /// The document id.
        doc_id: String,
        /// The stale revision id.
        rev_id: String,
    },

    /// Document or revision not found.
    #[error("document not found: {doc_id}{}", rev_id.as_deref().map(|r| format!(" rev {r}")).unwrap_or_default())]
    DocumentMissing {
        /// The document id.
        doc_id: String,
        /// The revision id, if an exact revision was requested.
        rev_id: Option<String>,
    },

    /// A referenced attachment blob is not present in the blob store.
    #[error("attachment blob missing: {key}")]
    AttachmentMissing {
        /// Hex-encoded blob key.
        key: String,
    },

    /// Another process holds the store directory lock.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The on-disk store has an unrecognized or newer format.
    #[error("invalid store format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Invalid argument provided to an API.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },
}

impl CoreError {
    /// Creates a document-exists error.
    pub fn document_exists(doc_id: impl Into<String>) -> Self {
        Self::DocumentExists {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
        }
    }

    /// Creates a document-missing error for a document id.
    pub fn document_missing(doc_id: impl Into<String>) -> Self {
        Self::DocumentMissing {
            doc_id: doc_id.into(),
            rev_id: None,
        }
    }

    /// Creates a document-missing error for an exact revision.
    pub fn revision_missing(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self::DocumentMissing {
            doc_id: doc_id.into(),
            rev_id: Some(rev_id.into()),
        }
    }

    /// Creates an invalid-format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::document_missing("doc-1");
        assert_eq!(err.to_string(), "document not found: doc-1");

        let err = CoreError::revision_missing("doc-1", "2-abc");
        assert!(err.to_string().contains("rev 2-abc"));

        let err = CoreError::conflict("doc-1", "1-old");
        assert!(err.to_string().contains("not a current leaf"));
    }
}
