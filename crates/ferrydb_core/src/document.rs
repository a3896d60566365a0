//! Document revision and attachment types.

use crate::blob::BlobKey;
use crate::revid::RevisionId;
use serde_json::{Map, Value};
use std::io::Read;

/// A JSON document body.
///
/// Keys beginning with `_` are reserved for metadata and are rejected at
/// the store boundary.
pub type DocumentBody = Map<String, Value>;

/// Returns the first reserved (underscore-prefixed) key in `body`, if any.
pub fn reserved_key(body: &DocumentBody) -> Option<&str> {
    body.keys().map(String::as_str).find(|k| k.starts_with('_'))
}

/// A single stored revision of a document.
#[derive(Debug, Clone)]
pub struct DocumentRevision {
    /// The document id.
    pub doc_id: String,
    /// The revision id.
    pub rev_id: RevisionId,
    /// Store-local sequence assigned at insert.
    pub sequence: u64,
    /// Sequence of the parent revision, absent for generation 1.
    pub parent_sequence: Option<u64>,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Whether this revision is a leaf of the revision tree.
    pub current: bool,
    /// Whether the body is present (false for history stubs and
    /// compacted ancestors).
    pub available: bool,
    /// The JSON body. Empty for tombstones and unavailable revisions.
    pub body: DocumentBody,
    /// Attachments bound to this revision.
    pub attachments: Vec<SavedAttachment>,
}

impl DocumentRevision {
    /// The generation of this revision's id.
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    /// Looks up an attachment by name.
    pub fn attachment(&self, name: &str) -> Option<&SavedAttachment> {
        self.attachments.iter().find(|a| a.name == name)
    }
}

/// On-disk encoding of an attachment's wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentEncoding {
    /// Bytes transferred as-is.
    Plain,
    /// Bytes gzip-compressed in transit.
    Gzip,
}

impl AttachmentEncoding {
    /// Integer form stored in the `attachments.encoding` column.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Plain => 0,
            Self::Gzip => 1,
        }
    }

    /// Parses the stored integer form.
    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            Self::Gzip
        } else {
            Self::Plain
        }
    }

    /// The wire name used in `_attachments` metadata, if any.
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            Self::Plain => None,
            Self::Gzip => Some("gzip"),
        }
    }
}

/// An attachment row joined to a revision.
///
/// The blob store holds the plain (decoded) bytes under `key`; `encoding`
/// records how the content travelled on the wire so a push can re-encode.
#[derive(Debug, Clone)]
pub struct SavedAttachment {
    /// Attachment name, unique per revision.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Blob store key: SHA-1 of the plain bytes.
    pub key: BlobKey,
    /// Wire encoding.
    pub encoding: AttachmentEncoding,
    /// Plain length in bytes.
    pub length: u64,
    /// Encoded length in bytes (equals `length` for plain).
    pub encoded_length: u64,
    /// Generation of the revision that introduced this content.
    pub revpos: u64,
}

/// A new attachment supplied to `create`/`update`, streamed into the blob
/// store during the insert.
pub struct UnsavedAttachment {
    /// Attachment name.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Content stream; read exactly once.
    pub data: Box<dyn Read + Send>,
}

impl UnsavedAttachment {
    /// Creates an attachment from an owned byte buffer.
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: Box::new(std::io::Cursor::new(bytes)),
        }
    }
}

impl std::fmt::Debug for UnsavedAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsavedAttachment")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}
