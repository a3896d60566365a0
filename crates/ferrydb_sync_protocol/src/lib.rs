//! # FerryDB Sync Protocol
//!
//! Wire types for the CouchDB-style replication protocol:
//! - Changes feed, `_revs_diff`, `_bulk_docs`, `open_revs` documents
//! - `_local` checkpoint documents and stable replication ids
//! - Attachment metadata and the multipart bodies that carry attachment
//!   payloads
//!
//! This is a pure protocol crate with no I/O; the sync engine drives it
//! over its HTTP client abstraction.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod multipart;
mod replication;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    format_digest, parse_digest, AttachmentMeta, BulkDocsRequest, BulkDocsResponseItem,
    ChangeRev, ChangeRow, ChangesResponse, CheckpointDoc, DocumentRevs, MissingRevs,
    OpenRevsEntry, Revisions, RevsDiffRequest, RevsDiffResponse,
};
pub use multipart::{
    boundary_from_content_type, parse_multipart, MultipartPart, MultipartWriter,
};
pub use replication::{replication_id, ReplicationFilter};
