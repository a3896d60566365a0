//! # FerryDB Core
//!
//! Embedded multi-version JSON document store.
//!
//! This crate provides:
//! - A SQLite-backed document store with a revision tree per document
//! - Content-addressed attachment storage keyed by SHA-1
//! - A monotonically increasing change feed
//! - An event bus for document and replication notifications
//!
//! Replication lives in `ferrydb_sync_engine`, which drives this store
//! through [`DocumentStore`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachments;
mod blob;
mod changes;
mod config;
mod dir;
mod document;
mod error;
mod events;
mod revid;
mod revtree;
mod sql;
mod store;

pub use attachments::{gunzip, AttachmentLink};
pub use blob::{BlobKey, BlobStore};
pub use changes::Changes;
pub use config::StoreConfig;
pub use document::{
    reserved_key, AttachmentEncoding, DocumentBody, DocumentRevision, SavedAttachment,
    UnsavedAttachment,
};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus};
pub use revid::{canonical_json, next_rev_id, RevisionId};
pub use store::{DocumentStore, ForceInsert};
