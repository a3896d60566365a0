//! # FerryDB Sync Engine
//!
//! Bidirectional replication between a local [`ferrydb_core`] document
//! store and a remote document database speaking CouchDB-style replication
//! semantics.
//!
//! This crate provides:
//! - The [`Replicator`] state machine and its push/pull pipelines
//! - The [`RemoteDatabase`] endpoint abstraction with an HTTP
//!   implementation over a pluggable [`HttpClient`]
//! - The interceptor chain for header mutation and request replay
//! - An in-memory remote for tests

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod memory;
mod pull;
mod push;
mod remote;
mod replicator;

pub use config::{default_user_agent, ReplicatorConfig, RetryConfig, REVS_DIFF_CHUNK};
pub use error::{SyncError, SyncResult};
pub use http::{
    BasicAuthInterceptor, HttpBody, HttpClient, HttpInterceptor, HttpRequest, HttpResponse,
    InterceptedClient, RequestContext, ResponseContext,
};
pub use memory::{Fault, FaultOp, MemoryRemoteDatabase};
pub use remote::{
    with_retry, FetchedAttachment, HttpRemoteDatabase, OpenRevision, RemoteDatabase,
};
pub use replicator::{Direction, Replicator, ReplicatorState};
