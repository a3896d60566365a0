//! # FerryDB Testkit
//!
//! Shared test tooling: temp-directory store fixtures and proptest
//! generators for document data.

#![deny(unsafe_code)]

mod fixtures;
mod generators;

pub use fixtures::{person_doc, populate, TestStore};
pub use generators::{body_strategy, doc_id_strategy, rev_digest_strategy};
