//! Stable replication ids.
//!
//! Two replicator runs configured with the same source, target, filter,
//! and direction must share a checkpoint, so the id is a digest over
//! exactly those inputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// A named server-side filter and its parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFilter {
    /// Filter function name.
    pub name: String,
    /// Filter parameters, order-insensitive.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

/// Computes the stable replication id for a configuration.
///
/// The id is `hex(SHA-1(source || target || filter_json || direction))`;
/// filter parameters serialize key-sorted so equal configurations hash
/// equal.
pub fn replication_id(
    source: &str,
    target: &str,
    filter: Option<&ReplicationFilter>,
    direction: &str,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hasher.update([0]);
    hasher.update(target.as_bytes());
    hasher.update([0]);
    if let Some(filter) = filter {
        // BTreeMap keys serialize sorted.
        hasher.update(serde_json::to_string(filter).unwrap_or_default().as_bytes());
    }
    hasher.update([0]);
    hasher.update(direction.as_bytes());
    hex::encode(hasher.finalize())
}
