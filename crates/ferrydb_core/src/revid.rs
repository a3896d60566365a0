//! Revision identifiers and the canonical JSON they hash over.
//!
//! A revision id is `"<generation>-<hash>"`: the generation counts the path
//! from the tree root (1-based) and the hash is the 32-hex-char MD5 of the
//! revision's canonical content plus its parent id. Ordering between ids is
//! by generation first, then lexicographically by hash; this is what winner
//! selection ties break on, so it must be stable.

use crate::error::{CoreError, CoreResult};
use md5::{Digest, Md5};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed `"<generation>-<hash>"` revision id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Builds a revision id from parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }

    /// The generation (leading number) of this id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The hash suffix of this id.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl FromStr for RevisionId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let (gen, digest) = s
            .split_once('-')
            .ok_or_else(|| CoreError::invalid_argument(format!("malformed rev id: {s}")))?;
        let generation: u64 = gen
            .parse()
            .map_err(|_| CoreError::invalid_argument(format!("malformed rev id: {s}")))?;
        if generation == 0 || digest.is_empty() {
            return Err(CoreError::invalid_argument(format!("malformed rev id: {s}")));
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

/// Computes the id for a child revision of `parent`.
///
/// The hash covers the canonical body bytes, the parent id, and the deleted
/// flag, making the id a pure function of `(parent, body, deleted)`.
pub fn next_rev_id(parent: Option<&RevisionId>, body: &Value, deleted: bool) -> RevisionId {
    let generation = parent.map_or(1, |p| p.generation + 1);
    let mut hasher = Md5::new();
    hasher.update(canonical_json(body));
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update([u8::from(deleted)]);
    RevisionId {
        generation,
        digest: hex::encode(hasher.finalize()),
    }
}

/// Serializes `value` to canonical JSON bytes: object keys sorted
/// lexicographically, no insignificant whitespace, UTF-8.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                // Scalars and strings always serialize; the error arm is
                // unreachable for Value input.
                out.extend_from_slice(
                    serde_json::to_string(key).unwrap_or_default().as_bytes(),
                );
                out.push(b':');
                write_canonical(&map[*key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => {
            out.extend_from_slice(serde_json::to_string(scalar).unwrap_or_default().as_bytes());
        }
    }
}
