//! JSON wire messages for the replication protocol.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One revision reference inside a change row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    /// The revision id.
    pub rev: String,
}

/// One row of a `_changes` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// Remote sequence of this change.
    pub seq: u64,
    /// Document id.
    pub id: String,
    /// Leaf revisions of the document at this change.
    pub changes: Vec<ChangeRev>,
    /// Whether the winning revision is a tombstone.
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl ChangeRow {
    /// The revision ids offered by this row.
    pub fn revs(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.rev.clone()).collect()
    }
}

/// A `_changes` response in normal (poll) mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Change rows, sequence-ascending.
    pub results: Vec<ChangeRow>,
    /// Sequence this response covers up to.
    pub last_seq: u64,
}

impl ChangesResponse {
    /// Returns true if the feed produced no rows.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// A `_revs_diff` request: document id to the revisions we hold.
pub type RevsDiffRequest = BTreeMap<String, Vec<String>>;

/// The peer's answer for one document in a `_revs_diff` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingRevs {
    /// Revisions the peer lacks.
    pub missing: Vec<String>,
    /// Revisions the peer holds that may serve as common ancestors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<String>,
}

/// A `_revs_diff` response.
pub type RevsDiffResponse = BTreeMap<String, MissingRevs>;

/// The `_revisions` history of a document: `ids` are the hash suffixes,
/// newest first, and `start` is the generation of the newest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revisions {
    /// Generation of the first entry in `ids`.
    pub start: u64,
    /// Revision hash suffixes, newest first.
    pub ids: Vec<String>,
}

impl Revisions {
    /// Expands to full `"<gen>-<hash>"` ids, oldest first.
    ///
    /// A history longer than `start` is malformed; the bogus generation-0
    /// entries it would imply surface as parse errors downstream.
    pub fn full_ids_oldest_first(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, hash)| format!("{}-{hash}", self.start.saturating_sub(i as u64)))
            .rev()
            .collect()
    }
}

/// `_attachments` metadata for one attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// MIME type.
    pub content_type: String,
    /// Generation that introduced this attachment content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,
    /// Content digest, `sha1-<hex>` form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Plain length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Encoded length in bytes, when `encoding` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_length: Option<u64>,
    /// Wire encoding (`gzip`), absent for plain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// True when the body is omitted because the peer already has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub: Option<bool>,
    /// True when the body follows as a multipart part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follows: Option<bool>,
    /// Inline base64 body, mutually exclusive with `follows`/`stub`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl AttachmentMeta {
    /// Decodes the inline base64 body, if present.
    pub fn decode_data(&self) -> ProtocolResult<Option<Vec<u8>>> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        self.data
            .as_deref()
            .map(|data| STANDARD.decode(data).map_err(ProtocolError::from))
            .transpose()
    }

    /// Encodes `bytes` as the inline base64 body.
    pub fn encode_data(bytes: &[u8]) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        STANDARD.encode(bytes)
    }
}

/// A document as exchanged by `open_revs` and `_bulk_docs`: metadata
/// fields plus the flattened JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRevs {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Revision id of this document.
    #[serde(rename = "_rev")]
    pub rev: String,
    /// Tombstone marker.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Ancestor history, newest first.
    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<Revisions>,
    /// Attachment metadata by name.
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attachments: BTreeMap<String, AttachmentMeta>,
    /// The document body fields.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl DocumentRevs {
    /// The full revision history, oldest first, falling back to the bare
    /// `_rev` when `_revisions` is absent.
    pub fn history_oldest_first(&self) -> Vec<String> {
        match &self.revisions {
            Some(revisions) => revisions.full_ids_oldest_first(),
            None => vec![self.rev.clone()],
        }
    }
}

/// One entry of an `open_revs` JSON response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRevsEntry {
    /// A revision the peer holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<DocumentRevs>,
    /// A requested revision the peer does not hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<String>,
}

/// A `_bulk_docs` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// The documents to write, with their `_revisions` history.
    pub docs: Vec<DocumentRevs>,
    /// False to preserve supplied revision ids (replication mode).
    pub new_edits: bool,
}

/// One row of a `_bulk_docs` response. With `new_edits=false` the peer
/// reports only failures, so an empty response means every write landed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsResponseItem {
    /// Document id.
    pub id: String,
    /// Revision the row refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Present and true on explicit success rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Error class, e.g. `conflict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkDocsResponseItem {
    /// Whether this row reports a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A `_local/<replication_id>` checkpoint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDoc {
    /// Document id (`_local/<replication_id>`), set by the server on read.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Local-doc revision, opaque.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// The source sequence replicated up to.
    pub last_seq: u64,
}

impl CheckpointDoc {
    /// Creates a checkpoint body for `PUT _local/<replication_id>`.
    pub fn new(last_seq: u64) -> Self {
        Self {
            id: None,
            rev: None,
            last_seq,
        }
    }
}

/// Formats a blob digest in the `sha1-<hex>` wire form.
pub fn format_digest(sha1_hex: &str) -> String {
    format!("sha1-{sha1_hex}")
}

/// Parses a `sha1-<hex>` wire digest back to the hex key.
pub fn parse_digest(digest: &str) -> ProtocolResult<String> {
    digest
        .strip_prefix("sha1-")
        .filter(|hex| hex.len() == 40 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ProtocolError::Digest {
            digest: digest.to_string(),
        })
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn changes_response_round_trip() {
        let json = json!({
            "results": [
                {"seq": 1, "id": "a", "changes": [{"rev": "1-abc"}]},
                {"seq": 3, "id": "b", "changes": [{"rev": "2-def"}], "deleted": true},
            ],
            "last_seq": 3,
        });
        let parsed: ChangesResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].revs(), vec!["1-abc"]);
        assert!(parsed.results[1].deleted);
        assert_eq!(parsed.last_seq, 3);
    }

    #[test]
    fn revs_diff_round_trip() {
        let mut request = RevsDiffRequest::new();
        request.insert("doc".into(), vec!["1-a".into(), "2-b".into()]);
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded, json!({"doc": ["1-a", "2-b"]}));

        let response: RevsDiffResponse = serde_json::from_value(json!({
            "doc": {"missing": ["2-b"], "possible_ancestors": ["1-a"]},
        }))
        .unwrap();
        assert_eq!(response["doc"].missing, vec!["2-b"]);
        assert_eq!(response["doc"].possible_ancestors, vec!["1-a"]);
    }

    #[test]
    fn revisions_expand_oldest_first() {
        let revisions = Revisions {
            start: 3,
            ids: vec!["ccc".into(), "bbb".into(), "aaa".into()],
        };
        assert_eq!(
            revisions.full_ids_oldest_first(),
            vec!["1-aaa", "2-bbb", "3-ccc"]
        );
    }

    #[test]
    fn document_revs_flattens_body() {
        let doc: DocumentRevs = serde_json::from_value(json!({
            "_id": "d",
            "_rev": "2-bbb",
            "_revisions": {"start": 2, "ids": ["bbb", "aaa"]},
            "name": "Tom",
            "age": 31,
        }))
        .unwrap();
        assert_eq!(doc.id, "d");
        assert_eq!(doc.body["name"], json!("Tom"));
        assert_eq!(doc.history_oldest_first(), vec!["1-aaa", "2-bbb"]);

        let encoded = serde_json::to_value(&doc).unwrap();
        assert_eq!(encoded["age"], json!(31));
        assert_eq!(encoded["_revisions"]["start"], json!(2));
        assert!(encoded.get("_attachments").is_none());
    }

    #[test]
    fn attachment_meta_inline_data() {
        let meta = AttachmentMeta {
            content_type: "text/plain".into(),
            data: Some(AttachmentMeta::encode_data(b"hello")),
            ..AttachmentMeta::default()
        };
        assert_eq!(meta.decode_data().unwrap().unwrap(), b"hello");

        let bad = AttachmentMeta {
            content_type: "text/plain".into(),
            data: Some("!!!".into()),
            ..AttachmentMeta::default()
        };
        assert!(bad.decode_data().is_err());
    }

    #[test]
    fn bulk_docs_error_rows() {
        let rows: Vec<BulkDocsResponseItem> = serde_json::from_value(json!([
            {"id": "a", "rev": "1-x", "error": "conflict", "reason": "exists"},
        ]))
        .unwrap();
        assert!(rows[0].is_error());
    }

    #[test]
    fn digest_wire_form() {
        let hex = "a".repeat(40);
        let digest = format_digest(&hex);
        assert_eq!(parse_digest(&digest).unwrap(), hex);
        assert!(parse_digest("md5-abc").is_err());
        assert!(parse_digest("sha1-xyz").is_err());
    }

    #[test]
    fn checkpoint_doc_round_trip() {
        let body = serde_json::to_value(CheckpointDoc::new(42)).unwrap();
        assert_eq!(body, json!({"last_seq": 42}));

        let parsed: CheckpointDoc = serde_json::from_value(json!({
            "_id": "_local/abc",
            "_rev": "0-1",
            "last_seq": 42,
        }))
        .unwrap();
        assert_eq!(parsed.last_seq, 42);
    }
}
