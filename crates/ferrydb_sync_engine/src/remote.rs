//! Remote endpoint abstraction and its HTTP implementation.
//!
//! [`RemoteDatabase`] is the seam the pipelines drive; tests swap in the
//! in-memory implementation from [`crate::memory`] while production uses
//! [`HttpRemoteDatabase`] over an [`HttpClient`].

use crate::config::{ReplicatorConfig, RetryConfig};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpBody, HttpClient, HttpInterceptor, HttpRequest, InterceptedClient};
use ferrydb_core::gunzip;
use ferrydb_sync_protocol::{
    boundary_from_content_type, parse_multipart, AttachmentMeta, BulkDocsRequest,
    BulkDocsResponseItem, ChangesResponse, CheckpointDoc, DocumentRevs, MultipartPart,
    MultipartWriter, OpenRevsEntry, RevsDiffRequest, RevsDiffResponse,
};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// An attachment body fetched alongside a revision.
#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    /// Attachment name.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Plain (decoded) bytes.
    pub data: Vec<u8>,
    /// Wire encoding the body travelled with, e.g. `gzip`.
    pub encoding: Option<String>,
    /// Encoded length on the wire.
    pub encoded_length: Option<u64>,
    /// Generation that introduced this content.
    pub revpos: Option<u64>,
}

/// One revision returned by `open_revs`, with any attachment bodies the
/// peer sent (bodies the peer knew we already hold arrive as stubs and are
/// omitted here).
#[derive(Debug, Clone)]
pub struct OpenRevision {
    /// The revision document with its history.
    pub doc: DocumentRevs,
    /// Attachment bodies included in the response.
    pub attachments: Vec<FetchedAttachment>,
}

/// A remote database speaking the replication protocol.
pub trait RemoteDatabase: Send + Sync {
    /// Identifies the remote endpoint for replication-id purposes.
    fn uri(&self) -> String;

    /// Polls the changes feed after `since`, up to `limit` rows.
    fn changes(&self, since: u64, limit: usize) -> SyncResult<ChangesResponse>;

    /// Asks which of the supplied revisions the peer lacks.
    fn revs_diff(&self, request: &RevsDiffRequest) -> SyncResult<RevsDiffResponse>;

    /// Fetches the given leaf revisions of one document with their full
    /// ancestor paths. `atts_since` names revisions we already hold so the
    /// peer can omit attachment bodies we have.
    fn open_revs(
        &self,
        id: &str,
        revs: &[String],
        atts_since: &[String],
    ) -> SyncResult<Vec<OpenRevision>>;

    /// Writes already-formed revisions, preserving their ids.
    fn bulk_docs(&self, docs: &[DocumentRevs]) -> SyncResult<Vec<BulkDocsResponseItem>>;

    /// Writes one document with attachment bodies as multipart parts, in
    /// `_attachments` `follows` order.
    fn put_doc_with_attachments(
        &self,
        doc: &DocumentRevs,
        attachments: &[(String, Vec<u8>)],
    ) -> SyncResult<()>;

    /// Reads the checkpoint for `replication_id`, if any.
    fn get_checkpoint(&self, replication_id: &str) -> SyncResult<Option<u64>>;

    /// Writes the checkpoint for `replication_id`. Writing the same value
    /// twice is a no-op.
    fn put_checkpoint(&self, replication_id: &str, last_seq: u64) -> SyncResult<()>;
}

/// Retries `op` on transient failures within the configured budget.
pub fn with_retry<T>(
    retry: &RetryConfig,
    mut op: impl FnMut() -> SyncResult<T>,
) -> SyncResult<T> {
    let mut last_err = None;
    for attempt in 0..retry.max_attempts {
        if attempt > 0 {
            thread::sleep(retry.delay_for_attempt(attempt));
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                warn!(attempt, error = %err, "transient failure, retrying");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| SyncError::protocol("retry budget exhausted")))
}

/// A remote CouchDB-style database over HTTP.
pub struct HttpRemoteDatabase {
    root: String,
    http: InterceptedClient,
    retry: RetryConfig,
}

impl HttpRemoteDatabase {
    /// Creates a client for the database at `root_url`.
    pub fn new(
        root_url: impl Into<String>,
        client: Arc<dyn HttpClient>,
        interceptors: Vec<Arc<dyn HttpInterceptor>>,
        config: &ReplicatorConfig,
    ) -> Self {
        let root = root_url.into().trim_end_matches('/').to_string();
        Self {
            root,
            http: InterceptedClient::new(
                client,
                interceptors,
                config.user_agent.clone(),
                config.retry.max_attempts,
            ),
            retry: config.retry.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.root)
    }

    fn execute_json<T: serde::de::DeserializeOwned>(&self, request: HttpRequest) -> SyncResult<T> {
        let url = request.url.clone();
        let response = self.http.execute(request)?;
        let status = response.status;
        if !(200..300).contains(&status) {
            return Err(error_for_status(status, &url));
        }
        let body = response.read_body()?;
        serde_json::from_slice(&body)
            .map_err(|e| SyncError::protocol(format!("decoding {url}: {e}")))
    }
}

impl RemoteDatabase for HttpRemoteDatabase {
    fn uri(&self) -> String {
        self.root.clone()
    }

    fn changes(&self, since: u64, limit: usize) -> SyncResult<ChangesResponse> {
        with_retry(&self.retry, || {
            let url = self.url(&format!(
                "_changes?feed=normal&style=all_docs&since={since}&limit={limit}"
            ));
            self.execute_json(HttpRequest::get(url))
        })
    }

    fn revs_diff(&self, request: &RevsDiffRequest) -> SyncResult<RevsDiffResponse> {
        let body = serde_json::to_vec(request)?;
        with_retry(&self.retry, || {
            self.execute_json(HttpRequest::post(
                self.url("_revs_diff"),
                HttpBody::json(body.clone()),
            ))
        })
    }

    fn open_revs(
        &self,
        id: &str,
        revs: &[String],
        atts_since: &[String],
    ) -> SyncResult<Vec<OpenRevision>> {
        let mut query = format!(
            "{}?open_revs={}&revs=true&attachments=true",
            encode_doc_id(id),
            encode_component(&serde_json::to_string(revs)?),
        );
        if !atts_since.is_empty() {
            query.push_str(&format!(
                "&atts_since={}",
                encode_component(&serde_json::to_string(atts_since)?)
            ));
        }
        let url = self.url(&query);

        with_retry(&self.retry, || {
            let request = HttpRequest::get(url.clone())
                .with_header("Accept", "multipart/mixed, application/json");
            let response = self.http.execute(request)?;
            let status = response.status;
            if !(200..300).contains(&status) {
                return Err(error_for_status(status, &url));
            }
            let content_type = response.header("Content-Type").unwrap_or("").to_string();
            let body = response.read_body()?;

            if let Some(boundary) = boundary_from_content_type(&content_type) {
                parse_open_revs_multipart(&body, &boundary)
            } else {
                parse_open_revs_json(&body)
            }
        })
    }

    fn bulk_docs(&self, docs: &[DocumentRevs]) -> SyncResult<Vec<BulkDocsResponseItem>> {
        let request = BulkDocsRequest {
            docs: docs.to_vec(),
            new_edits: false,
        };
        let body = serde_json::to_vec(&request)?;
        with_retry(&self.retry, || {
            self.execute_json(HttpRequest::post(
                self.url("_bulk_docs"),
                HttpBody::json(body.clone()),
            ))
        })
    }

    fn put_doc_with_attachments(
        &self,
        doc: &DocumentRevs,
        attachments: &[(String, Vec<u8>)],
    ) -> SyncResult<()> {
        let mut writer = MultipartWriter::new();
        let content_type = writer.content_type();
        writer.add_json(&serde_json::to_vec(doc)?);
        for (part_type, bytes) in attachments {
            writer.add_part(part_type, bytes);
        }
        let body = writer.finish();
        let url = self.url(&format!("{}?new_edits=false", encode_doc_id(&doc.id)));

        with_retry(&self.retry, || {
            let request = HttpRequest::put(
                url.clone(),
                HttpBody::from_bytes(content_type.clone(), body.clone()),
            );
            let response = self.http.execute(request)?;
            let status = response.status;
            if !(200..300).contains(&status) {
                return Err(error_for_status(status, &url));
            }
            Ok(())
        })
    }

    fn get_checkpoint(&self, replication_id: &str) -> SyncResult<Option<u64>> {
        let url = self.url(&format!("_local/{replication_id}"));
        with_retry(&self.retry, || {
            let response = self.http.execute(HttpRequest::get(url.clone()))?;
            match response.status {
                200 => {
                    let body = response.read_body()?;
                    let doc: CheckpointDoc = serde_json::from_slice(&body)
                        .map_err(|e| SyncError::protocol(format!("decoding checkpoint: {e}")))?;
                    Ok(Some(doc.last_seq))
                }
                404 => Ok(None),
                status => Err(error_for_status(status, &url)),
            }
        })
    }

    fn put_checkpoint(&self, replication_id: &str, last_seq: u64) -> SyncResult<()> {
        let url = self.url(&format!("_local/{replication_id}"));
        let body = serde_json::to_vec(&CheckpointDoc::new(last_seq))?;
        with_retry(&self.retry, || {
            let response = self
                .http
                .execute(HttpRequest::put(url.clone(), HttpBody::json(body.clone())))?;
            let status = response.status;
            if !(200..300).contains(&status) {
                return Err(error_for_status(status, &url));
            }
            debug!(replication_id, last_seq, "wrote checkpoint");
            Ok(())
        })
    }
}

/// Maps an HTTP status to the error taxonomy: 401/403 are auth failures
/// (fatal after interceptor replays), 429 and 5xx are transient, other
/// 4xx are fatal for the batch.
fn error_for_status(status: u16, url: &str) -> SyncError {
    match status {
        401 | 403 => SyncError::Auth(format!("HTTP {status} from {url}")),
        429 => SyncError::transport_retryable(format!("HTTP 429 from {url}")),
        500..=599 => SyncError::transport_retryable(format!("HTTP {status} from {url}")),
        408 => SyncError::Timeout,
        _ => SyncError::transport_fatal(format!("HTTP {status} from {url}")),
    }
}

fn parse_open_revs_json(body: &[u8]) -> SyncResult<Vec<OpenRevision>> {
    let entries: Vec<OpenRevsEntry> = serde_json::from_slice(body)
        .map_err(|e| SyncError::protocol(format!("decoding open_revs: {e}")))?;
    let mut revisions = Vec::new();
    for entry in entries {
        let Some(doc) = entry.ok else { continue };
        let attachments = inline_attachments(&doc)?;
        revisions.push(OpenRevision { doc, attachments });
    }
    Ok(revisions)
}

fn parse_open_revs_multipart(body: &[u8], boundary: &str) -> SyncResult<Vec<OpenRevision>> {
    let parts = parse_multipart(body, boundary)?;
    let mut revisions = Vec::new();
    for part in parts {
        if part.is_multipart() {
            revisions.push(parse_related_revision(&part)?);
        } else {
            let doc: DocumentRevs = serde_json::from_slice(&part.body)
                .map_err(|e| SyncError::protocol(format!("decoding open_revs part: {e}")))?;
            let attachments = inline_attachments(&doc)?;
            revisions.push(OpenRevision { doc, attachments });
        }
    }
    Ok(revisions)
}

/// Parses one `multipart/related` revision: JSON document first, then one
/// part per `follows` attachment, in `_attachments` order.
fn parse_related_revision(part: &MultipartPart) -> SyncResult<OpenRevision> {
    let boundary = boundary_from_content_type(part.content_type())
        .ok_or_else(|| SyncError::protocol("related part without boundary"))?;
    let inner = parse_multipart(&part.body, &boundary)?;
    let Some((doc_part, att_parts)) = inner.split_first() else {
        return Err(SyncError::protocol("empty related part"));
    };
    let doc: DocumentRevs = serde_json::from_slice(&doc_part.body)
        .map_err(|e| SyncError::protocol(format!("decoding related document: {e}")))?;

    let mut attachments = inline_attachments(&doc)?;
    let follows: Vec<(&String, &AttachmentMeta)> = doc
        .attachments
        .iter()
        .filter(|(_, meta)| meta.follows == Some(true))
        .collect();
    if follows.len() != att_parts.len() {
        return Err(SyncError::protocol(format!(
            "expected {} attachment parts, got {}",
            follows.len(),
            att_parts.len()
        )));
    }
    for ((name, meta), att_part) in follows.into_iter().zip(att_parts) {
        attachments.push(decode_attachment(name, meta, att_part.body.clone())?);
    }
    Ok(OpenRevision { doc, attachments })
}

/// Collects attachments whose bodies arrived inline as base64.
fn inline_attachments(doc: &DocumentRevs) -> SyncResult<Vec<FetchedAttachment>> {
    let mut attachments = Vec::new();
    for (name, meta) in &doc.attachments {
        if let Some(data) = meta.decode_data()? {
            attachments.push(decode_attachment(name, meta, data)?);
        }
    }
    Ok(attachments)
}

fn decode_attachment(
    name: &str,
    meta: &AttachmentMeta,
    wire_bytes: Vec<u8>,
) -> SyncResult<FetchedAttachment> {
    let encoded_length = Some(wire_bytes.len() as u64);
    let data = match meta.encoding.as_deref() {
        Some("gzip") => gunzip(&wire_bytes)
            .map_err(|e| SyncError::protocol(format!("bad gzip attachment {name}: {e}")))?,
        Some(other) => {
            return Err(SyncError::protocol(format!(
                "unknown attachment encoding {other}"
            )))
        }
        None => wire_bytes,
    };
    Ok(FetchedAttachment {
        name: name.to_string(),
        content_type: meta.content_type.clone(),
        data,
        encoding: meta.encoding.clone(),
        encoded_length,
        revpos: meta.revpos,
    })
}

/// Percent-encodes a document id as a single path segment.
pub(crate) fn encode_doc_id(id: &str) -> String {
    encode_component(id)
}

/// Percent-encodes a path or query component.
pub(crate) fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
