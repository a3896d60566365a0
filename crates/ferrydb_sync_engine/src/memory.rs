//! An in-memory remote database for tests.
//!
//! Implements [`RemoteDatabase`] over a hash-of-trees model with the same
//! winner rule as the local store, plus call counters and fault injection
//! so integration tests can exercise retries, interrupted runs, and
//! checkpoint resume without a network.

use crate::error::{SyncError, SyncResult};
use crate::remote::{FetchedAttachment, OpenRevision, RemoteDatabase};
use ferrydb_core::{next_rev_id, RevisionId};
use ferrydb_sync_protocol::{
    AttachmentMeta, BulkDocsResponseItem, ChangeRev, ChangeRow, ChangesResponse, DocumentRevs,
    MissingRevs, Revisions, RevsDiffRequest, RevsDiffResponse,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Operations that can have faults injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    /// The changes feed.
    Changes,
    /// `_revs_diff`.
    RevsDiff,
    /// `open_revs` fetches.
    OpenRevs,
    /// `_bulk_docs` writes.
    BulkDocs,
    /// Checkpoint reads.
    GetCheckpoint,
    /// Checkpoint writes.
    PutCheckpoint,
}

/// A fault plan: after `after_calls` successful calls, the next
/// `failures` calls fail.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    /// Successful calls before failures begin.
    pub after_calls: u64,
    /// Number of consecutive failures to produce.
    pub failures: u64,
    /// Whether the injected failures are retryable.
    pub retryable: bool,
}

#[derive(Debug, Clone)]
struct RemoteRev {
    deleted: bool,
    body: Map<String, Value>,
    /// Full ids, oldest first, ending with this revision.
    history: Vec<String>,
    attachments: BTreeMap<String, RemoteAttachment>,
}

#[derive(Debug, Clone)]
struct RemoteAttachment {
    content_type: String,
    data: Vec<u8>,
    revpos: u64,
}

#[derive(Debug, Default)]
struct RemoteDoc {
    revs: BTreeMap<String, RemoteRev>,
    /// Child count per revision id; leaves have none.
    children: HashMap<String, u32>,
    last_change_seq: u64,
}

impl RemoteDoc {
    fn leaves(&self) -> Vec<&str> {
        self.revs
            .keys()
            .filter(|rev| !self.children.contains_key(*rev))
            .map(String::as_str)
            .collect()
    }

    fn winner(&self) -> Option<(&str, &RemoteRev)> {
        let parsed: Vec<(RevisionId, &str)> = self
            .leaves()
            .into_iter()
            .filter_map(|rev| rev.parse::<RevisionId>().ok().map(|id| (id, rev)))
            .collect();
        let pick = |deleted: Option<bool>| {
            parsed
                .iter()
                .filter(|(_, rev)| match deleted {
                    Some(flag) => self.revs[*rev].deleted == flag,
                    None => true,
                })
                .max_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, rev)| *rev)
        };
        let rev = pick(Some(false)).or_else(|| pick(None))?;
        Some((rev, &self.revs[rev]))
    }
}

#[derive(Default)]
struct Inner {
    seq: u64,
    docs: BTreeMap<String, RemoteDoc>,
    checkpoints: BTreeMap<String, u64>,
    faults: HashMap<FaultOp, Fault>,
    fault_calls: HashMap<FaultOp, u64>,
}

impl Inner {
    fn check_fault(&mut self, op: FaultOp) -> SyncResult<()> {
        let calls = self.fault_calls.entry(op).or_insert(0);
        *calls += 1;
        let call_number = *calls;
        if let Some(fault) = self.faults.get(&op) {
            if call_number > fault.after_calls
                && call_number <= fault.after_calls.saturating_add(fault.failures)
            {
                let err = if fault.retryable {
                    SyncError::transport_retryable(format!("injected fault on {op:?}"))
                } else {
                    SyncError::transport_fatal(format!("injected fault on {op:?}"))
                };
                return Err(err);
            }
        }
        Ok(())
    }

    /// Inserts a revision with its history, idempotently. Returns true if
    /// anything new landed.
    fn insert_rev(
        &mut self,
        id: &str,
        history: &[String],
        body: Map<String, Value>,
        deleted: bool,
        attachments: BTreeMap<String, RemoteAttachment>,
    ) -> bool {
        let doc = self.docs.entry(id.to_string()).or_default();
        let leaf = match history.last() {
            Some(leaf) => leaf.clone(),
            None => return false,
        };
        if doc.revs.contains_key(&leaf) {
            return false;
        }

        // Ancestor stubs.
        for pair in history.windows(2) {
            *doc.children.entry(pair[0].clone()).or_insert(0) += 1;
            doc.revs.entry(pair[0].clone()).or_insert_with(|| RemoteRev {
                deleted: false,
                body: Map::new(),
                history: Vec::new(),
                attachments: BTreeMap::new(),
            });
        }
        doc.revs.insert(
            leaf,
            RemoteRev {
                deleted,
                body,
                history: history.to_vec(),
                attachments,
            },
        );
        self.seq += 1;
        let seq = self.seq;
        if let Some(doc) = self.docs.get_mut(id) {
            doc.last_change_seq = seq;
        }
        true
    }
}

#[derive(Default)]
struct Counters {
    changes_calls: AtomicU64,
    change_rows_served: AtomicU64,
    revs_diff_calls: AtomicU64,
    open_revs_calls: AtomicU64,
    bulk_docs_calls: AtomicU64,
    docs_written: AtomicU64,
    checkpoint_writes: AtomicU64,
}

/// An in-memory replication peer.
pub struct MemoryRemoteDatabase {
    inner: Mutex<Inner>,
    counters: Counters,
}

impl MemoryRemoteDatabase {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            counters: Counters::default(),
        }
    }

    /// Injects a fault plan for `op`.
    pub fn set_fault(&self, op: FaultOp, fault: Fault) {
        let mut inner = self.inner.lock();
        inner.faults.insert(op, fault);
        inner.fault_calls.insert(op, 0);
    }

    /// Clears all fault plans.
    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock();
        inner.faults.clear();
        inner.fault_calls.clear();
    }

    /// Seeds a generation-1 document, returning its revision id.
    pub fn seed_doc(&self, id: &str, body: Map<String, Value>) -> String {
        let rev = next_rev_id(None, &Value::Object(body.clone()), false).to_string();
        let mut inner = self.inner.lock();
        inner.insert_rev(id, &[rev.clone()], body, false, BTreeMap::new());
        rev
    }

    /// Seeds `count` small documents.
    pub fn seed_docs(&self, count: usize) {
        for i in 0..count {
            let mut body = Map::new();
            body.insert("n".into(), Value::from(i as u64));
            self.seed_doc(&format!("doc-{i:05}"), body);
        }
    }

    /// Splices a branch with an explicit history, oldest first.
    pub fn insert_branch(
        &self,
        id: &str,
        history: &[String],
        body: Map<String, Value>,
        deleted: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.insert_rev(id, history, body, deleted, BTreeMap::new());
    }

    /// Binds an attachment to an existing revision.
    pub fn add_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) {
        let mut inner = self.inner.lock();
        let revpos = rev
            .parse::<RevisionId>()
            .map(|r| r.generation())
            .unwrap_or(1);
        if let Some(stored) = inner.docs.get_mut(id).and_then(|d| d.revs.get_mut(rev)) {
            stored.attachments.insert(
                name.to_string(),
                RemoteAttachment {
                    content_type: content_type.to_string(),
                    data,
                    revpos,
                },
            );
        }
    }

    /// Number of documents with a live winner.
    pub fn document_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .docs
            .values()
            .filter(|doc| doc.winner().is_some_and(|(_, rev)| !rev.deleted))
            .count()
    }

    /// All revision ids stored for a document.
    pub fn revs_of(&self, id: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .docs
            .get(id)
            .map(|doc| doc.revs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Body of a stored revision.
    pub fn body_of(&self, id: &str, rev: &str) -> Option<Map<String, Value>> {
        let inner = self.inner.lock();
        inner
            .docs
            .get(id)
            .and_then(|doc| doc.revs.get(rev))
            .map(|r| r.body.clone())
    }

    /// Attachment bytes of a stored revision.
    pub fn attachment_of(&self, id: &str, rev: &str, name: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .docs
            .get(id)
            .and_then(|doc| doc.revs.get(rev))
            .and_then(|r| r.attachments.get(name))
            .map(|a| a.data.clone())
    }

    /// Stored checkpoint for a replication id.
    pub fn checkpoint(&self, replication_id: &str) -> Option<u64> {
        self.inner.lock().checkpoints.get(replication_id).copied()
    }

    /// Total change rows served across all `changes` calls.
    pub fn change_rows_served(&self) -> u64 {
        self.counters.change_rows_served.load(Ordering::SeqCst)
    }

    /// Number of `changes` calls served.
    pub fn changes_calls(&self) -> u64 {
        self.counters.changes_calls.load(Ordering::SeqCst)
    }

    /// Number of `_bulk_docs` calls served.
    pub fn bulk_docs_calls(&self) -> u64 {
        self.counters.bulk_docs_calls.load(Ordering::SeqCst)
    }

    /// Number of documents written by peers.
    pub fn docs_written(&self) -> u64 {
        self.counters.docs_written.load(Ordering::SeqCst)
    }

    /// Number of effective checkpoint writes (idempotent rewrites of the
    /// same value are not counted).
    pub fn checkpoint_writes(&self) -> u64 {
        self.counters.checkpoint_writes.load(Ordering::SeqCst)
    }

    fn doc_to_revs(&self, id: &str, rev: &str, stored: &RemoteRev) -> DocumentRevs {
        let history = if stored.history.is_empty() {
            vec![rev.to_string()]
        } else {
            stored.history.clone()
        };
        let ids: Vec<String> = history
            .iter()
            .rev()
            .filter_map(|full| full.split_once('-').map(|(_, hash)| hash.to_string()))
            .collect();
        let start = rev
            .parse::<RevisionId>()
            .map(|r| r.generation())
            .unwrap_or(1);
        DocumentRevs {
            id: id.to_string(),
            rev: rev.to_string(),
            deleted: stored.deleted,
            revisions: Some(Revisions { start, ids }),
            attachments: BTreeMap::new(),
            body: stored.body.clone(),
        }
    }
}

impl Default for MemoryRemoteDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteDatabase for MemoryRemoteDatabase {
    fn uri(&self) -> String {
        "memory://remote".into()
    }

    fn changes(&self, since: u64, limit: usize) -> SyncResult<ChangesResponse> {
        self.inner.lock().check_fault(FaultOp::Changes)?;
        self.counters.changes_calls.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.lock();
        let mut rows: Vec<(u64, String)> = inner
            .docs
            .iter()
            .filter(|(_, doc)| doc.last_change_seq > since)
            .map(|(id, doc)| (doc.last_change_seq, id.clone()))
            .collect();
        rows.sort();
        rows.truncate(limit);

        let mut results = Vec::with_capacity(rows.len());
        let mut last_seq = since;
        for (seq, id) in rows {
            let doc = &inner.docs[&id];
            last_seq = last_seq.max(seq);
            results.push(ChangeRow {
                seq,
                id: id.clone(),
                changes: doc
                    .leaves()
                    .into_iter()
                    .map(|rev| ChangeRev { rev: rev.into() })
                    .collect(),
                deleted: doc.winner().is_some_and(|(_, rev)| rev.deleted),
            });
        }
        self.counters
            .change_rows_served
            .fetch_add(results.len() as u64, Ordering::SeqCst);
        Ok(ChangesResponse { results, last_seq })
    }

    fn revs_diff(&self, request: &RevsDiffRequest) -> SyncResult<RevsDiffResponse> {
        self.inner.lock().check_fault(FaultOp::RevsDiff)?;
        self.counters.revs_diff_calls.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.lock();
        let mut response = RevsDiffResponse::new();
        for (id, revs) in request {
            let stored = inner.docs.get(id);
            let missing: Vec<String> = revs
                .iter()
                .filter(|rev| !stored.is_some_and(|doc| doc.revs.contains_key(*rev)))
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            let possible_ancestors = stored
                .map(|doc| doc.leaves().into_iter().map(String::from).collect())
                .unwrap_or_default();
            response.insert(
                id.clone(),
                MissingRevs {
                    missing,
                    possible_ancestors,
                },
            );
        }
        Ok(response)
    }

    fn open_revs(
        &self,
        id: &str,
        revs: &[String],
        atts_since: &[String],
    ) -> SyncResult<Vec<OpenRevision>> {
        self.inner.lock().check_fault(FaultOp::OpenRevs)?;
        self.counters.open_revs_calls.fetch_add(1, Ordering::SeqCst);

        let known_generation = atts_since
            .iter()
            .filter_map(|rev| rev.parse::<RevisionId>().ok())
            .map(|rev| rev.generation())
            .max()
            .unwrap_or(0);

        let inner = self.inner.lock();
        let Some(doc) = inner.docs.get(id) else {
            return Ok(Vec::new());
        };
        let mut revisions = Vec::new();
        for rev in revs {
            let Some(stored) = doc.revs.get(rev) else {
                continue;
            };
            let mut out = self.doc_to_revs(id, rev, stored);
            let mut attachments = Vec::new();
            for (name, attachment) in &stored.attachments {
                let meta = AttachmentMeta {
                    content_type: attachment.content_type.clone(),
                    revpos: Some(attachment.revpos),
                    length: Some(attachment.data.len() as u64),
                    stub: (attachment.revpos <= known_generation).then_some(true),
                    ..AttachmentMeta::default()
                };
                if meta.stub.is_none() {
                    attachments.push(FetchedAttachment {
                        name: name.clone(),
                        content_type: attachment.content_type.clone(),
                        data: attachment.data.clone(),
                        encoding: None,
                        encoded_length: Some(attachment.data.len() as u64),
                        revpos: Some(attachment.revpos),
                    });
                }
                out.attachments.insert(name.clone(), meta);
            }
            revisions.push(OpenRevision {
                doc: out,
                attachments,
            });
        }
        Ok(revisions)
    }

    fn bulk_docs(&self, docs: &[DocumentRevs]) -> SyncResult<Vec<BulkDocsResponseItem>> {
        self.inner.lock().check_fault(FaultOp::BulkDocs)?;
        self.counters.bulk_docs_calls.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock();
        for doc in docs {
            let history = doc.history_oldest_first();
            let mut attachments = BTreeMap::new();
            for (name, meta) in &doc.attachments {
                if let Some(data) = meta.decode_data()? {
                    attachments.insert(
                        name.clone(),
                        RemoteAttachment {
                            content_type: meta.content_type.clone(),
                            data,
                            revpos: meta.revpos.unwrap_or(1),
                        },
                    );
                }
            }
            if inner.insert_rev(&doc.id, &history, doc.body.clone(), doc.deleted, attachments) {
                self.counters.docs_written.fetch_add(1, Ordering::SeqCst);
            }
        }
        // With new_edits=false only failures are reported.
        Ok(Vec::new())
    }

    fn put_doc_with_attachments(
        &self,
        doc: &DocumentRevs,
        attachments: &[(String, Vec<u8>)],
    ) -> SyncResult<()> {
        let follows: Vec<(&String, &AttachmentMeta)> = doc
            .attachments
            .iter()
            .filter(|(_, meta)| meta.follows == Some(true))
            .collect();
        if follows.len() != attachments.len() {
            return Err(SyncError::protocol(format!(
                "expected {} attachment parts, got {}",
                follows.len(),
                attachments.len()
            )));
        }

        let mut stored = BTreeMap::new();
        for ((name, meta), (_, data)) in follows.into_iter().zip(attachments) {
            stored.insert(
                name.clone(),
                RemoteAttachment {
                    content_type: meta.content_type.clone(),
                    data: data.clone(),
                    revpos: meta.revpos.unwrap_or(1),
                },
            );
        }
        // Inline attachments may ride along in the same document.
        for (name, meta) in &doc.attachments {
            if let Some(data) = meta.decode_data()? {
                stored.insert(
                    name.clone(),
                    RemoteAttachment {
                        content_type: meta.content_type.clone(),
                        data,
                        revpos: meta.revpos.unwrap_or(1),
                    },
                );
            }
        }

        let history = doc.history_oldest_first();
        let mut inner = self.inner.lock();
        if inner.insert_rev(&doc.id, &history, doc.body.clone(), doc.deleted, stored) {
            self.counters.docs_written.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn get_checkpoint(&self, replication_id: &str) -> SyncResult<Option<u64>> {
        let mut inner = self.inner.lock();
        inner.check_fault(FaultOp::GetCheckpoint)?;
        Ok(inner.checkpoints.get(replication_id).copied())
    }

    fn put_checkpoint(&self, replication_id: &str, last_seq: u64) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.check_fault(FaultOp::PutCheckpoint)?;
        let previous = inner
            .checkpoints
            .insert(replication_id.to_string(), last_seq);
        if previous != Some(last_seq) {
            self.counters
                .checkpoint_writes
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
