//! The document store: CRUD over revision trees, attachments, the change
//! feed, and the event bus.
//!
//! Every mutating operation runs in a single SQL transaction; the sequence
//! counter (`info.local_seq`) is advanced inside that same transaction, so
//! sequences are strictly increasing with no reuse. Events are posted after
//! commit, on the mutating thread.

use crate::attachments::{self, AttachmentLink};
use crate::blob::{BlobKey, BlobStore};
use crate::changes::Changes;
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::document::{
    reserved_key, DocumentBody, DocumentRevision, SavedAttachment, UnsavedAttachment,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::revid::{next_rev_id, RevisionId};
use crate::revtree::{self, RevRow};
use crate::sql::{info_counter, info_set, SqlDatabase};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A revision arriving from replication, to be spliced into the local tree
/// together with its ancestor history.
#[derive(Debug)]
pub struct ForceInsert {
    /// Document id.
    pub doc_id: String,
    /// Revision ids from the root to the revision being inserted, oldest
    /// first; the final entry is the revision carrying `body`.
    pub history: Vec<RevisionId>,
    /// Body of the final revision.
    pub body: DocumentBody,
    /// Whether the final revision is a tombstone.
    pub deleted: bool,
    /// Attachments of the final revision, blobs already written.
    pub attachments: Vec<AttachmentLink>,
}

/// An embedded multi-version document store.
pub struct DocumentStore {
    db: SqlDatabase,
    blobs: BlobStore,
    events: Arc<EventBus>,
    config: StoreConfig,
    dir: StoreDir,
}

impl DocumentStore {
    /// Opens (or creates) the store at `path` with default configuration.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens (or creates) the store at `path`.
    pub fn open_with_config(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, &config)?;
        let db = SqlDatabase::open(&dir.database_path(&config))?;
        let blobs = BlobStore::open(&dir.blob_path(&config))?;
        info!(path = %path.display(), "opened document store");
        Ok(Self {
            db,
            blobs,
            events: Arc::new(EventBus::new()),
            config,
            dir,
        })
    }

    /// The store directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The event bus shared by this store and its replicators.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Subscribes to document and replication events.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    /// The highest sequence assigned so far.
    pub fn last_sequence(&self) -> CoreResult<u64> {
        self.db.read(|conn| info_counter(conn, "local_seq"))
    }

    /// Number of documents whose winner is not deleted.
    pub fn document_count(&self) -> CoreResult<u64> {
        self.db.read(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(DISTINCT doc_id) FROM revs WHERE current = 1 AND deleted = 0",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Creates a document with a generated id.
    pub fn create_with_generated_id(
        &self,
        body: DocumentBody,
        attachments: Vec<UnsavedAttachment>,
    ) -> CoreResult<DocumentRevision> {
        let doc_id = Uuid::new_v4().simple().to_string();
        self.create(&doc_id, body, attachments)
    }

    /// Creates the first revision of a document.
    ///
    /// Fails with [`CoreError::DocumentExists`] if a non-deleted revision
    /// already exists. Recreating a deleted document extends its tombstone
    /// leaf, so the generation keeps counting up.
    pub fn create(
        &self,
        doc_id: &str,
        body: DocumentBody,
        attachments: Vec<UnsavedAttachment>,
    ) -> CoreResult<DocumentRevision> {
        validate_doc_id(doc_id)?;
        validate_body(&body)?;

        let links = self.store_new_attachments(attachments)?;
        let rev = self.db.transaction(|tx| {
            let leaves = revtree::leaves(tx, doc_id)?;
            let parent = match revtree::winner_of(&leaves) {
                Some(winner) if !winner.deleted => {
                    return Err(CoreError::document_exists(doc_id));
                }
                Some(tombstone) => Some(tombstone.clone()),
                None => None,
            };
            let rev_id = next_rev_id(
                parent.as_ref().map(|p| &p.rev_id),
                &Value::Object(body.clone()),
                false,
            );
            let sequence = allocate_sequence(tx, 1)?;
            revtree::ensure_doc(tx, doc_id)?;
            if let Some(parent) = &parent {
                revtree::mark_not_current(tx, parent.sequence)?;
            }
            let json = body_json(&body);
            revtree::insert_rev(
                tx,
                sequence,
                doc_id,
                &rev_id,
                parent.as_ref().map(|p| p.sequence),
                true,
                false,
                true,
                Some(&json),
            )?;
            let mut saved = Vec::with_capacity(links.len());
            for link in relink(&links, rev_id.generation()) {
                attachments::insert_row(tx, sequence, &link)?;
                saved.push(link_to_saved(&link));
            }
            Ok(DocumentRevision {
                doc_id: doc_id.to_string(),
                rev_id,
                sequence,
                parent_sequence: parent.map(|p| p.sequence),
                deleted: false,
                current: true,
                available: true,
                body,
                attachments: saved,
            })
        })?;

        self.events.post(Event::DocumentCreated {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.to_string(),
        });
        Ok(rev)
    }

    /// Creates a child revision of a current leaf.
    ///
    /// The parent's attachments carry forward; entries in `attachments`
    /// add to or replace them by name. Fails with [`CoreError::Conflict`]
    /// if `parent_rev` is not a current leaf.
    pub fn update(
        &self,
        doc_id: &str,
        parent_rev: &RevisionId,
        body: DocumentBody,
        attachments: Vec<UnsavedAttachment>,
    ) -> CoreResult<DocumentRevision> {
        validate_body(&body)?;
        let links = self.store_new_attachments(attachments)?;

        let rev = self.db.transaction(|tx| {
            let parent = require_leaf(tx, doc_id, parent_rev)?;
            let rev_id = next_rev_id(Some(parent_rev), &Value::Object(body.clone()), false);
            let sequence = allocate_sequence(tx, 1)?;
            revtree::mark_not_current(tx, parent.sequence)?;
            let json = body_json(&body);
            revtree::insert_rev(
                tx,
                sequence,
                doc_id,
                &rev_id,
                Some(parent.sequence),
                true,
                false,
                true,
                Some(&json),
            )?;
            attachments::copy_forward(tx, parent.sequence, sequence)?;
            for link in relink(&links, rev_id.generation()) {
                attachments::insert_row(tx, sequence, &link)?;
            }
            let saved = attachments::for_sequence(tx, sequence)?;
            Ok(DocumentRevision {
                doc_id: doc_id.to_string(),
                rev_id,
                sequence,
                parent_sequence: Some(parent.sequence),
                deleted: false,
                current: true,
                available: true,
                body,
                attachments: saved,
            })
        })?;

        self.events.post(Event::DocumentUpdated {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.to_string(),
        });
        Ok(rev)
    }

    /// Creates a child revision without the named attachments.
    ///
    /// The body carries over unchanged; the remaining attachments re-link
    /// the parent's blobs.
    pub fn remove_attachments(
        &self,
        doc_id: &str,
        parent_rev: &RevisionId,
        names: &[&str],
    ) -> CoreResult<DocumentRevision> {
        let rev = self.db.transaction(|tx| {
            let parent = require_leaf(tx, doc_id, parent_rev)?;
            let body = parent.body()?;
            let rev_id = next_rev_id(Some(parent_rev), &Value::Object(body.clone()), false);
            let sequence = allocate_sequence(tx, 1)?;
            revtree::mark_not_current(tx, parent.sequence)?;
            let json = body_json(&body);
            revtree::insert_rev(
                tx,
                sequence,
                doc_id,
                &rev_id,
                Some(parent.sequence),
                true,
                false,
                true,
                Some(&json),
            )?;
            attachments::copy_forward(tx, parent.sequence, sequence)?;
            for name in names {
                tx.execute(
                    "DELETE FROM attachments WHERE sequence = ?1 AND filename = ?2",
                    rusqlite::params![sequence, name],
                )?;
            }
            let saved = attachments::for_sequence(tx, sequence)?;
            Ok(DocumentRevision {
                doc_id: doc_id.to_string(),
                rev_id,
                sequence,
                parent_sequence: Some(parent.sequence),
                deleted: false,
                current: true,
                available: true,
                body,
                attachments: saved,
            })
        })?;

        self.events.post(Event::DocumentUpdated {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.to_string(),
        });
        Ok(rev)
    }

    /// Deletes a document by appending a tombstone leaf.
    ///
    /// Fails with [`CoreError::Conflict`] if `rev` is not a current leaf.
    pub fn delete(&self, doc_id: &str, rev_id: &RevisionId) -> CoreResult<DocumentRevision> {
        let rev = self.db.transaction(|tx| {
            let parent = require_leaf(tx, doc_id, rev_id)?;
            if parent.deleted {
                return Err(CoreError::conflict(doc_id, rev_id.to_string()));
            }
            let tombstone_id = next_rev_id(Some(rev_id), &Value::Object(DocumentBody::new()), true);
            let sequence = allocate_sequence(tx, 1)?;
            revtree::mark_not_current(tx, parent.sequence)?;
            revtree::insert_rev(
                tx,
                sequence,
                doc_id,
                &tombstone_id,
                Some(parent.sequence),
                true,
                true,
                true,
                None,
            )?;
            Ok(DocumentRevision {
                doc_id: doc_id.to_string(),
                rev_id: tombstone_id,
                sequence,
                parent_sequence: Some(parent.sequence),
                deleted: true,
                current: true,
                available: true,
                body: DocumentBody::new(),
                attachments: Vec::new(),
            })
        })?;

        self.events.post(Event::DocumentDeleted {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.to_string(),
        });
        Ok(rev)
    }

    /// Returns the winning revision of a document.
    pub fn get(&self, doc_id: &str) -> CoreResult<DocumentRevision> {
        self.db.read(|conn| {
            let leaves = revtree::leaves(conn, doc_id)?;
            let winner = revtree::winner_of(&leaves)
                .ok_or_else(|| CoreError::document_missing(doc_id))?;
            load_revision(conn, winner)
        })
    }

    /// Returns an exact revision.
    pub fn get_rev(&self, doc_id: &str, rev_id: &RevisionId) -> CoreResult<DocumentRevision> {
        self.db.read(|conn| {
            let row = revtree::rev_by_id(conn, doc_id, rev_id)?
                .ok_or_else(|| CoreError::revision_missing(doc_id, rev_id.to_string()))?;
            load_revision(conn, &row)
        })
    }

    /// All current leaves of the document's revision tree.
    pub fn leaves(&self, doc_id: &str) -> CoreResult<Vec<DocumentRevision>> {
        self.db.read(|conn| {
            revtree::leaves(conn, doc_id)?
                .iter()
                .map(|row| load_revision(conn, row))
                .collect()
        })
    }

    /// Non-winning, non-deleted current leaves: the conflict set.
    pub fn conflicts(&self, doc_id: &str) -> CoreResult<Vec<DocumentRevision>> {
        self.db.read(|conn| {
            let leaves = revtree::leaves(conn, doc_id)?;
            let winner_seq = revtree::winner_of(&leaves).map(|w| w.sequence);
            leaves
                .iter()
                .filter(|l| !l.deleted && Some(l.sequence) != winner_seq)
                .map(|row| load_revision(conn, row))
                .collect()
        })
    }

    /// Changes after `since`, at most `limit` documents, sequence-ascending.
    ///
    /// Each entry is the changed document's winning revision.
    pub fn changes(&self, since: u64, limit: usize) -> CoreResult<Changes> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT doc_id, MAX(sequence) AS seq FROM revs
                 WHERE current = 1 AND sequence > ?1
                 GROUP BY doc_id ORDER BY seq LIMIT ?2",
            )?;
            let changed = stmt
                .query_map(rusqlite::params![since, limit], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut results = Vec::with_capacity(changed.len());
            let mut last_sequence = since;
            for (doc_id, seq) in changed {
                last_sequence = last_sequence.max(seq);
                let leaves = revtree::leaves(conn, &doc_id)?;
                if let Some(winner) = revtree::winner_of(&leaves) {
                    results.push(load_revision(conn, winner)?);
                }
            }
            Ok(Changes {
                last_sequence,
                results,
            })
        })
    }

    /// Splices a replicated revision and its history into the local tree.
    ///
    /// Missing ancestors become unavailable stubs; inserting an existing
    /// leaf is a no-op and returns `None`. This is the only write path that
    /// bypasses the parent-must-be-leaf rule.
    pub fn force_insert(&self, insert: ForceInsert) -> CoreResult<Option<DocumentRevision>> {
        validate_doc_id(&insert.doc_id)?;
        validate_body(&insert.body)?;
        validate_history(&insert.history)?;
        let doc_id = insert.doc_id.clone();
        let leaf_rev = insert
            .history
            .last()
            .cloned()
            .ok_or_else(|| CoreError::invalid_argument("empty revision history"))?;

        let outcome = self.db.transaction(|tx| {
            if revtree::rev_by_id(tx, &doc_id, &leaf_rev)?.is_some() {
                return Ok(None);
            }
            let was_present = revtree::doc_exists(tx, &doc_id)?;
            revtree::ensure_doc(tx, &doc_id)?;

            // Deepest ancestor already in the tree, if any.
            let mut parent: Option<RevRow> = None;
            let mut splice_from = 0;
            for (i, rev) in insert.history.iter().enumerate().rev().skip(1) {
                if let Some(row) = revtree::rev_by_id(tx, &doc_id, rev)? {
                    splice_from = i + 1;
                    parent = Some(row);
                    break;
                }
            }

            let missing = insert.history.len() - splice_from;
            let first_sequence = allocate_sequence(tx, missing as u64)?;
            if let Some(parent) = &parent {
                if parent.current {
                    revtree::mark_not_current(tx, parent.sequence)?;
                }
            }

            let mut parent_sequence = parent.as_ref().map(|p| p.sequence);
            let mut sequence = first_sequence;
            for rev in &insert.history[splice_from..insert.history.len() - 1] {
                revtree::insert_rev(
                    tx,
                    sequence,
                    &doc_id,
                    rev,
                    parent_sequence,
                    false,
                    false,
                    false,
                    None,
                )?;
                parent_sequence = Some(sequence);
                sequence += 1;
            }

            let json = body_json(&insert.body);
            revtree::insert_rev(
                tx,
                sequence,
                &doc_id,
                &leaf_rev,
                parent_sequence,
                true,
                insert.deleted,
                true,
                if insert.deleted { None } else { Some(&json) },
            )?;
            for link in &insert.attachments {
                attachments::insert_row(tx, sequence, link)?;
            }
            let saved = attachments::for_sequence(tx, sequence)?;

            Ok(Some((
                DocumentRevision {
                    doc_id: doc_id.clone(),
                    rev_id: leaf_rev.clone(),
                    sequence,
                    parent_sequence,
                    deleted: insert.deleted,
                    current: true,
                    available: true,
                    body: insert.body.clone(),
                    attachments: saved,
                },
                was_present,
            )))
        })?;

        Ok(outcome.map(|(rev, was_present)| {
            let event = if !was_present {
                Event::DocumentCreated {
                    doc_id: rev.doc_id.clone(),
                    rev_id: rev.rev_id.to_string(),
                }
            } else if rev.deleted {
                Event::DocumentDeleted {
                    doc_id: rev.doc_id.clone(),
                    rev_id: rev.rev_id.to_string(),
                }
            } else {
                Event::DocumentUpdated {
                    doc_id: rev.doc_id.clone(),
                    rev_id: rev.rev_id.to_string(),
                }
            };
            self.events.post(event);
            rev
        }))
    }

    /// The revision ids from the root to `rev`, oldest first.
    pub fn revision_history(&self, rev: &DocumentRevision) -> CoreResult<Vec<RevisionId>> {
        self.db.read(|conn| revtree::history(conn, rev.sequence))
    }

    /// Streams `reader` into the blob store.
    ///
    /// Used by the pull pipeline to land attachment bodies before the
    /// owning revision commits; an aborted insert leaves an orphan blob
    /// that the next [`DocumentStore::gc_attachments`] removes.
    pub fn write_blob(&self, reader: &mut dyn Read) -> CoreResult<(BlobKey, u64)> {
        self.blobs.put(reader)
    }

    /// Returns true if the blob store holds `key`.
    pub fn blob_exists(&self, key: &BlobKey) -> bool {
        self.blobs.exists(key)
    }

    /// Opens a reader over an attachment's plain bytes.
    pub fn attachment_reader(
        &self,
        attachment: &SavedAttachment,
    ) -> CoreResult<Box<dyn Read + Send>> {
        attachments::open_reader(&self.blobs, attachment)
    }

    /// Prunes non-leaf revision bodies deeper than the configured depth.
    pub fn compact(&self) -> CoreResult<usize> {
        let depth = self.config.compaction_depth;
        self.db.transaction(|tx| {
            let mut stmt = tx.prepare("SELECT doc_id FROM docs")?;
            let doc_ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            let mut pruned = 0;
            for doc_id in doc_ids {
                pruned += revtree::compact_doc(tx, &doc_id, depth)?;
            }
            Ok(pruned)
        })
    }

    /// Removes blobs referenced by no revision. Returns the count removed.
    pub fn gc_attachments(&self) -> CoreResult<usize> {
        let live = self.db.read(|conn| attachments::live_keys(conn))?;
        self.blobs.gc(&live)
    }

    /// Reads a local (non-replicated) document.
    pub fn get_local_doc(&self, doc_id: &str) -> CoreResult<Option<Value>> {
        self.db.read(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT json FROM local_docs WHERE doc_id = ?1",
                    [doc_id],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).map_err(CoreError::from))
                .transpose()
        })
    }

    /// Writes a local (non-replicated) document, overwriting any previous
    /// value.
    pub fn put_local_doc(&self, doc_id: &str, value: &Value) -> CoreResult<()> {
        let json = serde_json::to_string(value)?;
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO local_docs (doc_id, json) VALUES (?1, ?2)
                 ON CONFLICT(doc_id) DO UPDATE SET json = excluded.json",
                [doc_id, json.as_str()],
            )?;
            Ok(())
        })
    }

    /// Deletes a local document. Absent ids are a no-op.
    pub fn delete_local_doc(&self, doc_id: &str) -> CoreResult<()> {
        self.db.transaction(|tx| {
            tx.execute("DELETE FROM local_docs WHERE doc_id = ?1", [doc_id])?;
            Ok(())
        })
    }

    /// Writes new attachment bodies to the blob store before the revision
    /// transaction opens, so blob I/O never runs under the SQL lock.
    fn store_new_attachments(
        &self,
        attachments: Vec<UnsavedAttachment>,
    ) -> CoreResult<Vec<AttachmentLink>> {
        let mut links = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            // revpos is patched to the child generation at insert.
            links.push(attachments::store_unsaved(&self.blobs, attachment, 0)?);
        }
        Ok(links)
    }
}

fn validate_doc_id(doc_id: &str) -> CoreResult<()> {
    if doc_id.is_empty() {
        return Err(CoreError::invalid_argument("document id must not be empty"));
    }
    if doc_id.chars().any(char::is_control) {
        return Err(CoreError::invalid_argument(
            "document id must be printable",
        ));
    }
    Ok(())
}

fn validate_body(body: &DocumentBody) -> CoreResult<()> {
    if let Some(key) = reserved_key(body) {
        return Err(CoreError::invalid_argument(format!(
            "body must not contain reserved key {key}"
        )));
    }
    Ok(())
}

fn validate_history(history: &[RevisionId]) -> CoreResult<()> {
    if history.is_empty() {
        return Err(CoreError::invalid_argument("empty revision history"));
    }
    for pair in history.windows(2) {
        if pair[1].generation() != pair[0].generation() + 1 {
            return Err(CoreError::invalid_argument(
                "revision history generations must be contiguous",
            ));
        }
    }
    Ok(())
}

fn body_json(body: &DocumentBody) -> String {
    let canonical = crate::revid::canonical_json(&Value::Object(body.clone()));
    String::from_utf8(canonical).unwrap_or_default()
}

fn allocate_sequence(conn: &Connection, count: u64) -> CoreResult<u64> {
    debug_assert!(count > 0);
    let last = info_counter(conn, "local_seq")?;
    info_set(conn, "local_seq", &(last + count).to_string())?;
    Ok(last + 1)
}

fn require_leaf(conn: &Connection, doc_id: &str, rev_id: &RevisionId) -> CoreResult<RevRow> {
    let row = revtree::rev_by_id(conn, doc_id, rev_id)?
        .ok_or_else(|| CoreError::revision_missing(doc_id, rev_id.to_string()))?;
    if !row.current {
        return Err(CoreError::conflict(doc_id, rev_id.to_string()));
    }
    Ok(row)
}

fn load_revision(conn: &Connection, row: &RevRow) -> CoreResult<DocumentRevision> {
    Ok(DocumentRevision {
        doc_id: row.doc_id.clone(),
        rev_id: row.rev_id.clone(),
        sequence: row.sequence,
        parent_sequence: row.parent_sequence,
        deleted: row.deleted,
        current: row.current,
        available: row.available,
        body: row.body()?,
        attachments: attachments::for_sequence(conn, row.sequence)?,
    })
}

fn relink(links: &[AttachmentLink], generation: u64) -> Vec<AttachmentLink> {
    links
        .iter()
        .map(|link| {
            let mut link = link.clone();
            link.revpos = generation;
            link
        })
        .collect()
}

fn link_to_saved(link: &AttachmentLink) -> SavedAttachment {
    SavedAttachment {
        name: link.name.clone(),
        content_type: link.content_type.clone(),
        key: link.key,
        encoding: link.encoding,
        length: link.length,
        encoded_length: link.encoded_length,
        revpos: link.revpos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn body(value: Value) -> DocumentBody {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn open_store(temp: &tempfile::TempDir) -> DocumentStore {
        DocumentStore::open(&temp.path().join("store")).unwrap()
    }

    #[test]
    fn create_and_get() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        let rev = store
            .create("tom", body(json!({"name": "Tom", "age": 31})), Vec::new())
            .unwrap();
        assert_eq!(rev.generation(), 1);
        assert_eq!(rev.sequence, 1);

        let fetched = store.get("tom").unwrap();
        assert_eq!(fetched.rev_id, rev.rev_id);
        assert_eq!(fetched.body["name"], json!("Tom"));
    }

    #[test]
    fn create_duplicate_fails() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        store.create("d", body(json!({"v": 1})), Vec::new()).unwrap();
        assert!(matches!(
            store.create("d", body(json!({"v": 2})), Vec::new()),
            Err(CoreError::DocumentExists { .. })
        ));
    }

    #[test]
    fn create_rejects_reserved_keys_and_bad_ids() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        assert!(store
            .create("d", body(json!({"_rev": "1-x"})), Vec::new())
            .is_err());
        assert!(store.create("", body(json!({})), Vec::new()).is_err());
    }

    #[test]
    fn update_requires_current_leaf() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store.create("d", body(json!({"v": 1})), Vec::new()).unwrap();
        let r2 = store
            .update("d", &r1.rev_id, body(json!({"v": 2})), Vec::new())
            .unwrap();
        assert_eq!(r2.generation(), 2);

        // r1 is no longer a leaf.
        assert!(matches!(
            store.update("d", &r1.rev_id, body(json!({"v": 3})), Vec::new()),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn delete_appends_tombstone() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store.create("d", body(json!({"v": 1})), Vec::new()).unwrap();
        let tombstone = store.delete("d", &r1.rev_id).unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.generation(), 2);
        assert!(tombstone.body.is_empty());

        let winner = store.get("d").unwrap();
        assert!(winner.deleted);
        assert_eq!(store.document_count().unwrap(), 0);

        // Deleting again conflicts.
        assert!(store.delete("d", &tombstone.rev_id).is_err());
    }

    #[test]
    fn recreate_after_delete_extends_tree() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store.create("d", body(json!({"v": 1})), Vec::new()).unwrap();
        let tombstone = store.delete("d", &r1.rev_id).unwrap();
        let r3 = store.create("d", body(json!({"v": 3})), Vec::new()).unwrap();
        assert_eq!(r3.generation(), tombstone.generation() + 1);
        assert!(!store.get("d").unwrap().deleted);
    }

    #[test]
    fn sequences_strictly_increase() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store.create("a", body(json!({})), Vec::new()).unwrap();
        let r2 = store.create("b", body(json!({})), Vec::new()).unwrap();
        let r3 = store
            .update("a", &r1.rev_id, body(json!({"v": 2})), Vec::new())
            .unwrap();
        assert!(r1.sequence < r2.sequence);
        assert!(r2.sequence < r3.sequence);
        assert_eq!(store.last_sequence().unwrap(), r3.sequence);
    }

    #[test]
    fn changes_lists_winners_in_sequence_order() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let ra = store.create("a", body(json!({"v": 1})), Vec::new()).unwrap();
        store.create("b", body(json!({"v": 1})), Vec::new()).unwrap();
        store
            .update("a", &ra.rev_id, body(json!({"v": 2})), Vec::new())
            .unwrap();

        let changes = store.changes(0, 100).unwrap();
        assert_eq!(changes.len(), 2);
        // "a" was updated after "b", so "b" comes first.
        assert_eq!(changes.ids(), vec!["b", "a"]);
        assert_eq!(changes.last_sequence, 3);

        let seqs: Vec<u64> = changes.results.iter().map(|r| r.sequence).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);

        // Paging past everything yields an empty set.
        let rest = store.changes(changes.last_sequence, 100).unwrap();
        assert!(rest.is_empty());
        assert_eq!(rest.last_sequence, changes.last_sequence);
    }

    #[test]
    fn changes_respects_limit() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        for i in 0..5 {
            store
                .create(&format!("doc-{i}"), body(json!({"i": i})), Vec::new())
                .unwrap();
        }
        let first = store.changes(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = store.changes(first.last_sequence, 100).unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn force_insert_splices_remote_branch() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store.create("d", body(json!({"v": 1})), Vec::new()).unwrap();

        let remote_leaf: RevisionId = format!("3-{}", "c".repeat(32)).parse().unwrap();
        let mid: RevisionId = format!("2-{}", "b".repeat(32)).parse().unwrap();
        let inserted = store
            .force_insert(ForceInsert {
                doc_id: "d".into(),
                history: vec![r1.rev_id.clone(), mid.clone(), remote_leaf.clone()],
                body: body(json!({"v": 3})),
                deleted: false,
                attachments: Vec::new(),
            })
            .unwrap()
            .unwrap();
        assert_eq!(inserted.rev_id, remote_leaf);

        // The stub ancestor exists but is unavailable.
        let stub = store.get_rev("d", &mid).unwrap();
        assert!(!stub.available);
        assert!(stub.body.is_empty());

        // Winner is the new leaf.
        assert_eq!(store.get("d").unwrap().rev_id, remote_leaf);
    }

    #[test]
    fn force_insert_is_idempotent() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let leaf: RevisionId = format!("1-{}", "a".repeat(32)).parse().unwrap();
        let insert = || ForceInsert {
            doc_id: "d".into(),
            history: vec![leaf.clone()],
            body: body(json!({"v": 1})),
            deleted: false,
            attachments: Vec::new(),
        };
        assert!(store.force_insert(insert()).unwrap().is_some());
        let seq_after_first = store.last_sequence().unwrap();
        assert!(store.force_insert(insert()).unwrap().is_none());
        assert_eq!(store.last_sequence().unwrap(), seq_after_first);
    }

    #[test]
    fn force_insert_preserves_conflict_branches() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store.create("d", body(json!({"v": 1})), Vec::new()).unwrap();

        let b1: RevisionId = format!("2-{}", "1".repeat(32)).parse().unwrap();
        let b2: RevisionId = format!("2-{}", "2".repeat(32)).parse().unwrap();
        for (rev, v) in [(b1.clone(), 21), (b2.clone(), 22)] {
            store
                .force_insert(ForceInsert {
                    doc_id: "d".into(),
                    history: vec![r1.rev_id.clone(), rev],
                    body: body(json!({"v": v})),
                    deleted: false,
                    attachments: Vec::new(),
                })
                .unwrap();
        }

        let leaves = store.leaves("d").unwrap();
        assert_eq!(leaves.len(), 2);
        // Winner: same generation, lexicographically greatest digest.
        assert_eq!(store.get("d").unwrap().rev_id, b2);
        let conflicts = store.conflicts("d").unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].rev_id, b1);
    }

    #[test]
    fn attachments_round_trip_and_copy_forward() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store
            .create(
                "d",
                body(json!({"v": 1})),
                vec![UnsavedAttachment::from_bytes(
                    "note.txt",
                    "text/plain",
                    b"hello".to_vec(),
                )],
            )
            .unwrap();
        assert_eq!(r1.attachments.len(), 1);
        assert_eq!(r1.attachments[0].revpos, 1);

        let mut data = Vec::new();
        store
            .attachment_reader(&r1.attachments[0])
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"hello");

        // Update without new attachments carries the old one forward.
        let r2 = store
            .update("d", &r1.rev_id, body(json!({"v": 2})), Vec::new())
            .unwrap();
        assert_eq!(r2.attachments.len(), 1);
        assert_eq!(r2.attachments[0].key, r1.attachments[0].key);
        assert_eq!(r2.attachments[0].revpos, 1);
    }

    #[test]
    fn attachment_gc_keeps_referenced_blobs() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let r1 = store
            .create(
                "d",
                body(json!({})),
                vec![UnsavedAttachment::from_bytes(
                    "a.bin",
                    "application/octet-stream",
                    vec![1, 2, 3],
                )],
            )
            .unwrap();

        // An orphan blob with no attachment row.
        let (orphan, _) = store.write_blob(&mut std::io::Cursor::new(b"orphan")).unwrap();
        assert!(store.blob_exists(&orphan));

        assert_eq!(store.gc_attachments().unwrap(), 1);
        assert!(!store.blob_exists(&orphan));
        assert!(store.blob_exists(&r1.attachments[0].key));
    }

    #[test]
    fn compact_prunes_deep_bodies_keeps_rev_ids() {
        let temp = tempdir().unwrap();
        let store = DocumentStore::open_with_config(
            &temp.path().join("store"),
            StoreConfig::default().with_compaction_depth(1),
        )
        .unwrap();

        let mut rev = store.create("d", body(json!({"v": 0})), Vec::new()).unwrap();
        for v in 1..5 {
            rev = store
                .update("d", &rev.rev_id, body(json!({"v": v})), Vec::new())
                .unwrap();
        }
        let pruned = store.compact().unwrap();
        assert!(pruned > 0);

        // The leaf is intact, deep ancestors lost bodies but kept ids.
        let leaf = store.get("d").unwrap();
        assert_eq!(leaf.body["v"], json!(4));
        let history = store.revision_history(&leaf).unwrap();
        assert_eq!(history.len(), 5);
        let oldest = store.get_rev("d", &history[0]).unwrap();
        assert!(!oldest.available);
    }

    #[test]
    fn local_docs_round_trip() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        assert!(store.get_local_doc("ckpt").unwrap().is_none());
        store.put_local_doc("ckpt", &json!({"last_seq": 7})).unwrap();
        assert_eq!(
            store.get_local_doc("ckpt").unwrap().unwrap()["last_seq"],
            json!(7)
        );
        store.put_local_doc("ckpt", &json!({"last_seq": 9})).unwrap();
        assert_eq!(
            store.get_local_doc("ckpt").unwrap().unwrap()["last_seq"],
            json!(9)
        );
        store.delete_local_doc("ckpt").unwrap();
        assert!(store.get_local_doc("ckpt").unwrap().is_none());
    }

    #[test]
    fn events_fire_after_mutations() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let rx = store.subscribe();

        let r1 = store.create("d", body(json!({"v": 1})), Vec::new()).unwrap();
        let r2 = store
            .update("d", &r1.rev_id, body(json!({"v": 2})), Vec::new())
            .unwrap();
        store.delete("d", &r2.rev_id).unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::DocumentCreated { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::DocumentUpdated { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::DocumentDeleted { .. }
        ));
    }
}
