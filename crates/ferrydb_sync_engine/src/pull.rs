//! The pull pipeline: changes → revs_diff → fetch → insert → checkpoint.
//!
//! Fetchers run `parallelism` wide over bounded queues; inserts stay on a
//! single writer thread. The checkpoint for a batch is written only after
//! every insert in that batch has committed, so a cancelled or failed
//! batch is simply refetched on the next run.

use crate::config::REVS_DIFF_CHUNK;
use crate::error::{SyncError, SyncResult};
use crate::remote::OpenRevision;
use crate::replicator::{send_bounded, PipelineContext};
use crossbeam::channel::bounded;
use ferrydb_core::{AttachmentEncoding, AttachmentLink, ForceInsert};
use ferrydb_sync_protocol::{ChangesResponse, RevsDiffRequest};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// One unit of fetch work: a document and the revisions we lack.
struct FetchItem {
    id: String,
    revs: Vec<String>,
    atts_since: Vec<String>,
}

/// Runs a pull to completion or cancellation.
pub(crate) fn run(ctx: &PipelineContext<'_>) -> SyncResult<()> {
    let replication_id = ctx.replication_id.clone();
    let mut since = ctx.remote.get_checkpoint(&replication_id)?.unwrap_or(0);
    info!(replication_id = %replication_id, since, "pull starting");

    loop {
        ctx.check_cancelled()?;
        let changes = ctx.remote.changes(since, ctx.config.batch_size)?;
        if changes.results.is_empty() {
            break;
        }
        let batch_last = changes.last_seq;
        debug!(rows = changes.results.len(), batch_last, "pulled changes batch");

        process_batch(ctx, changes)?;

        // Never advance the checkpoint over an unfinished batch.
        ctx.check_cancelled()?;
        ctx.remote.put_checkpoint(&replication_id, batch_last)?;
        ctx.progress.batches.fetch_add(1, Ordering::SeqCst);
        since = batch_last;
    }
    Ok(())
}

fn process_batch(ctx: &PipelineContext<'_>, changes: ChangesResponse) -> SyncResult<()> {
    let work = diff_batch(ctx, &changes)?;
    if work.is_empty() {
        return Ok(());
    }

    let capacity = ctx.config.queue_capacity();
    let fetchers = ctx.config.parallelism.max(1);
    let first_error: Mutex<Option<SyncError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        let (work_tx, work_rx) = bounded::<FetchItem>(capacity);
        let (result_tx, result_rx) = bounded::<Vec<OpenRevision>>(capacity);
        let abort = || ctx.is_cancelled() || first_error.lock().is_some();

        {
            let first_error = &first_error;
            scope.spawn(move || {
                for item in work {
                    let abort = || ctx.is_cancelled() || first_error.lock().is_some();
                    if !send_bounded(&work_tx, item, abort) {
                        break;
                    }
                }
                // Sender drops here; fetchers drain and exit.
            });
        }

        for _ in 0..fetchers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let first_error = &first_error;
            scope.spawn(move || {
                while let Ok(item) = work_rx.recv() {
                    if ctx.is_cancelled() {
                        break;
                    }
                    match ctx.remote.open_revs(&item.id, &item.revs, &item.atts_since) {
                        Ok(revisions) => {
                            let abort = || ctx.is_cancelled() || first_error.lock().is_some();
                            if !send_bounded(&result_tx, revisions, abort) {
                                break;
                            }
                        }
                        Err(err) => {
                            first_error.lock().get_or_insert(err);
                            break;
                        }
                    }
                }
            });
        }
        drop(result_tx);
        drop(work_rx);

        // Single-writer insert stage.
        for revisions in result_rx.iter() {
            if abort() {
                break;
            }
            for open in revisions {
                if let Err(err) = insert_revision(ctx, open) {
                    first_error.lock().get_or_insert(err);
                    break;
                }
            }
        }
        // result_rx drops as the closure returns, unblocking any fetcher
        // still mid-send before the scope joins its threads.
    });

    ctx.check_cancelled()?;
    match first_error.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Narrows a changes batch to the revisions we actually lack.
fn diff_batch(
    ctx: &PipelineContext<'_>,
    changes: &ChangesResponse,
) -> SyncResult<Vec<FetchItem>> {
    let mut work = Vec::new();
    for rows in changes.results.chunks(REVS_DIFF_CHUNK) {
        ctx.check_cancelled()?;
        let request: RevsDiffRequest = rows
            .iter()
            .map(|row| (row.id.clone(), row.revs()))
            .collect();
        let response = ctx.remote.revs_diff(&request)?;
        for (id, diff) in response {
            if diff.missing.is_empty() {
                continue;
            }
            let atts_since: Vec<String> = ctx
                .store
                .leaves(&id)?
                .iter()
                .map(|leaf| leaf.rev_id.to_string())
                .collect();
            work.push(FetchItem {
                id,
                revs: diff.missing,
                atts_since,
            });
        }
    }
    Ok(work)
}

/// Writes one fetched revision: blobs first, then the revision row and its
/// attachment links in a single store transaction.
fn insert_revision(ctx: &PipelineContext<'_>, open: OpenRevision) -> SyncResult<()> {
    let history = open
        .doc
        .history_oldest_first()
        .iter()
        .map(|rev| rev.parse().map_err(SyncError::from))
        .collect::<SyncResult<Vec<_>>>()?;
    let leaf_generation = open
        .doc
        .rev
        .parse::<ferrydb_core::RevisionId>()
        .map(|rev| rev.generation())
        .unwrap_or(1);

    let mut links = Vec::new();
    for attachment in &open.attachments {
        let mut cursor = Cursor::new(attachment.data.as_slice());
        let (key, length) = ctx.store.write_blob(&mut cursor)?;
        let encoding = match attachment.encoding.as_deref() {
            Some("gzip") => AttachmentEncoding::Gzip,
            _ => AttachmentEncoding::Plain,
        };
        links.push(AttachmentLink {
            name: attachment.name.clone(),
            content_type: attachment.content_type.clone(),
            key,
            encoding,
            length,
            encoded_length: attachment.encoded_length.unwrap_or(length),
            revpos: attachment.revpos.unwrap_or(leaf_generation),
        });
    }

    // Attachments the peer stubbed out are content we already hold; re-link
    // them from the local leaves we advertised in atts_since.
    for (name, meta) in &open.doc.attachments {
        if meta.stub != Some(true) {
            continue;
        }
        let local = ctx
            .store
            .leaves(&open.doc.id)?
            .iter()
            .find_map(|leaf| leaf.attachment(name).cloned())
            .ok_or_else(|| {
                SyncError::protocol(format!(
                    "peer stubbed attachment {name} but no local copy exists"
                ))
            })?;
        links.push(AttachmentLink {
            name: local.name.clone(),
            content_type: local.content_type.clone(),
            key: local.key,
            encoding: local.encoding,
            length: local.length,
            encoded_length: local.encoded_length,
            revpos: local.revpos,
        });
    }

    let inserted = ctx.store.force_insert(ForceInsert {
        doc_id: open.doc.id.clone(),
        history,
        body: open.doc.body.clone(),
        deleted: open.doc.deleted,
        attachments: links,
    })?;
    if inserted.is_some() {
        ctx.progress.documents.fetch_add(1, Ordering::SeqCst);
    } else {
        warn!(doc_id = %open.doc.id, rev = %open.doc.rev, "revision already present, skipping");
    }
    Ok(())
}
