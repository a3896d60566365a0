//! The push pipeline: local changes → remote revs_diff → build → write →
//! checkpoint.
//!
//! Writers run `parallelism` wide; each job is either a `_bulk_docs` chunk
//! (attachments inline as base64) or a single multipart PUT for documents
//! whose attachments exceed the inline threshold. The checkpoint carries
//! the local sequence of the last document in the batch and is written
//! only after every job in the batch has landed.

use crate::config::REVS_DIFF_CHUNK;
use crate::error::{SyncError, SyncResult};
use crate::replicator::{send_bounded, PipelineContext};
use crossbeam::channel::bounded;
use ferrydb_core::{AttachmentEncoding, CoreError, DocumentRevision};
use ferrydb_sync_protocol::{
    format_digest, AttachmentMeta, DocumentRevs, Revisions, RevsDiffRequest,
};
use flate2::read::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// One write job for the writer stage.
enum WriteJob {
    /// A `_bulk_docs` chunk.
    Bulk(Vec<DocumentRevs>),
    /// A multipart PUT of one document with attachment parts.
    Multipart(DocumentRevs, Vec<(String, Vec<u8>)>),
}

impl WriteJob {
    fn doc_count(&self) -> u64 {
        match self {
            Self::Bulk(docs) => docs.len() as u64,
            Self::Multipart(..) => 1,
        }
    }
}

/// Runs a push to completion or cancellation.
pub(crate) fn run(ctx: &PipelineContext<'_>) -> SyncResult<()> {
    let replication_id = ctx.replication_id.clone();
    let mut since = ctx.remote.get_checkpoint(&replication_id)?.unwrap_or(0);
    info!(replication_id = %replication_id, since, "push starting");

    loop {
        ctx.check_cancelled()?;
        let changes = ctx.store.changes(since, ctx.config.batch_size)?;
        if changes.is_empty() {
            break;
        }
        let batch_last = changes.last_sequence;
        debug!(rows = changes.len(), batch_last, "pushing local batch");

        push_batch(ctx, &changes.results)?;

        ctx.check_cancelled()?;
        ctx.remote.put_checkpoint(&replication_id, batch_last)?;
        ctx.progress.batches.fetch_add(1, Ordering::SeqCst);
        since = batch_last;
    }
    Ok(())
}

fn push_batch(ctx: &PipelineContext<'_>, revisions: &[DocumentRevision]) -> SyncResult<()> {
    let jobs = build_jobs(ctx, revisions)?;
    if jobs.is_empty() {
        return Ok(());
    }

    let capacity = ctx.config.queue_capacity();
    let writers = ctx.config.parallelism.max(1);
    let first_error: Mutex<Option<SyncError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        let (job_tx, job_rx) = bounded::<WriteJob>(capacity);

        {
            let first_error = &first_error;
            scope.spawn(move || {
                for job in jobs {
                    let abort = || ctx.is_cancelled() || first_error.lock().is_some();
                    if !send_bounded(&job_tx, job, abort) {
                        break;
                    }
                }
            });
        }

        for _ in 0..writers {
            let job_rx = job_rx.clone();
            let first_error = &first_error;
            scope.spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    if ctx.is_cancelled() || first_error.lock().is_some() {
                        break;
                    }
                    let written = job.doc_count();
                    let outcome = match job {
                        WriteJob::Bulk(docs) => write_bulk(ctx, docs),
                        WriteJob::Multipart(doc, parts) => {
                            ctx.remote.put_doc_with_attachments(&doc, &parts)
                        }
                    };
                    match outcome {
                        Ok(()) => {
                            ctx.progress.documents.fetch_add(written, Ordering::SeqCst);
                        }
                        Err(err) => {
                            first_error.lock().get_or_insert(err);
                            break;
                        }
                    }
                }
            });
        }
    });

    ctx.check_cancelled()?;
    match first_error.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn write_bulk(ctx: &PipelineContext<'_>, docs: Vec<DocumentRevs>) -> SyncResult<()> {
    let rows = ctx.remote.bulk_docs(&docs)?;
    for row in rows.iter().filter(|row| row.is_error()) {
        // With new_edits=false a reported row is a per-document failure,
        // not a replication failure.
        warn!(
            id = %row.id,
            error = row.error.as_deref().unwrap_or("unknown"),
            "bulk_docs rejected document"
        );
    }
    Ok(())
}

/// Builds the batch's write jobs: asks the remote what it lacks, then
/// assembles one wire document per missing revision.
fn build_jobs(
    ctx: &PipelineContext<'_>,
    revisions: &[DocumentRevision],
) -> SyncResult<Vec<WriteJob>> {
    // Offer every current leaf so conflict branches replicate too.
    let mut offers: Vec<(String, Vec<String>)> = Vec::with_capacity(revisions.len());
    for revision in revisions {
        let leaves = ctx
            .store
            .leaves(&revision.doc_id)?
            .iter()
            .map(|leaf| leaf.rev_id.to_string())
            .collect();
        offers.push((revision.doc_id.clone(), leaves));
    }

    let mut missing: Vec<(String, String)> = Vec::new();
    for chunk in offers.chunks(REVS_DIFF_CHUNK) {
        ctx.check_cancelled()?;
        let request: RevsDiffRequest = chunk.iter().cloned().collect();
        let response = ctx.remote.revs_diff(&request)?;
        for (id, diff) in response {
            for rev in diff.missing {
                missing.push((id.clone(), rev));
            }
        }
    }

    let mut jobs = Vec::new();
    let mut bulk: Vec<DocumentRevs> = Vec::new();
    for (id, rev) in missing {
        ctx.check_cancelled()?;
        match build_doc(ctx, &id, &rev)? {
            BuiltDoc::Inline(doc) => {
                bulk.push(doc);
                if bulk.len() >= ctx.config.bulk_chunk_size {
                    jobs.push(WriteJob::Bulk(std::mem::take(&mut bulk)));
                }
            }
            BuiltDoc::Multipart(doc, parts) => jobs.push(WriteJob::Multipart(doc, parts)),
        }
    }
    if !bulk.is_empty() {
        jobs.push(WriteJob::Bulk(bulk));
    }
    Ok(jobs)
}

enum BuiltDoc {
    Inline(DocumentRevs),
    Multipart(DocumentRevs, Vec<(String, Vec<u8>)>),
}

fn build_doc(ctx: &PipelineContext<'_>, id: &str, rev: &str) -> SyncResult<BuiltDoc> {
    let rev_id: ferrydb_core::RevisionId = rev.parse()?;
    let revision = ctx.store.get_rev(id, &rev_id)?;
    let history = ctx.store.revision_history(&revision)?;
    let revisions = Revisions {
        start: revision.generation(),
        ids: history
            .iter()
            .rev()
            .map(|rev| rev.digest().to_string())
            .collect(),
    };

    let mut metas = BTreeMap::new();
    let mut parts = Vec::new();
    for attachment in &revision.attachments {
        let mut plain = Vec::new();
        ctx.store
            .attachment_reader(attachment)?
            .read_to_end(&mut plain)
            .map_err(|e| SyncError::Storage(CoreError::Io(e)))?;

        let mut meta = AttachmentMeta {
            content_type: attachment.content_type.clone(),
            revpos: Some(attachment.revpos),
            digest: Some(format_digest(&attachment.key.to_string())),
            length: Some(attachment.length),
            ..AttachmentMeta::default()
        };
        if plain.len() as u64 <= ctx.config.inline_attachment_limit {
            meta.data = Some(AttachmentMeta::encode_data(&plain));
        } else {
            let wire = match attachment.encoding {
                AttachmentEncoding::Gzip => {
                    let mut encoded = Vec::new();
                    GzEncoder::new(plain.as_slice(), Compression::default())
                        .read_to_end(&mut encoded)
                        .map_err(|e| SyncError::Storage(CoreError::Io(e)))?;
                    meta.encoding = Some("gzip".into());
                    meta.encoded_length = Some(encoded.len() as u64);
                    encoded
                }
                AttachmentEncoding::Plain => plain,
            };
            meta.follows = Some(true);
            parts.push((attachment.content_type.clone(), wire));
        }
        metas.insert(attachment.name.clone(), meta);
    }

    let doc = DocumentRevs {
        id: id.to_string(),
        rev: rev.to_string(),
        deleted: revision.deleted,
        revisions: Some(revisions),
        attachments: metas,
        body: revision.body,
    };
    Ok(if parts.is_empty() {
        BuiltDoc::Inline(doc)
    } else {
        BuiltDoc::Multipart(doc, parts)
    })
}
