//! Attachment rows and their binding to revisions.
//!
//! Attachment metadata lives in the `attachments` table keyed by
//! `(sequence, filename)`; bodies live in the blob store keyed by the SHA-1
//! of the plain bytes. A child revision that keeps its parent's attachments
//! re-links the same blob keys instead of copying bytes.

use crate::blob::{BlobKey, BlobStore};
use crate::document::{AttachmentEncoding, SavedAttachment, UnsavedAttachment};
use crate::error::CoreResult;
use flate2::read::GzDecoder;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::io::Read;

/// Metadata for an attachment arriving from replication, whose blob has
/// already been written.
#[derive(Debug, Clone)]
pub struct AttachmentLink {
    /// Attachment name.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Blob store key of the plain bytes.
    pub key: BlobKey,
    /// Wire encoding this attachment travelled with.
    pub encoding: AttachmentEncoding,
    /// Plain length in bytes.
    pub length: u64,
    /// Encoded length in bytes.
    pub encoded_length: u64,
    /// Generation that introduced this content.
    pub revpos: u64,
}

/// Inserts an attachment row for `sequence`, replacing any row copied over
/// from a previous revision under the same name.
pub(crate) fn insert_row(conn: &Connection, sequence: u64, link: &AttachmentLink) -> CoreResult<()> {
    conn.execute(
        "DELETE FROM attachments WHERE sequence = ?1 AND filename = ?2",
        params![sequence, link.name],
    )?;
    conn.execute(
        "INSERT INTO attachments
            (sequence, filename, key, type, encoding, length, encoded_length, revpos)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sequence,
            link.name,
            link.key.as_bytes().as_slice(),
            link.content_type,
            link.encoding.as_i64(),
            link.length,
            link.encoded_length,
            link.revpos
        ],
    )?;
    Ok(())
}

/// Copies the parent revision's attachment rows onto a child revision,
/// re-linking the same blob keys.
pub(crate) fn copy_forward(
    conn: &Connection,
    parent_sequence: u64,
    child_sequence: u64,
) -> CoreResult<usize> {
    let copied = conn.execute(
        "INSERT INTO attachments
            (sequence, filename, key, type, encoding, length, encoded_length, revpos)
         SELECT ?2, filename, key, type, encoding, length, encoded_length, revpos
         FROM attachments WHERE sequence = ?1",
        params![parent_sequence, child_sequence],
    )?;
    Ok(copied)
}

/// Loads the attachment rows for a revision.
pub(crate) fn for_sequence(conn: &Connection, sequence: u64) -> CoreResult<Vec<SavedAttachment>> {
    let mut stmt = conn.prepare(
        "SELECT filename, type, key, encoding, length, encoded_length, revpos
         FROM attachments WHERE sequence = ?1 ORDER BY filename",
    )?;
    let raws = stmt
        .query_map([sequence], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, u64>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, u64>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut attachments = Vec::with_capacity(raws.len());
    for (name, content_type, key, encoding, length, encoded_length, revpos) in raws {
        attachments.push(SavedAttachment {
            name,
            content_type,
            key: BlobKey::from_bytes(&key)?,
            encoding: AttachmentEncoding::from_i64(encoding),
            length,
            encoded_length,
            revpos,
        });
    }
    Ok(attachments)
}

/// All blob keys referenced by at least one revision.
pub(crate) fn live_keys(conn: &Connection) -> CoreResult<HashSet<BlobKey>> {
    let mut stmt = conn.prepare("SELECT DISTINCT key FROM attachments")?;
    let raws = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut keys = HashSet::with_capacity(raws.len());
    for raw in raws {
        keys.insert(BlobKey::from_bytes(&raw)?);
    }
    Ok(keys)
}

/// Writes a new attachment's bytes to the blob store and returns its link
/// metadata for `revpos`.
pub(crate) fn store_unsaved(
    blobs: &BlobStore,
    attachment: UnsavedAttachment,
    revpos: u64,
) -> CoreResult<AttachmentLink> {
    let mut data = attachment.data;
    let (key, length) = blobs.put(&mut *data)?;
    Ok(AttachmentLink {
        name: attachment.name,
        content_type: attachment.content_type,
        key,
        encoding: AttachmentEncoding::Plain,
        length,
        encoded_length: length,
        revpos,
    })
}

/// Opens a reader over the attachment's plain bytes.
pub(crate) fn open_reader(
    blobs: &BlobStore,
    attachment: &SavedAttachment,
) -> CoreResult<Box<dyn Read + Send>> {
    let file = blobs.get(&attachment.key)?;
    Ok(Box::new(file))
}

/// Decodes a gzip-encoded wire body into plain bytes.
pub fn gunzip(bytes: &[u8]) -> CoreResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut plain = Vec::new();
    decoder.read_to_end(&mut plain)?;
    Ok(plain)
}
