//! Revision tree operations over the `revs` table.
//!
//! Each document's revisions form a tree rooted at its generation-1
//! revisions. Rows flagged `current` are the leaves; the winner among them
//! is computed, never stored, so it cannot drift from the deterministic
//! rule. The tree only ever grows, except for `compact_doc` which prunes
//! deep non-leaf bodies while keeping their ids for protocol compatibility.

use crate::document::DocumentBody;
use crate::error::{CoreError, CoreResult};
use crate::revid::RevisionId;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

/// A raw `revs` row.
#[derive(Debug, Clone)]
pub(crate) struct RevRow {
    pub sequence: u64,
    pub doc_id: String,
    pub rev_id: RevisionId,
    pub parent_sequence: Option<u64>,
    pub current: bool,
    pub deleted: bool,
    pub available: bool,
    pub json: Option<String>,
}

impl RevRow {
    pub fn body(&self) -> CoreResult<DocumentBody> {
        match &self.json {
            Some(json) if !json.is_empty() => Ok(serde_json::from_str(json)?),
            _ => Ok(DocumentBody::new()),
        }
    }
}

const REV_COLUMNS: &str =
    "sequence, doc_id, rev_id, parent_sequence, current, deleted, available, json";

fn row_from_sql(row: &Row<'_>) -> rusqlite::Result<(u64, String, String, Option<u64>, bool, bool, bool, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_rev_row(
    raw: (u64, String, String, Option<u64>, bool, bool, bool, Option<String>),
) -> CoreResult<RevRow> {
    Ok(RevRow {
        sequence: raw.0,
        doc_id: raw.1,
        rev_id: raw.2.parse()?,
        parent_sequence: raw.3,
        current: raw.4,
        deleted: raw.5,
        available: raw.6,
        json: raw.7,
    })
}

/// Ensures a `docs` row exists for `doc_id`.
pub(crate) fn ensure_doc(conn: &Connection, doc_id: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO docs (doc_id) VALUES (?1) ON CONFLICT(doc_id) DO NOTHING",
        [doc_id],
    )?;
    Ok(())
}

/// Returns true if any revision exists for `doc_id`.
pub(crate) fn doc_exists(conn: &Connection, doc_id: &str) -> CoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM revs WHERE doc_id = ?1 LIMIT 1",
            [doc_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Fetches an exact revision.
pub(crate) fn rev_by_id(
    conn: &Connection,
    doc_id: &str,
    rev_id: &RevisionId,
) -> CoreResult<Option<RevRow>> {
    let raw = conn
        .query_row(
            &format!("SELECT {REV_COLUMNS} FROM revs WHERE doc_id = ?1 AND rev_id = ?2"),
            params![doc_id, rev_id.to_string()],
            row_from_sql,
        )
        .optional()?;
    raw.map(into_rev_row).transpose()
}

/// Fetches a revision by its sequence.
pub(crate) fn rev_by_sequence(conn: &Connection, sequence: u64) -> CoreResult<Option<RevRow>> {
    let raw = conn
        .query_row(
            &format!("SELECT {REV_COLUMNS} FROM revs WHERE sequence = ?1"),
            [sequence],
            row_from_sql,
        )
        .optional()?;
    raw.map(into_rev_row).transpose()
}

/// Returns the current leaves of the document's revision tree.
pub(crate) fn leaves(conn: &Connection, doc_id: &str) -> CoreResult<Vec<RevRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REV_COLUMNS} FROM revs WHERE doc_id = ?1 AND current = 1 ORDER BY sequence"
    ))?;
    let raws = stmt
        .query_map([doc_id], row_from_sql)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(into_rev_row).collect()
}

/// Selects the winning leaf.
///
/// Among non-deleted leaves the highest `(generation, rev_id)` wins; if all
/// leaves are deleted, the same rule applies to the tombstones and the
/// document as a whole counts as deleted.
pub(crate) fn winner_of(leaves: &[RevRow]) -> Option<&RevRow> {
    leaves
        .iter()
        .filter(|l| !l.deleted)
        .max_by(|a, b| a.rev_id.cmp(&b.rev_id))
        .or_else(|| leaves.iter().max_by(|a, b| a.rev_id.cmp(&b.rev_id)))
}

/// Walks the ancestor chain from `sequence` up to the root.
///
/// Returns rows leaf-first.
pub(crate) fn path_to_root(conn: &Connection, sequence: u64) -> CoreResult<Vec<RevRow>> {
    let mut path = Vec::new();
    let mut next = Some(sequence);
    while let Some(seq) = next {
        let row = rev_by_sequence(conn, seq)?.ok_or_else(|| {
            CoreError::invalid_format(format!("dangling parent_sequence {seq}"))
        })?;
        next = row.parent_sequence;
        path.push(row);
    }
    Ok(path)
}

/// The revision ids from root to `sequence`, oldest first.
pub(crate) fn history(conn: &Connection, sequence: u64) -> CoreResult<Vec<RevisionId>> {
    let mut ids: Vec<RevisionId> = path_to_root(conn, sequence)?
        .into_iter()
        .map(|r| r.rev_id)
        .collect();
    ids.reverse();
    Ok(ids)
}

/// Inserts a revision row. The caller allocates `sequence`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_rev(
    conn: &Connection,
    sequence: u64,
    doc_id: &str,
    rev_id: &RevisionId,
    parent_sequence: Option<u64>,
    current: bool,
    deleted: bool,
    available: bool,
    json: Option<&str>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO revs (sequence, doc_id, rev_id, parent_sequence, current, deleted, available, json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sequence,
            doc_id,
            rev_id.to_string(),
            parent_sequence,
            current,
            deleted,
            available,
            json
        ],
    )?;
    Ok(())
}

/// Clears the `current` flag on a revision that gained a child.
pub(crate) fn mark_not_current(conn: &Connection, sequence: u64) -> CoreResult<()> {
    conn.execute(
        "UPDATE revs SET current = 0 WHERE sequence = ?1",
        [sequence],
    )?;
    Ok(())
}

/// Prunes non-leaf bodies deeper than `depth` below every leaf.
///
/// Pruned rows keep their `rev_id` (so `revs_diff` and history exchange
/// still work) but lose their JSON and become unavailable.
pub(crate) fn compact_doc(conn: &Connection, doc_id: &str, depth: u64) -> CoreResult<usize> {
    // A revision survives if some leaf is within `depth` generations of it.
    let keep_floor: Option<u64> = leaves(conn, doc_id)?
        .iter()
        .map(|l| l.rev_id.generation().saturating_sub(depth))
        .min();
    let Some(floor) = keep_floor else {
        return Ok(0);
    };
    let mut stmt = conn.prepare(
        "SELECT sequence, rev_id FROM revs
         WHERE doc_id = ?1 AND current = 0 AND available = 1",
    )?;
    let candidates = stmt
        .query_map([doc_id], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut pruned = 0;
    for (sequence, rev_id) in candidates {
        let rev_id: RevisionId = rev_id.parse()?;
        if rev_id.generation() < floor {
            conn.execute(
                "UPDATE revs SET json = NULL, available = 0 WHERE sequence = ?1",
                [sequence],
            )?;
            pruned += 1;
        }
    }
    if pruned > 0 {
        debug!(doc_id, pruned, "compacted revision tree");
    }
    Ok(pruned)
}
