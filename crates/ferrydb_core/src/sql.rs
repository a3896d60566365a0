//! Relational store adapter.
//!
//! Wraps a single SQLite connection behind a mutex: SQLite serializes
//! writers per connection, so the store runs a single-writer discipline and
//! readers take the same lock. Cursors are mapped and fully consumed inside
//! the closure that opened them, so no cursor outlives its lock scope.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version, stored in the `info` table.
const SCHEMA_VERSION: u64 = 1;

const SCHEMA: &str = "
CREATE TABLE docs (
    doc_id TEXT PRIMARY KEY
);
CREATE TABLE revs (
    sequence INTEGER PRIMARY KEY,
    doc_id TEXT NOT NULL REFERENCES docs(doc_id),
    rev_id TEXT NOT NULL,
    parent_sequence INTEGER REFERENCES revs(sequence)
        CHECK (parent_sequence < sequence),
    current INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    available INTEGER NOT NULL DEFAULT 1,
    json TEXT,
    UNIQUE (doc_id, rev_id)
);
CREATE INDEX revs_by_doc ON revs(doc_id, current);
CREATE TABLE attachments (
    sequence INTEGER NOT NULL REFERENCES revs(sequence),
    filename TEXT NOT NULL,
    key BLOB NOT NULL,
    type TEXT NOT NULL,
    encoding INTEGER NOT NULL DEFAULT 0,
    length INTEGER NOT NULL,
    encoded_length INTEGER NOT NULL,
    revpos INTEGER NOT NULL,
    PRIMARY KEY (sequence, filename)
);
CREATE INDEX attachments_by_key ON attachments(key);
CREATE TABLE local_docs (
    doc_id TEXT PRIMARY KEY,
    json TEXT NOT NULL
);
CREATE TABLE info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// A typed SQL executor over one SQLite connection.
///
/// All access goes through [`SqlDatabase::read`] or
/// [`SqlDatabase::transaction`]; the latter guarantees commit-on-success and
/// rollback on error (including rollback when a closure observes
/// cancellation and returns an error).
pub struct SqlDatabase {
    conn: Mutex<Connection>,
}

impl SqlDatabase {
    /// Opens (or bootstraps) the database file at `path`.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database, bootstrapping the schema.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        bootstrap(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs a read-only closure against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside a transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back when it
    /// returns `Err`, including mid-transaction failures from SQLite itself.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls back.
                drop(tx);
                Err(err)
            }
        }
    }
}

/// Reads a value from the `info` table.
pub fn info_get(conn: &Connection, key: &str) -> CoreResult<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM info WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

/// Writes a value into the `info` table.
pub fn info_set(conn: &Connection, key: &str, value: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO info (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Reads an integer counter from the `info` table, defaulting to 0.
pub fn info_counter(conn: &Connection, key: &str) -> CoreResult<u64> {
    match info_get(conn, key)? {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| CoreError::invalid_format(format!("non-numeric info value for {key}"))),
        None => Ok(0),
    }
}

fn bootstrap(conn: &Connection) -> CoreResult<()> {
    let has_info: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'info'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    if has_info.is_none() {
        info!("bootstrapping new store schema v{SCHEMA_VERSION}");
        conn.execute_batch(SCHEMA)?;
        info_set(conn, "schema_version", &SCHEMA_VERSION.to_string())?;
        info_set(conn, "local_seq", "0")?;
        return Ok(());
    }

    let version = info_counter(conn, "schema_version")?;
    if version > SCHEMA_VERSION {
        return Err(CoreError::invalid_format(format!(
            "store schema v{version} is newer than supported v{SCHEMA_VERSION}"
        )));
    }
    // Linear migration chain; one version so far.
    if version < SCHEMA_VERSION {
        debug!(from = version, to = SCHEMA_VERSION, "migrating store schema");
        info_set(conn, "schema_version", &SCHEMA_VERSION.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_schema() {
        let db = SqlDatabase::open_in_memory().unwrap();
        db.read(|conn| {
            assert_eq!(info_counter(conn, "schema_version")?, SCHEMA_VERSION);
            assert_eq!(info_counter(conn, "local_seq")?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn transaction_commits_on_success() {
        let db = SqlDatabase::open_in_memory().unwrap();
        db.transaction(|tx| {
            info_set(tx, "local_seq", "42")?;
            Ok(())
        })
        .unwrap();
        db.read(|conn| {
            assert_eq!(info_counter(conn, "local_seq")?, 42);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = SqlDatabase::open_in_memory().unwrap();
        let result: CoreResult<()> = db.transaction(|tx| {
            info_set(tx, "local_seq", "42")?;
            Err(CoreError::invalid_argument("boom"))
        });
        assert!(result.is_err());
        db.read(|conn| {
            assert_eq!(info_counter(conn, "local_seq")?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn parent_must_precede_child() {
        let db = SqlDatabase::open_in_memory().unwrap();
        let result = db.transaction(|tx| {
            tx.execute("INSERT INTO docs (doc_id) VALUES ('d')", [])?;
            tx.execute(
                "INSERT INTO revs (sequence, doc_id, rev_id, parent_sequence, current)
                 VALUES (1, 'd', '1-a', 5, 1)",
                [],
            )?;
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::Storage(_))));
    }

    #[test]
    fn rev_ids_unique_per_doc() {
        let db = SqlDatabase::open_in_memory().unwrap();
        let result = db.transaction(|tx| {
            tx.execute("INSERT INTO docs (doc_id) VALUES ('d')", [])?;
            tx.execute(
                "INSERT INTO revs (sequence, doc_id, rev_id, current) VALUES (1, 'd', '1-a', 1)",
                [],
            )?;
            tx.execute(
                "INSERT INTO revs (sequence, doc_id, rev_id, current) VALUES (2, 'd', '1-a', 1)",
                [],
            )?;
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::Storage(_))));
    }
}
