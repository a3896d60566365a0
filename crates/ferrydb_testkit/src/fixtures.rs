//! Store fixtures with automatic cleanup.

use ferrydb_core::{DocumentBody, DocumentRevision, DocumentStore, StoreConfig};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

/// A document store in a temp directory, removed on drop.
pub struct TestStore {
    /// The store under test.
    pub store: Arc<DocumentStore>,
    _temp_dir: TempDir,
}

impl TestStore {
    /// Creates a fresh store.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a fresh store with a custom configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let store = DocumentStore::open_with_config(&temp_dir.path().join("store"), config)
            .expect("open store");
        Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        }
    }

    /// A clone of the store handle.
    pub fn handle(&self) -> Arc<DocumentStore> {
        Arc::clone(&self.store)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = DocumentStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// A `{name, age}` body, the fixture document shape.
pub fn person_doc(name: &str, age: u64) -> DocumentBody {
    match json!({"name": name, "age": age}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Creates `count` documents named `docnum-<i>`.
pub fn populate(store: &DocumentStore, count: usize) -> Vec<DocumentRevision> {
    (0..count)
        .map(|i| {
            store
                .create(&format!("docnum-{i:05}"), person_doc("docnum", i as u64), Vec::new())
                .expect("create document")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_store_round_trip() {
        let fixture = TestStore::new();
        let rev = fixture
            .create("tom", person_doc("Tom", 31), Vec::new())
            .unwrap();
        assert_eq!(fixture.get("tom").unwrap().rev_id, rev.rev_id);
    }

    #[test]
    fn populate_creates_ordered_docs() {
        let fixture = TestStore::new();
        let revs = populate(&fixture, 10);
        assert_eq!(revs.len(), 10);
        assert_eq!(fixture.document_count().unwrap(), 10);
        assert!(revs.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }
}
