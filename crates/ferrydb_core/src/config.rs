//! Store configuration.

/// Configuration for opening a document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// File name of the SQLite database within the store directory.
    pub database_file: String,

    /// Directory name for the content-addressed blob store.
    pub blob_dir: String,

    /// Default depth preserved by `compact`: non-leaf revision bodies
    /// deeper than this below every leaf are pruned.
    pub compaction_depth: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            database_file: "ferry.sqlite3".into(),
            blob_dir: "blobs".into(),
            compaction_depth: 20,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Sets the compaction depth.
    pub fn with_compaction_depth(mut self, depth: u64) -> Self {
        self.compaction_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = StoreConfig::new()
            .with_create_if_missing(false)
            .with_compaction_depth(5);
        assert!(!config.create_if_missing);
        assert_eq!(config.compaction_depth, 5);
        assert_eq!(config.blob_dir, "blobs");
    }
}
