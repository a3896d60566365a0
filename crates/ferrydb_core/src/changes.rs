//! Change sets returned by the store's change feed.

use crate::document::DocumentRevision;

/// A batch of changes between two sequence numbers.
///
/// `last_sequence` is the upper bound the batch covers; it is not
/// necessarily the sequence of the final revision in `results` (a document
/// updated again later in the feed reports its winner's sequence).
#[derive(Debug)]
pub struct Changes {
    /// Last sequence covered by this change set.
    pub last_sequence: u64,
    /// Winning revisions of the changed documents, sequence-ascending.
    pub results: Vec<DocumentRevision>,
}

impl Changes {
    /// Number of changed documents in the set.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if no documents changed.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The ids of the changed documents.
    pub fn ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.doc_id.as_str()).collect()
    }
}
