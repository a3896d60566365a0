//! Proptest strategies for document data.

use ferrydb_core::DocumentBody;
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for valid document ids: non-empty printable strings.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9_.-]{0,31}"
}

/// Strategy for revision hash suffixes: 32 lowercase hex characters.
pub fn rev_digest_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{32}"
}

/// Strategy for small JSON bodies without reserved keys.
pub fn body_strategy() -> impl Strategy<Value = DocumentBody> {
    prop::collection::btree_map(
        "[a-z][a-z0-9_]{0,7}",
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[ -~]{0,16}".prop_map(Value::from),
        ],
        0..6,
    )
    .prop_map(|map| map.into_iter().collect())
}
