//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of task ids and group fingerprints,
//! which are both plain strings on disk.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// The unique identifier of a single task (a UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Creates a task id from an existing string.
    pub fn new(s: impl Into<String>) -> Self {
        TaskId(s.into())
    }

    /// Generates a fresh random task id.
    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

/// The identity of a task group.
///
/// A fingerprint is the hex SHA-256 digest of the group's member task ids,
/// sorted and joined with commas. It doubles as the idempotency token stamped
/// onto every member task when the group is claimed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Computes the fingerprint of a set of task ids.
    ///
    /// The result does not depend on the order of `ids`.
    pub fn of_ids<'a>(ids: impl IntoIterator<Item = &'a TaskId>) -> Self {
        let mut sorted: Vec<&str> = ids.into_iter().map(TaskId::as_str).collect();
        sorted.sort_unstable();
        Self::of_joined(&sorted.join(","))
    }

    /// Hashes an already-canonical comma-joined id list.
    pub fn of_joined(joined: &str) -> Self {
        let digest = Sha256::digest(joined.as_bytes());
        Fingerprint(hex::encode(digest))
    }

    /// Returns the fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod task_id {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serde_roundtrip(s in "[0-9a-f-]{36}") {
                let id = TaskId::new(&s);
                let json = serde_json::to_string(&id).unwrap();
                prop_assert_eq!(&json, &format!("\"{}\"", s));
                let parsed: TaskId = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(id, parsed);
            }
        }

        #[test]
        fn generated_ids_are_unique() {
            let a = TaskId::generate();
            let b = TaskId::generate();
            assert_ne!(a, b);
            assert_eq!(a.as_str().len(), 36);
        }
    }

    mod fingerprint {
        use super::*;
        use proptest::prelude::*;

        fn ids(raw: &[&str]) -> Vec<TaskId> {
            raw.iter().map(|s| TaskId::from(*s)).collect()
        }

        #[test]
        fn known_digest_of_joined_ids() {
            assert_eq!(
                Fingerprint::of_joined("id1,id2,id3").as_str(),
                "6fd75da4fe7cd6104f8ea0d5836667a973d2b0c3d5c794f6489a7920e6a0c4f3"
            );
        }

        #[test]
        fn single_id_fixture() {
            let fp = Fingerprint::of_ids(&ids(&["d8fe8dad-c109-4f50-b37c-45bc9d063bdc"]));
            assert_eq!(
                fp.as_str(),
                "2bdfc8be205bf9ee16326e5ef6bf4f56a440846f088fb1b2e25ade9a157ee574"
            );
        }

        #[test]
        fn multiple_ids_are_sorted_before_hashing() {
            let fp = Fingerprint::of_ids(&ids(&[
                "9b8cd0b7-0537-41cb-94b7-eca4651f6ece",
                "fc95ce25-880d-4ccd-aa74-0a644e2d9adf",
                "a97de96e-4452-4aeb-81cc-f87c4ec45d21",
            ]));
            assert_eq!(
                fp.as_str(),
                "b4ef74f80d841e4fa41cbc5cdf45c4d3fa7564666f1276949c0453a5ab470fc5"
            );
        }

        proptest! {
            #[test]
            fn order_independent(mut raw in prop::collection::vec("[a-z0-9]{1,12}", 1..8)) {
                let forward = Fingerprint::of_ids(&ids(&raw.iter().map(String::as_str).collect::<Vec<_>>()));
                raw.reverse();
                let backward = Fingerprint::of_ids(&ids(&raw.iter().map(String::as_str).collect::<Vec<_>>()));
                prop_assert_eq!(forward, backward);
            }

            #[test]
            fn different_sets_differ(
                a in prop::collection::btree_set("[a-z0-9]{1,12}", 1..6),
                b in prop::collection::btree_set("[a-z0-9]{1,12}", 1..6),
            ) {
                prop_assume!(a != b);
                let fa = Fingerprint::of_ids(&a.iter().map(|s| TaskId::from(s.as_str())).collect::<Vec<_>>());
                let fb = Fingerprint::of_ids(&b.iter().map(|s| TaskId::from(s.as_str())).collect::<Vec<_>>());
                prop_assert_ne!(fa, fb);
            }
        }
    }
}
