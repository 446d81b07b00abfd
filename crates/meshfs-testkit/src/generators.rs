//! Proptest generators for property-based testing.

use proptest::prelude::*;

use meshfs_core::{FileKind, PeerId, VersionVector};
use meshfs_store::MetaStore;

/// Generate a single path component.
pub fn segment() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,6}".prop_map(String::from)
}

/// Generate a normalized, non-root tree path.
///
/// Components come from a small alphabet so generated paths share
/// ancestors often.
pub fn tree_path() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d"]), 1..=3)
        .prop_map(|parts| format!("/{}", parts.join("/")))
}

/// Generate a valid but unnormalized path: repeated and trailing separators.
pub fn messy_path() -> impl Strategy<Value = String> {
    (
        prop::collection::vec((segment(), 1usize..=3), 0..=4),
        any::<bool>(),
    )
        .prop_map(|(parts, trailing)| {
            let mut path = String::new();
            for (name, slashes) in parts {
                path.push_str(&"/".repeat(slashes));
                path.push_str(&name);
            }
            if trailing {
                path.push('/');
            }
            path
        })
}

/// Generate a peer id from a small range.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    (1u32..=4).prop_map(PeerId)
}

/// Generate a version vector over a small set of peers.
pub fn version_vector() -> impl Strategy<Value = VersionVector> {
    prop::collection::btree_map(1u32..=4, 0u64..=4, 0..=4).prop_map(|entries| {
        VersionVector::from_entries(entries.into_iter().map(|(p, c)| (PeerId(p), c)))
    })
}

/// Generate a FileKind.
pub fn file_kind() -> impl Strategy<Value = FileKind> {
    prop_oneof![
        Just(FileKind::Regular),
        Just(FileKind::Directory),
        Just(FileKind::Symlink),
        Just(FileKind::Socket),
    ]
}

/// File contents of at most `max_len` bytes.
pub fn contents(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// One metadata mutation, as a filesystem adapter or peer would issue it.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Mknod {
        path: String,
        kind: FileKind,
        subscribed: bool,
    },
    Unlink {
        path: String,
        peer: PeerId,
    },
    Bump {
        path: String,
        peer: PeerId,
    },
    Subscribe {
        path: String,
        on: bool,
    },
    RemoteTombstone {
        path: String,
        version: VersionVector,
    },
}

impl Arbitrary for StoreOp {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            3 => (tree_path(), file_kind(), any::<bool>())
                .prop_map(|(path, kind, subscribed)| StoreOp::Mknod { path, kind, subscribed }),
            1 => (tree_path(), peer_id()).prop_map(|(path, peer)| StoreOp::Unlink { path, peer }),
            2 => (tree_path(), peer_id()).prop_map(|(path, peer)| StoreOp::Bump { path, peer }),
            1 => (tree_path(), any::<bool>()).prop_map(|(path, on)| StoreOp::Subscribe { path, on }),
            1 => (tree_path(), version_vector())
                .prop_map(|(path, version)| StoreOp::RemoteTombstone { path, version }),
        ]
        .boxed()
    }
}

impl StoreOp {
    /// Apply to a store, reducing the outcome to a comparable string.
    pub async fn apply(&self, store: &dyn MetaStore) -> String {
        let outcome = match self {
            StoreOp::Mknod {
                path,
                kind,
                subscribed,
            } => store
                .mknod(path, *kind, *subscribed)
                .await
                .map(|v| v.to_string()),
            StoreOp::Unlink { path, peer } => store
                .unlink(path, *peer)
                .await
                .map(|v| format!("{:?}", v)),
            StoreOp::Bump { path, peer } => store
                .bump_version(path, *peer)
                .await
                .map(|v| v.to_string()),
            StoreOp::Subscribe { path, on } => store
                .set_subscribed(path, *on)
                .await
                .map(|v| v.to_string()),
            StoreOp::RemoteTombstone { path, version } => store
                .apply_remote_tombstone(path, version)
                .await
                .map(|v| v.to_string()),
        };
        match outcome {
            Ok(value) => value,
            Err(_) => "error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfs_core::{normalize, Causality};
    use meshfs_store::{MemoryStore, SqliteStore};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn test_normalize_idempotent(path in messy_path()) {
            let once = normalize(&path).unwrap();
            prop_assert!(once.starts_with('/'));
            prop_assert!(once == "/" || !once.ends_with('/'));
            prop_assert!(!once.contains("//"));
            prop_assert_eq!(normalize(&once).unwrap(), once);
        }

        #[test]
        fn test_merge_dominates_both(a in version_vector(), b in version_vector()) {
            let merged = a.merge(&b);
            prop_assert!(matches!(merged.compare(&a), Causality::Greater | Causality::Equal));
            prop_assert!(matches!(merged.compare(&b), Causality::Greater | Causality::Equal));
            prop_assert_eq!(merged, b.merge(&a));
        }

        #[test]
        fn test_compare_is_antisymmetric(a in version_vector(), b in version_vector()) {
            prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
        }

        #[test]
        fn test_stores_agree(ops in prop::collection::vec(any::<StoreOp>(), 1..24)) {
            let rt = runtime();
            let (memory_log, sqlite_log, memory_entries, sqlite_entries) = rt.block_on(async {
                let memory = MemoryStore::new();
                let sqlite = SqliteStore::open_memory().unwrap();
                let mut memory_log = Vec::new();
                let mut sqlite_log = Vec::new();
                for op in &ops {
                    memory_log.push(op.apply(&memory).await);
                    sqlite_log.push(op.apply(&sqlite).await);
                }
                (
                    memory_log,
                    sqlite_log,
                    memory.list_entries().await.unwrap(),
                    sqlite.list_entries().await.unwrap(),
                )
            });
            prop_assert_eq!(memory_log, sqlite_log);
            prop_assert_eq!(memory_entries, sqlite_entries);
        }
    }
}
