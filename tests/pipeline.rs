//! End-to-end pipeline tests over the in-memory backend: change gating,
//! deterministic walking, and cache-outage parity.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use merkle_watch::cache::TreeCache;
use merkle_watch::hasher::hash_bytes;
use merkle_watch::orchestrator::Orchestrator;
use merkle_watch::storage::memory::MemoryStore;
use merkle_watch::storage::TreeStore;
use merkle_watch::sync::TreeSync;
use merkle_watch::tree::MerkleTree;
use merkle_watch::walker;

fn touch(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    File::create(&path).unwrap().write_all(content.as_bytes()).unwrap();
}

fn pipeline_over(dir: &TempDir, cache: TreeCache) -> (Orchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let sync = TreeSync::new(cache.clone(), store.clone());
    (
        Orchestrator::new(dir.path().to_path_buf(), None, sync, cache),
        store,
    )
}

/// Change gate: two builds over an unmutated directory commit exactly once.
#[tokio::test]
async fn change_gate_commits_once_for_unchanged_directory() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "a.txt", "alpha");
    touch(dir.path(), "nested/b.txt", "beta");

    let (orchestrator, store) = pipeline_over(&dir, TreeCache::disabled());

    let first = orchestrator.build_and_sync().await.unwrap();
    assert!(first.written);

    let second = orchestrator.build_and_sync().await.unwrap();
    assert!(!second.written);
    assert_eq!(second.reason, Some("unchanged"));
    assert_eq!(second.root_hash, first.root_hash);

    // The backend saw exactly one commit across the two runs.
    assert_eq!(store.stats().await.unwrap().total_trees, 1);
    assert_eq!(store.write_count(), 1);
}

/// A content change reopens the gate.
#[tokio::test]
async fn change_gate_commits_again_after_mutation() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "a.txt", "alpha");

    let (orchestrator, store) = pipeline_over(&dir, TreeCache::disabled());
    let first = orchestrator.build_and_sync().await.unwrap();

    touch(dir.path(), "a.txt", "alpha v2");
    let second = orchestrator.build_and_sync().await.unwrap();

    assert!(second.written);
    assert_ne!(second.root_hash, first.root_hash);
    assert_eq!(store.stats().await.unwrap().total_trees, 2);

    // Latest root observation follows the newest commit.
    assert_eq!(
        store.latest_root_hash().await.unwrap().as_deref(),
        Some(second.root_hash.as_str())
    );
}

/// Deterministic walk: the service root equals a recomputation from the
/// lexicographically sorted absolute paths.
#[tokio::test]
async fn walk_order_drives_the_root() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "A/x.txt", "x-content");
    touch(dir.path(), "B/y.txt", "y-content");
    touch(dir.path(), "z.txt", "z-content");

    let (orchestrator, _) = pipeline_over(&dir, TreeCache::disabled());
    let built = orchestrator.build_and_sync().await.unwrap();
    assert_eq!(built.files_processed, 3);

    // Recompute from the sorted path list by hand.
    let scan = walker::walk(dir.path(), None).unwrap();
    let recomputed = MerkleTree::from_files(&scan.files).await.unwrap();
    assert_eq!(recomputed.root_hash(), Some(built.root_hash.as_str()));

    // And from first principles: content hashes reduced pairwise.
    let hx = hash_bytes("x-content");
    let hy = hash_bytes("y-content");
    let hz = hash_bytes("z-content");
    let level1 = [
        hash_bytes(&format!("{hx}{hy}")),
        hash_bytes(&format!("{hz}{hz}")),
    ];
    let expected_root = hash_bytes(&format!("{}{}", level1[0], level1[1]));
    assert_eq!(built.root_hash, expected_root);
}

/// Adding a file changes the root.
#[tokio::test]
async fn adding_a_file_changes_the_root() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "a.txt", "alpha");
    touch(dir.path(), "b.txt", "beta");

    let (orchestrator, _) = pipeline_over(&dir, TreeCache::disabled());
    let before = orchestrator.build_and_sync().await.unwrap();

    touch(dir.path(), "c.txt", "gamma");
    let after = orchestrator.build_and_sync().await.unwrap();

    assert!(after.written);
    assert_ne!(after.root_hash, before.root_hash);
}

/// Renaming a file without touching content still changes the root when the
/// rename moves it in the sort order: leaf hashes are content-only, but leaf
/// *position* follows the path ordering.
#[tokio::test]
async fn rename_that_reorders_changes_the_root() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "m.txt", "same-content");
    touch(dir.path(), "n.txt", "other-content");

    let (orchestrator, _) = pipeline_over(&dir, TreeCache::disabled());
    let before = orchestrator.build_and_sync().await.unwrap();

    // "z.txt" sorts after "n.txt"; contents untouched.
    fs::rename(dir.path().join("m.txt"), dir.path().join("z.txt")).unwrap();
    let after = orchestrator.build_and_sync().await.unwrap();

    assert!(after.written);
    assert_ne!(after.root_hash, before.root_hash);
}

/// Cache outage: with the cache tier disabled the pipeline behaves exactly
/// as with it enabled-but-unreachable: same commits, same gating, no
/// cache-originated errors anywhere.
#[tokio::test]
async fn cache_outage_changes_nothing_but_latency() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "a.txt", "alpha");
    touch(dir.path(), "b/b.txt", "beta");

    let (orchestrator, store) = pipeline_over(&dir, TreeCache::disabled());

    let first = orchestrator.build_and_sync().await.unwrap();
    let second = orchestrator.build_and_sync().await.unwrap();

    assert!(first.written);
    assert!(!second.written);
    assert_eq!(store.stats().await.unwrap().total_trees, 1);

    // The last-build record is intact for the health surface.
    let last = orchestrator.last_build().unwrap();
    assert!(last.success);
    assert_eq!(last.files_processed, 2);

    // Reads served from the backend, cache silently out of the loop.
    let full = store.tree_by_root_hash(&first.root_hash).await.unwrap().unwrap();
    assert_eq!(full.record.item_count, 2);
}
