mod common;

use common::data_registry;
use pipecore::DataFile;
use piperuntime::storage::genome_fingerprint;
use piperuntime::{get_or_compute, ArtifactStore, DirectoryStore, MemoryStore, StorageKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn key() -> StorageKey {
    StorageKey::new("bowtie2-build", "fp-hg38").with_param("seed", "42")
}

#[tokio::test]
async fn test_get_or_compute_computes_once() {
    let registry = data_registry();
    let store = MemoryStore::new();
    let computed = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let computed = computed.clone();
        let registry = registry.clone();
        let file = get_or_compute(&store, &key(), || async move {
            computed.fetch_add(1, Ordering::SeqCst);
            registry.resolve("/cache/hg38.1.bt2")
        })
        .await
        .unwrap();
        assert_eq!(file.reference(), "/cache/hg38.1.bt2");
    }

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_compute_error_is_not_stored() {
    let store = MemoryStore::new();
    let result: Result<DataFile, String> =
        get_or_compute(&store, &key(), || async { Err("indexer crashed".to_string()) }).await;
    assert!(result.is_err());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_directory_store_misses_deleted_artifacts() {
    let registry = data_registry();
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("hg38.fa.fai");
    std::fs::write(&artifact, "chr1\t248956422\t6\t60\t61\n").unwrap();

    let store = DirectoryStore::new(dir.path().join("cache"), registry.clone());
    assert!(store.get(&key()).await.is_none());

    let file = registry.resolve(&artifact.to_string_lossy()).unwrap();
    store.put(&key(), &file).await;
    assert!(store
        .root()
        .join(format!("{}.json", key().fingerprint()))
        .exists());

    // a fresh store over the same directory sees the record
    let reopened = DirectoryStore::new(dir.path().join("cache"), registry.clone());
    let hit = reopened.get(&key()).await.unwrap();
    assert_eq!(hit.reference(), file.reference());

    std::fs::remove_file(&artifact).unwrap();
    assert!(reopened.get(&key()).await.is_none());
}

#[tokio::test]
async fn test_genome_fingerprint_tracks_content() {
    let registry = data_registry();
    let dir = tempfile::tempdir().unwrap();
    let genome = dir.path().join("genome.fa");
    let reference = genome.to_string_lossy().to_string();

    std::fs::write(&genome, ">chr1\nACGT\n").unwrap();
    let first = genome_fingerprint(&registry.resolve(&reference).unwrap())
        .await
        .unwrap();
    let again = genome_fingerprint(&registry.resolve(&reference).unwrap())
        .await
        .unwrap();
    assert_eq!(first, again);

    std::fs::write(&genome, ">chr1\nACGTACGTAC\n").unwrap();
    let changed = genome_fingerprint(&registry.resolve(&reference).unwrap())
        .await
        .unwrap();
    assert_ne!(first, changed);
}
