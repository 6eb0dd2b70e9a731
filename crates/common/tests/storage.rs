//! Integration tests for chunking, compaction and egress through the
//! storage service

mod common;

use std::sync::Arc;

use ::common::brick::{content_hash, CompressionAlgorithm, HashLink};
use ::common::config::ArchiveConfig;
use ::common::crypto::{EncryptionAlgorithm, Secret};
use ::common::storage::{
    BrickStorageService, BrickStore, FsBrickStore, LocalFsAdapter, MemoryBrickStore,
    StorageError,
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use common::TestEnv;

fn sample(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn links(summaries: Vec<::common::storage::BrickSummary>) -> Vec<HashLink> {
    summaries.into_iter().map(HashLink::from).collect()
}

#[tokio::test]
async fn test_buffer_splits_into_blocks() {
    let env = TestEnv::new();
    let storage = env.storage();
    let data = sample(650);

    let summaries = storage.ingest_buffer(data.clone(), Some(256)).await.unwrap();
    let sizes: Vec<usize> = summaries.iter().map(|s| s.size).collect();
    assert_eq!(sizes, vec![256, 256, 138]);
    assert_eq!(summaries[2].checksum, content_hash(&data[512..]));
    assert_eq!(env.bricks.len(), 3);

    let restored = storage
        .create_buffer_from_bricks(&links(summaries))
        .await
        .unwrap();
    assert_eq!(restored, data);
}

#[tokio::test]
async fn test_stream_matches_buffer_chunking() {
    let env = TestEnv::new();
    let storage = env.storage();
    let data = sample(1000);

    // uneven chunks that straddle block boundaries
    let chunks: Vec<std::io::Result<Bytes>> = [0..100, 100..430, 430..431, 431..1000]
        .into_iter()
        .map(|range| Ok(data.slice(range)))
        .collect();
    let streamed = storage
        .ingest_stream(futures::stream::iter(chunks), Some(300))
        .await
        .unwrap();
    let buffered = storage.ingest_buffer(data.clone(), Some(300)).await.unwrap();
    assert_eq!(streamed, buffered);

    let pieces: Vec<Bytes> = storage
        .create_stream_from_bricks(links(streamed))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(pieces.len(), 4);
    assert_eq!(pieces.concat(), data.to_vec());
}

#[tokio::test]
async fn test_empty_buffer_has_no_bricks() {
    let env = TestEnv::new();
    let summaries = env.storage().ingest_buffer(Bytes::new(), None).await.unwrap();
    assert!(summaries.is_empty());
    assert!(env.bricks.is_empty());
}

#[tokio::test]
async fn test_compacted_buffers_resolve_individually() {
    let env = TestEnv::new();
    let storage = env.storage();

    let files = storage
        .create_brick_from_buffers(vec![
            ("a".to_string(), Bytes::from_static(b"hello")),
            ("b".to_string(), Bytes::from_static(b"goodbye")),
        ])
        .await
        .unwrap();
    assert_eq!(env.bricks.len(), 1);

    let a = HashLink::from(files[0].summary.clone());
    let b = HashLink::from(files[1].summary.clone());
    assert_eq!(
        storage.create_buffer_from_bricks(&[a.clone()]).await.unwrap(),
        Bytes::from_static(b"hello")
    );
    assert_eq!(
        storage.create_buffer_from_bricks(&[b.clone()]).await.unwrap(),
        Bytes::from_static(b"goodbye")
    );
    // both slices of one brick in one batch
    assert_eq!(
        storage.create_buffer_from_bricks(&[b, a]).await.unwrap(),
        Bytes::from_static(b"goodbyehello")
    );
}

fn transformed_configs() -> Vec<ArchiveConfig> {
    let key = || Secret::generate().unwrap();
    let base = || ArchiveConfig::default().with_buffer_size(64);
    vec![
        base().with_compression(CompressionAlgorithm::Gzip),
        base().with_compression(CompressionAlgorithm::Brotli),
        base().with_encryption(EncryptionAlgorithm::ChaCha20Poly1305, key()),
        base()
            .with_compression(CompressionAlgorithm::Deflate)
            .with_encryption(EncryptionAlgorithm::Aes256Gcm, key()),
    ]
}

#[tokio::test]
async fn test_transformed_ingest_and_egress() {
    let data = Bytes::from("all work and no play ".repeat(20));
    for config in transformed_configs() {
        let env = TestEnv::with_config(config.clone());
        let storage = env.storage();

        let summaries = storage.ingest_buffer(data.clone(), None).await.unwrap();
        assert_eq!(summaries.len(), data.len().div_ceil(64));
        if config.encryption.is_some() {
            assert!(summaries.iter().all(|s| s.key.is_some()));
        }

        // a fresh service has an empty cache, so this reads through the store
        let fresh = BrickStorageService::new(
            Arc::new(env.bricks.clone()),
            Arc::new(LocalFsAdapter),
            Arc::new(config),
        );
        let restored = fresh.create_buffer_from_bricks(&links(summaries)).await.unwrap();
        assert_eq!(restored, data);
    }
}

#[tokio::test]
async fn test_encrypted_bricks_do_not_leak_plaintext() {
    let config = ArchiveConfig::default()
        .with_encryption(EncryptionAlgorithm::ChaCha20Poly1305, Secret::generate().unwrap());
    let env = TestEnv::with_config(config);
    let data = Bytes::from_static(b"a very secret sentence");

    let summaries = env.storage().ingest_buffer(data.clone(), None).await.unwrap();
    let stored = env.bricks.get_brick(&summaries[0].hash).await.unwrap();
    assert_ne!(stored, data);
    assert!(!stored
        .windows(data.len())
        .any(|window| window == data.as_ref()));
}

#[tokio::test]
async fn test_tampered_slice_is_rejected() {
    let env = TestEnv::new();
    let storage = env.storage();
    let summaries = storage
        .ingest_buffer(Bytes::from_static(b"original"), None)
        .await
        .unwrap();
    let mut link = HashLink::from(summaries[0].clone());
    link.checksum = content_hash(b"something else");

    assert!(matches!(
        storage.create_buffer_from_bricks(&[link]).await,
        Err(StorageError::InvalidData { .. })
    ));
}

#[tokio::test]
async fn test_fs_store_backs_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBrickStore::new(dir.path().join("bricks")).await.unwrap();
    let storage = BrickStorageService::new(
        Arc::new(store.clone()),
        Arc::new(LocalFsAdapter),
        Arc::new(ArchiveConfig::default().with_buffer_size(10)),
    );

    let data = sample(35);
    let summaries = storage.ingest_buffer(data.clone(), None).await.unwrap();
    assert_eq!(summaries.len(), 4);
    for summary in &summaries {
        assert!(store.get_brick(&summary.hash).await.is_ok());
    }

    // reopening the same directory sees the same bricks
    let reopened = BrickStorageService::new(
        Arc::new(FsBrickStore::new(dir.path().join("bricks")).await.unwrap()),
        Arc::new(LocalFsAdapter),
        Arc::new(ArchiveConfig::default()),
    );
    assert_eq!(
        reopened.create_buffer_from_bricks(&links(summaries)).await.unwrap(),
        data
    );
}

#[tokio::test]
async fn test_file_ingest_and_extraction() {
    let env = TestEnv::new();
    let storage = env.storage();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let data = sample(5000);
    tokio::fs::write(&source, &data).await.unwrap();

    let summaries = storage.ingest_file(&source, Some(1024)).await.unwrap();
    assert_eq!(summaries.len(), 5);
    assert_eq!(summaries.last().map(|s| s.size), Some(904));

    let target = dir.path().join("restored.bin");
    let written = storage
        .create_file_from_bricks(&target, &links(summaries))
        .await
        .unwrap();
    assert_eq!(written, 5000);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data.to_vec());
}

#[tokio::test]
async fn test_folder_compaction_is_sorted_and_relative() {
    let env = TestEnv::new();
    let storage = env.storage();
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(dir.path().join("nested/deeper"))
        .await
        .unwrap();
    tokio::fs::write(dir.path().join("b.txt"), b"bee").await.unwrap();
    tokio::fs::write(dir.path().join("a.txt"), b"ay").await.unwrap();
    tokio::fs::write(dir.path().join("nested/deeper/c.txt"), b"sea")
        .await
        .unwrap();

    let files = storage.create_brick_from_folder(dir.path()).await.unwrap();
    let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "b.txt", "nested/deeper/c.txt"]);
    assert_eq!(env.bricks.len(), 1);

    let contents: Vec<Bytes> = futures::stream::iter(files)
        .then(|file| {
            let storage = storage.clone();
            async move {
                storage
                    .fetch_link(&HashLink::from(file.summary))
                    .await
                    .unwrap()
            }
        })
        .collect()
        .await;
    assert_eq!(contents, vec!["ay", "bee", "sea"]);
}

#[tokio::test]
async fn test_missing_brick_is_a_store_error() {
    let storage = BrickStorageService::new(
        Arc::new(MemoryBrickStore::new()),
        Arc::new(LocalFsAdapter),
        Arc::new(ArchiveConfig::default()),
    );
    let link = HashLink::new(content_hash(b"nowhere"), content_hash(b"nowhere"), None);
    assert!(matches!(
        storage.fetch_link(&link).await,
        Err(StorageError::Store(_))
    ));
}
