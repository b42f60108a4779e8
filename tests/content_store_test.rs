mod common;

use avatar_store::{
    models::blob::BlobKind,
    services::{content_store::StorageError, digest::ContentDigest},
};
use bytes::Bytes;
use common::{Harness, file_count, png};
use chrono::Duration;
use futures::future::join_all;

#[tokio::test]
async fn identical_bytes_store_one_record_and_one_file() {
    let h = Harness::new().await;
    let data = png(64, 64, 7);

    let first = h
        .store
        .ingest(data.clone(), "image/png", BlobKind::PoseReference, "a.png")
        .await
        .unwrap();
    let second = h
        .store
        .ingest(data.clone(), "image/png", BlobKind::PoseReference, "b.png")
        .await
        .unwrap();

    assert!(!first.is_duplicate);
    assert!(second.is_duplicate);
    assert_eq!(first.blob.id, second.blob.id);
    assert_eq!(second.blob.filename, "a.png");
    assert_eq!(second.blob.reference_count, 0);
    assert_eq!(first.blob.digest, ContentDigest::compute(&data).to_hex());
    assert_eq!(h.row_count("blobs").await, 1);
    assert_eq!(file_count(h.uploads_root()), 1);
}

#[tokio::test]
async fn layout_is_sharded_by_digest_prefix() {
    let h = Harness::new().await;
    let blob = h.upload(3, BlobKind::StyleReference).await;

    let expected = format!(
        "style-reference/{}/{}/{}.png",
        &blob.digest[0..2],
        &blob.digest[2..4],
        blob.digest
    );
    assert_eq!(blob.storage_path, expected);
    assert!(h.payload_exists(&blob));
    assert_eq!((blob.width, blob.height), (Some(64), Some(64)));
}

#[tokio::test]
async fn kind_does_not_split_identity() {
    let h = Harness::new().await;
    let data = png(80, 80, 9);

    let pose = h
        .store
        .ingest(data.clone(), "image/png", BlobKind::PoseReference, "p.png")
        .await
        .unwrap();
    let style = h
        .store
        .ingest(data, "image/png", BlobKind::StyleReference, "s.png")
        .await
        .unwrap();

    assert!(style.is_duplicate);
    assert_eq!(style.blob.id, pose.blob.id);
    assert_eq!(style.blob.kind, BlobKind::PoseReference);
}

#[tokio::test]
async fn concurrent_ingest_of_same_bytes_yields_one_record() {
    let h = Harness::new().await;
    let data = png(96, 96, 11);

    let tasks = (0..8).map(|i| {
        let store = h.store.clone();
        let data = data.clone();
        tokio::spawn(async move {
            store
                .ingest(data, "image/png", BlobKind::PoseReference, &format!("{i}.png"))
                .await
        })
    });

    let mut ids: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().blob.id)
        .collect();
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.row_count("blobs").await, 1);
    assert_eq!(file_count(h.uploads_root()), 1);
}

#[tokio::test]
async fn release_never_goes_below_zero() {
    let h = Harness::new().await;
    let blob = h.upload(1, BlobKind::PoseReference).await;

    assert!(!h.store.release(blob.id).await.unwrap());
    assert_eq!(h.reference_count(blob.id).await, 0);

    h.store.claim(blob.id).await.unwrap();
    h.store.claim(blob.id).await.unwrap();
    assert_eq!(h.reference_count(blob.id).await, 2);

    assert!(h.store.release(blob.id).await.unwrap());
    assert!(h.store.release(blob.id).await.unwrap());
    assert!(!h.store.release(blob.id).await.unwrap());
    assert_eq!(h.reference_count(blob.id).await, 0);
}

#[tokio::test]
async fn claim_of_unknown_blob_is_not_found() {
    let h = Harness::new().await;
    let err = h.store.claim(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn remove_is_refused_while_referenced() {
    let h = Harness::new().await;
    let blob = h.upload(2, BlobKind::PoseReference).await;
    h.store.claim(blob.id).await.unwrap();

    let err = h.store.remove(blob.id).await.unwrap_err();
    assert!(matches!(err, StorageError::StillReferenced { count: 1, .. }));
    assert!(h.payload_exists(&blob));

    h.store.release(blob.id).await.unwrap();
    assert!(h.store.remove(blob.id).await.unwrap());
    assert!(!h.payload_exists(&blob));
    assert!(matches!(
        h.store.resolve(blob.id).await,
        Err(StorageError::NotFound(_))
    ));

    // shard directories are pruned with the last payload, the kind
    // directory is kept for concurrent writers
    let kind_dir = h.uploads_root().join("pose-reference");
    assert!(!kind_dir.join(&blob.digest[0..2]).exists());
    assert!(kind_dir.is_dir());

    assert!(!h.store.remove(blob.id).await.unwrap());
}

#[tokio::test]
async fn tombstone_hides_but_keeps_bytes_and_references() {
    let h = Harness::new().await;
    let data = png(64, 64, 4);
    let blob = h
        .store
        .ingest(data.clone(), "image/png", BlobKind::PoseReference, "t.png")
        .await
        .unwrap()
        .blob;
    h.store.claim(blob.id).await.unwrap();

    assert!(h.store.tombstone(blob.id).await.unwrap());
    assert!(!h.store.tombstone(blob.id).await.unwrap());

    assert!(matches!(
        h.store.resolve(blob.id).await,
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        h.store.resolve_by_digest(&blob.digest).await,
        Err(StorageError::NotFound(_))
    ));
    let located = h.store.locate(blob.id).await.unwrap().unwrap();
    assert!(located.is_deleted);
    assert_eq!(located.reference_count, 1);
    assert!(h.payload_exists(&blob));

    // Same content uploaded again is a new record sharing the same file.
    let again = h
        .store
        .ingest(data, "image/png", BlobKind::PoseReference, "t2.png")
        .await
        .unwrap();
    assert!(!again.is_duplicate);
    assert_ne!(again.blob.id, blob.id);
    assert_eq!(again.blob.storage_path, blob.storage_path);

    // Removing the live copy must not pull bytes out from under the tombstone.
    assert!(h.store.remove(again.blob.id).await.unwrap());
    assert!(h.payload_exists(&blob));
}

#[tokio::test]
async fn missing_payload_is_reported_as_not_found() {
    let h = Harness::new().await;
    let blob = h.upload(5, BlobKind::PoseReference).await;
    std::fs::remove_file(h.store.path_of(&blob)).unwrap();

    let err = h.store.retrieve(blob.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn retrieve_returns_the_stored_bytes() {
    use tokio::io::AsyncReadExt;

    let h = Harness::new().await;
    let data = png(70, 70, 6);
    let blob = h
        .store
        .ingest(data.clone(), "image/png", BlobKind::PoseReference, "r.png")
        .await
        .unwrap()
        .blob;

    let (meta, mut file) = h.store.retrieve(blob.id).await.unwrap();
    let mut read = Vec::new();
    file.read_to_end(&mut read).await.unwrap();
    assert_eq!(meta.media_type, "image/png");
    assert_eq!(read, data.to_vec());
}

#[tokio::test]
async fn invalid_uploads_write_nothing() {
    let h = Harness::new().await;

    let wrong_type = h
        .store
        .ingest(png(64, 64, 1), "image/gif", BlobKind::PoseReference, "x.gif")
        .await
        .unwrap_err();
    assert!(matches!(wrong_type, StorageError::Validation(_)));

    let too_small = h
        .store
        .ingest(png(32, 32, 1), "image/png", BlobKind::PoseReference, "x.png")
        .await
        .unwrap_err();
    assert!(matches!(too_small, StorageError::Validation(_)));

    let not_an_image = h
        .store
        .ingest(
            Bytes::from_static(b"definitely not a png"),
            "image/png",
            BlobKind::PoseReference,
            "x.png",
        )
        .await
        .unwrap_err();
    assert!(matches!(not_an_image, StorageError::Validation(_)));

    let empty = h
        .store
        .ingest(Bytes::new(), "image/png", BlobKind::PoseReference, "x.png")
        .await
        .unwrap_err();
    assert!(matches!(empty, StorageError::Validation(_)));

    assert_eq!(h.row_count("blobs").await, 0);
    assert_eq!(file_count(h.uploads_root()), 0);
}

#[tokio::test]
async fn digest_lookup_accepts_uppercase_and_rejects_garbage() {
    let h = Harness::new().await;
    let blob = h.upload(8, BlobKind::PoseReference).await;

    let found = h
        .store
        .resolve_by_digest(&blob.digest.to_uppercase())
        .await
        .unwrap();
    assert_eq!(found.id, blob.id);

    let err = h.store.resolve_by_digest("abc").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidDigest(_)));
}

#[tokio::test]
async fn ingest_continues_after_the_last_payload_of_a_kind_is_removed() {
    let h = Harness::new().await;
    let blob = h.upload(21, BlobKind::StyleReference).await;
    assert!(h.store.remove(blob.id).await.unwrap());
    assert!(h.uploads_root().join("style-reference").is_dir());

    let tasks = (0..6u8).map(|seed| {
        let store = h.store.clone();
        tokio::spawn(async move {
            let removed = store
                .ingest(png(64, 64, 100 + seed), "image/png", BlobKind::StyleReference, "s.png")
                .await?;
            store.remove(removed.blob.id).await?;
            store
                .ingest(png(64, 64, 150 + seed), "image/png", BlobKind::StyleReference, "s.png")
                .await
        })
    });
    for joined in join_all(tasks).await {
        joined.unwrap().unwrap();
    }
    assert_eq!(h.row_count("blobs").await, 6);
    assert_eq!(file_count(h.uploads_root()), 6);
}

#[tokio::test]
async fn claim_racing_a_sweep_never_holds_deleted_bytes() {
    for seed in 0..8u8 {
        let h = Harness::new().await;
        let blob = h.upload(seed, BlobKind::PoseReference).await;
        h.age(blob.id, 60).await;

        let sweeper = h.store.clone();
        let claimer = h.store.clone();
        let id = blob.id;
        let (swept, claimed) = tokio::join!(
            tokio::spawn(async move { sweeper.reclaim_orphans(Duration::zero()).await }),
            tokio::spawn(async move { claimer.claim(id).await }),
        );
        let swept = swept.unwrap().unwrap();
        assert_eq!(swept.failed, 0);

        match claimed.unwrap() {
            Ok(()) => {
                assert_eq!(h.reference_count(blob.id).await, 1);
                assert!(h.payload_exists(&blob));
                assert_eq!(swept.reclaimed, 0);
            }
            Err(StorageError::NotFound(_)) => {
                assert!(h.store.locate(blob.id).await.unwrap().is_none());
                assert!(!h.payload_exists(&blob));
                assert_eq!(swept.reclaimed, 1);
            }
            Err(other) => panic!("unexpected claim error: {other:?}"),
        }
    }
}
