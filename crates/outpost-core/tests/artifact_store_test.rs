//! Integration tests for the artifact store against a MinIO container.

use bytes::Bytes;
use uuid::Uuid;

use outpost_core::Error;
use outpost_core::artifacts::ArtifactStore;
use outpost_core::config::{ArtifactConfig, RetentionConfig};
use outpost_test_utils::start_minio;

const MIB: usize = 1024 * 1024;

async fn store() -> (outpost_test_utils::MinioS3, ArtifactStore) {
    let minio = start_minio("outpost-artifacts-test").await;
    let store = ArtifactStore::new(
        minio.client.clone(),
        minio.bucket.clone(),
        &ArtifactConfig::default(),
        &RetentionConfig::default(),
    );
    (minio, store)
}

#[tokio::test]
async fn upload_then_get_roundtrips_bytes() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();
    let body = Bytes::from_static(b"diff --git a/src/auth.rs b/src/auth.rs\n+pkce\n");

    let uploaded = store
        .upload(dispatch_id, "diff.patch", body.clone(), None)
        .await
        .expect("upload should succeed");
    assert_eq!(uploaded.size, body.len() as u64);
    assert_eq!(
        uploaded.key,
        format!("dispatches/{dispatch_id}/diff.patch")
    );

    let fetched = store
        .get(dispatch_id, "diff.patch")
        .await
        .expect("get should succeed");
    assert_eq!(fetched, body);
}

#[tokio::test]
async fn threshold_boundary_selects_upload_path() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();

    // One byte below the threshold: single-shot PUT, plain etag.
    let small = Bytes::from(vec![7u8; 5 * MIB - 1]);
    let single = store
        .upload(dispatch_id, "below.bin", small.clone(), None)
        .await
        .expect("single-shot upload");
    assert!(
        !single.etag.clone().unwrap_or_default().contains('-'),
        "single-shot etag should not be a multipart etag: {:?}",
        single.etag
    );

    // Exactly at the threshold: multipart, etag carries the part count.
    let large = Bytes::from(vec![9u8; 5 * MIB]);
    let multi = store
        .upload(dispatch_id, "at.bin", large.clone(), None)
        .await
        .expect("multipart upload");
    assert!(
        multi.etag.clone().unwrap_or_default().contains('-'),
        "multipart etag should carry a part suffix: {:?}",
        multi.etag
    );

    // Both read back intact.
    assert_eq!(store.get(dispatch_id, "below.bin").await.unwrap(), small);
    assert_eq!(store.get(dispatch_id, "at.bin").await.unwrap(), large);
}

#[tokio::test]
async fn upload_large_streams_in_parts() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();

    let payload = vec![42u8; 11 * MIB];
    let uploaded = store
        .upload_large(
            dispatch_id,
            "output.log",
            payload.as_slice(),
            payload.len() as u64,
        )
        .await
        .expect("streamed upload");
    assert_eq!(uploaded.size, payload.len() as u64);

    let fetched = store.get(dispatch_id, "output.log").await.unwrap();
    assert_eq!(fetched.len(), payload.len());
    assert_eq!(&fetched[..], &payload[..]);
}

#[tokio::test]
async fn presign_download_requires_the_object() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();

    let err = store
        .presign_download(dispatch_id, "output.log", None)
        .await
        .expect_err("missing object should not presign");
    assert!(matches!(err, Error::NotFound(_)));

    store
        .upload(dispatch_id, "output.log", Bytes::from_static(b"agent output here"), None)
        .await
        .unwrap();

    let presigned = store
        .presign_download(dispatch_id, "output.log", Some(600))
        .await
        .expect("presign should succeed");
    assert!(presigned.url.starts_with("http"));
    assert!(presigned.url.contains(&dispatch_id.to_string()));
}

#[tokio::test]
async fn presign_ttl_boundaries() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();
    store
        .upload(dispatch_id, "summary.json", Bytes::from_static(b"{\"ok\":true}"), None)
        .await
        .unwrap();

    for ttl in [59, 86_401] {
        let err = store
            .presign_download(dispatch_id, "summary.json", Some(ttl))
            .await
            .expect_err("out-of-range TTL should be rejected");
        assert!(matches!(err, Error::Validation(_)), "ttl {ttl}");
    }
    for ttl in [60, 86_400] {
        store
            .presign_download(dispatch_id, "summary.json", Some(ttl))
            .await
            .unwrap_or_else(|e| panic!("ttl {ttl} should be accepted: {e}"));
    }

    // Upload presigning validates the same bounds.
    let err = store
        .presign_upload(dispatch_id, "stdout.txt", None, Some(59))
        .await
        .expect_err("out-of-range TTL should be rejected");
    assert!(matches!(err, Error::Validation(_)));
    store
        .presign_upload(dispatch_id, "stdout.txt", None, Some(3600))
        .await
        .expect("upload presign should succeed");
}

#[tokio::test]
async fn list_resolves_metadata_per_entry() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();

    store
        .upload(dispatch_id, "output.log", Bytes::from_static(b"log line"), None)
        .await
        .unwrap();
    store
        .upload(
            dispatch_id,
            "summary.json",
            Bytes::from_static(b"{\"files_changed\":3}"),
            None,
        )
        .await
        .unwrap();

    let listing = store.list(dispatch_id).await.expect("list should succeed");
    assert_eq!(listing.count, 2);
    assert_eq!(listing.total_size, 8 + 19);

    let summary = listing
        .artifacts
        .iter()
        .find(|a| a.filename == "summary.json")
        .expect("summary entry");
    assert_eq!(summary.content_type, "application/json");
    // The retention stamp sits the configured window past the upload
    // stamp.
    let window = summary.expires_at - summary.uploaded_at;
    assert_eq!(window.num_days(), RetentionConfig::default().artifact_days);

    // Another dispatch's prefix is empty.
    let other = store.list(Uuid::new_v4()).await.unwrap();
    assert_eq!(other.count, 0);
}

#[tokio::test]
async fn delete_removes_the_whole_prefix() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();

    for name in ["output.log", "stdout.txt", "stderr.txt"] {
        store
            .upload(dispatch_id, name, Bytes::from_static(b"x"), None)
            .await
            .unwrap();
    }

    let deleted = store.delete(dispatch_id).await.expect("delete");
    assert_eq!(deleted, 3);
    assert_eq!(store.list(dispatch_id).await.unwrap().count, 0);

    // Deleting again is a no-op.
    assert_eq!(store.delete(dispatch_id).await.unwrap(), 0);
}

#[tokio::test]
async fn sweep_leaves_fresh_objects_alone() {
    let (_minio, store) = store().await;
    let dispatch_id = Uuid::new_v4();

    store
        .upload(dispatch_id, "output.log", Bytes::from_static(b"fresh"), None)
        .await
        .unwrap();

    let report = store.sweep_expired().await.expect("sweep");
    assert_eq!(report.deleted_count, 0);
    assert_eq!(report.freed_bytes, 0);
    assert_eq!(report.dispatches_processed, 1);
    assert_eq!(store.list(dispatch_id).await.unwrap().count, 1);
}
