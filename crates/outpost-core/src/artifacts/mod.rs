//! Object-storage-backed artifact management.
//!
//! Artifacts live under `dispatches/{dispatch_id}/{filename}` with
//! `dispatch-id`, `uploaded-at`, and `expires-at` metadata stamps. Small
//! payloads go up in one shot; anything at or above the multipart
//! threshold is split into parts, and a failed part aborts the whole
//! multipart upload before the error surfaces.

use std::collections::HashMap;

use anyhow::Context;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ArtifactConfig, RetentionConfig};
use crate::error::{Error, Result};

/// Presign TTL bounds (seconds).
pub const PRESIGN_MIN_SECS: u64 = 60;
pub const PRESIGN_MAX_SECS: u64 = 86_400;

/// Object-store batch-delete cap.
const DELETE_BATCH: usize = 1000;

/// Standard artifact names and their content types.
const STANDARD_ARTIFACTS: [(&str, &str); 5] = [
    ("output.log", "text/plain"),
    ("summary.json", "application/json"),
    ("diff.patch", "text/x-patch"),
    ("stdout.txt", "text/plain"),
    ("stderr.txt", "text/plain"),
];

/// Content type for an artifact filename, defaulting to octet-stream.
pub fn content_type_for(filename: &str) -> &'static str {
    STANDARD_ARTIFACTS
        .iter()
        .find(|(name, _)| *name == filename)
        .map(|(_, ct)| *ct)
        .unwrap_or("application/octet-stream")
}

/// Result of an upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedArtifact {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// A presigned URL plus its expiry.
#[derive(Debug, Clone, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// One entry in a dispatch's artifact listing.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactEntry {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A dispatch's artifact listing.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactListing {
    pub artifacts: Vec<ArtifactEntry>,
    pub total_size: u64,
    pub count: usize,
}

/// Result of a retention sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub deleted_count: usize,
    pub freed_bytes: u64,
    pub dispatches_processed: usize,
}

/// S3-backed artifact store.
#[derive(Clone)]
pub struct ArtifactStore {
    client: Client,
    bucket: String,
    multipart_threshold: usize,
    part_size: usize,
    default_presign_secs: u64,
    retention: Duration,
}

impl ArtifactStore {
    pub fn new(
        client: Client,
        bucket: impl Into<String>,
        artifacts: &ArtifactConfig,
        retention: &RetentionConfig,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            multipart_threshold: artifacts.multipart_threshold,
            part_size: artifacts.part_size,
            default_presign_secs: artifacts.default_presign_secs,
            retention: Duration::days(retention.artifact_days),
        }
    }

    /// The object key for a dispatch artifact.
    pub fn key_for(dispatch_id: Uuid, filename: &str) -> String {
        format!("dispatches/{dispatch_id}/{filename}")
    }

    /// Upload a buffered artifact.
    ///
    /// Payloads below the multipart threshold go up in a single PUT;
    /// larger ones are split into parts.
    pub async fn upload(
        &self,
        dispatch_id: Uuid,
        filename: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadedArtifact> {
        validate_filename(filename)?;
        let key = Self::key_for(dispatch_id, filename);
        let content_type = content_type
            .unwrap_or_else(|| content_type_for(filename))
            .to_string();
        let size = body.len() as u64;

        if body.len() < self.multipart_threshold {
            let output = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(body))
                .content_type(&content_type)
                .set_metadata(Some(self.metadata_stamps(dispatch_id)))
                .send()
                .await
                .with_context(|| format!("failed to upload {key}"))?;

            return Ok(UploadedArtifact {
                key,
                size,
                etag: output.e_tag().map(str::to_owned),
            });
        }

        let parts = body.len().div_ceil(self.part_size);
        let chunks = (0..parts).map(|i| {
            let start = i * self.part_size;
            let end = usize::min(start + self.part_size, body.len());
            body.slice(start..end)
        });
        let etag = self
            .multipart_upload(dispatch_id, &key, &content_type, chunks)
            .await?;

        Ok(UploadedArtifact { key, size, etag })
    }

    /// Upload a streamed artifact of known size via multipart.
    ///
    /// `size` is advisory (used for logging); the stream is read to its
    /// end regardless.
    pub async fn upload_large<R>(
        &self,
        dispatch_id: Uuid,
        filename: &str,
        mut reader: R,
        size: u64,
    ) -> Result<UploadedArtifact>
    where
        R: AsyncRead + Send + Unpin,
    {
        validate_filename(filename)?;
        let key = Self::key_for(dispatch_id, filename);
        let content_type = content_type_for(filename).to_string();

        // Drain the reader into part-sized chunks.
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total: u64 = 0;
        loop {
            let mut buf = BytesMut::with_capacity(self.part_size);
            while buf.len() < self.part_size {
                let read = reader
                    .read_buf(&mut buf)
                    .await
                    .context("failed to read artifact stream")?;
                if read == 0 {
                    break;
                }
            }
            if buf.is_empty() {
                break;
            }
            total += buf.len() as u64;
            chunks.push(buf.freeze());
        }

        if total != size {
            warn!(
                key = %key,
                declared = size,
                actual = total,
                "artifact stream size differed from declared size"
            );
        }

        let etag = self
            .multipart_upload(dispatch_id, &key, &content_type, chunks.into_iter())
            .await?;

        Ok(UploadedArtifact {
            key,
            size: total,
            etag,
        })
    }

    async fn multipart_upload(
        &self,
        dispatch_id: Uuid,
        key: &str,
        content_type: &str,
        chunks: impl Iterator<Item = Bytes>,
    ) -> Result<Option<String>> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(self.metadata_stamps(dispatch_id)))
            .send()
            .await
            .with_context(|| format!("failed to start multipart upload for {key}"))?;
        let upload_id = created
            .upload_id()
            .context("multipart upload returned no id")?
            .to_string();

        match self.upload_parts(key, &upload_id, chunks).await {
            Ok(parts) => {
                let completed = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .with_context(|| format!("failed to complete multipart upload for {key}"))?;
                Ok(completed.e_tag().map(str::to_owned))
            }
            Err(err) => {
                // Abort before surfacing so the bucket is not left with
                // orphaned parts.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %abort_err,
                        "failed to abort multipart upload after part failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        chunks: impl Iterator<Item = Bytes>,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        for (index, chunk) in chunks.enumerate() {
            let part_number = (index + 1) as i32;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .with_context(|| format!("failed to upload part {part_number} of {key}"))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_owned))
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }

    /// Fetch an artifact's bytes.
    pub async fn get(&self, dispatch_id: Uuid, filename: &str) -> Result<Bytes> {
        validate_filename(filename)?;
        let key = Self::key_for(dispatch_id, filename);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    Error::not_found(format!("artifact {key} not found"))
                } else {
                    Error::Internal(anyhow::Error::from(err).context(format!("failed to get {key}")))
                }
            })?;
        let bytes = output
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of {key}"))?
            .into_bytes();
        Ok(bytes)
    }

    /// Issue a time-limited GET URL for an existing artifact.
    ///
    /// Fails with `NotFound` when the object does not exist.
    pub async fn presign_download(
        &self,
        dispatch_id: Uuid,
        filename: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<PresignedUrl> {
        validate_filename(filename)?;
        let ttl = self.validate_ttl(ttl_seconds)?;
        let key = Self::key_for(dispatch_id, filename);

        // Verify existence first so the caller gets a 404 now instead of
        // a signed URL that will fail later.
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Error::not_found(format!("artifact {key} not found"))
                } else {
                    Error::Internal(
                        anyhow::Error::from(err).context(format!("failed to head {key}")),
                    )
                }
            })?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presign_config(ttl)?)
            .await
            .with_context(|| format!("failed to presign download for {key}"))?;

        Ok(PresignedUrl {
            url: presigned.uri().to_string(),
            expires_at: Utc::now() + Duration::seconds(ttl as i64),
        })
    }

    /// Issue a time-limited PUT URL carrying the standard metadata stamps.
    pub async fn presign_upload(
        &self,
        dispatch_id: Uuid,
        filename: &str,
        content_type: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<PresignedUrl> {
        validate_filename(filename)?;
        let ttl = self.validate_ttl(ttl_seconds)?;
        let key = Self::key_for(dispatch_id, filename);
        let content_type = content_type.unwrap_or_else(|| content_type_for(filename));

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .set_metadata(Some(self.metadata_stamps(dispatch_id)))
            .presigned(presign_config(ttl)?)
            .await
            .with_context(|| format!("failed to presign upload for {key}"))?;

        Ok(PresignedUrl {
            url: presigned.uri().to_string(),
            expires_at: Utc::now() + Duration::seconds(ttl as i64),
        })
    }

    /// Enumerate a dispatch's artifacts.
    ///
    /// Per-entry metadata comes from a HEAD on each object; a failed HEAD
    /// degrades that entry to defaults rather than failing the listing.
    pub async fn list(&self, dispatch_id: Uuid) -> Result<ArtifactListing> {
        let prefix = format!("dispatches/{dispatch_id}/");
        let mut artifacts = Vec::new();
        let mut total_size: u64 = 0;
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.clone())
                .send()
                .await
                .with_context(|| format!("failed to list artifacts under {prefix}"))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let filename = key.strip_prefix(&prefix).unwrap_or(key).to_string();
                let size = object.size().unwrap_or(0).max(0) as u64;
                let fallback_uploaded = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or_else(Utc::now);

                let entry = match self.head_entry(key, &filename, size).await {
                    Some(entry) => entry,
                    None => ArtifactEntry {
                        filename: filename.clone(),
                        size,
                        content_type: content_type_for(&filename).to_string(),
                        uploaded_at: fallback_uploaded,
                        expires_at: fallback_uploaded + self.retention,
                    },
                };
                total_size += entry.size;
                artifacts.push(entry);
            }

            if response.is_truncated() == Some(true) {
                continuation = response.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }

        Ok(ArtifactListing {
            count: artifacts.len(),
            total_size,
            artifacts,
        })
    }

    /// Resolve one listing entry via HEAD; `None` on any failure.
    async fn head_entry(&self, key: &str, filename: &str, size: u64) -> Option<ArtifactEntry> {
        let head = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(err) => {
                warn!(key = %key, error = %err, "metadata fetch failed, using defaults");
                return None;
            }
        };

        let empty = HashMap::new();
        let metadata = head.metadata().unwrap_or(&empty);
        let uploaded_at = metadata
            .get("uploaded-at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))?;
        let expires_at = metadata
            .get("expires-at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(uploaded_at + self.retention);

        Some(ArtifactEntry {
            filename: filename.to_string(),
            size: head.content_length().map(|l| l.max(0) as u64).unwrap_or(size),
            content_type: head
                .content_type()
                .unwrap_or_else(|| content_type_for(filename))
                .to_string(),
            uploaded_at,
            expires_at,
        })
    }

    /// Batch-delete every artifact of a dispatch. Returns the number of
    /// objects removed.
    pub async fn delete(&self, dispatch_id: Uuid) -> Result<usize> {
        let prefix = format!("dispatches/{dispatch_id}/");
        let keys = self.collect_keys(&prefix).await?;
        let deleted = keys.len();
        self.delete_keys(keys).await?;
        Ok(deleted)
    }

    /// Delete every artifact older than the retention window.
    ///
    /// Uses the storage-level `last_modified` so objects uploaded outside
    /// this store (presigned PUTs with clobbered metadata) still age out.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let cutoff = Utc::now() - self.retention;
        let mut report = SweepReport::default();
        let mut dispatches = std::collections::HashSet::new();
        let mut doomed: Vec<String> = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix("dispatches/")
                .set_continuation_token(continuation.clone())
                .send()
                .await
                .context("failed to list artifacts for sweep")?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if let Some(id) = key
                    .strip_prefix("dispatches/")
                    .and_then(|rest| rest.split('/').next())
                {
                    dispatches.insert(id.to_string());
                }
                let modified = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));
                if modified.is_some_and(|t| t < cutoff) {
                    report.deleted_count += 1;
                    report.freed_bytes += object.size().unwrap_or(0).max(0) as u64;
                    doomed.push(key.to_string());
                }
            }

            if response.is_truncated() == Some(true) {
                continuation = response.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }

        report.dispatches_processed = dispatches.len();
        self.delete_keys(doomed).await?;

        info!(
            deleted = report.deleted_count,
            freed_bytes = report.freed_bytes,
            dispatches = report.dispatches_processed,
            "artifact retention sweep finished"
        );
        Ok(report)
    }

    async fn collect_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.clone())
                .send()
                .await
                .with_context(|| format!("failed to list objects under {prefix}"))?;
            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_owned)),
            );
            if response.is_truncated() == Some(true) {
                continuation = response.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete_keys(&self, keys: Vec<String>) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .context("failed to build object identifier")
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .context("failed to build delete request")?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .context("failed to batch-delete artifacts")?;
        }
        Ok(())
    }

    fn metadata_stamps(&self, dispatch_id: Uuid) -> HashMap<String, String> {
        let now = Utc::now();
        HashMap::from([
            ("dispatch-id".to_string(), dispatch_id.to_string()),
            ("uploaded-at".to_string(), now.to_rfc3339()),
            (
                "expires-at".to_string(),
                (now + self.retention).to_rfc3339(),
            ),
        ])
    }

    fn validate_ttl(&self, ttl_seconds: Option<u64>) -> Result<u64> {
        let ttl = ttl_seconds.unwrap_or(self.default_presign_secs);
        if !(PRESIGN_MIN_SECS..=PRESIGN_MAX_SECS).contains(&ttl) {
            return Err(Error::validation(format!(
                "presign TTL must be within [{PRESIGN_MIN_SECS}, {PRESIGN_MAX_SECS}] seconds, got {ttl}"
            )));
        }
        Ok(ttl)
    }
}

fn presign_config(ttl_seconds: u64) -> Result<PresigningConfig> {
    PresigningConfig::expires_in(std::time::Duration::from_secs(ttl_seconds))
        .context("failed to build presigning config")
        .map_err(Error::Internal)
}

/// Artifact filenames are single path segments.
fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename.len() > 255
        || filename.contains('/')
        || filename.contains("..")
    {
        return Err(Error::validation(format!(
            "invalid artifact filename: {filename:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_for_standard_names() {
        assert_eq!(content_type_for("output.log"), "text/plain");
        assert_eq!(content_type_for("summary.json"), "application/json");
        assert_eq!(content_type_for("diff.patch"), "text/x-patch");
        assert_eq!(content_type_for("stdout.txt"), "text/plain");
        assert_eq!(content_type_for("stderr.txt"), "text/plain");
        assert_eq!(content_type_for("weird.bin"), "application/octet-stream");
    }

    #[test]
    fn key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            ArtifactStore::key_for(id, "output.log"),
            format!("dispatches/{id}/output.log")
        );
    }

    #[test]
    fn filenames_are_single_segments() {
        assert!(validate_filename("output.log").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("a/b").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename(&"x".repeat(256)).is_err());
    }
}
