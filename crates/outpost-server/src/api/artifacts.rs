//! Artifact retrieval: per-dispatch listing with presigned download URLs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use super::envelope::{ApiResult, ok};
use super::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactParams {
    /// Presign lifetime in seconds (60 to 86400).
    pub expires_in: Option<u64>,
}

/// Coarse artifact type from its standard filename.
fn artifact_type(filename: &str) -> &'static str {
    match filename {
        "output.log" => "log",
        "summary.json" => "summary",
        "diff.patch" => "diff",
        "stdout.txt" => "stdout",
        "stderr.txt" => "stderr",
        _ => "file",
    }
}

pub async fn get_artifacts(
    State(state): State<AppState>,
    Path(dispatch_id): Path<Uuid>,
    Query(params): Query<ArtifactParams>,
) -> ApiResult {
    // 404 for unknown dispatches, not an empty listing.
    let dispatch = state.store.get(dispatch_id).await?;

    let listing = state.artifacts.list(dispatch_id).await?;

    let mut entries = Vec::with_capacity(listing.artifacts.len());
    for artifact in &listing.artifacts {
        let presigned = state
            .artifacts
            .presign_download(dispatch_id, &artifact.filename, params.expires_in)
            .await?;
        entries.push(serde_json::json!({
            "type": artifact_type(&artifact.filename),
            "key": outpost_core::artifacts::ArtifactStore::key_for(dispatch_id, &artifact.filename),
            "url": presigned.url,
            "expires_at": presigned.expires_at,
            "size": artifact.size,
            "content_type": artifact.content_type,
        }));
    }

    Ok(ok(
        StatusCode::OK,
        serde_json::json!({
            "dispatch_id": dispatch_id,
            "status": dispatch.status,
            "artifacts": entries,
        }),
    ))
}
