//! Workspace record endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use uuid::Uuid;

use outpost_core::Error;
use outpost_db::queries::workspaces as workspace_db;

use super::envelope::{ApiResult, ok};
use super::AppState;

pub async fn list_workspaces(State(state): State<AppState>) -> ApiResult {
    let workspaces = workspace_db::list_workspaces(state.store.pool())
        .await
        .map_err(Error::Internal)?;
    Ok(ok(StatusCode::OK, workspaces))
}

pub async fn get_workspace(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let workspace = workspace_db::get_workspace(state.store.pool(), id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found(format!("workspace {id} not found")))?;
    Ok(ok(StatusCode::OK, workspace))
}

pub async fn delete_workspace(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let deleted = workspace_db::delete_workspace(state.store.pool(), id)
        .await
        .map_err(Error::Internal)?;
    if deleted == 0 {
        return Err(Error::not_found(format!("workspace {id} not found")).into());
    }
    Ok(ok(
        StatusCode::OK,
        serde_json::json!({ "workspace_id": id, "status": "deleted" }),
    ))
}
