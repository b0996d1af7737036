//! Database query functions for the `workspaces` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Workspace, WorkspaceInitMode};

/// Insert a workspace record for a dispatch. Returns the inserted row with
/// its server-generated id.
pub async fn insert_workspace(
    pool: &PgPool,
    dispatch_id: Uuid,
    repo_url: &str,
    branch: Option<&str>,
    init_mode: WorkspaceInitMode,
) -> Result<Workspace> {
    let workspace = sqlx::query_as::<_, Workspace>(
        "INSERT INTO workspaces (dispatch_id, repo_url, branch, init_mode) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(dispatch_id)
    .bind(repo_url)
    .bind(branch)
    .bind(init_mode)
    .fetch_one(pool)
    .await
    .context("failed to insert workspace")?;

    Ok(workspace)
}

/// Fetch a single workspace by ID.
pub async fn get_workspace(pool: &PgPool, id: Uuid) -> Result<Option<Workspace>> {
    let workspace =
        sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE workspace_id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch workspace")?;

    Ok(workspace)
}

/// List all active workspaces, newest first.
pub async fn list_workspaces(pool: &PgPool) -> Result<Vec<Workspace>> {
    let workspaces = sqlx::query_as::<_, Workspace>(
        "SELECT * FROM workspaces WHERE status = 'active' ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list workspaces")?;

    Ok(workspaces)
}

/// Soft-delete a workspace. Returns the number of rows affected (0 when
/// the workspace is missing or already deleted).
pub async fn delete_workspace(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workspaces SET status = 'deleted' \
         WHERE workspace_id = $1 AND status = 'active'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to delete workspace")?;

    Ok(result.rows_affected())
}
