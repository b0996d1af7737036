//! Integration tests for the `dispatches` queries: conditional
//! transitions, listing, metrics, and retention.

use chrono::{Duration, Utc};
use uuid::Uuid;

use outpost_db::cursor::PageCursor;
use outpost_db::models::{
    AgentKind, DispatchStatus, NewDispatch, StatusPatch, WorkspaceInitMode,
};
use outpost_db::queries::{dispatch_logs, dispatches as db};
use outpost_test_utils::{create_test_db, drop_test_db};

fn new_dispatch(user_id: &str, agent: AgentKind) -> NewDispatch {
    NewDispatch {
        dispatch_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        agent_kind: agent,
        model_id: "claude-opus-4-5-20251101".to_string(),
        task: "Refactor the auth module to use PKCE flow.".to_string(),
        repo_url: None,
        branch: None,
        workspace_init_mode: WorkspaceInitMode::Full,
        timeout_seconds: 3600,
        cpu_units: None,
        memory_mb: None,
        disk_gb: None,
        additional_secrets: Vec::new(),
        tags: None,
        idempotency_key: None,
        workspace_id: None,
        expires_at: Utc::now() + Duration::days(90),
    }
}

#[tokio::test]
async fn insert_starts_pending_at_version_one() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("tenant-1", AgentKind::Claude);
    let dispatch = db::insert_dispatch(&pool, &new)
        .await
        .expect("insert should succeed")
        .expect("fresh id should insert");

    assert_eq!(dispatch.status, DispatchStatus::Pending);
    assert_eq!(dispatch.version, 1);
    assert!(dispatch.ended_at.is_none());
    assert!(dispatch.task_arn.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_insert_returns_none() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("tenant-1", AgentKind::Claude);
    db::insert_dispatch(&pool, &new)
        .await
        .expect("insert should succeed")
        .expect("fresh id should insert");

    let duplicate = db::insert_dispatch(&pool, &new)
        .await
        .expect("query should succeed");
    assert!(duplicate.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transition_bumps_version_and_applies_patch() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("tenant-1", AgentKind::Codex);
    let dispatch = db::insert_dispatch(&pool, &new).await.unwrap().unwrap();

    let running = db::transition_dispatch(
        &pool,
        dispatch.dispatch_id,
        1,
        DispatchStatus::Running,
        &StatusPatch {
            task_arn: Some("arn:aws:ecs:us-east-1:0:task/outpost/t1".to_string()),
            ..Default::default()
        },
    )
    .await
    .expect("query should succeed")
    .expect("guard should pass");

    assert_eq!(running.status, DispatchStatus::Running);
    assert_eq!(running.version, 2);
    assert_eq!(
        running.task_arn.as_deref(),
        Some("arn:aws:ecs:us-east-1:0:task/outpost/t1")
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_version_fails_the_guard() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("tenant-1", AgentKind::Codex);
    let dispatch = db::insert_dispatch(&pool, &new).await.unwrap().unwrap();

    db::transition_dispatch(&pool, dispatch.dispatch_id, 1, DispatchStatus::Running, &StatusPatch::default())
        .await
        .unwrap()
        .expect("first transition should pass");

    // A second writer still holding version 1 loses.
    let stale = db::transition_dispatch(
        &pool,
        dispatch.dispatch_id,
        1,
        DispatchStatus::Cancelled,
        &StatusPatch::default(),
    )
    .await
    .expect("query should succeed");
    assert!(stale.is_none());

    // The record is untouched by the failed write.
    let current = db::get_dispatch(&pool, dispatch.dispatch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, DispatchStatus::Running);
    assert_eq!(current.version, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_states_absorb_further_transitions() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("tenant-1", AgentKind::Gemini);
    let dispatch = db::insert_dispatch(&pool, &new).await.unwrap().unwrap();

    db::transition_dispatch(&pool, dispatch.dispatch_id, 1, DispatchStatus::Running, &StatusPatch::default())
        .await
        .unwrap()
        .expect("to running");
    db::transition_dispatch(
        &pool,
        dispatch.dispatch_id,
        2,
        DispatchStatus::Completed,
        &StatusPatch {
            ended_at: Some(Utc::now()),
            exit_code: Some(0),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .expect("to completed");

    // Even with the correct version, no edge leaves a terminal state.
    let reopened = db::transition_dispatch(
        &pool,
        dispatch.dispatch_id,
        3,
        DispatchStatus::Failed,
        &StatusPatch::default(),
    )
    .await
    .expect("query should succeed");
    assert!(reopened.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn invalid_edge_fails_even_with_matching_version() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("tenant-1", AgentKind::Grok);
    let dispatch = db::insert_dispatch(&pool, &new).await.unwrap().unwrap();

    // PENDING -> COMPLETED skips RUNNING and must be refused.
    let skipped = db::transition_dispatch(
        &pool,
        dispatch.dispatch_id,
        1,
        DispatchStatus::Completed,
        &StatusPatch::default(),
    )
    .await
    .expect("query should succeed");
    assert!(skipped.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn lookup_by_task_arn() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("tenant-1", AgentKind::Claude);
    let dispatch = db::insert_dispatch(&pool, &new).await.unwrap().unwrap();
    db::transition_dispatch(
        &pool,
        dispatch.dispatch_id,
        1,
        DispatchStatus::Running,
        &StatusPatch {
            task_arn: Some("arn:aws:ecs:us-east-1:0:task/outpost/by-arn".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .unwrap();

    let found = db::get_dispatch_by_task_arn(&pool, "arn:aws:ecs:us-east-1:0:task/outpost/by-arn")
        .await
        .expect("query should succeed")
        .expect("should find the dispatch");
    assert_eq!(found.dispatch_id, dispatch.dispatch_id);

    assert!(
        db::get_dispatch_by_task_arn(&pool, "arn:aws:ecs:us-east-1:0:task/outpost/unknown")
            .await
            .unwrap()
            .is_none()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn listing_pages_newest_first_with_cursor() {
    let (pool, db_name) = create_test_db().await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let new = new_dispatch("pager", AgentKind::Claude);
        ids.push(new.dispatch_id);
        db::insert_dispatch(&pool, &new).await.unwrap().unwrap();
        // Distinct started_at values for a stable order.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    // Another tenant's rows stay invisible.
    db::insert_dispatch(&pool, &new_dispatch("other", AgentKind::Claude))
        .await
        .unwrap()
        .unwrap();

    let first_page = db::list_for_user(&pool, "pager", 2, None, None, None)
        .await
        .expect("list should succeed");
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].dispatch_id, ids[4]);
    assert_eq!(first_page[1].dispatch_id, ids[3]);

    let cursor = PageCursor {
        started_at: first_page[1].started_at,
        dispatch_id: first_page[1].dispatch_id,
    };
    let second_page = db::list_for_user(&pool, "pager", 2, Some(cursor), None, None)
        .await
        .expect("list should succeed");
    assert_eq!(second_page.len(), 2);
    assert_eq!(second_page[0].dispatch_id, ids[2]);
    assert_eq!(second_page[1].dispatch_id, ids[1]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn listing_filters_by_status_and_tags() {
    let (pool, db_name) = create_test_db().await;

    let mut tagged = new_dispatch("filter", AgentKind::Claude);
    tagged.tags = Some(serde_json::json!({"team": "infra", "env": "prod"}));
    let tagged_id = tagged.dispatch_id;
    db::insert_dispatch(&pool, &tagged).await.unwrap().unwrap();

    let mut other = new_dispatch("filter", AgentKind::Claude);
    other.tags = Some(serde_json::json!({"team": "infra", "env": "dev"}));
    db::insert_dispatch(&pool, &other).await.unwrap().unwrap();

    let running = new_dispatch("filter", AgentKind::Claude);
    let running_id = running.dispatch_id;
    db::insert_dispatch(&pool, &running).await.unwrap().unwrap();
    db::transition_dispatch(&pool, running_id, 1, DispatchStatus::Running, &StatusPatch::default())
        .await
        .unwrap()
        .unwrap();

    // Status filter.
    let running_only = db::list_for_user(
        &pool,
        "filter",
        10,
        None,
        Some(DispatchStatus::Running),
        None,
    )
    .await
    .unwrap();
    assert_eq!(running_only.len(), 1);
    assert_eq!(running_only[0].dispatch_id, running_id);

    // Tag filter is AND across pairs.
    let filter = serde_json::json!({"team": "infra", "env": "prod"});
    let both_tags = db::list_for_user(&pool, "filter", 10, None, None, Some(&filter))
        .await
        .unwrap();
    assert_eq!(both_tags.len(), 1);
    assert_eq!(both_tags[0].dispatch_id, tagged_id);

    let one_tag = serde_json::json!({"team": "infra"});
    let team_only = db::list_for_user(&pool, "filter", 10, None, None, Some(&one_tag))
        .await
        .unwrap();
    assert_eq!(team_only.len(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn active_count_tracks_live_statuses() {
    let (pool, db_name) = create_test_db().await;

    let pending = new_dispatch("quota", AgentKind::Claude);
    db::insert_dispatch(&pool, &pending).await.unwrap().unwrap();

    let finished = new_dispatch("quota", AgentKind::Claude);
    let finished_id = finished.dispatch_id;
    db::insert_dispatch(&pool, &finished).await.unwrap().unwrap();
    db::transition_dispatch(&pool, finished_id, 1, DispatchStatus::Running, &StatusPatch::default())
        .await
        .unwrap()
        .unwrap();
    db::transition_dispatch(
        &pool,
        finished_id,
        2,
        DispatchStatus::Completed,
        &StatusPatch {
            ended_at: Some(Utc::now()),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(db::count_active_for_user(&pool, "quota").await.unwrap(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn metrics_aggregate_by_status_and_agent() {
    let (pool, db_name) = create_test_db().await;

    let completed = new_dispatch("metrics", AgentKind::Claude);
    let completed_id = completed.dispatch_id;
    db::insert_dispatch(&pool, &completed).await.unwrap().unwrap();
    db::transition_dispatch(&pool, completed_id, 1, DispatchStatus::Running, &StatusPatch::default())
        .await
        .unwrap()
        .unwrap();
    db::transition_dispatch(
        &pool,
        completed_id,
        2,
        DispatchStatus::Completed,
        &StatusPatch {
            ended_at: Some(Utc::now()),
            exit_code: Some(0),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .unwrap();

    db::insert_dispatch(&pool, &new_dispatch("metrics", AgentKind::Aider))
        .await
        .unwrap()
        .unwrap();

    let metrics = db::dispatch_metrics(&pool, Utc::now() - Duration::hours(1))
        .await
        .expect("metrics should aggregate");
    assert_eq!(metrics.total, 2);
    assert_eq!(metrics.by_status.completed, 1);
    assert_eq!(metrics.by_status.pending, 1);

    let claude = metrics
        .by_agent
        .iter()
        .find(|a| a.agent_kind == AgentKind::Claude)
        .expect("claude aggregate");
    assert_eq!(claude.completed, 1);
    assert_eq!(claude.failed, 0);
    assert!(claude.avg_duration_ms.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn purge_removes_expired_dispatches_and_their_logs() {
    let (pool, db_name) = create_test_db().await;

    let mut expired = new_dispatch("sweep", AgentKind::Claude);
    expired.expires_at = Utc::now() - Duration::days(1);
    let expired_id = expired.dispatch_id;
    db::insert_dispatch(&pool, &expired).await.unwrap().unwrap();
    dispatch_logs::append_line(&pool, expired_id, "hello from a doomed dispatch")
        .await
        .unwrap();

    let fresh = new_dispatch("sweep", AgentKind::Claude);
    let fresh_id = fresh.dispatch_id;
    db::insert_dispatch(&pool, &fresh).await.unwrap().unwrap();

    let purged = db::purge_expired(&pool, Utc::now()).await.unwrap();
    assert_eq!(purged, 1);

    assert!(db::get_dispatch(&pool, expired_id).await.unwrap().is_none());
    assert!(db::get_dispatch(&pool, fresh_id).await.unwrap().is_some());
    // Cascade took the logs.
    let lines = dispatch_logs::page_lines(&pool, expired_id, 0, 10).await.unwrap();
    assert!(lines.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn log_pagination_by_sequence_id() {
    let (pool, db_name) = create_test_db().await;

    let new = new_dispatch("logs", AgentKind::Claude);
    let id = new.dispatch_id;
    db::insert_dispatch(&pool, &new).await.unwrap().unwrap();

    for i in 0..5 {
        dispatch_logs::append_line(&pool, id, &format!("line {i}"))
            .await
            .unwrap();
    }

    let first = dispatch_logs::page_lines(&pool, id, 0, 3).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first[0].line, "line 0");

    let rest = dispatch_logs::page_lines(&pool, id, first[2].id, 3)
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].line, "line 3");
    assert_eq!(rest[1].line, "line 4");

    pool.close().await;
    drop_test_db(&db_name).await;
}
