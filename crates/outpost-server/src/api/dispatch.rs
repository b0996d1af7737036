//! Dispatch endpoints: create, status, cancel, list.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use outpost_core::Error;
use outpost_core::orchestrator::DispatchRequest;
use outpost_core::status::{LOG_LIMIT_MAX, StatusQuery};

use super::envelope::{ApiResult, ok};
use super::{AppState, user_id};

pub async fn create_dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult {
    let user = user_id(&headers)?;
    // Deserialize by hand so schema failures surface as 400s in the
    // envelope rather than the extractor's default rejection.
    let request: DispatchRequest = serde_json::from_value(body)
        .map_err(|err| Error::validation(format!("invalid dispatch request: {err}")))?;

    let receipt = state.orchestrator.dispatch(&user, request).await?;
    Ok(ok(StatusCode::CREATED, receipt))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatusParams {
    pub log_offset: Option<String>,
    pub log_limit: Option<i64>,
    pub skip_logs: Option<bool>,
}

pub async fn get_dispatch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<StatusParams>,
) -> ApiResult {
    if params.log_limit.is_some_and(|l| l < 1 || l > LOG_LIMIT_MAX) {
        return Err(Error::validation(format!(
            "log_limit must be within [1, {LOG_LIMIT_MAX}]"
        ))
        .into());
    }

    let view = state
        .tracker
        .status(
            id,
            StatusQuery {
                log_offset: params.log_offset,
                log_limit: params.log_limit,
                skip_logs: params.skip_logs.unwrap_or(false),
            },
        )
        .await?;
    Ok(ok(StatusCode::OK, view))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelBody {
    pub reason: Option<String>,
}

pub async fn cancel_dispatch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "cancelled by user".to_string());

    let outcome = state.orchestrator.cancel(id, &reason).await?;
    Ok(ok(StatusCode::OK, outcome))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    pub status: Option<String>,
    /// Comma-separated `key=value` pairs, all of which must match.
    pub tags: Option<String>,
}

pub async fn list_dispatches(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult {
    let user = user_id(&headers)?;

    let status = params
        .status
        .as_deref()
        .map(|s| {
            s.parse()
                .map_err(|_| Error::validation(format!("invalid status filter: {s:?}")))
        })
        .transpose()?;

    let tags = params
        .tags
        .as_deref()
        .map(parse_tag_filter)
        .transpose()?;

    let page = state
        .store
        .list_by_user(
            &user,
            params.limit.unwrap_or(20),
            params.cursor.as_deref(),
            status,
            tags.as_ref(),
        )
        .await?;

    Ok(ok(
        StatusCode::OK,
        serde_json::json!({
            "items": page.items,
            "next_cursor": page.next_cursor,
        }),
    ))
}

/// Parse `k1=v1,k2=v2` into the JSONB containment filter.
fn parse_tag_filter(raw: &str) -> Result<serde_json::Value, Error> {
    let mut map = serde_json::Map::new();
    for pair in raw.split(',').filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::validation(format!(
                "tag filter entries must be key=value, got {pair:?}"
            )));
        };
        map.insert(key.to_string(), serde_json::Value::from(value));
    }
    Ok(serde_json::Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_filter_parses_pairs() {
        let value = parse_tag_filter("team=infra,env=prod").unwrap();
        assert_eq!(value["team"], "infra");
        assert_eq!(value["env"], "prod");
    }

    #[test]
    fn tag_filter_rejects_bare_keys() {
        assert!(parse_tag_filter("team").is_err());
    }
}
