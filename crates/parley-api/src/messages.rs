use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;

use parley_store::models::UserRow;
use parley_store::queries::{MAX_PAGE_LIMIT, SCROLL_PAGE_LIMIT};
use parley_types::api::{Claims, EditMessageRequest, HistoryResponse, MessageView};
use parley_types::models::MessageKind;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Cursor: only messages with ids strictly below this are returned.
    pub before: Option<i64>,
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

/// Initial room load asks for a bigger page than incremental scroll-back.
fn default_history_limit() -> u32 {
    MAX_PAGE_LIMIT
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

fn default_search_limit() -> u32 {
    SCROLL_PAGE_LIMIT
}

/// Resolve the authenticated principal and check group membership. Every
/// history read enforces the same authorization as the live path.
pub(crate) fn authorize_member(
    state: &AppState,
    claims: &Claims,
    group_id: i64,
) -> Result<UserRow, StatusCode> {
    let user = state
        .store
        .user_by_username(&claims.sub)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .filter(|u| u.is_active)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if state
        .store
        .group(group_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }
    if !state
        .store
        .is_member(group_id, user.id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(user)
}

/// Cursor-paginated backfill for initial room load and scroll-back. Pages
/// come out of the store newest-first and are reversed so the response
/// body reads oldest-to-newest.
pub async fn history(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize_member(&state, &claims, group_id)?;

    // Run blocking store reads off the async runtime
    let store = state.store.clone();
    let rows = tokio::task::spawn_blocking(move || store.page(group_id, query.before, query.limit))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("history read failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let mut messages: Vec<MessageView> = rows.into_iter().map(|row| row.into_view()).collect();
    messages.reverse();
    Ok(Json(HistoryResponse { messages }))
}

/// Case-insensitive substring search over a group's log, newest first.
pub async fn search(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Query(query): Query<SearchQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize_member(&state, &claims, group_id)?;

    let store = state.store.clone();
    let rows = tokio::task::spawn_blocking(move || store.search(group_id, &query.q, query.limit))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("search failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let messages: Vec<MessageView> = rows.into_iter().map(|row| row.into_view()).collect();
    Ok(Json(HistoryResponse { messages }))
}

/// Owner-only edit of a text/code body; stamps the edit time.
pub async fn edit_message(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(i64, i64)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let user = authorize_member(&state, &claims, group_id)?;

    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let existing = state
        .store
        .get(message_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .filter(|m| m.group_id == group_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    if existing.sender_id != user.id {
        return Err(StatusCode::FORBIDDEN);
    }
    if !matches!(
        MessageKind::parse(&existing.kind),
        Some(MessageKind::Text | MessageKind::Code)
    ) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let store = state.store.clone();
    let row = tokio::task::spawn_blocking(move || store.edit(message_id, &content))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("edit failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        // the store no-ops silently on a vanished row; surface it here
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(row.into_view()))
}

/// Deletion by the owner, or by a group admin; the one privileged action
/// that consults the membership role flags.
pub async fn delete_message(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(i64, i64)>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, StatusCode> {
    let user = authorize_member(&state, &claims, group_id)?;

    let existing = state
        .store
        .get(message_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .filter(|m| m.group_id == group_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    if existing.sender_id != user.id {
        let is_admin = state
            .store
            .membership(group_id, user.id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_some_and(|m| m.is_admin);
        if !is_admin {
            return Err(StatusCode::FORBIDDEN);
        }
    }

    let removed = state
        .store
        .delete(message_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
