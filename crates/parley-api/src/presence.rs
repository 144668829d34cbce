use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;

use parley_types::api::Claims;

use crate::AppState;
use crate::messages::authorize_member;

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub online_users: Vec<i64>,
    pub typing_users: Vec<i64>,
}

/// Live presence snapshot for a group. Presence is process-local and
/// ephemeral; clients treat it as a convenience signal, not a source of
/// truth.
pub async fn online_users(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize_member(&state, &claims, group_id)?;

    Ok(Json(PresenceResponse {
        online_users: state.hub.online_users(group_id).await,
        typing_users: state.hub.typing_users(group_id).await,
    }))
}
