use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use parley_types::api::Claims;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: id of the oldest message already loaded.
    pub before: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

/// Messages are written over the WebSocket only; REST serves history.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let before = query.before;
    let page = state
        .chat
        .blocking(move |chat| {
            chat.history(claims.sub, thread_id, &claims.permissions, query.limit, before)
        })
        .await?;
    Ok(Json(page))
}
