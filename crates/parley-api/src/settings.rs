use axum::{Extension, Json, extract::State, response::IntoResponse};

use parley_types::api::{Claims, UpdateAssistantSettingsRequest};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn get_assistant_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let settings = state
        .chat
        .blocking(move |chat| chat.assistant_settings(claims.sub))
        .await?;
    Ok(Json(settings))
}

pub async fn update_assistant_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateAssistantSettingsRequest>,
) -> ApiResult<impl IntoResponse> {
    let settings = state
        .chat
        .blocking(move |chat| chat.update_assistant_settings(claims.sub, req))
        .await?;
    Ok(Json(settings))
}
