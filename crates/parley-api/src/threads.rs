use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_chat::{Action, ChatResult, ChatService};
use parley_types::api::{
    Claims, CreateRoomRequest, EnsureDmRequest, EnsureTeamRequest, ThreadResponse,
    TopicsResponse,
};
use parley_types::models::Thread;

use crate::error::ApiResult;
use crate::state::AppState;

fn with_participants(chat: &ChatService, thread: Thread) -> ChatResult<ThreadResponse> {
    let participant_ids = chat.participant_ids(thread.id)?;
    Ok(ThreadResponse {
        thread,
        participant_ids,
    })
}

pub async fn list_threads(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let threads = state
        .chat
        .blocking(move |chat| chat.list_threads(claims.sub))
        .await?;
    Ok(Json(threads))
}

pub async fn ensure_ai_thread(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let thread = state
        .chat
        .blocking(move |chat| {
            let thread = chat.ensure_ai_thread(claims.sub, &claims.permissions)?;
            with_participants(chat, thread)
        })
        .await?;
    Ok(Json(thread))
}

pub async fn ensure_dm_thread(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EnsureDmRequest>,
) -> ApiResult<impl IntoResponse> {
    let thread = state
        .chat
        .blocking(move |chat| {
            let thread = chat.ensure_dm_thread(claims.sub, req.user_id, &claims.permissions)?;
            with_participants(chat, thread)
        })
        .await?;
    Ok(Json(thread))
}

pub async fn ensure_team_thread(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EnsureTeamRequest>,
) -> ApiResult<impl IntoResponse> {
    let thread = state
        .chat
        .blocking(move |chat| {
            let thread = chat.ensure_team_thread(claims.sub, req.team_id, &claims.permissions)?;
            with_participants(chat, thread)
        })
        .await?;
    Ok(Json(thread))
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRoomRequest>,
) -> ApiResult<impl IntoResponse> {
    let thread = state
        .chat
        .blocking(move |chat| {
            let thread =
                chat.create_room(claims.sub, &req.title, &req.member_ids, &claims.permissions)?;
            with_participants(chat, thread)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(thread)))
}

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let thread = state
        .chat
        .blocking(move |chat| {
            let ctx = chat.assert_access(claims.sub, thread_id, &claims.permissions, Action::Read)?;
            with_participants(chat, ctx.thread)
        })
        .await?;
    Ok(Json(thread))
}

pub async fn list_topics(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let topics = state
        .chat
        .blocking(move |chat| chat.topics(claims.sub, thread_id, &claims.permissions))
        .await?;
    Ok(Json(TopicsResponse { topics }))
}
