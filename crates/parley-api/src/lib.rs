//! REST surface: thread setup and listing, history pages, topics and
//! assistant settings. Messages themselves flow over the gateway.

pub mod error;
pub mod messages;
pub mod session;
pub mod settings;
pub mod state;
pub mod threads;

use axum::{
    Router, middleware,
    routing::{get, post},
};

pub use error::{ApiError, ApiResult};
pub use session::{SessionError, resolve_session};
pub use state::{AppState, AppStateInner};

/// Every route here requires a session with `chat:access`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/threads", get(threads::list_threads))
        .route("/threads/ai", post(threads::ensure_ai_thread))
        .route("/threads/dm", post(threads::ensure_dm_thread))
        .route("/threads/team", post(threads::ensure_team_thread))
        .route("/threads/rooms", post(threads::create_room))
        .route("/threads/{thread_id}", get(threads::get_thread))
        .route("/threads/{thread_id}/messages", get(messages::get_messages))
        .route("/threads/{thread_id}/topics", get(threads::list_topics))
        .route(
            "/settings/assistant",
            get(settings::get_assistant_settings).put(settings::update_assistant_settings),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            session::require_session,
        ))
        .with_state(state)
}
