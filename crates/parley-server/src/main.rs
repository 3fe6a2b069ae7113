mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::{AppStateInner, resolve_session};
use parley_chat::ChatService;
use parley_gateway::{
    AssistantBridge, AssistantConfig, Dispatcher, Gateway, OpenAiGenerator, handle_connection,
};

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    gateway: Gateway,
    jwt_secret: Arc<str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(parley_db::Database::open(&config.db_path)?);
    let chat = ChatService::new(db);
    let dispatcher = Dispatcher::new();

    let generator = Arc::new(OpenAiGenerator::new(&config.ai.base_url, &config.ai.model));
    let assistant = AssistantBridge::new(
        chat.clone(),
        dispatcher.clone(),
        generator,
        AssistantConfig {
            default_api_key: config.ai.api_key.clone(),
            context_limit: config.ai.context_limit,
            system_prompt: config.ai.system_prompt.clone(),
        },
    );
    if config.ai.api_key.is_none() {
        info!("no PARLEY_AI_API_KEY set; assistant replies need per-user keys");
    }
    let gateway = Gateway::new(chat.clone(), dispatcher).with_assistant(assistant);

    let api_state = Arc::new(AppStateInner {
        chat,
        jwt_secret: config.jwt_secret.clone(),
    });
    let state = ServerState {
        gateway,
        jwt_secret: config.jwt_secret.as_str().into(),
    };

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(parley_api::router(api_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Parley server stopped");
    Ok(())
}

/// Authenticate before upgrading: a rejected caller never gets a socket.
async fn ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match resolve_session(&headers, &uri, &state.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("gateway upgrade refused: {}", e);
            return e.into_response();
        }
    };

    ws.on_upgrade(move |socket| {
        handle_connection(
            socket,
            state.gateway,
            claims.sub,
            claims.username,
            claims.permissions,
        )
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
