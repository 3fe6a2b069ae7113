use axum::{
    Json,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::permissions::Permissions;

use crate::state::AppState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing session token")]
    Missing,

    #[error("invalid session token")]
    Invalid,

    #[error("chat access not granted")]
    Forbidden,
}

impl SessionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Missing | Self::Invalid => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer` first, then `?token=` (browsers cannot set headers on a WebSocket upgrade).
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
        .or_else(|| {
            Query::<TokenQuery>::try_from_uri(uri)
                .ok()
                .and_then(|Query(q)| q.token)
        })
        .filter(|token| !token.is_empty())
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, SessionError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("rejected session token: {}", e);
        SessionError::Invalid
    })
}

/// Resolve the caller of a request. Runs before any WebSocket exists, so a
/// failure here is the only way a connection is refused outright.
pub fn resolve_session(headers: &HeaderMap, uri: &Uri, secret: &str) -> Result<Claims, SessionError> {
    let token = extract_token(headers, uri).ok_or(SessionError::Missing)?;
    let claims = verify_token(&token, secret)?;
    if !claims.permissions.can_chat() {
        return Err(SessionError::Forbidden);
    }
    Ok(claims)
}

/// Sign a session token. Parley only verifies tokens in production; this is
/// for local tooling and tests.
pub fn issue_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    permissions: Permissions,
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        permissions,
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Validate the session and stash its claims in request extensions.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, SessionError> {
    let claims = resolve_session(req.headers(), req.uri(), &state.jwt_secret)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
