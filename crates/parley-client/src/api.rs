//! REST calls the chat view needs besides the gateway: thread list,
//! history pages and assistant settings.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use parley_types::api::{
    AssistantSettingsResponse, EnsureDmRequest, HistoryResponse, ThreadResponse, ThreadSummary,
    UpdateAssistantSettingsRequest,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{status} {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Transport(e) => e.status(),
            Self::Api { status, .. } => Some(*status),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>, ClientError> {
        self.send(self.request(Method::GET, "/threads")).await
    }

    pub async fn ensure_ai_thread(&self) -> Result<ThreadResponse, ClientError> {
        self.send(self.request(Method::POST, "/threads/ai")).await
    }

    pub async fn ensure_dm_thread(&self, user_id: Uuid) -> Result<ThreadResponse, ClientError> {
        let body = EnsureDmRequest { user_id };
        self.send(self.request(Method::POST, "/threads/dm").json(&body))
            .await
    }

    /// One page of history, oldest first, ending just before message `before` when given.
    pub async fn history(
        &self,
        thread_id: Uuid,
        limit: u32,
        before: Option<Uuid>,
    ) -> Result<HistoryResponse, ClientError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let path = format!("/threads/{}/messages", thread_id);
        self.send(self.request(Method::GET, &path).query(&query))
            .await
    }

    pub async fn assistant_settings(&self) -> Result<AssistantSettingsResponse, ClientError> {
        self.send(self.request(Method::GET, "/settings/assistant"))
            .await
    }

    pub async fn update_assistant_settings(
        &self,
        update: &UpdateAssistantSettingsRequest,
    ) -> Result<AssistantSettingsResponse, ClientError> {
        self.send(self.request(Method::PUT, "/settings/assistant").json(update))
            .await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res.json().await?);
        }
        let (code, message) = match res.json::<ErrorBody>().await {
            Ok(body) => (body.code, body.message),
            Err(_) => ("UNKNOWN".to_string(), status.to_string()),
        };
        Err(ClientError::Api {
            status,
            code,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slash() {
        let client = RestClient::new("http://localhost:3000/", "t");
        assert_eq!(client.base_url, "http://localhost:3000");
    }

    #[test]
    fn api_errors_carry_status() {
        let err = ClientError::Api {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN".into(),
            message: "not a participant".into(),
        };
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(err.to_string(), "403 Forbidden FORBIDDEN: not a participant");
    }
}
