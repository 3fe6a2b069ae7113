use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Thread, ThreadTopic};
use crate::permissions::Permissions;

// -- JWT Claims --

/// Session claims shared by parley-api (REST middleware) and the gateway
/// upgrade handler. Tokens are issued elsewhere; we only verify them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(default)]
    pub permissions: Permissions,
    pub exp: usize,
}

// -- Threads --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsureDmRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsureTeamRequest {
    pub team_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub title: String,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

/// A thread as seen by one participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    #[serde(flatten)]
    pub thread: Thread,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadResponse {
    pub thread: Thread,
    pub participant_ids: Vec<Uuid>,
}

// -- Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub thread_id: Uuid,
    /// Oldest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
    /// Id of the oldest message here when `has_more`; pass it back as `before`.
    #[serde(default)]
    pub next_before: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsResponse {
    pub topics: Vec<ThreadTopic>,
}

// -- Assistant settings --

/// Absent fields are left unchanged; an empty string clears the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateAssistantSettingsRequest {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// The stored key itself is never returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantSettingsResponse {
    pub has_api_key: bool,
    pub system_prompt: Option<String>,
}
