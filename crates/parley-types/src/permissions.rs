use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Base capability: required for any chat interaction at all.
pub const CHAT_ACCESS: &str = "chat:access";
pub const CHAT_AI: &str = "chat:ai";
pub const TEAM_READ: &str = "chat:team:read";
pub const TEAM_WRITE: &str = "chat:team:write";

/// Permission strings issued for a session. Opaque to everything but the access guard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(HashSet<String>);

impl Permissions {
    pub fn new<I, S>(perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(perms.into_iter().map(Into::into).collect())
    }

    pub fn has(&self, perm: &str) -> bool {
        self.0.contains(perm)
    }

    pub fn has_any(&self, perms: &[&str]) -> bool {
        perms.iter().any(|p| self.has(p))
    }

    pub fn can_chat(&self) -> bool {
        self.has(CHAT_ACCESS)
    }
}
