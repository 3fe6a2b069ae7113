use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{ChatError, ChatResult, ChatService};

/// Pick the cursor to store for a client-reported read time. Client clocks
/// may run ahead, so the value is clamped to server receipt time.
pub fn clamp_read_at(requested: Option<DateTime<Utc>>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    match requested {
        Some(at) if at < received_at => at,
        _ => received_at,
    }
}

impl ChatService {
    /// Overwrite the participant's read cursor.
    ///
    /// Last write wins: a delayed, older update moves the cursor backwards.
    /// Out-of-order delivery can therefore briefly resurrect unread counts.
    pub fn mark_read(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> ChatResult<DateTime<Utc>> {
        if !self.db().set_last_read_at(thread_id, user_id, at)? {
            return Err(ChatError::denied("not a participant of this thread"));
        }
        Ok(at)
    }
}
