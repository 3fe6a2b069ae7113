use tracing::info;
use uuid::Uuid;

use parley_types::api::{HistoryResponse, ThreadSummary};
use parley_types::models::{ParticipantRole, RelationshipStatus, Thread, ThreadTopic};
use parley_types::permissions::{CHAT_ACCESS, CHAT_AI, Permissions};

use crate::access::Action;
use crate::{ChatError, ChatResult, ChatService};

pub const AI_THREAD_TITLE: &str = "Assistant";
pub const TEAM_THREAD_TITLE: &str = "Team chat";
pub const MAX_HISTORY_PAGE: u32 = 200;

/// Topics seeded into every assistant thread, in display order.
pub const DEFAULT_TOPICS: &[(&str, &str)] = &[
    ("general", "General"),
    ("code", "Code help"),
    ("writing", "Writing"),
    ("planning", "Planning"),
];

impl ChatService {
    pub fn ensure_ai_thread(&self, user_id: Uuid, permissions: &Permissions) -> ChatResult<Thread> {
        if !permissions.can_chat() || !permissions.has_any(&[CHAT_AI, CHAT_ACCESS]) {
            return Err(ChatError::denied("missing assistant permission"));
        }
        let thread = self
            .db()
            .ensure_ai_thread(user_id, AI_THREAD_TITLE, DEFAULT_TOPICS)?;
        Ok(thread)
    }

    /// Commutative: `(a, b)` and `(b, a)` resolve to the same thread.
    pub fn ensure_dm_thread(
        &self,
        user_id: Uuid,
        other_id: Uuid,
        permissions: &Permissions,
    ) -> ChatResult<Thread> {
        if !permissions.can_chat() {
            return Err(ChatError::denied("missing chat permission"));
        }
        if user_id == other_id {
            return Err(ChatError::invalid("cannot open a conversation with yourself"));
        }
        match self.directory().relationship(user_id, other_id)? {
            Some(RelationshipStatus::Accepted) => {}
            _ => return Err(ChatError::denied("friendship is not accepted")),
        }

        let thread = self.db().ensure_dm_thread(user_id, other_id)?;
        info!("dm thread {} ready for {} and {}", thread.id, user_id, other_id);
        Ok(thread)
    }

    pub fn ensure_team_thread(
        &self,
        user_id: Uuid,
        team_id: Uuid,
        permissions: &Permissions,
    ) -> ChatResult<Thread> {
        if !permissions.can_chat() {
            return Err(ChatError::denied("missing chat permission"));
        }
        if self.directory().team_role(team_id, user_id)?.is_none() {
            return Err(ChatError::denied("not a member of this team"));
        }

        let thread = self.db().ensure_team_thread(team_id, TEAM_THREAD_TITLE)?;
        self.db()
            .upsert_participant(thread.id, user_id, ParticipantRole::Member)?;
        Ok(thread)
    }

    pub fn create_room(
        &self,
        creator_id: Uuid,
        title: &str,
        member_ids: &[Uuid],
        permissions: &Permissions,
    ) -> ChatResult<Thread> {
        if !permissions.can_chat() {
            return Err(ChatError::denied("missing chat permission"));
        }
        let title = title.trim();
        if title.is_empty() || title.chars().count() > 100 {
            return Err(ChatError::invalid("room title must be 1-100 characters"));
        }

        let thread = self.db().create_room(creator_id, title, member_ids)?;
        info!("room {} created by {} with {} members", thread.id, creator_id, member_ids.len());
        Ok(thread)
    }

    pub fn list_threads(&self, user_id: Uuid) -> ChatResult<Vec<ThreadSummary>> {
        let rows = self.db().list_threads_for_user(user_id)?;
        Ok(rows
            .into_iter()
            .map(|row| ThreadSummary {
                thread: row.thread,
                last_read_at: row.last_read_at,
                unread_count: row.unread_count,
            })
            .collect())
    }

    /// One page of history, oldest first, gated by a `read` access check.
    pub fn history(
        &self,
        user_id: Uuid,
        thread_id: Uuid,
        permissions: &Permissions,
        limit: u32,
        before: Option<Uuid>,
    ) -> ChatResult<HistoryResponse> {
        self.assert_access(user_id, thread_id, permissions, Action::Read)?;
        if let Some(cursor) = before {
            if !self.db().message_in_thread(thread_id, cursor)? {
                return Err(ChatError::invalid("history cursor is not a message of this thread"));
            }
        }

        let limit = limit.clamp(1, MAX_HISTORY_PAGE);
        let mut messages = self.db().get_messages(thread_id, limit + 1, before)?;
        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);
        messages.reverse();
        let next_before = if has_more {
            messages.first().map(|m| m.id)
        } else {
            None
        };

        Ok(HistoryResponse {
            thread_id,
            messages,
            has_more,
            next_before,
        })
    }

    pub fn topics(
        &self,
        user_id: Uuid,
        thread_id: Uuid,
        permissions: &Permissions,
    ) -> ChatResult<Vec<ThreadTopic>> {
        self.assert_access(user_id, thread_id, permissions, Action::Read)?;
        Ok(self.db().list_topics(thread_id)?)
    }

    /// Everyone a fan-out for this thread should reach.
    pub fn participant_ids(&self, thread_id: Uuid) -> ChatResult<Vec<Uuid>> {
        Ok(self
            .db()
            .list_participants(thread_id)?
            .into_iter()
            .map(|p| p.user_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CreateMessage;
    use crate::testing::{base, none, service};
    use parley_types::events::ErrorCode;
    use parley_types::models::ThreadKind;

    #[test]
    fn ai_thread_seeds_default_topics() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.ensure_ai_thread(user, &base()).unwrap();
        assert_eq!(thread.kind, ThreadKind::Ai);
        let topics = chat.topics(user, thread.id, &base()).unwrap();
        assert_eq!(topics.len(), DEFAULT_TOPICS.len());
        assert!(chat.ensure_ai_thread(user, &none()).is_err());
    }

    #[test]
    fn dm_requires_friendship_and_is_commutative() {
        let chat = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let err = chat.ensure_dm_thread(a, b, &base()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        chat.db().set_relationship(a, b, RelationshipStatus::Accepted).unwrap();
        let ab = chat.ensure_dm_thread(a, b, &base()).unwrap();
        let ba = chat.ensure_dm_thread(b, a, &base()).unwrap();
        assert_eq!(ab.id, ba.id);
        assert_eq!(chat.participant_ids(ab.id).unwrap().len(), 2);

        let err = chat.ensure_dm_thread(a, a, &base()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn team_thread_requires_membership() {
        let chat = service();
        let team = Uuid::new_v4();
        let (member, outsider) = (Uuid::new_v4(), Uuid::new_v4());
        chat.db().set_team_member(team, member, "owner").unwrap();

        let thread = chat.ensure_team_thread(member, team, &base()).unwrap();
        assert_eq!(thread.team_id, Some(team));
        assert!(chat.ensure_team_thread(outsider, team, &base()).is_err());
        assert_eq!(chat.participant_ids(thread.id).unwrap(), vec![member]);
    }

    #[test]
    fn room_title_is_validated() {
        let chat = service();
        let err = chat.create_room(Uuid::new_v4(), "  ", &[], &base()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn history_is_oldest_first_with_more_flag() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.ensure_ai_thread(user, &base()).unwrap();
        for i in 0..3 {
            chat.create_message(CreateMessage::from_user(thread.id, user, format!("m{}", i)))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let page = chat.history(user, thread.id, &base(), 2, None).unwrap();
        assert!(page.has_more);
        assert_eq!(page.messages[0].content, "m1");
        assert_eq!(page.messages[1].content, "m2");

        assert_eq!(page.next_before, Some(page.messages[0].id));

        let rest = chat.history(user, thread.id, &base(), 2, page.next_before).unwrap();
        assert!(!rest.has_more);
        assert_eq!(rest.next_before, None);
        assert_eq!(rest.messages.len(), 1);
        assert_eq!(rest.messages[0].content, "m0");

        let err = chat
            .history(user, thread.id, &base(), 2, Some(Uuid::new_v4()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn listing_puts_assistant_first() {
        let chat = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        chat.db().set_relationship(a, b, RelationshipStatus::Accepted).unwrap();
        let dm = chat.ensure_dm_thread(a, b, &base()).unwrap();
        chat.create_message(CreateMessage::from_user(dm.id, b, "hi")).unwrap();
        chat.ensure_ai_thread(a, &base()).unwrap();

        let list = chat.list_threads(a).unwrap();
        assert_eq!(list[0].thread.kind, ThreadKind::Ai);
        assert_eq!(list[1].thread.id, dm.id);
        assert_eq!(list[1].unread_count, 1);
    }
}
