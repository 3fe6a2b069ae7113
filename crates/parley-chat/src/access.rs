use tracing::debug;
use uuid::Uuid;

use parley_types::models::{
    Participant, ParticipantRole, RelationshipStatus, Thread, ThreadKind,
};
use parley_types::permissions::{CHAT_ACCESS, CHAT_AI, Permissions, TEAM_READ, TEAM_WRITE};

use crate::{ChatError, ChatResult, ChatService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Join,
}

/// Outcome of a successful access check.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub thread: Thread,
    /// Always present except for a team `read` by a member who has never joined.
    pub participant: Option<Participant>,
    /// The counterpart of a direct thread.
    pub dm_other_user_id: Option<Uuid>,
}

impl ChatService {
    /// Resolve (thread, action) for a user into an authorized context or a typed denial.
    ///
    /// Team threads may create the caller's participant row as a side effect
    /// (`write` with team-write permission, and every `join`).
    pub fn assert_access(
        &self,
        user_id: Uuid,
        thread_id: Uuid,
        permissions: &Permissions,
        action: Action,
    ) -> ChatResult<AccessContext> {
        let thread = self
            .db()
            .get_thread(thread_id)?
            .ok_or(ChatError::ThreadNotFound(thread_id))?;

        if !permissions.can_chat() {
            return Err(ChatError::denied("missing chat permission"));
        }

        match thread.kind {
            ThreadKind::Ai => self.ai_access(thread, user_id, permissions),
            ThreadKind::Dm => self.dm_access(thread, user_id),
            ThreadKind::Team => self.team_access(thread, user_id, permissions, action),
            ThreadKind::Room => self.participant_access(thread, user_id),
        }
    }

    fn ai_access(
        &self,
        thread: Thread,
        user_id: Uuid,
        permissions: &Permissions,
    ) -> ChatResult<AccessContext> {
        if !permissions.has_any(&[CHAT_AI, CHAT_ACCESS]) {
            return Err(ChatError::denied("missing assistant permission"));
        }
        // Assistant participants are written at thread setup, never here.
        self.participant_access(thread, user_id)
    }

    fn dm_access(&self, thread: Thread, user_id: Uuid) -> ChatResult<AccessContext> {
        let participants = self.db().list_participants(thread.id)?;
        let Some(me) = participants.iter().find(|p| p.user_id == user_id).cloned() else {
            return Err(ChatError::denied("not a participant of this conversation"));
        };
        let other = participants
            .iter()
            .find(|p| p.user_id != user_id)
            .map(|p| p.user_id)
            .ok_or_else(|| ChatError::denied("conversation has no counterpart"))?;

        match self.directory().relationship(user_id, other)? {
            Some(RelationshipStatus::Accepted) => Ok(AccessContext {
                thread,
                participant: Some(me),
                dm_other_user_id: Some(other),
            }),
            status => {
                debug!("dm {} denied for {}: relationship {:?}", thread.id, user_id, status);
                Err(ChatError::denied("friendship is not accepted"))
            }
        }
    }

    fn team_access(
        &self,
        thread: Thread,
        user_id: Uuid,
        permissions: &Permissions,
        action: Action,
    ) -> ChatResult<AccessContext> {
        let team_id = thread
            .team_id
            .ok_or_else(|| ChatError::Server(anyhow::anyhow!("team thread {} has no team", thread.id)))?;

        if self.directory().team_role(team_id, user_id)?.is_none() {
            return Err(ChatError::denied("not a member of this team"));
        }

        let existing = self.db().get_participant(thread.id, user_id)?;
        let participant = match action {
            Action::Read => {
                if !permissions.has_any(&[TEAM_READ, CHAT_ACCESS]) {
                    return Err(ChatError::denied("missing team read permission"));
                }
                existing
            }
            Action::Write => {
                if existing.is_none() && !permissions.has(TEAM_WRITE) {
                    return Err(ChatError::denied("missing team write permission"));
                }
                Some(self.db().upsert_participant(thread.id, user_id, ParticipantRole::Member)?)
            }
            Action::Join => {
                Some(self.db().upsert_participant(thread.id, user_id, ParticipantRole::Member)?)
            }
        };

        Ok(AccessContext {
            thread,
            participant,
            dm_other_user_id: None,
        })
    }

    fn participant_access(&self, thread: Thread, user_id: Uuid) -> ChatResult<AccessContext> {
        let participant = self
            .db()
            .get_participant(thread.id, user_id)?
            .ok_or_else(|| ChatError::denied("not a participant of this thread"))?;
        Ok(AccessContext {
            thread,
            participant: Some(participant),
            dm_other_user_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{base, full, none, service};
    use parley_types::events::ErrorCode;

    #[test]
    fn missing_thread_is_not_found() {
        let chat = service();
        let err = chat
            .assert_access(Uuid::new_v4(), Uuid::new_v4(), &full(), Action::Read)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ThreadNotFound);
    }

    #[test]
    fn base_permission_is_required() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.db().ensure_ai_thread(user, "Assistant", &[]).unwrap();
        let err = chat.assert_access(user, thread.id, &none(), Action::Read).unwrap_err();
        assert!(matches!(err, ChatError::AccessDenied(_)));
    }

    #[test]
    fn ai_thread_requires_existing_participant() {
        let chat = service();
        let owner = Uuid::new_v4();
        let thread = chat.db().ensure_ai_thread(owner, "Assistant", &[]).unwrap();

        let ctx = chat.assert_access(owner, thread.id, &base(), Action::Write).unwrap();
        assert_eq!(ctx.participant.unwrap().user_id, owner);

        let stranger = Uuid::new_v4();
        assert!(chat.assert_access(stranger, thread.id, &full(), Action::Join).is_err());
        assert!(chat.db().get_participant(thread.id, stranger).unwrap().is_none());
    }

    #[test]
    fn dm_requires_accepted_relationship() {
        let chat = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let thread = chat.db().ensure_dm_thread(a, b).unwrap();

        for status in [
            RelationshipStatus::Pending,
            RelationshipStatus::Declined,
            RelationshipStatus::Blocked,
        ] {
            chat.db().set_relationship(a, b, status).unwrap();
            assert!(chat.assert_access(a, thread.id, &base(), Action::Write).is_err());
        }

        chat.db().set_relationship(a, b, RelationshipStatus::Accepted).unwrap();
        let ctx = chat.assert_access(a, thread.id, &base(), Action::Write).unwrap();
        assert_eq!(ctx.dm_other_user_id, Some(b));
    }

    #[test]
    fn dm_outsider_is_forbidden() {
        let chat = service();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        chat.db().set_relationship(a, b, RelationshipStatus::Accepted).unwrap();
        let thread = chat.db().ensure_dm_thread(a, b).unwrap();
        let err = chat.assert_access(c, thread.id, &full(), Action::Join).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[test]
    fn team_write_lazily_joins_with_write_permission() {
        let chat = service();
        let team = Uuid::new_v4();
        let user = Uuid::new_v4();
        chat.db().set_team_member(team, user, "member").unwrap();
        let thread = chat.db().ensure_team_thread(team, "Team").unwrap();

        // Read never creates a row.
        let ctx = chat.assert_access(user, thread.id, &base(), Action::Read).unwrap();
        assert!(ctx.participant.is_none());

        // Write without team-write and without a row is refused.
        assert!(chat.assert_access(user, thread.id, &base(), Action::Write).is_err());

        let ctx = chat.assert_access(user, thread.id, &full(), Action::Write).unwrap();
        assert!(ctx.participant.is_some());

        // Already a participant: base permission now suffices.
        chat.assert_access(user, thread.id, &base(), Action::Write).unwrap();
        assert_eq!(chat.db().list_participants(thread.id).unwrap().len(), 1);
    }

    #[test]
    fn team_join_always_upserts_for_members() {
        let chat = service();
        let team = Uuid::new_v4();
        let (member, outsider) = (Uuid::new_v4(), Uuid::new_v4());
        chat.db().set_team_member(team, member, "member").unwrap();
        let thread = chat.db().ensure_team_thread(team, "Team").unwrap();

        for _ in 0..3 {
            chat.assert_access(member, thread.id, &base(), Action::Join).unwrap();
        }
        assert_eq!(chat.db().list_participants(thread.id).unwrap().len(), 1);

        let err = chat.assert_access(outsider, thread.id, &full(), Action::Join).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[test]
    fn room_requires_participant() {
        let chat = service();
        let (owner, guest, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let room = chat.db().create_room(owner, "Planning", &[guest]).unwrap();
        chat.assert_access(guest, room.id, &base(), Action::Write).unwrap();
        assert!(chat.assert_access(stranger, room.id, &full(), Action::Read).is_err());
    }
}
