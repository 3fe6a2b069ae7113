use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use parley_db::NewMessage;
use parley_types::models::{Message, MessageKind, Thread};
use parley_types::time;

use crate::{ChatError, ChatResult, ChatService};

pub const MAX_CONTENT_LEN: usize = 8_000;

/// Assistant replies are produced by the server, not typed, and run longer.
pub const MAX_ASSISTANT_CONTENT_LEN: usize = 200_000;

#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub thread_id: Uuid,
    /// `None` for assistant and system messages.
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: serde_json::Value,
}

impl CreateMessage {
    pub fn from_user(thread_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            sender_id: Some(sender_id),
            kind: MessageKind::User,
            content: content.into(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CreatedMessage {
    pub thread: Thread,
    pub message: Message,
    pub created_at: DateTime<Utc>,
}

impl ChatService {
    /// Persist a message and advance its thread's `last_message_at` to the
    /// message timestamp in the same transaction.
    ///
    /// The sender is re-checked as a participant so that callers outside the
    /// gateway cannot skip the access guard.
    pub fn create_message(&self, input: CreateMessage) -> ChatResult<CreatedMessage> {
        if input.content.trim().is_empty() {
            return Err(ChatError::invalid("message content is empty"));
        }
        let max_len = match input.kind {
            MessageKind::User => MAX_CONTENT_LEN,
            MessageKind::Assistant | MessageKind::System => MAX_ASSISTANT_CONTENT_LEN,
        };
        if input.content.chars().count() > max_len {
            return Err(ChatError::invalid(format!(
                "message content exceeds {} characters",
                max_len
            )));
        }
        let metadata = match input.metadata {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            value @ serde_json::Value::Object(_) => value,
            _ => return Err(ChatError::invalid("metadata must be an object")),
        };

        if self.db().get_thread(input.thread_id)?.is_none() {
            return Err(ChatError::ThreadNotFound(input.thread_id));
        }
        if let Some(sender_id) = input.sender_id {
            if self.db().get_participant(input.thread_id, sender_id)?.is_none() {
                return Err(ChatError::denied("sender is not a participant"));
            }
        }

        let (thread, message) = self.db().insert_message(&NewMessage {
            id: Uuid::new_v4(),
            thread_id: input.thread_id,
            sender_id: input.sender_id,
            kind: input.kind,
            content: input.content,
            metadata,
            created_at: time::now(),
        })?;

        debug!("message {} stored in thread {}", message.id, thread.id);
        Ok(CreatedMessage {
            created_at: message.created_at,
            thread,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::service;
    use parley_types::events::ErrorCode;

    #[test]
    fn create_bumps_thread_to_message_time() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.db().ensure_ai_thread(user, "Assistant", &[]).unwrap();

        let created = chat.create_message(CreateMessage::from_user(thread.id, user, "hello")).unwrap();
        assert_eq!(created.thread.last_message_at, Some(created.created_at));
        assert_eq!(created.message.created_at, created.created_at);

        let reloaded = chat.db().get_thread(thread.id).unwrap().unwrap();
        let latest = chat.db().get_messages(thread.id, 1, None).unwrap();
        assert!(reloaded.last_message_at.unwrap() >= latest[0].created_at);
    }

    #[test]
    fn concurrent_sends_keep_thread_time_on_the_newest_message() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.db().ensure_ai_thread(user, "Assistant", &[]).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|w| {
                let chat = chat.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|i| {
                            chat.create_message(CreateMessage::from_user(
                                thread.id,
                                user,
                                format!("w{} m{}", w, i),
                            ))
                            .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for created in workers.into_iter().flat_map(|w| w.join().unwrap()) {
            assert_eq!(created.thread.last_message_at, Some(created.created_at));
        }

        // Stored order never runs backwards in time.
        let stored = chat.db().get_messages(thread.id, 100, None).unwrap();
        assert_eq!(stored.len(), 80);
        assert!(stored.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        let reloaded = chat.db().get_thread(thread.id).unwrap().unwrap();
        assert_eq!(reloaded.last_message_at, Some(stored[0].created_at));
    }

    #[test]
    fn assistant_messages_have_no_sender() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.db().ensure_ai_thread(user, "Assistant", &[]).unwrap();
        let created = chat
            .create_message(CreateMessage {
                thread_id: thread.id,
                sender_id: None,
                kind: MessageKind::Assistant,
                content: "Hi there".into(),
                metadata: serde_json::Value::Null,
            })
            .unwrap();
        assert_eq!(created.message.sender_id, None);
        assert!(created.message.metadata.is_object());
    }

    #[test]
    fn length_cap_depends_on_kind() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.db().ensure_ai_thread(user, "Assistant", &[]).unwrap();
        let long = "a".repeat(MAX_CONTENT_LEN + 1);

        let err = chat
            .create_message(CreateMessage::from_user(thread.id, user, long.clone()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let reply = chat
            .create_message(CreateMessage {
                thread_id: thread.id,
                sender_id: None,
                kind: MessageKind::Assistant,
                content: long,
                metadata: serde_json::Value::Null,
            })
            .unwrap();
        assert_eq!(reply.message.content.len(), MAX_CONTENT_LEN + 1);
    }

    #[test]
    fn rejects_non_participant_sender() {
        let chat = service();
        let owner = Uuid::new_v4();
        let thread = chat.db().ensure_ai_thread(owner, "Assistant", &[]).unwrap();
        let err = chat
            .create_message(CreateMessage::from_user(thread.id, Uuid::new_v4(), "sneaky"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
        assert!(chat.db().get_messages(thread.id, 10, None).unwrap().is_empty());
    }

    #[test]
    fn validates_before_touching_storage() {
        let chat = service();
        let err = chat
            .create_message(CreateMessage::from_user(Uuid::new_v4(), Uuid::new_v4(), "   "))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = chat
            .create_message(CreateMessage::from_user(Uuid::new_v4(), Uuid::new_v4(), "hi"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ThreadNotFound);

        let err = chat
            .create_message(
                CreateMessage::from_user(Uuid::new_v4(), Uuid::new_v4(), "hi")
                    .with_metadata(serde_json::json!([1, 2])),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}
