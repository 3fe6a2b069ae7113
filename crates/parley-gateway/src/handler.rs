use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_chat::read_state::clamp_read_at;
use parley_chat::{Action, ChatError, ChatResult, ChatService, CreateMessage};
use parley_types::events::{
    ClientEvent, ErrorPayload, NewMessage, ProtocolError, ReadUpdate, ReadUpdated, SendMessage,
    ServerEvent, ThreadRef, TypingEvent, TypingUpdate,
};
use parley_types::models::ThreadKind;
use parley_types::permissions::Permissions;
use parley_types::time;

use crate::assistant::AssistantBridge;
use crate::dispatcher::{Channel, ConnId, Dispatcher};

/// An authenticated connection. Identity is resolved before the socket is
/// upgraded and never changes for the life of the connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: ConnId,
    pub user_id: Uuid,
    pub username: String,
    pub permissions: Permissions,
}

/// Protocol dispatch for client frames, independent of the socket transport.
///
/// Every failure is reported to the originating connection as an `error`
/// frame. Nothing here closes the connection.
#[derive(Clone)]
pub struct Gateway {
    chat: ChatService,
    dispatcher: Dispatcher,
    assistant: Option<AssistantBridge>,
}

impl Gateway {
    pub fn new(chat: ChatService, dispatcher: Dispatcher) -> Self {
        Self {
            chat,
            dispatcher,
            assistant: None,
        }
    }

    pub fn with_assistant(mut self, assistant: AssistantBridge) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register a connection and subscribe it to its user channel.
    pub async fn open(
        &self,
        user_id: Uuid,
        username: impl Into<String>,
        permissions: Permissions,
    ) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn_id, rx) = self.dispatcher.register().await;
        self.dispatcher.subscribe(conn_id, Channel::User(user_id)).await;
        let session = Session {
            conn_id,
            user_id,
            username: username.into(),
            permissions,
        };
        info!("{} ({}) opened connection {}", session.username, user_id, conn_id);
        (session, rx)
    }

    pub async fn close(&self, session: &Session) {
        self.dispatcher.unregister(session.conn_id).await;
        info!(
            "{} ({}) closed connection {}",
            session.username, session.user_id, session.conn_id
        );
    }

    /// Parse and handle one text frame.
    pub async fn handle_text(&self, session: &Session, text: &str) {
        match ClientEvent::from_json(text) {
            Ok(event) => self.handle_event(session, event).await,
            Err(e) => {
                warn!(
                    "{} ({}) bad frame: {} -- raw: {}",
                    session.username,
                    session.user_id,
                    e,
                    truncate(text, 200)
                );
                self.reply(session, protocol_error(&e)).await;
            }
        }
    }

    pub async fn handle_event(&self, session: &Session, event: ClientEvent) {
        let kind = event.kind();
        let thread_id = event.thread_id();
        let temp_id = match &event {
            ClientEvent::MessageSend(send) => send.temp_id,
            _ => None,
        };

        let result = match event {
            ClientEvent::MessageSend(send) => self.send_message(session, send).await,
            ClientEvent::ThreadJoin(target) => self.join(session, target).await,
            ClientEvent::ThreadLeave(target) => self.leave(session, target).await,
            ClientEvent::ReadUpdate(update) => self.read_update(session, update).await,
            ClientEvent::Typing(update) => self.typing(session, update).await,
        };

        if let Err(e) = result {
            match &e {
                ChatError::Server(inner) => {
                    warn!("{} from {} failed: {:#}", kind, session.user_id, inner)
                }
                other => debug!("{} from {} rejected: {}", kind, session.user_id, other),
            }
            self.reply(
                session,
                ServerEvent::Error(ErrorPayload {
                    code: e.code(),
                    message: e.public_message(),
                    thread_id: Some(thread_id),
                    temp_id,
                    stream_id: None,
                }),
            )
            .await;
        }
    }

    async fn send_message(&self, session: &Session, send: SendMessage) -> ChatResult<()> {
        let user_id = session.user_id;
        let permissions = session.permissions.clone();
        let temp_id = send.temp_id;

        let (created, participants) = self
            .chat
            .blocking(move |chat| {
                chat.assert_access(user_id, send.thread_id, &permissions, Action::Write)?;
                let input = CreateMessage::from_user(send.thread_id, user_id, send.content)
                    .with_metadata(send.metadata.unwrap_or(serde_json::Value::Null));
                let created = chat.create_message(input)?;
                chat.mark_read(created.thread.id, user_id, created.created_at)?;
                let participants = chat.participant_ids(created.thread.id)?;
                Ok((created, participants))
            })
            .await?;

        let thread_id = created.thread.id;
        self.dispatcher
            .fan_out(
                &participants,
                ServerEvent::MessageNew(NewMessage {
                    message: created.message,
                    temp_id,
                    stream_id: None,
                }),
            )
            .await;

        if created.thread.kind == ThreadKind::Ai {
            match &self.assistant {
                Some(assistant) => {
                    assistant.spawn_reply(thread_id, user_id);
                }
                None => debug!("no assistant configured, {} gets no reply", thread_id),
            }
        }
        Ok(())
    }

    async fn join(&self, session: &Session, target: ThreadRef) -> ChatResult<()> {
        let user_id = session.user_id;
        let permissions = session.permissions.clone();
        self.chat
            .blocking(move |chat| {
                chat.assert_access(user_id, target.thread_id, &permissions, Action::Join)?;
                Ok(())
            })
            .await?;

        self.dispatcher
            .subscribe(session.conn_id, Channel::Thread(target.thread_id))
            .await;
        self.reply(session, ServerEvent::ThreadJoined(target)).await;
        Ok(())
    }

    async fn leave(&self, session: &Session, target: ThreadRef) -> ChatResult<()> {
        self.dispatcher
            .unsubscribe(session.conn_id, Channel::Thread(target.thread_id))
            .await;
        self.reply(session, ServerEvent::ThreadLeft(target)).await;
        Ok(())
    }

    async fn read_update(&self, session: &Session, update: ReadUpdate) -> ChatResult<()> {
        let user_id = session.user_id;
        let permissions = session.permissions.clone();
        let thread_id = update.thread_id;
        let at = clamp_read_at(update.last_read_at, time::now());

        let (last_read_at, participants) = self
            .chat
            .blocking(move |chat| {
                chat.assert_access(user_id, thread_id, &permissions, Action::Read)?;
                let at = chat.mark_read(thread_id, user_id, at)?;
                Ok((at, chat.participant_ids(thread_id)?))
            })
            .await?;

        self.dispatcher
            .fan_out(
                &participants,
                ServerEvent::ReadUpdated(ReadUpdated {
                    thread_id,
                    user_id,
                    last_read_at,
                }),
            )
            .await;
        Ok(())
    }

    async fn typing(&self, session: &Session, update: TypingUpdate) -> ChatResult<()> {
        let user_id = session.user_id;
        let permissions = session.permissions.clone();
        let thread_id = update.thread_id;
        let participants = self
            .chat
            .blocking(move |chat| {
                let ctx = chat.assert_access(user_id, thread_id, &permissions, Action::Read)?;
                // Team members may read without ever joining; they cannot type.
                if ctx.participant.is_none() {
                    return Err(ChatError::denied("not a participant of this thread"));
                }
                chat.participant_ids(thread_id)
            })
            .await?;

        self.dispatcher
            .fan_out(
                &participants,
                ServerEvent::Typing(TypingEvent {
                    thread_id,
                    user_id,
                    is_typing: update.is_typing,
                }),
            )
            .await;
        Ok(())
    }

    async fn reply(&self, session: &Session, event: ServerEvent) {
        if !self.dispatcher.send_to_conn(session.conn_id, event).await {
            debug!("connection {} is gone, reply dropped", session.conn_id);
        }
    }
}

fn protocol_error(e: &ProtocolError) -> ServerEvent {
    ServerEvent::error(e.code(), e.to_string())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn protocol_errors_map_to_codes() {
        use parley_types::events::ErrorCode;
        let event = protocol_error(&ProtocolError::UnknownEvent("presence".into()));
        match event {
            ServerEvent::Error(payload) => assert_eq!(payload.code, ErrorCode::UnknownEvent),
            other => panic!("unexpected {:?}", other),
        }
    }
}
