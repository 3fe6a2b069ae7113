use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_chat::{ChatResult, ChatService, CreateMessage};
use parley_types::events::{ErrorCode, ErrorPayload, MessageDelta, NewMessage, ServerEvent};
use parley_types::models::{Message, MessageKind};

use crate::dispatcher::Dispatcher;
use crate::generator::{ChatTurn, GenerationRequest, Generator, Role};

pub const DEFAULT_CONTEXT_LIMIT: u32 = 20;

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Used when the user has not stored a key of their own.
    pub default_api_key: Option<String>,
    pub context_limit: u32,
    pub system_prompt: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            default_api_key: None,
            context_limit: DEFAULT_CONTEXT_LIMIT,
            system_prompt: None,
        }
    }
}

/// Streams assistant replies into `ai` threads.
///
/// Each chunk is fanned out as `message.delta` as soon as it arrives. The
/// completed text is then persisted through the message use-case and fanned
/// out as `message.new` carrying the same `stream_id`, which is what clients
/// use to retire their streaming placeholder.
#[derive(Clone)]
pub struct AssistantBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    chat: ChatService,
    dispatcher: Dispatcher,
    generator: Arc<dyn Generator>,
    config: AssistantConfig,
}

struct ReplyContext {
    api_key: Option<String>,
    system_prompt: Option<String>,
    turns: Vec<ChatTurn>,
    participants: Vec<Uuid>,
}

impl AssistantBridge {
    pub fn new(
        chat: ChatService,
        dispatcher: Dispatcher,
        generator: Arc<dyn Generator>,
        config: AssistantConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                chat,
                dispatcher,
                generator,
                config,
            }),
        }
    }

    /// Generate in the background. The task is detached from the requesting
    /// connection: a disconnect mid-stream does not cancel it.
    pub fn spawn_reply(&self, thread_id: Uuid, user_id: Uuid) -> JoinHandle<Option<Message>> {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.reply(thread_id, user_id).await })
    }

    /// Returns the persisted assistant message, or `None` when nothing was generated.
    pub async fn reply(&self, thread_id: Uuid, user_id: Uuid) -> Option<Message> {
        match self.try_reply(thread_id, user_id).await {
            Ok(message) => message,
            Err(e) => {
                warn!("assistant reply in {} failed: {}", thread_id, e);
                None
            }
        }
    }

    async fn try_reply(&self, thread_id: Uuid, user_id: Uuid) -> ChatResult<Option<Message>> {
        let ctx = self.load_context(thread_id, user_id).await?;

        let Some(api_key) = ctx.api_key else {
            info!("no assistant API key for {}, skipping reply in {}", user_id, thread_id);
            return Ok(None);
        };

        let stream_id = Uuid::new_v4();
        let mut chunks = self.inner.generator.stream(GenerationRequest {
            api_key,
            system_prompt: ctx.system_prompt,
            messages: ctx.turns,
        });

        let mut full = String::new();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(delta) if delta.is_empty() => continue,
                Ok(delta) => {
                    full.push_str(&delta);
                    self.inner
                        .dispatcher
                        .fan_out(
                            &ctx.participants,
                            ServerEvent::MessageDelta(MessageDelta {
                                thread_id,
                                stream_id,
                                delta,
                            }),
                        )
                        .await;
                }
                Err(e) => {
                    warn!("assistant stream {} in {} broke: {}", stream_id, thread_id, e);
                    self.abandon(&ctx.participants, thread_id, stream_id).await;
                    return Ok(None);
                }
            }
        }

        if full.trim().is_empty() {
            debug!("assistant stream {} produced no text", stream_id);
            self.abandon(&ctx.participants, thread_id, stream_id).await;
            return Ok(None);
        }

        let stored = self
            .inner
            .chat
            .blocking(move |chat| {
                chat.create_message(CreateMessage {
                    thread_id,
                    sender_id: None,
                    kind: MessageKind::Assistant,
                    content: full,
                    metadata: serde_json::json!({ "stream_id": stream_id }),
                })
            })
            .await;
        // Deltas are already out; every failure from here on must retire the stream.
        let created = match stored {
            Ok(created) => created,
            Err(e) => {
                warn!("assistant stream {} in {} could not be stored: {}", stream_id, thread_id, e);
                self.abandon(&ctx.participants, thread_id, stream_id).await;
                return Ok(None);
            }
        };

        self.inner
            .dispatcher
            .fan_out(
                &ctx.participants,
                ServerEvent::MessageNew(NewMessage {
                    message: created.message.clone(),
                    temp_id: None,
                    stream_id: Some(stream_id),
                }),
            )
            .await;

        Ok(Some(created.message))
    }

    async fn load_context(&self, thread_id: Uuid, user_id: Uuid) -> ChatResult<ReplyContext> {
        let limit = self.inner.config.context_limit.max(1);
        let default_key = self.inner.config.default_api_key.clone();
        let base_prompt = self.inner.config.system_prompt.clone();

        self.inner
            .chat
            .blocking(move |chat| {
                let settings = chat.db().get_assistant_settings(user_id)?.unwrap_or_default();
                let api_key = settings
                    .api_key
                    .filter(|k| !k.trim().is_empty())
                    .or(default_key);

                let system_prompt = match (base_prompt, settings.system_prompt) {
                    (Some(base), Some(custom)) if !custom.trim().is_empty() => {
                        Some(format!("{}\n\n{}", base, custom))
                    }
                    (None, Some(custom)) if !custom.trim().is_empty() => Some(custom),
                    (base, _) => base,
                };

                let mut history = chat.db().get_messages(thread_id, limit, None)?;
                history.reverse();
                let turns = history.into_iter().map(to_turn).collect();

                Ok(ReplyContext {
                    api_key,
                    system_prompt,
                    turns,
                    participants: chat.participant_ids(thread_id)?,
                })
            })
            .await
    }

    async fn abandon(&self, participants: &[Uuid], thread_id: Uuid, stream_id: Uuid) {
        self.inner
            .dispatcher
            .fan_out(
                participants,
                ServerEvent::Error(ErrorPayload {
                    code: ErrorCode::ServerError,
                    message: "assistant reply failed".to_string(),
                    thread_id: Some(thread_id),
                    temp_id: None,
                    stream_id: Some(stream_id),
                }),
            )
            .await;
    }
}

fn to_turn(message: Message) -> ChatTurn {
    let role = match message.kind {
        MessageKind::User => Role::User,
        MessageKind::Assistant => Role::Assistant,
        MessageKind::System => Role::System,
    };
    ChatTurn {
        role,
        content: message.content,
    }
}
