//! Client-side chat model: thread list, per-thread timelines, optimistic
//! sends and unread accounting. Pure state; the socket is reached through
//! [`EventSink`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::api::{HistoryResponse, ThreadSummary};
use parley_types::events::{
    ClientEvent, ErrorPayload, MessageDelta, NewMessage, ReadUpdate, ReadUpdated, SendMessage,
    ServerEvent, ThreadRef, TypingEvent, TypingUpdate,
};
use parley_types::models::{Message, ThreadKind};
use parley_types::time;

use crate::socket::{ConnectionState, SocketManager, Subscription};

pub trait EventSink: Send + Sync {
    /// Returns `false` when the frame could not be handed to an open socket.
    fn send(&self, event: &ClientEvent) -> bool;
}

impl EventSink for SocketManager {
    fn send(&self, event: &ClientEvent) -> bool {
        SocketManager::send(self, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sending,
    Failed,
}

/// A locally composed message that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub temp_id: Uuid,
    pub thread_id: Uuid,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub status: SendStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Pending(PendingMessage),
    Confirmed {
        message: Message,
        /// Kept after reconciliation so the optimistic copy stays identifiable.
        temp_id: Option<Uuid>,
    },
}

impl Entry {
    pub fn content(&self) -> &str {
        match self {
            Self::Pending(p) => &p.content,
            Self::Confirmed { message, .. } => &message.content,
        }
    }

    pub fn temp_id(&self) -> Option<Uuid> {
        match self {
            Self::Pending(p) => Some(p.temp_id),
            Self::Confirmed { temp_id, .. } => *temp_id,
        }
    }

    /// Server id, once confirmed.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Self::Pending(_) => None,
            Self::Confirmed { message, .. } => Some(message.id),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Pending(p) if p.status == SendStatus::Failed)
    }
}

/// Assistant reply being streamed, keyed by `stream_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStream {
    pub stream_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryStatus {
    #[default]
    NotLoaded,
    Loading,
    Loaded {
        has_more: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ThreadState {
    pub entries: Vec<Entry>,
    pub typing: BTreeSet<Uuid>,
    pub read_cursors: HashMap<Uuid, DateTime<Utc>>,
    pub stream: Option<PendingStream>,
    pub history: HistoryStatus,
    pub unread: u32,
}

impl ThreadState {
    fn find_pending(&mut self, temp_id: Uuid) -> Option<&mut PendingMessage> {
        self.entries.iter_mut().find_map(|e| match e {
            Entry::Pending(p) if p.temp_id == temp_id => Some(p),
            _ => None,
        })
    }

    fn oldest_confirmed(&self) -> Option<Uuid> {
        self.entries.iter().find_map(|e| match e {
            Entry::Confirmed { message, .. } => Some(message.id),
            Entry::Pending(_) => None,
        })
    }
}

/// Keeps a [`ChatState`] wired to a socket; see [`ChatState::attach`].
pub struct Attachment {
    _subscription: Subscription,
    watcher: JoinHandle<()>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

pub struct ChatState {
    user_id: Uuid,
    sink: Arc<dyn EventSink>,
    threads: Vec<ThreadSummary>,
    active: Option<Uuid>,
    states: HashMap<Uuid, ThreadState>,
    last_error: Option<ErrorPayload>,
}

impl ChatState {
    pub fn new(user_id: Uuid, sink: Arc<dyn EventSink>) -> Self {
        Self {
            user_id,
            sink,
            threads: Vec::new(),
            active: None,
            states: HashMap::new(),
            last_error: None,
        }
    }

    /// Feed every inbound event and connection change of `socket` into a
    /// shared state. Both stop when the returned [`Attachment`] drops.
    pub fn attach(state: Arc<Mutex<ChatState>>, socket: &SocketManager) -> Attachment {
        let events = state.clone();
        let subscription = socket.subscribe(move |event| match events.lock() {
            Ok(mut state) => state.apply(event),
            Err(_) => warn!("chat state lock poisoned, dropping {:?}", event),
        });

        let mut rx = socket.watch_state();
        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let connection = *rx.borrow_and_update();
                match state.lock() {
                    Ok(mut state) => state.connection_changed(connection),
                    Err(_) => warn!("chat state lock poisoned, dropping {:?}", connection),
                }
            }
        });

        Attachment {
            _subscription: subscription,
            watcher,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Assistant first, then most recent activity.
    pub fn threads(&self) -> &[ThreadSummary] {
        &self.threads
    }

    pub fn active(&self) -> Option<Uuid> {
        self.active
    }

    pub fn thread(&self, thread_id: Uuid) -> Option<&ThreadState> {
        self.states.get(&thread_id)
    }

    pub fn entries(&self, thread_id: Uuid) -> &[Entry] {
        self.states
            .get(&thread_id)
            .map(|s| s.entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn unread(&self, thread_id: Uuid) -> u32 {
        self.states.get(&thread_id).map_or(0, |s| s.unread)
    }

    pub fn last_error(&self) -> Option<&ErrorPayload> {
        self.last_error.as_ref()
    }

    pub fn set_threads(&mut self, threads: Vec<ThreadSummary>) {
        for summary in &threads {
            let state = self.states.entry(summary.thread.id).or_default();
            state.unread = if self.active == Some(summary.thread.id) {
                0
            } else {
                summary.unread_count
            };
        }
        self.threads = threads;
        self.sort_threads();
    }

    /// Make `thread_id` the open thread. Leaves the previous one, joins the
    /// new one and marks it read. Returns `true` when its history still needs
    /// fetching; the caller loads it and hands it to [`apply_history`](Self::apply_history).
    pub fn activate(&mut self, thread_id: Uuid) -> bool {
        if self.active == Some(thread_id) {
            return false;
        }
        if let Some(previous) = self.active.take() {
            self.sink.send(&ClientEvent::ThreadLeave(ThreadRef {
                thread_id: previous,
            }));
        }
        self.active = Some(thread_id);
        self.sink.send(&ClientEvent::ThreadJoin(ThreadRef { thread_id }));
        self.mark_read(thread_id);

        let state = self.states.entry(thread_id).or_default();
        if state.history == HistoryStatus::NotLoaded {
            state.history = HistoryStatus::Loading;
            return true;
        }
        false
    }

    pub fn deactivate(&mut self) {
        if let Some(thread_id) = self.active.take() {
            self.sink.send(&ClientEvent::ThreadLeave(ThreadRef { thread_id }));
        }
    }

    /// Merge a page of history (oldest first) in front of what is loaded.
    pub fn apply_history(&mut self, page: HistoryResponse) {
        let state = self.states.entry(page.thread_id).or_default();
        let known: BTreeSet<Uuid> = state.entries.iter().filter_map(Entry::id).collect();
        let older: Vec<Entry> = page
            .messages
            .into_iter()
            .filter(|m| !known.contains(&m.id))
            .map(|message| Entry::Confirmed {
                message,
                temp_id: None,
            })
            .collect();
        state.entries.splice(0..0, older);
        state.history = HistoryStatus::Loaded {
            has_more: page.has_more,
        };
    }

    /// Let the next activation retry the fetch.
    pub fn history_failed(&mut self, thread_id: Uuid) {
        if let Some(state) = self.states.get_mut(&thread_id) {
            state.history = HistoryStatus::NotLoaded;
        }
    }

    /// Cursor for loading the page before what is already shown.
    pub fn history_cursor(&self, thread_id: Uuid) -> Option<Uuid> {
        self.states.get(&thread_id)?.oldest_confirmed()
    }

    /// Append an optimistic message to the active thread and send it.
    ///
    /// Returns the `temp_id`, or `None` without an active thread. When the
    /// socket is not open the message is kept and marked failed.
    pub fn send_message(
        &mut self,
        content: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Option<Uuid> {
        let thread_id = self.active?;
        let mut pending = PendingMessage {
            temp_id: Uuid::new_v4(),
            thread_id,
            content: content.into(),
            metadata,
            created_at: time::now(),
            status: SendStatus::Sending,
        };
        let temp_id = pending.temp_id;
        if !self.sink.send(&send_frame(&pending)) {
            debug!("socket not open, message {} failed", temp_id);
            pending.status = SendStatus::Failed;
        }
        self.states
            .entry(thread_id)
            .or_default()
            .entries
            .push(Entry::Pending(pending));
        Some(temp_id)
    }

    /// Resend a failed optimistic message under its original `temp_id`.
    pub fn retry_send(&mut self, temp_id: Uuid) -> bool {
        let Some(pending) = self
            .states
            .values_mut()
            .find_map(|s| s.find_pending(temp_id))
        else {
            return false;
        };
        if pending.status != SendStatus::Failed {
            return false;
        }
        let sent = self.sink.send(&send_frame(pending));
        pending.status = if sent {
            SendStatus::Sending
        } else {
            SendStatus::Failed
        };
        sent
    }

    /// Sends still awaiting their echo will never get one once the link is
    /// gone, so they become retryable.
    pub fn connection_changed(&mut self, connection: ConnectionState) {
        if connection == ConnectionState::Open {
            return;
        }
        let mut failed = 0;
        for entry in self.states.values_mut().flat_map(|s| s.entries.iter_mut()) {
            match entry {
                Entry::Pending(pending) if pending.status == SendStatus::Sending => {
                    pending.status = SendStatus::Failed;
                    failed += 1;
                }
                _ => {}
            }
        }
        if failed > 0 {
            debug!("connection {:?}, {} in-flight sends failed", connection, failed);
        }
    }

    pub fn send_typing(&self, is_typing: bool) -> bool {
        let Some(thread_id) = self.active else {
            return false;
        };
        self.sink.send(&ClientEvent::Typing(TypingUpdate {
            thread_id,
            is_typing,
        }))
    }

    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageNew(new) => self.on_message(new),
            ServerEvent::MessageDelta(delta) => self.on_delta(delta),
            ServerEvent::ReadUpdated(update) => self.on_read(update),
            ServerEvent::Typing(typing) => self.on_typing(typing),
            ServerEvent::Error(error) => self.on_error(error),
            ServerEvent::ThreadJoined(r) => debug!("joined thread {}", r.thread_id),
            ServerEvent::ThreadLeft(r) => debug!("left thread {}", r.thread_id),
        }
    }

    fn on_message(&mut self, new: &NewMessage) {
        let message = &new.message;
        let thread_id = message.thread_id;
        let own = message.sender_id == Some(self.user_id);
        let is_active = self.active == Some(thread_id);
        let state = self.states.entry(thread_id).or_default();

        if state.entries.iter().any(|e| e.id() == Some(message.id)) {
            return;
        }

        let reconciled = new.temp_id.and_then(|temp_id| {
            state
                .entries
                .iter()
                .position(|e| matches!(e, Entry::Pending(p) if p.temp_id == temp_id))
        });
        let entry = Entry::Confirmed {
            message: message.clone(),
            temp_id: new.temp_id,
        };
        match reconciled {
            Some(index) => state.entries[index] = entry,
            None => state.entries.push(entry),
        }

        let stream_id = new.stream_id.or_else(|| message.stream_id());
        if stream_id.is_some() && state.stream.as_ref().map(|s| s.stream_id) == stream_id {
            state.stream = None;
        }
        if let Some(sender) = message.sender_id {
            state.typing.remove(&sender);
        }

        if !own {
            if is_active {
                self.sink.send(&ClientEvent::ReadUpdate(ReadUpdate {
                    thread_id,
                    last_read_at: Some(message.created_at),
                }));
            } else {
                state.unread += 1;
            }
        }

        if let Some(summary) = self.threads.iter_mut().find(|t| t.thread.id == thread_id) {
            if summary.thread.last_message_at < Some(message.created_at) {
                summary.thread.last_message_at = Some(message.created_at);
            }
            summary.unread_count = state.unread;
        }
        self.sort_threads();
    }

    fn on_delta(&mut self, delta: &MessageDelta) {
        let state = self.states.entry(delta.thread_id).or_default();
        match state.stream.as_mut() {
            Some(stream) if stream.stream_id == delta.stream_id => {
                stream.text.push_str(&delta.delta)
            }
            _ => {
                state.stream = Some(PendingStream {
                    stream_id: delta.stream_id,
                    text: delta.delta.clone(),
                })
            }
        }
    }

    fn on_read(&mut self, update: &ReadUpdated) {
        let state = self.states.entry(update.thread_id).or_default();
        state.read_cursors.insert(update.user_id, update.last_read_at);
        if update.user_id != self.user_id {
            return;
        }

        // Another device of ours caught up.
        let summary = self.threads.iter_mut().find(|t| t.thread.id == update.thread_id);
        let last_message_at = summary.as_ref().and_then(|s| s.thread.last_message_at);
        if last_message_at.is_none_or(|at| update.last_read_at >= at) {
            state.unread = 0;
        }
        if let Some(summary) = summary {
            summary.last_read_at = Some(update.last_read_at);
            summary.unread_count = state.unread;
        }
    }

    fn on_typing(&mut self, typing: &TypingEvent) {
        if typing.user_id == self.user_id {
            return;
        }
        let state = self.states.entry(typing.thread_id).or_default();
        if typing.is_typing {
            state.typing.insert(typing.user_id);
        } else {
            state.typing.remove(&typing.user_id);
        }
    }

    fn on_error(&mut self, error: &ErrorPayload) {
        warn!("gateway error {:?}: {}", error.code, error.message);

        if let Some(temp_id) = error.temp_id {
            let pending = match error.thread_id {
                Some(thread_id) => self
                    .states
                    .get_mut(&thread_id)
                    .and_then(|s| s.find_pending(temp_id)),
                None => self
                    .states
                    .values_mut()
                    .find_map(|s| s.find_pending(temp_id)),
            };
            if let Some(pending) = pending {
                pending.status = SendStatus::Failed;
            }
        }

        if let Some(stream_id) = error.stream_id {
            for state in self.states.values_mut() {
                if state.stream.as_ref().is_some_and(|s| s.stream_id == stream_id) {
                    state.stream = None;
                }
            }
        }

        self.last_error = Some(error.clone());
    }

    fn mark_read(&mut self, thread_id: Uuid) {
        self.states.entry(thread_id).or_default().unread = 0;
        if let Some(summary) = self.threads.iter_mut().find(|t| t.thread.id == thread_id) {
            summary.unread_count = 0;
        }
        self.sink.send(&ClientEvent::ReadUpdate(ReadUpdate {
            thread_id,
            last_read_at: None,
        }));
    }

    fn sort_threads(&mut self) {
        self.threads.sort_by(|a, b| {
            let a_ai = a.thread.kind == ThreadKind::Ai;
            let b_ai = b.thread.kind == ThreadKind::Ai;
            b_ai.cmp(&a_ai).then_with(|| activity(b).cmp(&activity(a)))
        });
    }
}

fn activity(summary: &ThreadSummary) -> DateTime<Utc> {
    summary
        .thread
        .last_message_at
        .unwrap_or(summary.thread.created_at)
}

fn send_frame(pending: &PendingMessage) -> ClientEvent {
    ClientEvent::MessageSend(SendMessage {
        thread_id: pending.thread_id,
        content: pending.content.clone(),
        temp_id: Some(pending.temp_id),
        metadata: pending.metadata.clone(),
    })
}
