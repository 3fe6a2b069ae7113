//! Row mapping between SQLite and parley-types models.
//!
//! Ids are stored as hyphenated TEXT, timestamps as INTEGER epoch millis.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use parley_types::models::{Message, MessageKind, Participant, Thread, ThreadTopic};
use parley_types::time::from_millis;

pub const THREAD_COLUMNS: &str =
    "t.id, t.kind, t.title, t.team_id, t.dm_key, t.owner_id, t.created_at, t.last_message_at";

pub const PARTICIPANT_COLUMNS: &str = "thread_id, user_id, role, joined_at, last_read_at";

pub const MESSAGE_COLUMNS: &str =
    "id, thread_id, sender_id, kind, content, metadata, created_at";

/// Insert-side shape of a message. The id is assigned by the caller.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: serde_json::Value,
    /// Lower bound only: the stored time is raised to the thread's latest
    /// message time when that is later.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantSettings {
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ThreadSummaryRow {
    pub thread: Thread,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| conversion_err(idx, e)),
        None => Ok(None),
    }
}

pub(crate) fn time_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_millis(row.get(idx)?))
}

pub(crate) fn opt_time_at(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

/// Expects `THREAD_COLUMNS` starting at `offset`.
pub(crate) fn thread_from_row(row: &Row, offset: usize) -> rusqlite::Result<Thread> {
    let kind: String = row.get(offset + 1)?;
    Ok(Thread {
        id: uuid_at(row, offset)?,
        kind: kind.parse().map_err(|e| conversion_err(offset + 1, e))?,
        title: row.get(offset + 2)?,
        team_id: opt_uuid_at(row, offset + 3)?,
        dm_key: row.get(offset + 4)?,
        owner_id: opt_uuid_at(row, offset + 5)?,
        created_at: time_at(row, offset + 6)?,
        last_message_at: opt_time_at(row, offset + 7)?,
    })
}

pub(crate) fn participant_from_row(row: &Row) -> rusqlite::Result<Participant> {
    let role: String = row.get(2)?;
    Ok(Participant {
        thread_id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        role: role.parse().map_err(|e| conversion_err(2, e))?,
        joined_at: time_at(row, 3)?,
        last_read_at: opt_time_at(row, 4)?,
    })
}

pub(crate) fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let kind: String = row.get(3)?;
    let metadata: String = row.get(5)?;
    Ok(Message {
        id: uuid_at(row, 0)?,
        thread_id: uuid_at(row, 1)?,
        sender_id: opt_uuid_at(row, 2)?,
        kind: kind.parse().map_err(|e| conversion_err(3, e))?,
        content: row.get(4)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_err(5, e))?,
        created_at: time_at(row, 6)?,
    })
}

pub(crate) fn topic_from_row(row: &Row) -> rusqlite::Result<ThreadTopic> {
    Ok(ThreadTopic {
        thread_id: uuid_at(row, 0)?,
        slug: row.get(1)?,
        label: row.get(2)?,
        order: row.get(3)?,
    })
}
