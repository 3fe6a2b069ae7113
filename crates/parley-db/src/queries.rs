use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use parley_types::models::{
    Message, Participant, ParticipantRole, RelationshipStatus, Thread, ThreadTopic, dm_key,
};
use parley_types::time;

use crate::Database;
use crate::models::{
    AssistantSettings, MESSAGE_COLUMNS, NewMessage, PARTICIPANT_COLUMNS, THREAD_COLUMNS,
    ThreadSummaryRow, message_from_row, opt_time_at, participant_from_row, thread_from_row,
    topic_from_row,
};

impl Database {
    // -- Threads --

    pub fn get_thread(&self, id: Uuid) -> Result<Option<Thread>> {
        self.with_conn(|conn| query_thread_where(conn, "t.id = ?1", &id.to_string()))
    }

    /// Find-or-create the caller's assistant thread. The owner participant and
    /// the topic rows are written only when the thread is first created.
    pub fn ensure_ai_thread(
        &self,
        owner_id: Uuid,
        title: &str,
        topics: &[(&str, &str)],
    ) -> Result<Thread> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = time::now().timestamp_millis();
            let owner = owner_id.to_string();

            let created = tx.execute(
                "INSERT OR IGNORE INTO threads (id, kind, title, owner_id, created_at)
                 VALUES (?1, 'ai', ?2, ?3, ?4)",
                params![Uuid::new_v4().to_string(), title, owner, now],
            )? == 1;

            let thread = query_thread_where(&tx, "t.kind = 'ai' AND t.owner_id = ?1", &owner)?
                .ok_or_else(|| anyhow!("ai thread for {} missing after insert", owner_id))?;

            if created {
                insert_participant(&tx, thread.id, owner_id, ParticipantRole::Owner, now)?;
                for (position, (slug, label)) in topics.iter().enumerate() {
                    tx.execute(
                        "INSERT OR IGNORE INTO thread_topics (thread_id, slug, label, position)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![thread.id.to_string(), slug, label, position as i64],
                    )?;
                }
            }

            tx.commit()?;
            Ok(thread)
        })
    }

    /// Find-or-create the direct thread between two users. Keyed by the
    /// unordered pair, so argument order does not matter.
    pub fn ensure_dm_thread(&self, a: Uuid, b: Uuid) -> Result<Thread> {
        let key = dm_key(a, b);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = time::now().timestamp_millis();

            tx.execute(
                "INSERT OR IGNORE INTO threads (id, kind, dm_key, created_at)
                 VALUES (?1, 'dm', ?2, ?3)",
                params![Uuid::new_v4().to_string(), key, now],
            )?;

            let thread = query_thread_where(&tx, "t.dm_key = ?1", &key)?
                .ok_or_else(|| anyhow!("dm thread {} missing after insert", key))?;

            insert_participant(&tx, thread.id, a, ParticipantRole::Member, now)?;
            insert_participant(&tx, thread.id, b, ParticipantRole::Member, now)?;

            tx.commit()?;
            Ok(thread)
        })
    }

    /// Find-or-create the single thread of a team. Participants are added lazily.
    pub fn ensure_team_thread(&self, team_id: Uuid, title: &str) -> Result<Thread> {
        let team = team_id.to_string();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO threads (id, kind, title, team_id, created_at)
                 VALUES (?1, 'team', ?2, ?3, ?4)",
                params![Uuid::new_v4().to_string(), title, team, time::now().timestamp_millis()],
            )?;
            let thread = query_thread_where(&tx, "t.kind = 'team' AND t.team_id = ?1", &team)?
                .ok_or_else(|| anyhow!("team thread for {} missing after insert", team_id))?;
            tx.commit()?;
            Ok(thread)
        })
    }

    pub fn create_room(&self, creator_id: Uuid, title: &str, member_ids: &[Uuid]) -> Result<Thread> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = time::now().timestamp_millis();
            let id = Uuid::new_v4();

            tx.execute(
                "INSERT INTO threads (id, kind, title, owner_id, created_at)
                 VALUES (?1, 'room', ?2, ?3, ?4)",
                params![id.to_string(), title, creator_id.to_string(), now],
            )?;
            insert_participant(&tx, id, creator_id, ParticipantRole::Owner, now)?;
            for member in member_ids {
                insert_participant(&tx, id, *member, ParticipantRole::Member, now)?;
            }

            let thread = query_thread_where(&tx, "t.id = ?1", &id.to_string())?
                .ok_or_else(|| anyhow!("room {} missing after insert", id))?;
            tx.commit()?;
            Ok(thread)
        })
    }

    /// Threads the user participates in: assistant thread first, then most recent activity.
    pub fn list_threads_for_user(&self, user_id: Uuid) -> Result<Vec<ThreadSummaryRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {THREAD_COLUMNS}, p.last_read_at,
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.thread_id = t.id
                        AND (m.sender_id IS NULL OR m.sender_id != p.user_id)
                        AND m.created_at > COALESCE(p.last_read_at, 0))
                 FROM participants p
                 JOIN threads t ON t.id = p.thread_id
                 WHERE p.user_id = ?1
                 ORDER BY (t.kind = 'ai') DESC, COALESCE(t.last_message_at, t.created_at) DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok(ThreadSummaryRow {
                        thread: thread_from_row(row, 0)?,
                        last_read_at: opt_time_at(row, 8)?,
                        unread_count: row.get::<_, i64>(9)? as u32,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Participants --

    pub fn get_participant(&self, thread_id: Uuid, user_id: Uuid) -> Result<Option<Participant>> {
        self.with_conn(|conn| query_participant(conn, thread_id, user_id))
    }

    /// Idempotent: concurrent first-writes for the same (thread, user) leave one row,
    /// guarded by the primary key rather than a retry loop.
    pub fn upsert_participant(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> Result<Participant> {
        self.with_conn(|conn| {
            insert_participant(conn, thread_id, user_id, role, time::now().timestamp_millis())?;
            query_participant(conn, thread_id, user_id)?
                .ok_or_else(|| anyhow!("participant {}/{} missing after upsert", thread_id, user_id))
        })
    }

    pub fn list_participants(&self, thread_id: Uuid) -> Result<Vec<Participant>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE thread_id = ?1 ORDER BY joined_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([thread_id.to_string()], participant_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Overwrites the read cursor. Returns false if no participant row exists.
    pub fn set_last_read_at(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE participants SET last_read_at = ?3 WHERE thread_id = ?1 AND user_id = ?2",
                params![thread_id.to_string(), user_id.to_string(), at.timestamp_millis()],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    /// Insert a message and advance the owning thread's `last_message_at` in
    /// one transaction. Returns the updated thread alongside the stored message.
    ///
    /// The timestamp is settled under the connection lock as
    /// `max(msg.created_at, last_message_at)`, so commit order and time order
    /// agree and the thread always carries its newest message's time.
    pub fn insert_message(&self, msg: &NewMessage) -> Result<(Thread, Message)> {
        let metadata = serde_json::to_string(&msg.metadata)?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let latest: Option<i64> = tx
                .query_row(
                    "SELECT last_message_at FROM threads WHERE id = ?1",
                    [msg.thread_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| anyhow!("thread {} vanished during message insert", msg.thread_id))?;
            let created_at = latest.map_or(msg.created_at.timestamp_millis(), |latest| {
                latest.max(msg.created_at.timestamp_millis())
            });

            tx.execute(
                "INSERT INTO messages (id, thread_id, sender_id, kind, content, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    msg.id.to_string(),
                    msg.thread_id.to_string(),
                    msg.sender_id.map(|s| s.to_string()),
                    msg.kind.as_str(),
                    msg.content,
                    metadata,
                    created_at,
                ],
            )?;
            tx.execute(
                "UPDATE threads SET last_message_at = ?2 WHERE id = ?1",
                params![msg.thread_id.to_string(), created_at],
            )?;

            let thread = query_thread_where(&tx, "t.id = ?1", &msg.thread_id.to_string())?
                .ok_or_else(|| anyhow!("thread {} missing", msg.thread_id))?;
            tx.commit()?;

            let message = Message {
                id: msg.id,
                thread_id: msg.thread_id,
                sender_id: msg.sender_id,
                kind: msg.kind,
                content: msg.content.clone(),
                metadata: msg.metadata.clone(),
                created_at: time::from_millis(created_at),
            };
            Ok((thread, message))
        })
    }

    /// Newest first. `before` is the id of a message in the thread; the page
    /// holds what precedes it in `(created_at, rowid)` order, so messages
    /// sharing a millisecond are neither skipped nor repeated.
    pub fn get_messages(
        &self,
        thread_id: Uuid,
        limit: u32,
        before: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE thread_id = ?1
                   AND (?2 IS NULL OR (created_at, rowid) <
                        (SELECT created_at, rowid FROM messages WHERE id = ?2 AND thread_id = ?1))
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![
                        thread_id.to_string(),
                        before.map(|b| b.to_string()),
                        limit
                    ],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn message_in_thread(&self, thread_id: Uuid, message_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM messages WHERE id = ?1 AND thread_id = ?2",
                    [message_id.to_string(), thread_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Topics --

    pub fn list_topics(&self, thread_id: Uuid) -> Result<Vec<ThreadTopic>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT thread_id, slug, label, position FROM thread_topics
                 WHERE thread_id = ?1 ORDER BY position",
            )?;
            let rows = stmt
                .query_map([thread_id.to_string()], topic_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Assistant settings --

    pub fn get_assistant_settings(&self, user_id: Uuid) -> Result<Option<AssistantSettings>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT api_key, system_prompt FROM assistant_settings WHERE user_id = ?1",
                    [user_id.to_string()],
                    |row| {
                        Ok(AssistantSettings {
                            api_key: row.get(0)?,
                            system_prompt: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn set_assistant_settings(&self, user_id: Uuid, settings: &AssistantSettings) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO assistant_settings (user_id, api_key, system_prompt, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    api_key = excluded.api_key,
                    system_prompt = excluded.system_prompt,
                    updated_at = excluded.updated_at",
                params![
                    user_id.to_string(),
                    settings.api_key,
                    settings.system_prompt,
                    time::now().timestamp_millis()
                ],
            )?;
            Ok(())
        })
    }

    // -- Directory (friendships, team membership) --

    pub fn get_relationship(&self, a: Uuid, b: Uuid) -> Result<Option<RelationshipStatus>> {
        let (lo, hi) = ordered(a, b);
        self.with_conn(|conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM friendships WHERE user_a = ?1 AND user_b = ?2",
                    [lo.to_string(), hi.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            status
                .map(|s| s.parse().map_err(|e| anyhow!("bad friendship status: {}", e)))
                .transpose()
        })
    }

    pub fn set_relationship(&self, a: Uuid, b: Uuid, status: RelationshipStatus) -> Result<()> {
        let (lo, hi) = ordered(a, b);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO friendships (user_a, user_b, status) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_a, user_b) DO UPDATE SET status = excluded.status",
                params![lo.to_string(), hi.to_string(), status.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn get_team_role(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let role = conn
                .query_row(
                    "SELECT role FROM team_members WHERE team_id = ?1 AND user_id = ?2",
                    [team_id.to_string(), user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(role)
        })
    }

    pub fn set_team_member(&self, team_id: Uuid, user_id: Uuid, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_members (team_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(team_id, user_id) DO UPDATE SET role = excluded.role",
                params![team_id.to_string(), user_id.to_string(), role],
            )?;
            Ok(())
        })
    }
}

fn ordered(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

fn query_thread_where(conn: &Connection, clause: &str, param: &str) -> Result<Option<Thread>> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM threads t WHERE {clause}");
    let thread = conn
        .query_row(&sql, [param], |row| thread_from_row(row, 0))
        .optional()?;
    Ok(thread)
}

fn query_participant(conn: &Connection, thread_id: Uuid, user_id: Uuid) -> Result<Option<Participant>> {
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE thread_id = ?1 AND user_id = ?2"
    );
    let row = conn
        .query_row(
            &sql,
            [thread_id.to_string(), user_id.to_string()],
            participant_from_row,
        )
        .optional()?;
    Ok(row)
}

fn insert_participant(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
    role: ParticipantRole,
    joined_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO participants (thread_id, user_id, role, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![thread_id.to_string(), user_id.to_string(), role.as_str(), joined_at],
    )?;
    Ok(())
}
