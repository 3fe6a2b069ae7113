use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (threads, participants, messages)");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS threads (
                id               TEXT PRIMARY KEY,
                kind             TEXT NOT NULL CHECK (kind IN ('ai', 'dm', 'team', 'room')),
                title            TEXT,
                team_id          TEXT,
                dm_key           TEXT UNIQUE,
                owner_id         TEXT,
                created_at       INTEGER NOT NULL,
                last_message_at  INTEGER
            );

            -- One assistant thread per user, one thread per team.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_ai_owner
                ON threads(owner_id) WHERE kind = 'ai';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_team
                ON threads(team_id) WHERE kind = 'team';

            CREATE TABLE IF NOT EXISTS participants (
                thread_id     TEXT NOT NULL REFERENCES threads(id),
                user_id       TEXT NOT NULL,
                role          TEXT NOT NULL,
                joined_at     INTEGER NOT NULL,
                last_read_at  INTEGER,
                PRIMARY KEY (thread_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_user
                ON participants(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                id          TEXT PRIMARY KEY,
                thread_id   TEXT NOT NULL REFERENCES threads(id),
                sender_id   TEXT,
                kind        TEXT NOT NULL CHECK (kind IN ('user', 'assistant', 'system')),
                content     TEXT NOT NULL,
                metadata    TEXT NOT NULL DEFAULT '{}',
                created_at  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_thread
                ON messages(thread_id, created_at);

            CREATE TABLE IF NOT EXISTS thread_topics (
                thread_id  TEXT NOT NULL REFERENCES threads(id),
                slug       TEXT NOT NULL,
                label      TEXT NOT NULL,
                position   INTEGER NOT NULL,
                PRIMARY KEY (thread_id, slug)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (assistant settings, directory lookups)");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS assistant_settings (
                user_id        TEXT PRIMARY KEY,
                api_key        TEXT,
                system_prompt  TEXT,
                updated_at     INTEGER NOT NULL
            );

            -- Mirrors of the friendship and team services, read-only from the chat side.
            -- Friendship pairs are stored with user_a < user_b.
            CREATE TABLE IF NOT EXISTS friendships (
                user_a  TEXT NOT NULL,
                user_b  TEXT NOT NULL,
                status  TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'declined', 'blocked')),
                PRIMARY KEY (user_a, user_b)
            );

            CREATE TABLE IF NOT EXISTS team_members (
                team_id  TEXT NOT NULL,
                user_id  TEXT NOT NULL,
                role     TEXT NOT NULL,
                PRIMARY KEY (team_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
