//! Table layout for the SQLite backend

use rusqlite::Connection;

use crate::error::{DbContext, Result};

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            metadata TEXT NOT NULL DEFAULT '{}',
            parent_id TEXT,
            child_ids TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user_updated ON sessions(user_id, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);

        CREATE TABLE IF NOT EXISTS session_tags (
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (session_id, position)
        );

        CREATE INDEX IF NOT EXISTS idx_session_tags_tag ON session_tags(tag);

        CREATE TABLE IF NOT EXISTS conversations (
            session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
            provider TEXT,
            model TEXT,
            temperature REAL,
            max_tokens INTEGER,
            system_prompt TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            id TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'system')),
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            attachments TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (session_id, position)
        );",
    )
    .db_context("Failed to initialize session schema")
}

/// Tokenizer of `messages_fts`; substring matches need trigrams
pub(crate) const FTS_TOKENIZER: &str = "trigram";

/// Create the full-text index over message content
///
/// Returns false when this SQLite build lacks FTS5 or the tokenizer; the
/// backend then answers every search by scanning.
pub(crate) fn init_fts_with(conn: &Connection, tokenizer: &str) -> bool {
    let result = conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            content,
            session_id UNINDEXED,
            user_id UNINDEXED,
            message_id UNINDEXED,
            tokenize = '{tokenizer}'
        );"
    ));
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, tokenizer, "Full-text search unavailable, falling back to scan");
            false
        }
    }
}

pub(crate) fn fts_table_exists(conn: &Connection) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'messages_fts'",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
    .db_context("Failed to probe full-text index")
}

/// Repopulate the index when its row count disagrees with `messages`
///
/// This happens when a database was written while the index was disabled.
pub(crate) fn rebuild_fts_if_stale(conn: &Connection) -> Result<()> {
    let (messages, indexed): (i64, i64) = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM messages), (SELECT COUNT(*) FROM messages_fts)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .db_context("Failed to count indexed messages")?;
    if messages == indexed {
        return Ok(());
    }

    tracing::info!(messages, indexed, "Rebuilding full-text index");
    conn.execute_batch(
        "BEGIN;
        DELETE FROM messages_fts;
        INSERT INTO messages_fts (content, session_id, user_id, message_id)
            SELECT m.content, m.session_id, s.user_id, m.id
            FROM messages m JOIN sessions s ON s.id = m.session_id;
        COMMIT;",
    )
    .db_context("Failed to rebuild full-text index")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert!(init_fts_with(&conn, FTS_TOKENIZER));
        assert!(init_fts_with(&conn, FTS_TOKENIZER));

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('sessions', 'session_tags', 'conversations', 'messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_failed_index_creation_leaves_no_table() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert!(!init_fts_with(&conn, "no_such_tokenizer"));
        assert!(!fts_table_exists(&conn).unwrap());
    }
}
