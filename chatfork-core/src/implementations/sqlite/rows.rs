//! Row-level reads and writes of the session aggregate
//!
//! Everything here is synchronous and takes a borrowed connection, so the
//! caller decides the transaction boundary.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use crate::error::{DbContext, Result, StorageError};
use crate::ids::{MessageId, SessionId};
use crate::types::{Attachment, Conversation, Message, Metadata, Role, Session, SessionInfo};

/// RFC 3339 with nanoseconds, so a stored time loads back unchanged
pub(crate) fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_time(raw: &str, location: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::corrupted(location, format!("bad timestamp {:?}: {}", raw, e)))
}

fn encode_json<T: serde::Serialize>(value: &T, context: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StorageError::serialization(context, e))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, location: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| StorageError::corrupted(location, e))
}

/// Upsert the session row and replace its tags, settings and messages
///
/// Returns `Permission` when the ID is already owned by another user.
pub(crate) fn write_session(conn: &Connection, user_id: &str, session: &Session, index_fts: bool) -> Result<()> {
    let id = session.id.as_str();
    let config = encode_json(&session.config, "Failed to encode session config")?;
    let metadata = encode_json(&session.metadata, "Failed to encode session metadata")?;
    let child_ids = encode_json(&session.child_ids, "Failed to encode child ids")?;

    let changed = conn
        .execute(
            "INSERT INTO sessions (id, user_id, name, created_at, updated_at, config, metadata, parent_id, child_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                config = excluded.config,
                metadata = excluded.metadata,
                parent_id = excluded.parent_id,
                child_ids = excluded.child_ids
             WHERE sessions.user_id = excluded.user_id",
            params![
                id,
                user_id,
                session.name,
                encode_time(&session.created),
                encode_time(&session.updated),
                config,
                metadata,
                session.parent_id.as_ref().map(|p| p.as_str()),
                child_ids,
            ],
        )
        .db_context("Failed to write session row")?;
    if changed == 0 {
        return Err(StorageError::Permission(format!(
            "session {} belongs to another user",
            session.id
        )));
    }

    conn.execute("DELETE FROM session_tags WHERE session_id = ?1", params![id])
        .db_context("Failed to clear tags")?;
    {
        let mut stmt = conn
            .prepare("INSERT INTO session_tags (session_id, position, tag) VALUES (?1, ?2, ?3)")
            .db_context("Failed to prepare tag insert")?;
        for (position, tag) in session.tags.iter().enumerate() {
            stmt.execute(params![id, position as i64, tag])
                .db_context("Failed to insert tag")?;
        }
    }

    let conv = &session.conversation;
    conn.execute(
        "INSERT OR REPLACE INTO conversations (session_id, provider, model, temperature, max_tokens, system_prompt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            conv.provider,
            conv.model,
            conv.temperature,
            conv.max_tokens,
            conv.system_prompt
        ],
    )
    .db_context("Failed to write conversation settings")?;

    conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])
        .db_context("Failed to clear messages")?;
    if index_fts {
        conn.execute("DELETE FROM messages_fts WHERE session_id = ?1", params![id])
            .db_context("Failed to clear search index")?;
    }
    {
        let mut insert = conn
            .prepare(
                "INSERT INTO messages (session_id, position, id, role, content, timestamp, attachments, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .db_context("Failed to prepare message insert")?;
        let mut index = if index_fts {
            Some(
                conn.prepare(
                    "INSERT INTO messages_fts (content, session_id, user_id, message_id) VALUES (?1, ?2, ?3, ?4)",
                )
                .db_context("Failed to prepare search index insert")?,
            )
        } else {
            None
        };

        for (position, message) in conv.messages.iter().enumerate() {
            let attachments = encode_json(&message.attachments, "Failed to encode attachments")?;
            let message_metadata = encode_json(&message.metadata, "Failed to encode message metadata")?;
            insert
                .execute(params![
                    id,
                    position as i64,
                    message.id.as_str(),
                    message.role.as_str(),
                    message.content,
                    encode_time(&message.timestamp),
                    attachments,
                    message_metadata,
                ])
                .db_context("Failed to insert message")?;
            if let Some(index) = index.as_mut() {
                index
                    .execute(params![message.content, id, user_id, message.id.as_str()])
                    .db_context("Failed to index message")?;
            }
        }
    }
    Ok(())
}

/// Delete a session and its index rows; false if the user has no such session
pub(crate) fn delete_session(conn: &Connection, user_id: &str, id: &SessionId, index_fts: bool) -> Result<bool> {
    let deleted = conn
        .execute(
            "DELETE FROM sessions WHERE id = ?1 AND user_id = ?2",
            params![id.as_str(), user_id],
        )
        .db_context("Failed to delete session")?;
    if deleted > 0 && index_fts {
        conn.execute("DELETE FROM messages_fts WHERE session_id = ?1", params![id.as_str()])
            .db_context("Failed to clear search index")?;
    }
    Ok(deleted > 0)
}

pub(crate) fn session_exists(conn: &Connection, user_id: &str, id: &SessionId) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sessions WHERE id = ?1 AND user_id = ?2",
        params![id.as_str(), user_id],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .db_context("Failed to check session")
}

struct SessionRow {
    name: String,
    created: String,
    updated: String,
    config: String,
    metadata: String,
    parent_id: Option<String>,
    child_ids: String,
}

/// Load the full aggregate, or `SessionNotFound`
pub(crate) fn read_session(conn: &Connection, user_id: &str, id: &SessionId) -> Result<Session> {
    let location = format!("session {}", id);
    let row = conn
        .query_row(
            "SELECT name, created_at, updated_at, config, metadata, parent_id, child_ids
             FROM sessions WHERE id = ?1 AND user_id = ?2",
            params![id.as_str(), user_id],
            |row| {
                Ok(SessionRow {
                    name: row.get(0)?,
                    created: row.get(1)?,
                    updated: row.get(2)?,
                    config: row.get(3)?,
                    metadata: row.get(4)?,
                    parent_id: row.get(5)?,
                    child_ids: row.get(6)?,
                })
            },
        )
        .optional()
        .db_context("Failed to load session")?
        .ok_or_else(|| StorageError::SessionNotFound(id.clone()))?;

    let mut conversation = conn
        .query_row(
            "SELECT provider, model, temperature, max_tokens, system_prompt
             FROM conversations WHERE session_id = ?1",
            params![id.as_str()],
            |row| {
                Ok(Conversation {
                    messages: Vec::new(),
                    provider: row.get(0)?,
                    model: row.get(1)?,
                    temperature: row.get(2)?,
                    max_tokens: row.get(3)?,
                    system_prompt: row.get(4)?,
                })
            },
        )
        .optional()
        .db_context("Failed to load conversation settings")?
        .unwrap_or_default();
    conversation.messages = read_messages(conn, id, &location)?;

    let config: Metadata = decode_json(&row.config, &location)?;
    let metadata: Metadata = decode_json(&row.metadata, &location)?;
    let child_ids: Vec<SessionId> = decode_json(&row.child_ids, &location)?;

    Ok(Session {
        id: id.clone(),
        name: row.name,
        created: decode_time(&row.created, &location)?,
        updated: decode_time(&row.updated, &location)?,
        config,
        metadata,
        tags: read_tags(conn, id)?,
        conversation,
        parent_id: row.parent_id.map(SessionId::from),
        child_ids,
    })
}

fn read_tags(conn: &Connection, id: &SessionId) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT tag FROM session_tags WHERE session_id = ?1 ORDER BY position")
        .db_context("Failed to prepare tag query")?;
    let tags = stmt
        .query_map(params![id.as_str()], |row| row.get(0))
        .db_context("Failed to query tags")?
        .collect::<std::result::Result<Vec<String>, _>>()
        .db_context("Failed to read tags")?;
    Ok(tags)
}

struct MessageRow {
    id: String,
    role: String,
    content: String,
    timestamp: String,
    attachments: String,
    metadata: String,
}

fn read_messages(conn: &Connection, id: &SessionId, location: &str) -> Result<Vec<Message>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, role, content, timestamp, attachments, metadata
             FROM messages WHERE session_id = ?1 ORDER BY position",
        )
        .db_context("Failed to prepare message query")?;
    let rows = stmt
        .query_map(params![id.as_str()], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                role: row.get(1)?,
                content: row.get(2)?,
                timestamp: row.get(3)?,
                attachments: row.get(4)?,
                metadata: row.get(5)?,
            })
        })
        .db_context("Failed to query messages")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .db_context("Failed to read messages")?;

    rows.into_iter()
        .map(|row| {
            let role: Role = row
                .role
                .parse()
                .map_err(|e: String| StorageError::corrupted(location, e))?;
            let attachments: Vec<Attachment> = decode_json(&row.attachments, location)?;
            Ok(Message {
                id: MessageId::from_string(row.id),
                role,
                content: row.content,
                timestamp: decode_time(&row.timestamp, location)?,
                attachments,
                metadata: decode_json(&row.metadata, location)?,
            })
        })
        .collect()
}

/// Listing rows for a user; rows that fail to decode are logged and skipped
pub(crate) fn list_infos(conn: &Connection, user_id: &str) -> Result<Vec<SessionInfo>> {
    let mut tags: HashMap<String, Vec<String>> = HashMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT t.session_id, t.tag FROM session_tags t
                 JOIN sessions s ON s.id = t.session_id
                 WHERE s.user_id = ?1 ORDER BY t.session_id, t.position",
            )
            .db_context("Failed to prepare tag listing")?;
        let rows = stmt
            .query_map(params![user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .db_context("Failed to list tags")?;
        for row in rows {
            let (session_id, tag) = row.db_context("Failed to read tag row")?;
            tags.entry(session_id).or_default().push(tag);
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.created_at, s.updated_at, s.parent_id, s.child_ids,
                    c.provider, c.model,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s
             LEFT JOIN conversations c ON c.session_id = s.id
             WHERE s.user_id = ?1",
        )
        .db_context("Failed to prepare session listing")?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })
        .db_context("Failed to list sessions")?;

    let mut infos = Vec::new();
    for row in rows {
        let (id, name, created, updated, parent_id, child_ids, provider, model, count) =
            row.db_context("Failed to read session row")?;
        let location = format!("session {}", id);
        let decoded = (|| -> Result<SessionInfo> {
            let child_ids: Vec<SessionId> = decode_json(&child_ids, &location)?;
            Ok(SessionInfo {
                tags: tags.remove(&id).unwrap_or_default(),
                id: SessionId::from_string(id.clone()),
                name,
                created: decode_time(&created, &location)?,
                updated: decode_time(&updated, &location)?,
                message_count: count.max(0) as usize,
                model,
                provider,
                parent_id: parent_id.map(SessionId::from),
                child_count: child_ids.len(),
            })
        })();
        match decoded {
            Ok(info) => infos.push(info),
            Err(e) => tracing::warn!(session = %id, error = %e, "Skipping corrupted session row"),
        }
    }
    Ok(infos)
}

/// IDs of every session the user owns
pub(crate) fn session_ids(conn: &Connection, user_id: &str) -> Result<Vec<SessionId>> {
    let mut stmt = conn
        .prepare("SELECT id FROM sessions WHERE user_id = ?1")
        .db_context("Failed to prepare id query")?;
    let ids = stmt
        .query_map(params![user_id], |row| row.get::<_, String>(0))
        .db_context("Failed to query session ids")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .db_context("Failed to read session ids")?;
    Ok(ids.into_iter().map(SessionId::from_string).collect())
}

/// Name, tags and system prompt per session, for matching fields the
/// full-text index does not cover
pub(crate) struct HeaderRow {
    pub id: SessionId,
    pub name: String,
    pub system_prompt: Option<String>,
    pub tags: Vec<String>,
}

pub(crate) fn session_headers(conn: &Connection, user_id: &str) -> Result<Vec<HeaderRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, c.system_prompt FROM sessions s
             LEFT JOIN conversations c ON c.session_id = s.id
             WHERE s.user_id = ?1",
        )
        .db_context("Failed to prepare header query")?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })
        .db_context("Failed to query headers")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .db_context("Failed to read headers")?;

    rows.into_iter()
        .map(|(id, name, system_prompt)| {
            let id = SessionId::from_string(id);
            Ok(HeaderRow {
                tags: read_tags(conn, &id)?,
                id,
                name,
                system_prompt,
            })
        })
        .collect()
}

/// Sessions with at least one message matching the phrase in the index
pub(crate) fn fts_candidates(conn: &Connection, user_id: &str, text: &str) -> Result<Vec<SessionId>> {
    let phrase = format!("\"{}\"", text.replace('"', "\"\""));
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT session_id FROM messages_fts
             WHERE messages_fts MATCH ?1 AND user_id = ?2",
        )
        .db_context("Failed to prepare full-text query")?;
    let ids = stmt
        .query_map(params![phrase, user_id], |row| row.get::<_, String>(0))
        .db_context("Failed to run full-text query")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .db_context("Failed to read full-text results")?;
    Ok(ids.into_iter().map(SessionId::from_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::implementations::sqlite::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init_schema(&conn).unwrap();
        assert!(schema::init_fts_with(&conn, schema::FTS_TOKENIZER));
        conn
    }

    #[test]
    fn test_time_encoding_keeps_nanoseconds() {
        let now = Utc::now();
        let encoded = encode_time(&now);
        assert_eq!(decode_time(&encoded, "test").unwrap(), now);
        assert!(matches!(
            decode_time("yesterday", "test"),
            Err(StorageError::CorruptedData { .. })
        ));
    }

    #[test]
    fn test_write_then_read_aggregate() {
        let conn = conn();
        let mut session = Session::new("Demo");
        session.add_tag("b");
        session.add_tag("a");
        session.conversation.temperature = Some(0.7);
        session.conversation.max_tokens = Some(256);
        session.add_message(Message::user("Hello"));
        session.add_message(Message::assistant("Hi there!"));

        write_session(&conn, "local", &session, true).unwrap();
        let loaded = read_session(&conn, "local", &session.id).unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_other_user_cannot_overwrite() {
        let conn = conn();
        let session = Session::new("mine");
        write_session(&conn, "alice", &session, true).unwrap();

        let err = write_session(&conn, "bob", &session, true).unwrap_err();
        assert!(matches!(err, StorageError::Permission(_)));
        assert!(matches!(
            read_session(&conn, "bob", &session.id),
            Err(StorageError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_fts_phrase_escapes_quotes() {
        let conn = conn();
        let mut session = Session::new("quotes");
        session.add_message(Message::user(r#"she said "hello world" loudly"#));
        write_session(&conn, "local", &session, true).unwrap();

        let hits = fts_candidates(&conn, "local", r#"said "hello"#).unwrap();
        assert_eq!(hits, vec![session.id.clone()]);
        assert!(fts_candidates(&conn, "local", "goodbye").unwrap().is_empty());
    }

    #[test]
    fn test_delete_cascades() {
        let conn = conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let mut session = Session::new("gone");
        session.add_tag("x");
        session.add_message(Message::user("bye"));
        write_session(&conn, "local", &session, true).unwrap();

        assert!(delete_session(&conn, "local", &session.id, true).unwrap());
        assert!(!delete_session(&conn, "local", &session.id, true).unwrap());
        let leftover: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(leftover, 0);
    }
}
