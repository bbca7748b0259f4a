//! SQLite backend
//!
//! Provides `SqliteBackend` - a single shared connection holding sessions
//! for one user. Each save is one transaction over the session row, its
//! tags, its conversation settings and its messages.
//!
//! Submodules:
//! - `schema` - table layout and the optional full-text index
//! - `rows` - reading and writing the aggregate inside a transaction

use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::branch;
use crate::error::{DbContext, Result, StorageError};
use crate::ids::SessionId;
use crate::search::{contains_ignore_case, search_sessions, SearchQuery};
use crate::types::{sort_by_recency, MergeOptions, MergeResult, SearchResult, Session, SessionInfo};

mod rows;
mod schema;

pub const SQLITE_BACKEND: &str = "sqlite";

/// User that owns sessions when none is configured
pub const DEFAULT_USER_ID: &str = "local";

/// Shortest query the trigram index can answer
const MIN_FTS_QUERY_CHARS: usize = 3;

#[derive(Clone, Debug)]
pub struct SqliteOptions {
    /// Every read and write is scoped to this user
    pub user_id: String,
    /// Use the FTS5 index when SQLite supports it
    pub full_text_search: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            full_text_search: true,
        }
    }
}

impl SqliteOptions {
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn without_full_text_search(mut self) -> Self {
        self.full_text_search = false;
        self
    }
}

pub struct SqliteBackend {
    conn: Arc<Mutex<Option<Connection>>>,
    user_id: String,
    /// Message content is mirrored into `messages_fts`
    indexed: bool,
    /// Searches consult the index
    fts: bool,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("user_id", &self.user_id)
            .field("fts", &self.fts)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StorageError::database(format!("Failed to open database {}", path.display()), e))?;
        tracing::info!(path = %path.display(), user = %options.user_id, "Opened SQLite session store");
        Self::from_connection(conn, options)
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory(options: SqliteOptions) -> Result<Self> {
        let conn = Connection::open_in_memory().db_context("Failed to open in-memory database")?;
        Self::from_connection(conn, options)
    }

    fn from_connection(conn: Connection, options: SqliteOptions) -> Result<Self> {
        Self::with_tokenizer(conn, options, schema::FTS_TOKENIZER)
    }

    fn with_tokenizer(conn: Connection, options: SqliteOptions, tokenizer: &str) -> Result<Self> {
        schema::init_schema(&conn)?;
        let indexed = if options.full_text_search {
            schema::init_fts_with(&conn, tokenizer)
        } else {
            schema::fts_table_exists(&conn)?
        };
        if indexed {
            schema::rebuild_fts_if_stale(&conn)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            user_id: options.user_id,
            indexed,
            fts: options.full_text_search && indexed,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether searches are answered from the full-text index
    pub fn full_text_search(&self) -> bool {
        self.fts
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::corrupted("sqlite backend", "connection lock poisoned"))?;
        let conn = guard.as_mut().ok_or(StorageError::BackendClosed)?;
        f(conn)
    }

    /// Write sessions in one transaction; nothing is kept if any write fails
    fn commit(&self, conn: &mut Connection, sessions: &[&Session]) -> Result<()> {
        let Some(first) = sessions.first() else {
            return Ok(());
        };
        let failed = |err: StorageError| match err {
            StorageError::Database { .. } => StorageError::TransactionFailed {
                session_id: first.id.clone(),
                source: Box::new(err),
            },
            other => other,
        };

        let tx = conn
            .transaction()
            .db_context("Failed to begin transaction")
            .map_err(failed)?;
        for session in sessions {
            rows::write_session(&tx, &self.user_id, session, self.indexed).map_err(failed)?;
        }
        tx.commit().db_context("Failed to commit transaction").map_err(failed)
    }

    /// Load sessions by ID, skipping ones that no longer decode
    fn load_many(&self, conn: &Connection, ids: impl IntoIterator<Item = SessionId>) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for id in ids {
            match rows::read_session(conn, &self.user_id, &id) {
                Ok(session) => sessions.push(session),
                Err(e @ StorageError::CorruptedData { .. }) => {
                    tracing::warn!(session = %id, error = %e, "Skipping corrupted session");
                }
                Err(StorageError::SessionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sessions)
    }

    /// Candidate sessions for an indexed search: message hits from the
    /// index plus sessions whose name, tags or system prompt match
    fn fts_candidates(&self, conn: &Connection, text: &str) -> Result<BTreeSet<SessionId>> {
        let mut ids: BTreeSet<SessionId> = rows::fts_candidates(conn, &self.user_id, text)?.into_iter().collect();
        for header in rows::session_headers(conn, &self.user_id)? {
            let matched = contains_ignore_case(&header.name, text)
                || header
                    .system_prompt
                    .as_deref()
                    .is_some_and(|prompt| contains_ignore_case(prompt, text))
                || header.tags.iter().any(|tag| contains_ignore_case(tag, text));
            if matched {
                ids.insert(header.id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> &'static str {
        SQLITE_BACKEND
    }

    async fn create_session(&self, session: &mut Session) -> Result<()> {
        self.with_conn(|conn| {
            if rows::session_exists(conn, &self.user_id, &session.id)? {
                return Err(StorageError::SessionExists(session.id.clone()));
            }
            session.touch();
            self.commit(conn, &[&*session])
        })
    }

    async fn save_session(&self, session: &mut Session) -> Result<()> {
        self.with_conn(|conn| {
            session.touch();
            self.commit(conn, &[&*session])
        })?;
        tracing::debug!(session = %session.id, "Saved session");
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session> {
        self.with_conn(|conn| rows::read_session(conn, &self.user_id, id))
    }

    async fn update_session(&self, session: &mut Session) -> Result<()> {
        self.with_conn(|conn| {
            if !rows::session_exists(conn, &self.user_id, &session.id)? {
                return Err(StorageError::SessionNotFound(session.id.clone()));
            }
            session.touch();
            self.commit(conn, &[&*session])
        })
    }

    async fn delete_session(&self, id: &SessionId) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().db_context("Failed to begin transaction")?;
            if !rows::delete_session(&tx, &self.user_id, id, self.indexed)? {
                return Err(StorageError::SessionNotFound(id.clone()));
            }
            tx.commit().db_context("Failed to commit delete")
        })?;
        tracing::debug!(session = %id, "Deleted session");
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut infos = self.with_conn(|conn| rows::list_infos(conn, &self.user_id))?;
        sort_by_recency(&mut infos);
        Ok(infos)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        if query.is_blank() {
            // Still report a closed backend
            self.with_conn(|_| Ok(()))?;
            return Ok(Vec::new());
        }
        let sessions = self.with_conn(|conn| {
            if self.fts && query.text.chars().count() >= MIN_FTS_QUERY_CHARS {
                let ids = self.fts_candidates(conn, &query.text)?;
                self.load_many(conn, ids)
            } else {
                let ids = rows::session_ids(conn, &self.user_id)?;
                self.load_many(conn, ids)
            }
        })?;
        Ok(search_sessions(&sessions, query))
    }

    async fn close(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::corrupted("sqlite backend", "connection lock poisoned"))?
            .take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| StorageError::database("Failed to close database", e))?;
            tracing::info!(user = %self.user_id, "Closed SQLite session store");
        }
        Ok(())
    }

    /// Child and parent are written in one transaction
    async fn branch_session(&self, parent_id: &SessionId, fork_index: usize, name: Option<&str>) -> Result<Session> {
        let child = self.with_conn(|conn| {
            let mut parent = rows::read_session(conn, &self.user_id, parent_id)?;
            let name = name.map(str::to_string).unwrap_or_else(|| branch::branch_name(&parent));
            let mut child = branch::fork(&parent, fork_index, name)?;
            child.touch();
            parent.add_child(child.id.clone());
            parent.touch();
            self.commit(conn, &[&child, &parent])?;
            Ok(child)
        })?;
        tracing::debug!(parent = %parent_id, child = %child.id, fork_index, "Created branch");
        Ok(child)
    }

    /// The merged session and the updated target are written in one transaction
    async fn merge_sessions(
        &self,
        target_id: &SessionId,
        source_id: &SessionId,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let result = self.with_conn(|conn| {
            let target = rows::read_session(conn, &self.user_id, target_id)?;
            let source = rows::read_session(conn, &self.user_id, source_id)?;
            let plan = branch::plan_merge(&target, &source, options)?;

            let mut updated_target = plan.target;
            updated_target.touch();
            match plan.branch {
                Some(mut new_branch) => {
                    new_branch.touch();
                    self.commit(conn, &[&new_branch, &updated_target])?;
                    Ok(MergeResult {
                        merged_count: plan.merged_count,
                        session_id: new_branch.id.clone(),
                        branch_id: Some(new_branch.id),
                    })
                }
                None => {
                    self.commit(conn, &[&updated_target])?;
                    Ok(MergeResult {
                        merged_count: plan.merged_count,
                        session_id: updated_target.id,
                        branch_id: None,
                    })
                }
            }
        })?;
        tracing::debug!(
            target = %target_id,
            source = %source_id,
            merge_type = %options.merge_type,
            merged = result.merged_count,
            "Merged sessions"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use tempfile::TempDir;

    fn backend(options: SqliteOptions) -> SqliteBackend {
        SqliteBackend::in_memory(options).unwrap()
    }

    #[tokio::test]
    async fn test_fts_is_detected() {
        assert!(backend(SqliteOptions::default()).full_text_search());
        assert!(!backend(SqliteOptions::default().without_full_text_search()).full_text_search());
    }

    #[tokio::test]
    async fn test_unavailable_index_falls_back_to_scan() {
        let conn = Connection::open_in_memory().unwrap();
        let store = SqliteBackend::with_tokenizer(conn, SqliteOptions::default(), "no_such_tokenizer").unwrap();
        assert!(!store.full_text_search());

        let mut session = store.new_session("Fallback");
        session.add_message(Message::user("needle in a haystack"));
        store.save_session(&mut session).await.unwrap();
        session.add_message(Message::assistant("found the needle"));
        store.save_session(&mut session).await.unwrap();

        let results = store.search(&SearchQuery::new("needle")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].matches.len(), 2);
        assert_eq!(store.load_session(&session.id).await.unwrap(), session);

        store.delete_session(&session.id).await.unwrap();
        assert!(store.search(&SearchQuery::new("needle")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_scoped_by_user() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        let alice = SqliteBackend::open(&path, SqliteOptions::default().with_user("alice")).unwrap();
        let bob = SqliteBackend::open(&path, SqliteOptions::default().with_user("bob")).unwrap();

        let mut session = alice.new_session("private");
        session.add_message(Message::user("secret plans"));
        alice.save_session(&mut session).await.unwrap();

        assert!(bob.list_sessions().await.unwrap().is_empty());
        assert!(bob.search(&SearchQuery::new("secret")).await.unwrap().is_empty());
        assert!(matches!(
            bob.load_session(&session.id).await,
            Err(StorageError::SessionNotFound(_))
        ));
        assert!(matches!(
            bob.save_session(&mut session.clone()).await,
            Err(StorageError::Permission(_))
        ));
        assert_eq!(alice.search(&SearchQuery::new("secret")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fts_and_scan_agree() {
        let fts = backend(SqliteOptions::default());
        let scan = backend(SqliteOptions::default().without_full_text_search());

        for store in [&fts, &scan] {
            let mut a = store.new_session("Rust questions");
            a.conversation.system_prompt = Some("You answer about ownership".into());
            a.add_tag("lang");
            a.add_message(Message::user("What does the Borrow checker do?"));
            a.add_message(Message::assistant("It enforces borrowing rules."));
            store.save_session(&mut a).await.unwrap();

            let mut b = store.new_session("Cooking");
            b.add_message(Message::user("How long to boil an egg?"));
            store.save_session(&mut b).await.unwrap();
        }

        for text in ["borrow", "OWNERSHIP", "lang", "egg", "Cook", "zz", "missing"] {
            let query = SearchQuery::new(text);
            let from_fts: Vec<_> = fts
                .search(&query)
                .await
                .unwrap()
                .into_iter()
                .map(|r| (r.session.name, r.matches))
                .collect();
            let from_scan: Vec<_> = scan
                .search(&query)
                .await
                .unwrap()
                .into_iter()
                .map(|r| (r.session.name, r.matches))
                .collect();
            assert_eq!(from_fts, from_scan, "query {:?}", text);
        }
    }

    #[tokio::test]
    async fn test_index_is_rebuilt_after_scan_only_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let scan = SqliteBackend::open(&path, SqliteOptions::default().without_full_text_search()).unwrap();
            let mut session = scan.new_session("written without index");
            session.add_message(Message::user("needle in a haystack"));
            scan.save_session(&mut session).await.unwrap();
            scan.close().await.unwrap();
        }

        let fts = SqliteBackend::open(&path, SqliteOptions::default()).unwrap();
        assert!(fts.full_text_search());
        assert_eq!(fts.search(&SearchQuery::new("needle")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_branch_writes_parent_and_child() {
        let store = backend(SqliteOptions::default());
        let mut parent = store.new_session("Demo");
        parent.add_message(Message::user("one"));
        parent.add_message(Message::assistant("two"));
        store.save_session(&mut parent).await.unwrap();

        let child = store.branch_session(&parent.id, 1, None).await.unwrap();
        let parent = store.load_session(&parent.id).await.unwrap();
        assert_eq!(parent.child_ids, vec![child.id.clone()]);
        assert_eq!(store.load_session(&child.id).await.unwrap().message_count(), 1);

        let err = store.branch_session(&parent.id, 5, None).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidBranch(_)));
        assert_eq!(store.list_sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = backend(SqliteOptions::default());
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.list_sessions().await, Err(StorageError::BackendClosed)));
        assert!(matches!(
            store.search(&SearchQuery::new("")).await,
            Err(StorageError::BackendClosed)
        ));
    }
}
