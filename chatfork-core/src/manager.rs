//! Session manager: a backend plus the session currently being worked on
//!
//! This is the layer a front end talks to. It keeps one active session,
//! saves it after every appended message and follows branches and merges
//! so the active session is always the one holding the newest history.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::backend::{Backend, ExportSink};
use crate::error::{Result, StorageError};
use crate::export::{self, ExportFormat};
use crate::ids::SessionId;
use crate::registry::{self, BackendConfig};
use crate::search::SearchQuery;
use crate::types::{MergeOptions, MergeResult, Message, SearchResult, Session};

const LIST_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";
const NAME_COLUMN_WIDTH: usize = 30;

pub struct SessionManager {
    backend: Arc<dyn Backend>,
    current: Option<Session>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            current: None,
        }
    }

    /// Build a manager over a registry backend
    pub fn from_config(kind: &str, config: &BackendConfig) -> Result<Self> {
        Ok(Self::new(registry::create_backend(kind, config)?))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    fn current_mut(&mut self) -> Result<&mut Session> {
        self.current.as_mut().ok_or(StorageError::NoActiveSession)
    }

    fn current_id(&self) -> Result<SessionId> {
        self.current
            .as_ref()
            .map(|s| s.id.clone())
            .ok_or(StorageError::NoActiveSession)
    }

    fn resolve(&self, id: Option<&SessionId>) -> Result<SessionId> {
        match id {
            Some(id) => Ok(id.clone()),
            None => self.current_id(),
        }
    }

    /// Create, persist and activate a new session
    pub async fn new_session(&mut self, name: &str) -> Result<&Session> {
        let mut session = self.backend.new_session(name);
        self.backend.create_session(&mut session).await?;
        tracing::debug!(session = %session.id, "Started session");
        Ok(&*self.current.insert(session))
    }

    pub async fn save(&mut self) -> Result<()> {
        let backend = self.backend.clone();
        let session = self.current_mut()?;
        backend.save_session(session).await
    }

    /// Load and activate a stored session
    pub async fn open(&mut self, id: &SessionId) -> Result<&Session> {
        let session = self.backend.load_session(id).await?;
        Ok(&*self.current.insert(session))
    }

    /// Delete a session; deleting the active one leaves no session active
    pub async fn delete(&mut self, id: &SessionId) -> Result<()> {
        self.backend.delete_session(id).await?;
        if self.current.as_ref().is_some_and(|s| &s.id == id) {
            self.current = None;
        }
        Ok(())
    }

    /// Append to the active session and save it
    pub async fn add_message(&mut self, message: Message) -> Result<()> {
        let backend = self.backend.clone();
        let session = self.current_mut()?;
        session.add_message(message);
        backend.save_session(session).await
    }

    /// Stored sessions as a fixed-width table, newest first
    pub async fn list_formatted(&self) -> Result<String> {
        let sessions = self.backend.list_sessions().await?;
        if sessions.is_empty() {
            return Ok("No sessions found.\n".to_string());
        }

        let id_width = sessions.iter().map(|s| s.id.as_str().len()).max().unwrap_or(2).max(2);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<id_width$}  {:<NAME_COLUMN_WIDTH$}  {:>8}  {:<16}  Tags",
            "ID", "Name", "Messages", "Updated"
        );
        for info in &sessions {
            let mut name = info.name.clone();
            if name.chars().count() > NAME_COLUMN_WIDTH {
                name = name.chars().take(NAME_COLUMN_WIDTH - 3).collect::<String>() + "...";
            }
            let marker = if self.current.as_ref().is_some_and(|c| c.id == info.id) {
                " *"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "{:<id_width$}  {:<NAME_COLUMN_WIDTH$}  {:>8}  {:<16}  {}{}",
                info.id,
                name,
                info.message_count,
                info.updated.format(LIST_TIME_FORMAT).to_string(),
                info.tags.join(", "),
                marker
            );
        }
        Ok(out)
    }

    /// Export a session (the active one when `id` is `None`)
    pub async fn export_to(&self, id: Option<&SessionId>, format: &str, writer: &mut ExportSink<'_>) -> Result<()> {
        let format: ExportFormat = format.parse()?;
        let id = self.resolve(id)?;
        self.backend.export_session(&id, format, writer).await
    }

    pub async fn export_to_string(&self, id: Option<&SessionId>, format: &str) -> Result<String> {
        let format: ExportFormat = format.parse()?;
        let id = self.resolve(id)?;
        let session = self.backend.load_session(&id).await?;
        export::render(&session, format)
    }

    pub async fn search(&self, query: impl Into<SearchQuery>) -> Result<Vec<SearchResult>> {
        self.backend.search(&query.into()).await
    }

    /// Fork the active session and switch to the branch
    ///
    /// `fork_index` defaults to the full history.
    pub async fn branch(&mut self, fork_index: Option<usize>, name: Option<&str>) -> Result<&Session> {
        let parent_id = self.current_id()?;
        let fork_index = match fork_index {
            Some(index) => index,
            None => self.current.as_ref().map(Session::message_count).unwrap_or(0),
        };
        let child = self.backend.branch_session(&parent_id, fork_index, name).await?;
        Ok(&*self.current.insert(child))
    }

    /// Merge `source_id` into the active session
    ///
    /// Afterwards the active session is whichever session received the
    /// merged messages.
    pub async fn merge(&mut self, source_id: &SessionId, options: &MergeOptions) -> Result<MergeResult> {
        let target_id = self.current_id()?;
        let result = self.backend.merge_sessions(&target_id, source_id, options).await?;
        let merged = self.backend.load_session(&result.session_id).await?;
        self.current = Some(merged);
        Ok(result)
    }

    /// Indented text tree of a session and its branches
    pub async fn branch_tree(&self, id: Option<&SessionId>) -> Result<String> {
        let id = self.resolve(id)?;
        Ok(self.backend.get_branch_tree(&id).await?.render())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.current = None;
        self.backend.close().await
    }
}
