//! Filesystem backend: one JSON document per session
//!
//! Sessions live at `{base_dir}/{session_id}.json`. Writes go to a uniquely
//! named temp file that is synced and renamed over the target, so readers
//! never observe a truncated document.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{Result, StorageError};
use crate::ids::SessionId;
use crate::search::{search_sessions, SearchQuery};
use crate::types::{sort_by_recency, SearchResult, Session, SessionInfo};

pub const FS_BACKEND: &str = "filesystem";

const SESSION_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    closed: AtomicBool,
}

impl FsBackend {
    /// Open a backend rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;
        tracing::info!(path = %root.display(), "Opened filesystem session store");
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the document for a session
    pub fn path_for(&self, id: &SessionId) -> Result<PathBuf> {
        if !id.is_path_safe() {
            return Err(StorageError::InvalidSessionId(id.to_string()));
        }
        Ok(self.root.join(format!("{}.{}", id, SESSION_EXTENSION)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::BackendClosed);
        }
        Ok(())
    }

    async fn read_session(&self, id: &SessionId, path: &Path) -> Result<Session> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::SessionNotFound(id.clone()));
            }
            Err(e) => return Err(StorageError::io(path, e)),
        };
        serde_json::from_slice(&data).map_err(|e| StorageError::corrupted(path.display().to_string(), e))
    }

    async fn write_session(&self, session: &Session, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(session)
            .map_err(|e| StorageError::serialization(format!("Failed to serialize session {}", session.id), e))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.{}", session.id, Uuid::new_v4().simple(), TEMP_EXTENSION));
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, path).await
        }
        .await;

        if let Err(e) = result {
            fs::remove_file(&temp_path).await.ok();
            return Err(StorageError::io(path, e));
        }
        Ok(())
    }

    /// Paths of every session document, in directory order
    async fn session_paths(&self) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.root, e))?
        {
            let path = entry.path();
            let is_session = path.extension().is_some_and(|ext| ext == SESSION_EXTENSION)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'));
            if !is_session {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(&path, e))?;
            if file_type.is_file() {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Load every readable session; unreadable documents are logged and skipped
    async fn load_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for path in self.session_paths().await? {
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                    continue;
                }
            };
            match serde_json::from_slice::<Session>(&data) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping corrupted session file");
                }
            }
        }
        Ok(sessions)
    }

    /// Remove temp files orphaned by an interrupted write
    pub async fn cleanup_temp_files(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut cleaned = 0;
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.root, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                fs::remove_file(&path).await.map_err(|e| StorageError::io(&path, e))?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn kind(&self) -> &'static str {
        FS_BACKEND
    }

    async fn create_session(&self, session: &mut Session) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(&session.id)?;
        if fs::try_exists(&path).await.map_err(|e| StorageError::io(&path, e))? {
            return Err(StorageError::SessionExists(session.id.clone()));
        }
        session.touch();
        self.write_session(session, &path).await
    }

    async fn save_session(&self, session: &mut Session) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(&session.id)?;
        session.touch();
        self.write_session(session, &path).await?;
        tracing::debug!(session = %session.id, "Saved session");
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session> {
        self.ensure_open()?;
        let path = self.path_for(id)?;
        self.read_session(id, &path).await
    }

    async fn update_session(&self, session: &mut Session) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(&session.id)?;
        if !fs::try_exists(&path).await.map_err(|e| StorageError::io(&path, e))? {
            return Err(StorageError::SessionNotFound(session.id.clone()));
        }
        session.touch();
        self.write_session(session, &path).await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(session = %id, "Deleted session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::SessionNotFound(id.clone())),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.ensure_open()?;
        let mut infos: Vec<SessionInfo> = self.load_all().await?.iter().map(SessionInfo::from).collect();
        sort_by_recency(&mut infos);
        Ok(infos)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        if query.is_blank() {
            return Ok(Vec::new());
        }
        let sessions = self.load_all().await?;
        Ok(search_sessions(&sessions, query))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(path = %self.root.display(), "Closed filesystem session store");
        }
        Ok(())
    }
}
