//! In-memory backend
//!
//! Nothing is persisted; useful for tests and for callers that want the
//! branch/merge engine without touching disk.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::backend::Backend;
use crate::error::{Result, StorageError};
use crate::ids::SessionId;
use crate::search::{search_sessions, SearchQuery};
use crate::types::{sort_by_recency, SearchResult, Session, SessionInfo};

pub const MEMORY_BACKEND: &str = "memory";

#[derive(Debug, Default)]
pub struct MemoryBackend {
    sessions: Mutex<HashMap<SessionId, Session>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<SessionId, Session>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::BackendClosed);
        }
        self.sessions
            .lock()
            .map_err(|_| StorageError::corrupted("memory backend", "session map lock poisoned"))
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        MEMORY_BACKEND
    }

    async fn create_session(&self, session: &mut Session) -> Result<()> {
        let mut sessions = self.sessions()?;
        if sessions.contains_key(&session.id) {
            return Err(StorageError::SessionExists(session.id.clone()));
        }
        session.touch();
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn save_session(&self, session: &mut Session) -> Result<()> {
        let mut sessions = self.sessions()?;
        session.touch();
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session> {
        self.sessions()?
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::SessionNotFound(id.clone()))
    }

    async fn update_session(&self, session: &mut Session) -> Result<()> {
        let mut sessions = self.sessions()?;
        if !sessions.contains_key(&session.id) {
            return Err(StorageError::SessionNotFound(session.id.clone()));
        }
        session.touch();
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<()> {
        self.sessions()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::SessionNotFound(id.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut infos: Vec<SessionInfo> = self.sessions()?.values().map(SessionInfo::from).collect();
        sort_by_recency(&mut infos);
        Ok(infos)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let sessions = self.sessions()?;
        Ok(search_sessions(sessions.values(), query))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Ok(mut sessions) = self.sessions.lock() {
                sessions.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_backend_rejects_operations() {
        let backend = MemoryBackend::new();
        let mut session = backend.new_session("x");
        backend.save_session(&mut session).await.unwrap();
        assert_eq!(backend.len(), 1);

        backend.close().await.unwrap();
        backend.close().await.unwrap();
        assert!(matches!(
            backend.load_session(&session.id).await,
            Err(StorageError::BackendClosed)
        ));
    }

    #[tokio::test]
    async fn test_stored_copy_is_detached() {
        let backend = MemoryBackend::new();
        let mut session = backend.new_session("x");
        backend.save_session(&mut session).await.unwrap();

        session.name = "changed locally".into();
        let loaded = backend.load_session(&session.id).await.unwrap();
        assert_eq!(loaded.name, "x");
    }
}
