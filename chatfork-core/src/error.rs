//! Error taxonomy shared by every storage backend
//!
//! Backends wrap low-level failures with the session ID or path they were
//! working on, so callers can report something actionable.

use std::path::PathBuf;

use crate::ids::SessionId;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exists: {0}")]
    SessionExists(SessionId),

    #[error("corrupted data for {location}: {reason}")]
    CorruptedData { location: String, reason: String },

    #[error("unknown storage backend: {0}")]
    InvalidBackend(String),

    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("transaction failed for session {session_id}: {source}")]
    TransactionFailed {
        session_id: SessionId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("branch not found: {0}")]
    BranchNotFound(SessionId),

    #[error("invalid branch: {0}")]
    InvalidBranch(String),

    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("storage backend is closed")]
    BackendClosed,

    #[error("no active session")]
    NoActiveSession,

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[cfg(feature = "sqlite")]
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl StorageError {
    /// Wrap an I/O error, promoting permission failures to `Permission`
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::Permission(format!("{}: {}", path.display(), source));
        }
        Self::Io { path, source }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn corrupted(location: impl Into<String>, reason: impl ToString) -> Self {
        Self::CorruptedData {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn database(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Database {
            context: context.into(),
            source,
        }
    }

    /// True for the error every backend returns when an ID is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::BranchNotFound(_))
    }
}

/// Attach context to fallible rusqlite calls, mirroring `anyhow::Context`
#[cfg(feature = "sqlite")]
pub(crate) trait DbContext<T> {
    fn db_context(self, context: &str) -> Result<T>;
}

#[cfg(feature = "sqlite")]
impl<T> DbContext<T> for std::result::Result<T, rusqlite::Error> {
    fn db_context(self, context: &str) -> Result<T> {
        self.map_err(|e| StorageError::database(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_promoted() {
        let err = StorageError::io(
            "/tmp/x.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, StorageError::Permission(_)));
    }

    #[test]
    fn test_not_found_display_names_session() {
        let err = StorageError::SessionNotFound(SessionId::from_string("abc"));
        assert_eq!(err.to_string(), "session not found: abc");
        assert!(err.is_not_found());
    }
}
