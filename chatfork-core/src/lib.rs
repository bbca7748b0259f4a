//! Storage engine for branching LLM conversation sessions
//!
//! This crate provides:
//! - **Data model**: `Session`, `Conversation`, `Message`, `Attachment`
//! - **Backends**: the `Backend` trait with filesystem, SQLite and in-memory
//!   implementations, constructed by token through the registry
//! - **Branching**: fork a session at any message and merge histories back
//! - **Search**: case-insensitive substring search with context snippets
//! - **Export**: JSON, Markdown and plain text
//!
//! # Example
//!
//! ```ignore
//! use chatfork_core::{create_backend, BackendConfig, Message};
//!
//! let mut config = BackendConfig::new();
//! config.insert("base_dir".into(), "/tmp/sessions".into());
//! let backend = create_backend("filesystem", &config)?;
//!
//! let mut session = backend.new_session("Demo");
//! session.add_message(Message::user("Hello"));
//! backend.save_session(&mut session).await?;
//! ```
pub mod backend;
pub mod branch;
pub mod error;
pub mod export;
pub mod ids;
pub mod implementations;
pub mod manager;
pub mod registry;
pub mod search;
pub mod types;

pub use backend::{Backend, ExportSink};
pub use error::{Result, StorageError};
pub use export::ExportFormat;
pub use ids::{MessageId, SessionId};
pub use implementations::fs::FsBackend;
pub use implementations::memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use implementations::sqlite::{SqliteBackend, SqliteOptions};
pub use manager::SessionManager;
pub use registry::{create_backend, register_backend, registered_backends, BackendConfig};
pub use search::SearchQuery;
pub use types::{
    Attachment, AttachmentKind, BranchTree, Conversation, MatchKind, MergeOptions, MergeResult, MergeType, Message,
    Metadata, Role, SearchMatch, SearchResult, Session, SessionInfo,
};
