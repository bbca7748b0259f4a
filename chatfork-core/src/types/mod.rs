//! Data model: pure value types, no I/O
//!
//! - `Session` / `Conversation` - the persisted aggregate
//! - `Message` / `Attachment` - transcript entries
//! - `SessionInfo`, `SearchResult`, `BranchTree` - derived read models
//! - `MergeOptions` / `MergeResult` - merge configuration and outcome

mod info;
mod merge;
mod message;
mod session;

pub use info::{sort_by_recency, BranchTree, MatchKind, SearchMatch, SearchResult, SessionInfo};
pub use merge::{MergeOptions, MergeResult, MergeType};
pub use message::{Attachment, AttachmentKind, Message, Role};
pub use session::{Conversation, Session};

/// Free-form key/value map used for session config and metadata
pub type Metadata = std::collections::BTreeMap<String, serde_json::Value>;
