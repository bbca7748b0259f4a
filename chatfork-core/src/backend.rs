//! The storage contract every backend implements
//!
//! Backends provide the primitive CRUD, listing and search operations.
//! Branch navigation, branching, merging and export have default
//! implementations built only on those primitives, which keeps backends
//! interchangeable. A backend may override a default when it can do better
//! (the SQLite backend persists a branch and its parent in one transaction).

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::branch;
use crate::error::{Result, StorageError};
use crate::export::{self, ExportFormat};
use crate::ids::SessionId;
use crate::search::SearchQuery;
use crate::types::{BranchTree, MergeOptions, MergeResult, SearchResult, Session, SessionInfo};

/// Sink accepted by `Backend::export_session`
pub type ExportSink<'a> = dyn AsyncWrite + Unpin + Send + 'a;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name of the backend type (the registry token)
    fn kind(&self) -> &'static str;

    /// Allocate a fresh, unpersisted session. No I/O.
    fn new_session(&self, name: &str) -> Session {
        Session::new(name)
    }

    /// Persist a session that must not exist yet
    async fn create_session(&self, session: &mut Session) -> Result<()>;

    /// Insert or replace the whole aggregate
    ///
    /// `session.updated` is advanced to now before writing, so the caller's
    /// value matches what a later load returns.
    async fn save_session(&self, session: &mut Session) -> Result<()>;

    async fn load_session(&self, id: &SessionId) -> Result<Session>;

    /// Replace an existing session; `SessionNotFound` if it was never saved
    async fn update_session(&self, session: &mut Session) -> Result<()>;

    async fn delete_session(&self, id: &SessionId) -> Result<()>;

    /// All sessions, most recently updated first
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>>;

    /// Release held resources. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    async fn session_exists(&self, id: &SessionId) -> Result<bool> {
        match self.load_session(id).await {
            Ok(_) => Ok(true),
            Err(StorageError::SessionNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn export_session(&self, id: &SessionId, format: ExportFormat, writer: &mut ExportSink<'_>) -> Result<()> {
        let session = self.load_session(id).await?;
        export::write_session(&session, format, writer).await
    }

    async fn get_children(&self, id: &SessionId) -> Result<Vec<SessionInfo>> {
        branch::load_children(self, id).await
    }

    async fn get_branch_tree(&self, id: &SessionId) -> Result<BranchTree> {
        branch::build_branch_tree(self, id).await
    }

    /// Fork `parent_id` at `fork_index` and persist both sides
    ///
    /// The child is written before the parent; if the parent write fails the
    /// child exists without a back-link from the parent.
    async fn branch_session(&self, parent_id: &SessionId, fork_index: usize, name: Option<&str>) -> Result<Session> {
        let mut parent = self.load_session(parent_id).await?;
        let name = name.map(str::to_string).unwrap_or_else(|| branch::branch_name(&parent));
        let mut child = branch::fork(&parent, fork_index, name)?;

        self.save_session(&mut child).await?;
        parent.add_child(child.id.clone());
        self.save_session(&mut parent).await?;

        tracing::debug!(parent = %parent.id, child = %child.id, fork_index, "Created branch");
        Ok(child)
    }

    /// Merge `source_id`'s history into `target_id`
    async fn merge_sessions(
        &self,
        target_id: &SessionId,
        source_id: &SessionId,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let target = self.load_session(target_id).await?;
        let source = self.load_session(source_id).await?;
        let plan = branch::plan_merge(&target, &source, options)?;

        let mut updated_target = plan.target;
        let result = match plan.branch {
            Some(mut new_branch) => {
                self.save_session(&mut new_branch).await?;
                self.save_session(&mut updated_target).await?;
                MergeResult {
                    merged_count: plan.merged_count,
                    session_id: new_branch.id.clone(),
                    branch_id: Some(new_branch.id),
                }
            }
            None => {
                self.save_session(&mut updated_target).await?;
                MergeResult {
                    merged_count: plan.merged_count,
                    session_id: updated_target.id,
                    branch_id: None,
                }
            }
        };

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
