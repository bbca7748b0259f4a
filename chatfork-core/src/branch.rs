//! Branch and merge engine
//!
//! Works purely on the data model. Anything that has to touch storage goes
//! through the `Backend` load/save primitives, so every backend gets the same
//! branching and merging behavior.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::json;

use crate::backend::Backend;
use crate::error::{Result, StorageError};
use crate::ids::{MessageId, SessionId};
use crate::types::{BranchTree, MergeOptions, MergeType, Message, Session, SessionInfo};

/// Metadata key recording where a branch was forked
pub const FORK_INDEX_KEY: &str = "fork_index";
/// Metadata key on merged messages naming the session they came from
pub const MERGED_FROM_KEY: &str = "merged_from";
/// Metadata key on merged messages holding the ID they had in the source
pub const ORIGINAL_MESSAGE_KEY: &str = "original_message_id";

/// Create a child session sharing `parent`'s first `fork_index` messages
///
/// The child gets copies of the messages, so later appends to either side
/// stay independent. The parent is not modified; linking it is the caller's
/// job (see `Backend::branch_session`).
pub fn fork(parent: &Session, fork_index: usize, name: impl Into<String>) -> Result<Session> {
    if fork_index > parent.message_count() {
        return Err(StorageError::InvalidBranch(format!(
            "fork index {} is past the end of session {} ({} messages)",
            fork_index,
            parent.id,
            parent.message_count()
        )));
    }

    let mut child = Session::new(name);
    child.conversation = parent.conversation.settings_only();
    child.conversation.messages = parent.messages()[..fork_index].to_vec();
    child.config = parent.config.clone();
    child.tags = parent.tags.clone();
    child.parent_id = Some(parent.id.clone());
    child.metadata.insert(FORK_INDEX_KEY.to_string(), json!(fork_index));
    Ok(child)
}

/// Default name for a branch of `parent`
pub fn branch_name(parent: &Session) -> String {
    format!("{} (branch)", parent.name)
}

/// Load a branch tree rooted at `root_id`
///
/// Children that fail to load are skipped, and IDs already placed in the tree
/// are not visited twice, so dangling or cyclic links never fail the call.
pub async fn build_branch_tree<B>(backend: &B, root_id: &SessionId) -> Result<BranchTree>
where
    B: Backend + ?Sized,
{
    let root = backend.load_session(root_id).await?;
    let root_key = root.id.clone();

    let mut nodes: HashMap<SessionId, (SessionInfo, Vec<SessionId>)> = HashMap::new();
    let mut visited: HashSet<SessionId> = HashSet::from([root.id.clone()]);
    let mut pending = vec![root];

    while let Some(session) = pending.pop() {
        let mut children = Vec::new();
        for child_id in &session.child_ids {
            if !visited.insert(child_id.clone()) {
                tracing::warn!(session = %session.id, child = %child_id, "Skipping repeated branch link");
                continue;
            }
            match backend.load_session(child_id).await {
                Ok(child) => {
                    children.push(child.id.clone());
                    pending.push(child);
                }
                Err(e) => {
                    tracing::debug!(parent = %session.id, child = %child_id, error = %e, "Skipping unreachable branch");
                }
            }
        }
        nodes.insert(session.id.clone(), (SessionInfo::from(&session), children));
    }

    assemble(&root_key, &mut nodes).ok_or_else(|| StorageError::BranchNotFound(root_id.clone()))
}

fn assemble(id: &SessionId, nodes: &mut HashMap<SessionId, (SessionInfo, Vec<SessionId>)>) -> Option<BranchTree> {
    let (info, child_ids) = nodes.remove(id)?;
    Some(BranchTree {
        session: info,
        children: child_ids.iter().filter_map(|child| assemble(child, nodes)).collect(),
    })
}

/// Load the direct children of `parent_id`, skipping dangling links
pub async fn load_children<B>(backend: &B, parent_id: &SessionId) -> Result<Vec<SessionInfo>>
where
    B: Backend + ?Sized,
{
    let parent = backend.load_session(parent_id).await?;
    let mut children = Vec::with_capacity(parent.child_ids.len());
    for child_id in &parent.child_ids {
        match backend.load_session(child_id).await {
            Ok(child) => children.push(SessionInfo::from(&child)),
            Err(e) => {
                tracing::debug!(parent = %parent_id, child = %child_id, error = %e, "Skipping unreachable branch");
            }
        }
    }
    Ok(children)
}

fn provenance_copy(message: &Message, source_id: &SessionId) -> Message {
    let mut copy = message.clone();
    let original = message
        .metadata
        .get(ORIGINAL_MESSAGE_KEY)
        .cloned()
        .unwrap_or_else(|| json!(message.id.as_str()));
    copy.id = MessageId::new();
    copy.metadata.insert(MERGED_FROM_KEY.to_string(), json!(source_id.as_str()));
    copy.metadata.insert(ORIGINAL_MESSAGE_KEY.to_string(), original);
    copy
}

/// IDs a message is known by: its own and, for merged copies, the original
fn known_ids(message: &Message) -> impl Iterator<Item = String> + '_ {
    std::iter::once(message.id.as_str().to_string()).chain(
        message
            .metadata
            .get(ORIGINAL_MESSAGE_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string),
    )
}

/// Reconcile `source` into a copy of `target`
///
/// Returns the merged session (same ID as `target`) and the number of
/// messages taken from `source`. Overlapping edits on a shared ancestor are
/// concatenated; there is no three-way merge.
pub fn merge_histories(target: &Session, source: &Session, merge_type: MergeType) -> (Session, usize) {
    let mut merged = target.clone();

    let incoming: Vec<&Message> = match merge_type {
        MergeType::Continuation => source.messages().iter().collect(),
        MergeType::Append => {
            let present: HashSet<String> = target.messages().iter().flat_map(known_ids).collect();
            source
                .messages()
                .iter()
                .filter(|m| !known_ids(m).any(|id| present.contains(&id)))
                .collect()
        }
    };

    let count = incoming.len();
    for message in incoming {
        merged.add_message(provenance_copy(message, &source.id));
    }
    (merged, count)
}

/// Build the session a merge writes to
///
/// Without `create_branch` this is the mutated target. With it, a new branch
/// of the target carries target history plus merged messages, and the target
/// itself only gains the child link.
pub fn plan_merge(target: &Session, source: &Session, options: &MergeOptions) -> Result<MergePlan> {
    if target.id == source.id {
        return Err(StorageError::MergeConflict(format!(
            "cannot merge session {} into itself",
            target.id
        )));
    }

    let (merged, merged_count) = merge_histories(target, source, options.merge_type);

    if !options.create_branch {
        return Ok(MergePlan {
            target: merged,
            branch: None,
            merged_count,
        });
    }

    let name = options
        .branch_name
        .clone()
        .unwrap_or_else(|| format!("{} + {}", target.name, source.name));
    let mut branch = fork(target, target.message_count(), name)?;
    branch.conversation.messages = merged.conversation.messages;
    branch.metadata.insert(MERGED_FROM_KEY.to_string(), json!(source.id.as_str()));
    branch.metadata.insert("merged_at".to_string(), json!(Utc::now().to_rfc3339()));

    let mut target = target.clone();
    target.add_child(branch.id.clone());

    Ok(MergePlan {
        target,
        branch: Some(branch),
        merged_count,
    })
}

/// Sessions to persist for a merge
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub target: Session,
    pub branch: Option<Session>,
    pub merged_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn session_with(name: &str, contents: &[&str]) -> Session {
        let mut session = Session::new(name);
        for (i, text) in contents.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            session.add_message(Message::new(role, *text));
        }
        session
    }

    fn contents(session: &Session) -> Vec<&str> {
        session.messages().iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_fork_copies_prefix() {
        let mut parent = session_with("p", &["a", "b", "c"]);
        parent.conversation.model = Some("m".into());
        parent.conversation.system_prompt = Some("be brief".into());
        parent.add_tag("t");

        for k in 0..=3 {
            let child = fork(&parent, k, "child").unwrap();
            assert_eq!(child.message_count(), k);
            assert_eq!(child.messages(), &parent.messages()[..k]);
            assert_eq!(child.parent_id.as_ref(), Some(&parent.id));
            assert_eq!(child.conversation.model.as_deref(), Some("m"));
            assert_eq!(child.conversation.system_prompt.as_deref(), Some("be brief"));
            assert_eq!(child.tags, vec!["t"]);
            assert_eq!(child.metadata[FORK_INDEX_KEY], json!(k));
            assert_ne!(child.id, parent.id);
        }
    }

    #[test]
    fn test_fork_past_end_is_invalid() {
        let parent = session_with("p", &["a"]);
        let err = fork(&parent, 2, "child").unwrap_err();
        assert!(matches!(err, StorageError::InvalidBranch(_)));
    }

    #[test]
    fn test_fork_is_not_live_shared() {
        let mut parent = session_with("p", &["a", "b"]);
        let mut child = fork(&parent, 2, "child").unwrap();
        child.add_message(Message::user("child only"));
        parent.add_message(Message::user("parent only"));
        assert_eq!(contents(&child), vec!["a", "b", "child only"]);
        assert_eq!(contents(&parent), vec!["a", "b", "parent only"]);
    }

    #[test]
    fn test_continuation_concatenates() {
        let target = session_with("t", &["A", "B"]);
        let source = session_with("s", &["C", "D"]);
        let (merged, count) = merge_histories(&target, &source, MergeType::Continuation);
        assert_eq!(count, 2);
        assert_eq!(merged.id, target.id);
        assert_eq!(contents(&merged), vec!["A", "B", "C", "D"]);

        let copied = &merged.messages()[2];
        assert_ne!(copied.id, source.messages()[0].id);
        assert_eq!(copied.metadata[MERGED_FROM_KEY], json!(source.id.as_str()));
        assert_eq!(copied.metadata[ORIGINAL_MESSAGE_KEY], json!(source.messages()[0].id.as_str()));
    }

    #[test]
    fn test_continuation_duplicates_shared_ancestry() {
        let root = session_with("root", &["A", "B"]);
        let mut left = fork(&root, 2, "left").unwrap();
        left.add_message(Message::user("L"));
        let mut right = fork(&root, 2, "right").unwrap();
        right.add_message(Message::user("R"));

        let (merged, count) = merge_histories(&left, &right, MergeType::Continuation);
        assert_eq!(count, 3);
        assert_eq!(contents(&merged), vec!["A", "B", "L", "A", "B", "R"]);
    }

    #[test]
    fn test_append_skips_shared_ancestry() {
        let root = session_with("root", &["A", "B"]);
        let mut left = fork(&root, 2, "left").unwrap();
        left.add_message(Message::user("L"));
        let mut right = fork(&root, 2, "right").unwrap();
        right.add_message(Message::user("R"));

        let (merged, count) = merge_histories(&left, &right, MergeType::Append);
        assert_eq!(count, 1);
        assert_eq!(contents(&merged), vec!["A", "B", "L", "R"]);

        // Merging again finds nothing new, even through the merged copy's new ID
        let (again, count) = merge_histories(&merged, &right, MergeType::Append);
        assert_eq!(count, 0);
        assert_eq!(again.message_count(), 4);
    }

    #[test]
    fn test_plan_merge_into_branch_leaves_target_history() {
        let target = session_with("t", &["A", "B"]);
        let source = session_with("s", &["C"]);
        let options = MergeOptions::continuation().into_branch(Some("merged".into()));

        let plan = plan_merge(&target, &source, &options).unwrap();
        let branch = plan.branch.unwrap();
        assert_eq!(plan.merged_count, 1);
        assert_eq!(branch.name, "merged");
        assert_eq!(contents(&branch), vec!["A", "B", "C"]);
        assert_eq!(branch.parent_id.as_ref(), Some(&target.id));
        assert_eq!(contents(&plan.target), vec!["A", "B"]);
        assert_eq!(plan.target.child_ids, vec![branch.id.clone()]);
    }

    #[test]
    fn test_plan_merge_rejects_self_merge() {
        let target = session_with("t", &["A"]);
        let err = plan_merge(&target, &target.clone(), &MergeOptions::default()).unwrap_err();
        assert!(matches!(err, StorageError::MergeConflict(_)));
    }
}
