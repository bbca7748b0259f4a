//! Read-side projections: listings, search results and branch trees
//!
//! None of these are persisted; all are recomputed from `Session` values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::types::{Role, Session};

/// Listing projection of a session (no message bodies)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub message_count: usize,
    pub tags: Vec<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub parent_id: Option<SessionId>,
    pub child_count: usize,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            created: session.created,
            updated: session.updated,
            message_count: session.message_count(),
            tags: session.tags.clone(),
            model: session.conversation.model.clone(),
            provider: session.conversation.provider.clone(),
            parent_id: session.parent_id.clone(),
            child_count: session.child_ids.len(),
        }
    }
}

/// Sort listings newest-first by update time, breaking ties by ID
pub fn sort_by_recency(infos: &mut [SessionInfo]) {
    infos.sort_by(|a, b| b.updated.cmp(&a.updated).then_with(|| b.id.cmp(&a.id)));
}

/// Which field of a session a search hit came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Message,
    SystemPrompt,
    Name,
    Tag,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Message => "message",
            MatchKind::SystemPrompt => "system_prompt",
            MatchKind::Name => "name",
            MatchKind::Tag => "tag",
        }
    }
}

/// A single hit inside a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub kind: MatchKind,
    pub role: Option<Role>,
    pub snippet: String,
    pub context: String,
    /// 1-based message position for message hits
    pub position: Option<usize>,
}

/// A session together with every hit it produced
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub session: SessionInfo,
    pub matches: Vec<SearchMatch>,
}

/// A session and the branches forked from it, recursively
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchTree {
    pub session: SessionInfo,
    pub children: Vec<BranchTree>,
}

impl BranchTree {
    pub fn leaf(session: SessionInfo) -> Self {
        Self {
            session,
            children: Vec::new(),
        }
    }

    /// Number of levels, counting the root as 1
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(BranchTree::depth).max().unwrap_or(0)
    }

    /// Total number of sessions in the tree
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(BranchTree::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn find(&self, id: &SessionId) -> Option<&BranchTree> {
        if &self.session.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Indented one-line-per-session rendering
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, level: usize) {
        let indent = "  ".repeat(level);
        let marker = if level == 0 { "" } else { "└─ " };
        out.push_str(&format!(
            "{}{}{} ({}) [{} messages]\n",
            indent, marker, self.session.name, self.session.id, self.session.message_count
        ));
        for child in &self.children {
            child.render_into(out, level + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> SessionInfo {
        SessionInfo::from(&Session::new(name))
    }

    #[test]
    fn test_info_projection() {
        let mut session = Session::new("Demo");
        session.add_message(crate::types::Message::user("hi"));
        session.conversation.model = Some("gpt-4o".into());
        session.add_tag("x");
        let info = SessionInfo::from(&session);
        assert_eq!(info.message_count, 1);
        assert_eq!(info.model.as_deref(), Some("gpt-4o"));
        assert_eq!(info.tags, vec!["x"]);
    }

    #[test]
    fn test_tree_depth_and_find() {
        let c3 = BranchTree::leaf(info("c3"));
        let c3_id = c3.session.id.clone();
        let c1 = BranchTree {
            session: info("c1"),
            children: vec![c3],
        };
        let root = BranchTree {
            session: info("root"),
            children: vec![c1, BranchTree::leaf(info("c2"))],
        };
        assert_eq!(root.depth(), 3);
        assert_eq!(root.len(), 4);
        assert_eq!(root.find(&c3_id).unwrap().session.name, "c3");

        let rendered = root.render();
        assert!(rendered.starts_with("root ("));
        assert!(rendered.contains("    └─ c3"));
    }

    #[test]
    fn test_sort_by_recency() {
        let older = info("older");
        let mut newer = info("newer");
        newer.updated = older.updated + chrono::Duration::seconds(5);
        let mut list = vec![older, newer];
        sort_by_recency(&mut list);
        assert_eq!(list[0].name, "newer");
    }
}
