//! Session aggregate and its conversation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::types::{Message, Metadata};

/// Ordered chat transcript plus the generation settings last used for it
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Conversation {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Copy of everything except the transcript
    pub fn settings_only(&self) -> Self {
        Self {
            messages: Vec::new(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.clone(),
        }
    }
}

/// Root aggregate: one conversation thread plus its branch links
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub config: Metadata,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub conversation: Conversation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    #[serde(default)]
    pub child_ids: Vec<SessionId>,
}

impl Session {
    /// Fresh, unpersisted session with a new ID
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.into(),
            created: now,
            updated: now,
            config: Metadata::new(),
            metadata: Metadata::new(),
            tags: Vec::new(),
            conversation: Conversation::default(),
            parent_id: None,
            child_ids: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    pub fn message_count(&self) -> usize {
        self.conversation.messages.len()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.conversation.messages.last()
    }

    pub fn add_message(&mut self, message: Message) {
        self.conversation.messages.push(message);
    }

    pub fn clear_messages(&mut self) {
        self.conversation.messages.clear();
    }

    /// Add a tag, keeping insertion order. Returns false if already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        if self.tags.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        self.tags.len() != before
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Record a child branch. Self-links and duplicates are ignored.
    pub fn add_child(&mut self, child_id: SessionId) -> bool {
        if child_id == self.id || self.child_ids.contains(&child_id) {
            return false;
        }
        self.child_ids.push(child_id);
        true
    }

    pub fn is_branch(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Advance `updated` to now, never moving it before `created`
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated = now.max(self.created);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_empty() {
        let session = Session::new("Demo");
        assert_eq!(session.name, "Demo");
        assert_eq!(session.created, session.updated);
        assert!(session.conversation.is_empty());
        assert!(session.tags.is_empty());
        assert!(session.metadata.is_empty());
        assert!(session.config.is_empty());
        assert!(session.parent_id.is_none());
    }

    #[test]
    fn test_tags_are_an_ordered_set() {
        let mut session = Session::new("t");
        assert!(session.add_tag("rust"));
        assert!(session.add_tag("llm"));
        assert!(!session.add_tag("rust"));
        assert_eq!(session.tags, vec!["rust", "llm"]);
        assert!(session.remove_tag("rust"));
        assert!(!session.has_tag("rust"));
    }

    #[test]
    fn test_child_ids_reject_self_and_duplicates() {
        let mut session = Session::new("p");
        let own = session.id.clone();
        assert!(!session.add_child(own));

        let child = SessionId::new();
        assert!(session.add_child(child.clone()));
        assert!(!session.add_child(child));
        assert_eq!(session.child_ids.len(), 1);
    }

    #[test]
    fn test_touch_keeps_updated_after_created() {
        let mut session = Session::new("t");
        session.touch();
        assert!(session.updated >= session.created);
    }

    #[test]
    fn test_json_shape() {
        let mut session = Session::new("Demo");
        session.add_message(Message::user("Hello"));
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["name"], "Demo");
        assert_eq!(json["conversation"]["messages"][0]["role"], "user");
        assert!(json["child_ids"].as_array().unwrap().is_empty());
    }
}
