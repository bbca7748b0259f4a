//! Message and attachment types
//!
//! A message is immutable once appended to a conversation; only its
//! metadata may be enriched afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::MessageId;
use crate::types::Metadata;

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Capitalized label used in exports
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("Invalid role: {}", other)),
        }
    }
}

/// Kind of content an attachment carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    File,
    Image,
    Text,
    Audio,
    Video,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::File => "file",
            AttachmentKind::Image => "image",
            AttachmentKind::Text => "text",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
        }
    }
}

/// A file, image or other payload attached to a message
///
/// Either `url` or `content` (or both) locate the payload. Inline bytes are
/// serialized as base64 so the JSON document stays valid UTF-8.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub content: Option<Vec<u8>>,
    pub mime_type: String,
    pub name: String,
    pub size: u64,
}

impl Attachment {
    /// Attachment with inline content; size is taken from the bytes
    pub fn inline(
        kind: AttachmentKind,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            url: None,
            size: content.len() as u64,
            content: Some(content),
            mime_type: mime_type.into(),
            name: name.into(),
        }
    }

    /// Attachment that only points at a URL
    pub fn linked(
        kind: AttachmentKind,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        url: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            kind,
            url: Some(url.into()),
            content: None,
            mime_type: mime_type.into(),
            name: name.into(),
            size,
        }
    }
}

/// One entry of a conversation transcript
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata is the only part of a message that may change after append
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// serde adapter: `Option<Vec<u8>>` <-> base64 string
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
        assert_eq!(Role::User.label(), "User");
    }

    #[test]
    fn test_inline_attachment_is_base64_in_json() {
        let msg = Message::user("see file").with_attachment(Attachment::inline(
            AttachmentKind::Text,
            "notes.txt",
            "text/plain",
            b"hi".to_vec(),
        ));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["attachments"][0]["content"], "aGk=");
        assert_eq!(json["attachments"][0]["size"], 2);

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_linked_attachment_omits_content() {
        let att = Attachment::linked(AttachmentKind::Image, "cat.png", "image/png", "https://x/cat.png", 10);
        let json = serde_json::to_value(&att).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["kind"], "image");
    }
}
