//! Session export to JSON, Markdown and plain text

use std::fmt::Write as _;
use std::str::FromStr;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StorageError};
use crate::types::{Attachment, Session};

/// Output format for `Backend::export_session`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
    Text,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "markdown",
            ExportFormat::Text => "text",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "md",
            ExportFormat::Text => "txt",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "text" | "txt" | "plain" => Ok(ExportFormat::Text),
            _ => Err(StorageError::UnsupportedFormat(s.to_string())),
        }
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Render a session in the given format
pub fn render(session: &Session, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(session)
            .map_err(|e| StorageError::serialization(format!("Failed to export session {}", session.id), e)),
        ExportFormat::Markdown => Ok(render_markdown(session)),
        ExportFormat::Text => Ok(render_text(session)),
    }
}

/// Render and write to an async sink, flushing at the end
pub async fn write_session<W>(session: &Session, format: ExportFormat, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let rendered = render(session, format)?;
    let target = format!("<export of {}>", session.id);
    writer
        .write_all(rendered.as_bytes())
        .await
        .map_err(|e| StorageError::io(&target, e))?;
    writer.flush().await.map_err(|e| StorageError::io(&target, e))?;
    Ok(())
}

fn model_label(session: &Session) -> Option<String> {
    let conv = &session.conversation;
    match (&conv.provider, &conv.model) {
        (Some(provider), Some(model)) => Some(format!("{}/{}", provider, model)),
        (None, Some(model)) => Some(model.clone()),
        (Some(provider), None) => Some(provider.clone()),
        (None, None) => None,
    }
}

fn describe_attachment(attachment: &Attachment) -> String {
    let mut line = format!("{} ({}, {} bytes)", attachment.name, attachment.mime_type, attachment.size);
    if let Some(url) = &attachment.url {
        let _ = write!(line, " <{}>", url);
    }
    line
}

fn render_markdown(session: &Session) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Session: {}", session.name);
    out.push('\n');
    let _ = writeln!(out, "- **ID:** {}", session.id);
    let _ = writeln!(out, "- **Created:** {}", session.created.format(TIMESTAMP_FORMAT));
    let _ = writeln!(out, "- **Updated:** {}", session.updated.format(TIMESTAMP_FORMAT));
    if let Some(model) = model_label(session) {
        let _ = writeln!(out, "- **Model:** {}", model);
    }
    if !session.tags.is_empty() {
        let _ = writeln!(out, "- **Tags:** {}", session.tags.join(", "));
    }
    if let Some(parent) = &session.parent_id {
        let _ = writeln!(out, "- **Branched from:** {}", parent);
    }
    let _ = writeln!(out, "- **Messages:** {}", session.message_count());

    if let Some(prompt) = &session.conversation.system_prompt {
        out.push_str("\n## System Prompt\n\n");
        let _ = writeln!(out, "{}", prompt);
    }

    out.push_str("\n## Conversation\n");
    for message in session.messages() {
        let _ = writeln!(out, "\n### {}", message.role.label());
        let _ = writeln!(out, "*{}*\n", message.timestamp.format(TIMESTAMP_FORMAT));
        let _ = writeln!(out, "{}", message.content);
        if !message.attachments.is_empty() {
            out.push_str("\nAttachments:\n");
            for attachment in &message.attachments {
                let _ = writeln!(out, "- {}", describe_attachment(attachment));
            }
        }
    }
    out
}

fn render_text(session: &Session) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Session: {}", session.name);
    let _ = writeln!(out, "ID: {}", session.id);
    let _ = writeln!(out, "Created: {}", session.created.format(TIMESTAMP_FORMAT));
    if let Some(model) = model_label(session) {
        let _ = writeln!(out, "Model: {}", model);
    }
    if !session.tags.is_empty() {
        let _ = writeln!(out, "Tags: {}", session.tags.join(", "));
    }
    if let Some(prompt) = &session.conversation.system_prompt {
        let _ = writeln!(out, "System: {}", prompt);
    }
    out.push('\n');

    for message in session.messages() {
        let _ = writeln!(
            out,
            "[{}] {}: {}",
            message.timestamp.format(TIMESTAMP_FORMAT),
            message.role.label(),
            message.content
        );
        for attachment in &message.attachments {
            let _ = writeln!(out, "  attachment: {}", describe_attachment(attachment));
        }
    }
    out
}
