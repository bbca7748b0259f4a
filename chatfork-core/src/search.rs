//! Substring search and snippet extraction
//!
//! Shared by every backend. Backends without an index run `search_sessions`
//! over everything they store; indexed backends use their index only to
//! pick candidates and still run the same matcher, so hits look identical.

use crate::types::{MatchKind, SearchMatch, SearchResult, Session, SessionInfo};

/// Default number of characters shown on each side of a hit
pub const DEFAULT_CONTEXT_RADIUS: usize = 50;

/// How far a snippet edge may move outward looking for a word boundary
const MAX_BOUNDARY_NUDGE: usize = 15;

/// A search request
#[derive(Clone, Debug, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub context_radius: usize,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context_radius: DEFAULT_CONTEXT_RADIUS,
            limit: None,
        }
    }

    pub fn with_context_radius(mut self, radius: usize) -> Self {
        self.context_radius = radius;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Blank queries never match anything
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

impl From<&str> for SearchQuery {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

fn is_word_boundary(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '.' | ',' | ';' | ':' | '!' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '"' | '\''
        )
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Char index of the first case-insensitive occurrence of `needle`
fn find_ignore_case(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&start| {
        haystack[start..start + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| chars_eq_ignore_case(*a, *b))
    })
}

/// Case-insensitive substring test
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    let haystack: Vec<char> = haystack.chars().collect();
    let needle: Vec<char> = needle.chars().collect();
    find_ignore_case(&haystack, &needle).is_some()
}

/// Excerpt of `content` around the first occurrence of `query`
///
/// Returns `None` when the query does not occur.
pub fn extract_snippet(content: &str, query: &str, radius: usize) -> Option<String> {
    let chars: Vec<char> = content.chars().collect();
    let needle: Vec<char> = query.chars().collect();
    let hit = find_ignore_case(&chars, &needle)?;

    let mut start = hit.saturating_sub(radius);
    let mut end = hit.saturating_add(needle.len()).saturating_add(radius).min(chars.len());

    if start > 0 {
        let floor = start.saturating_sub(MAX_BOUNDARY_NUDGE);
        let mut probe = start;
        while probe > floor && !is_word_boundary(chars[probe - 1]) {
            probe -= 1;
        }
        if probe == 0 || is_word_boundary(chars[probe - 1]) {
            start = probe;
        }
    }
    if end < chars.len() {
        let ceiling = (end + MAX_BOUNDARY_NUDGE).min(chars.len());
        let mut probe = end;
        while probe < ceiling && !is_word_boundary(chars[probe]) {
            probe += 1;
        }
        if probe == chars.len() || is_word_boundary(chars[probe]) {
            end = probe;
        }
    }

    let body: String = chars[start..end].iter().collect();
    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(body.trim());
    if end < chars.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

/// Every hit in one session, in field order: system prompt, messages, name, tags
pub fn match_session(session: &Session, query: &SearchQuery) -> Vec<SearchMatch> {
    let mut matches = Vec::new();
    if query.is_blank() {
        return matches;
    }
    let text = query.text.as_str();
    let radius = query.context_radius;

    if let Some(prompt) = &session.conversation.system_prompt {
        if let Some(snippet) = extract_snippet(prompt, text, radius) {
            matches.push(SearchMatch {
                kind: MatchKind::SystemPrompt,
                role: None,
                snippet,
                context: "System prompt".to_string(),
                position: None,
            });
        }
    }

    for (index, message) in session.messages().iter().enumerate() {
        if let Some(snippet) = extract_snippet(&message.content, text, radius) {
            let position = index + 1;
            matches.push(SearchMatch {
                kind: MatchKind::Message,
                role: Some(message.role),
                snippet,
                context: format!("Message {} ({})", position, message.role),
                position: Some(position),
            });
        }
    }

    if let Some(snippet) = extract_snippet(&session.name, text, radius) {
        matches.push(SearchMatch {
            kind: MatchKind::Name,
            role: None,
            snippet,
            context: "Session name".to_string(),
            position: None,
        });
    }

    for tag in &session.tags {
        if contains_ignore_case(tag, text) {
            matches.push(SearchMatch {
                kind: MatchKind::Tag,
                role: None,
                snippet: tag.clone(),
                context: format!("Tag: {}", tag),
                position: None,
            });
        }
    }

    matches
}

/// Run the matcher over a set of sessions, dropping sessions without hits
///
/// Results are ordered like listings (most recently updated first) and
/// truncated to the query limit.
pub fn search_sessions<'a>(
    sessions: impl IntoIterator<Item = &'a Session>,
    query: &SearchQuery,
) -> Vec<SearchResult> {
    if query.is_blank() {
        return Vec::new();
    }

    let mut results: Vec<SearchResult> = sessions
        .into_iter()
        .filter_map(|session| {
            let matches = match_session(session, query);
            if matches.is_empty() {
                None
            } else {
                Some(SearchResult {
                    session: SessionInfo::from(session),
                    matches,
                })
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.session
            .updated
            .cmp(&a.session.updated)
            .then_with(|| b.session.id.cmp(&a.session.id))
    });

    if let Some(limit) = query.limit {
        results.truncate(limit);
    }
    results
}
