//! Merge configuration and outcome

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::SessionId;

/// Reconciliation policy for combining two histories
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeType {
    /// Append every source message after the target's messages
    #[default]
    Continuation,
    /// Append only source messages the target does not already contain
    Append,
}

impl MergeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeType::Continuation => "continuation",
            MergeType::Append => "append",
        }
    }
}

impl fmt::Display for MergeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuation" | "continue" => Ok(MergeType::Continuation),
            "append" => Ok(MergeType::Append),
            other => Err(format!("Unknown merge type: {}", other)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub merge_type: MergeType,
    /// Write the merged history to a new branch of the target instead of
    /// mutating the target
    pub create_branch: bool,
    pub branch_name: Option<String>,
}

impl MergeOptions {
    pub fn continuation() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, merge_type: MergeType) -> Self {
        self.merge_type = merge_type;
        self
    }

    pub fn into_branch(mut self, name: Option<String>) -> Self {
        self.create_branch = true;
        self.branch_name = name;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub merged_count: usize,
    /// Session that now holds the merged history
    pub session_id: SessionId,
    /// Set when the merge produced a new branch
    pub branch_id: Option<SessionId>,
}
