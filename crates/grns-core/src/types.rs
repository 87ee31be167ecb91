//! Core domain types for the task graph service.
//!
//! Everything that crosses the HTTP boundary or the import/export stream is
//! defined here so the daemon and the CLI agree on one wire shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of the random id suffix (`gr-ab12` -> `ab12`).
pub const ID_SUFFIX_LEN: usize = 4;

fn random_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

fn is_valid_suffix(s: &str) -> bool {
    s.len() == ID_SUFFIX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}

/// Task identifier of the form `<2-letter prefix>-<4 base36 chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Parse a client-supplied id, rejecting anything that does not match
    /// `^[a-z]{2}-[0-9a-z]{4}$`.
    pub fn parse(s: &str) -> Result<Self> {
        let (prefix, suffix) = s
            .split_once('-')
            .ok_or_else(|| Error::invalid(format!("invalid id: {s}")))?;
        if prefix.len() == 2
            && prefix.bytes().all(|b| b.is_ascii_lowercase())
            && is_valid_suffix(suffix)
        {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::invalid(format!("invalid id: {s}")))
        }
    }

    /// Generate a fresh id under the given project prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", random_suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Git reference identifier (`gf-<4 base36 chars>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GitRefId(String);

impl GitRefId {
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('-') {
            Some(("gf", suffix)) if is_valid_suffix(suffix) => Ok(Self(s.to_string())),
            _ => Err(Error::invalid(format!("invalid git ref id: {s}"))),
        }
    }

    pub fn generate() -> Self {
        Self(format!("gf-{}", random_suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GitRefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for GitRefId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
    Pinned,
    Tombstone,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
            Self::Pinned => "pinned",
            Self::Tombstone => "tombstone",
        }
    }

    /// Parse with trim + lowercase normalization.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "deferred" => Ok(Self::Deferred),
            "closed" => Ok(Self::Closed),
            "pinned" => Ok(Self::Pinned),
            "tombstone" => Ok(Self::Tombstone),
            other => Err(Error::invalid(format!("invalid status: {other}"))),
        }
    }
}

/// Task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Chore => "chore",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            "task" => Ok(Self::Task),
            "epic" => Ok(Self::Epic),
            "chore" => Ok(Self::Chore),
            other => Err(Error::invalid(format!("invalid type: {other}"))),
        }
    }
}

/// Git object kind a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitObjectType {
    Commit,
    Tag,
    Branch,
    Path,
    Blob,
    Tree,
}

impl GitObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tag => "tag",
            Self::Branch => "branch",
            Self::Path => "path",
            Self::Blob => "blob",
            Self::Tree => "tree",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            "branch" => Ok(Self::Branch),
            "path" => Ok(Self::Path),
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            other => Err(Error::invalid(format!("invalid object type: {other}"))),
        }
    }

    /// Hash-valued object types share commit validation rules.
    pub fn is_hash(&self) -> bool {
        matches!(self, Self::Commit | Self::Blob | Self::Tree)
    }
}

/// Relation between a task and a git object. Fixed built-ins plus
/// `x-<suffix>` extensions.
pub const BUILTIN_RELATIONS: &[&str] = &[
    "design_doc",
    "implements",
    "fix_commit",
    "closed_by",
    "introduced_by",
    "related",
];

/// Relation used by close-with-commit annotations.
pub const RELATION_CLOSED_BY: &str = "closed_by";

/// Single dependency edge kind in scope.
pub const DEP_TYPE_BLOCKS: &str = "blocks";

/// A directed dependency edge: the parent blocks the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepEdge {
    pub parent_id: TaskId,
    #[serde(rename = "type", default = "default_dep_type")]
    pub dep_type: String,
}

fn default_dep_type() -> String {
    DEP_TYPE_BLOCKS.to_string()
}

impl DepEdge {
    pub fn blocks(parent_id: TaskId) -> Self {
        Self {
            parent_id,
            dep_type: default_dep_type(),
        }
    }
}

/// A task with its owned labels and dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,
    /// Always sorted, deduplicated, lowercase.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Free-form string map. Preserved byte-for-byte, never indexed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
    #[serde(default)]
    pub deps: Vec<DepEdge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A git reference attached to one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitRef {
    pub id: GitRefId,
    pub task_id: TaskId,
    /// Canonical `host/owner/name` slug.
    pub repo: String,
    pub relation: String,
    pub object_type: GitObjectType,
    pub object_value: String,
    /// Empty string when the reference is not pinned to a commit.
    #[serde(default)]
    pub resolved_commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_parse_accepts_valid() {
        assert!(TaskId::parse("gr-ab12").is_ok());
        assert!(TaskId::parse("xy-0000").is_ok());
    }

    #[test]
    fn task_id_parse_rejects_invalid() {
        for bad in ["", "gr-", "gr-ABCD", "g-ab12", "grr-ab12", "gr-ab123", "gr_ab12", "GR-ab12"] {
            assert!(TaskId::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn generated_ids_match_format() {
        for _ in 0..50 {
            let id = TaskId::generate("gr");
            assert!(TaskId::parse(id.as_str()).is_ok(), "bad id {id}");
        }
    }

    #[test]
    fn git_ref_id_roundtrip() {
        let id = GitRefId::generate();
        assert!(GitRefId::parse(id.as_str()).is_ok());
        assert!(GitRefId::parse("gr-ab12").is_err());
    }

    #[test]
    fn status_parse_normalizes_case() {
        assert_eq!(TaskStatus::parse("  CLOSED ").unwrap(), TaskStatus::Closed);
        assert_eq!(
            TaskStatus::parse("In_Progress").unwrap(),
            TaskStatus::InProgress
        );
        assert!(TaskStatus::parse("done").is_err());
    }

    #[test]
    fn type_parse_normalizes_case() {
        assert_eq!(TaskType::parse("BUG").unwrap(), TaskType::Bug);
        assert!(TaskType::parse("nope").is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn dep_edge_defaults_to_blocks() {
        let edge: DepEdge = serde_json::from_str(r#"{"parent_id":"gr-ab12"}"#).unwrap();
        assert_eq!(edge.dep_type, DEP_TYPE_BLOCKS);
    }
}
