//! Import/export wire types.
//!
//! Export lines are serialized [`crate::types::Task`] values, one per line.
//! Import accepts a looser record shape so that per-record validation failures
//! can be reported structurally instead of failing the whole stream.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Behavior when an imported record's id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupePolicy {
    #[default]
    Skip,
    Overwrite,
    Error,
}

impl DedupePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Overwrite => "overwrite",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "overwrite" => Ok(Self::Overwrite),
            "error" => Ok(Self::Error),
            other => Err(Error::invalid(format!("invalid dedupe policy: {other}"))),
        }
    }
}

/// Behavior when a dep's parent cannot be resolved at import time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanHandling {
    Strict,
    #[default]
    Lenient,
}

impl OrphanHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Lenient => "lenient",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(Error::invalid(format!("invalid orphan handling: {other}"))),
        }
    }
}

/// Knobs for one import run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub dedupe: DedupePolicy,
    pub orphans: OrphanHandling,
    pub dry_run: bool,
    /// Apply records line by line instead of parsing the whole input first.
    pub stream: bool,
}

/// A dep entry as it appears on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDep {
    pub parent_id: String,
    #[serde(rename = "type", default)]
    pub dep_type: Option<String>,
}

/// One import line. Field values are kept loose (strings, raw ints) so that
/// invalid values surface as per-record structured errors rather than stream
/// parse failures.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub spec_id: Option<String>,
    #[serde(default)]
    pub source_repo: Option<String>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub custom: Option<BTreeMap<String, String>>,
    /// `None` preserves existing edges on overwrite; `Some([])` clears them.
    #[serde(default)]
    pub deps: Option<Vec<RawDep>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Result of one import run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub created: u64,
    pub skipped: u64,
    pub errors: u64,
    pub messages: Vec<String>,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_policy_parse() {
        assert_eq!(DedupePolicy::parse("skip").unwrap(), DedupePolicy::Skip);
        assert_eq!(
            DedupePolicy::parse(" OVERWRITE ").unwrap(),
            DedupePolicy::Overwrite
        );
        assert!(DedupePolicy::parse("merge").is_err());
    }

    #[test]
    fn orphan_handling_parse() {
        assert_eq!(
            OrphanHandling::parse("strict").unwrap(),
            OrphanHandling::Strict
        );
        assert!(OrphanHandling::parse("loose").is_err());
    }

    #[test]
    fn record_distinguishes_absent_and_empty_deps() {
        let absent: ImportRecord = serde_json::from_str(r#"{"id":"gr-ab12"}"#).unwrap();
        assert!(absent.deps.is_none());

        let empty: ImportRecord = serde_json::from_str(r#"{"id":"gr-ab12","deps":[]}"#).unwrap();
        assert_eq!(empty.deps.as_deref(), Some(&[][..]));
    }

    #[test]
    fn record_parses_export_shape() {
        let line = r#"{"id":"gr-ab12","title":"T","type":"bug","status":"closed","priority":3,
            "labels":["a"],"custom":{"env":"prod"},
            "deps":[{"parent_id":"gr-cd34","type":"blocks"}],
            "created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-02T00:00:00Z",
            "closed_at":"2026-01-02T00:00:00Z"}"#;
        let rec: ImportRecord = serde_json::from_str(line).unwrap();
        assert_eq!(rec.id, "gr-ab12");
        assert_eq!(rec.status.as_deref(), Some("closed"));
        assert_eq!(rec.deps.as_ref().unwrap()[0].parent_id, "gr-cd34");
        assert!(rec.closed_at.is_some());
    }
}
