//! Shared domain layer for the grns task graph service.
//!
//! Holds the types, canonicalization rules, error taxonomy, and
//! import/export record shapes used by both the daemon and the CLI.

pub mod canon;
pub mod error;
pub mod transfer;
pub mod types;

pub use error::{Error, ErrorBody, Result};
pub use types::{
    DepEdge, GitObjectType, GitRef, GitRefId, Task, TaskId, TaskStatus, TaskType,
    DEP_TYPE_BLOCKS, RELATION_CLOSED_BY,
};

/// Default two-letter project prefix.
pub const DEFAULT_PROJECT_PREFIX: &str = "gr";

/// Validate a project prefix (two lowercase ASCII letters).
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.len() == 2 && prefix.bytes().all(|b| b.is_ascii_lowercase()) {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "invalid project prefix: {prefix} (expected two lowercase letters)"
        )))
    }
}
