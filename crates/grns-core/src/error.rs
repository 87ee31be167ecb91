//! Error taxonomy shared by the daemon and the CLI.
//!
//! Every failure that crosses the HTTP boundary is one of four kinds, rendered
//! as `{error, code, error_code}`. The `code` strings and `error_code`
//! integers are part of the wire contract and must never change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Canonicalization or validation failure.
    #[error("{0}")]
    InvalidArgument(String),
    /// Target task, git ref, or dependency parent does not exist.
    #[error("{0}")]
    NotFound(String),
    /// Unique-key violation (duplicate task id, duplicate git-ref key).
    #[error("{0}")]
    Conflict(String),
    /// Unexpected store or serialization failure.
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable taxonomy key.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// Stable positive integer for machine consumers.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => 1,
            Self::NotFound(_) => 2,
            Self::Conflict(_) => 3,
            Self::Internal(_) => 4,
        }
    }

    /// HTTP status the error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Internal(_) => 500,
        }
    }
}

/// Wire shape of an error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub error_code: u32,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            error: err.to_string(),
            code: err.code().to_string(),
            error_code: err.error_code(),
        }
    }
}

impl ErrorBody {
    /// Rebuild a typed error from a wire body (used by the CLI client).
    pub fn into_error(self) -> Error {
        match self.code.as_str() {
            "invalid_argument" => Error::InvalidArgument(self.error),
            "not_found" => Error::NotFound(self.error),
            "conflict" => Error::Conflict(self.error),
            _ => Error::Internal(self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let cases = [
            (Error::invalid("x"), "invalid_argument", 1, 400),
            (Error::not_found("x"), "not_found", 2, 404),
            (Error::conflict("x"), "conflict", 3, 409),
            (Error::internal("x"), "internal", 4, 500),
        ];
        for (err, code, num, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.error_code(), num);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn body_roundtrips_through_json() {
        let err = Error::conflict("task id already exists: gr-ab12");
        let body = ErrorBody::from(&err);
        let json = serde_json::to_string(&body).unwrap();
        let parsed: ErrorBody = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed.into_error(), Error::Conflict(_)));
    }

    #[test]
    fn unknown_code_maps_to_internal() {
        let body = ErrorBody {
            error: "boom".into(),
            code: "mystery".into(),
            error_code: 99,
        };
        assert!(matches!(body.into_error(), Error::Internal(_)));
    }
}
