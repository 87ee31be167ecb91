//! Canonicalization of user-supplied fields.
//!
//! Applied at every ingress: HTTP bodies, import records, and CLI arguments
//! all pass through these functions before touching the store. Every function
//! is stable under repeated application.

use crate::error::{Error, Result};
use crate::types::{GitObjectType, BUILTIN_RELATIONS};

/// Trim a title and reject the empty result.
pub fn title(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid("title is required"));
    }
    Ok(trimmed.to_string())
}

/// Priority must be an integer in `[0, 4]`.
pub fn priority(raw: i64) -> Result<u8> {
    if (0..=4).contains(&raw) {
        Ok(raw as u8)
    } else {
        Err(Error::invalid("priority must be between 0 and 4"))
    }
}

/// Normalize a label set: trim, lowercase, drop empties, sort, dedupe.
pub fn labels<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = raw
        .into_iter()
        .map(|l| l.as_ref().trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Validate a 40-hex git hash, lowercasing on the way through.
pub fn git_hash(raw: &str) -> Result<String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.len() == 40 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(trimmed)
    } else {
        Err(Error::invalid(format!("invalid git hash: {}", raw.trim())))
    }
}

/// An optional resolved commit: absent and empty are the same thing.
pub fn resolved_commit(raw: Option<&str>) -> Result<String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(String::new()),
        Some(hash) => git_hash(hash),
    }
}

/// Validate a git relation: a fixed built-in or an `x-<suffix>` extension.
pub fn relation(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if BUILTIN_RELATIONS.contains(&normalized.as_str()) {
        return Ok(normalized);
    }
    if let Some(suffix) = normalized.strip_prefix("x-") {
        if !suffix.is_empty()
            && suffix
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Ok(normalized);
        }
    }
    Err(Error::invalid(format!("invalid relation: {normalized}")))
}

/// Canonicalize a repository slug to `host/owner/name`.
///
/// Accepts https/ssh URLs, SCP-style `git@host:owner/name`, and plain slugs;
/// all equivalent spellings collapse to the same canonical form.
pub fn repo_slug(raw: &str) -> Result<String> {
    let mut value = raw.trim().to_string();
    if value.is_empty() {
        return Err(Error::invalid("repo is required"));
    }

    if let Some(idx) = value.find("://") {
        let rest = &value[idx + 3..];
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        let host = host.split_once(':').map_or(host, |(h, _)| h);
        if host.is_empty() {
            return Err(Error::invalid(format!("invalid repo: {raw}")));
        }
        value = format!("{host}/{}", path.trim_matches('/'));
    } else if value.contains('@') && value.contains(':') {
        // SCP-style: git@host:owner/name
        let (left, path) = value.split_once(':').unwrap_or((value.as_str(), ""));
        let host = left.rsplit_once('@').map_or(left, |(_, h)| h).trim();
        value = format!("{host}/{}", path.trim_matches('/'));
    }

    let mut value = value.trim().to_ascii_lowercase();
    while value.ends_with('/') {
        value.pop();
    }
    if let Some(stripped) = value.strip_suffix(".git") {
        value = stripped.to_string();
    }

    let parts: Vec<&str> = value.split('/').collect();
    let well_formed = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && !p.chars().any(char::is_whitespace));
    if !well_formed {
        return Err(Error::invalid("repo must be host/owner/name"));
    }

    Ok(value)
}

/// Normalize a repository-relative path: no leading `/`, no `..` segments,
/// POSIX-collapsed (`docs//./x` -> `docs/x`).
pub fn repo_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid("invalid path: empty"));
    }
    if trimmed.starts_with('/') {
        return Err(Error::invalid(format!(
            "invalid path: must be relative: {trimmed}"
        )));
    }
    if trimmed.split('/').any(|seg| seg == "..") {
        return Err(Error::invalid(format!(
            "invalid path: must not contain ..: {trimmed}"
        )));
    }
    let segments: Vec<&str> = trimmed
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();
    if segments.is_empty() {
        return Err(Error::invalid(format!("invalid path: {trimmed}")));
    }
    Ok(segments.join("/"))
}

/// Normalize an object value according to its object type.
pub fn object_value(object_type: GitObjectType, raw: &str) -> Result<String> {
    if object_type.is_hash() {
        return git_hash(raw);
    }
    match object_type {
        GitObjectType::Path => repo_path(raw),
        // branch / tag: trimmed, no internal whitespace
        _ => {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
                Err(Error::invalid(format!(
                    "invalid {}: {raw}",
                    object_type.as_str()
                )))
            } else {
                Ok(trimmed.to_string())
            }
        }
    }
}
