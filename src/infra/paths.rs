//! Project-relative path guard.
//!
//! Every path that arrives from model output passes through
//! [`normalize_rel_path`] before it is staged, read, written, or deleted.
//! The result is a `/`-separated relative path that cannot leave the
//! project root.

use thiserror::Error;

/// Why a candidate path was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPath {
    #[error("empty path")]
    Empty,

    #[error("path must be project-relative: {0}")]
    Absolute(String),

    #[error("home-relative paths are not allowed: {0}")]
    HomeRelative(String),

    #[error("backslashes are not allowed in paths: {0}")]
    Backslash(String),

    #[error("drive-letter paths are not allowed: {0}")]
    DriveLetter(String),

    #[error("path escapes the project root: {0}")]
    ParentTraversal(String),

    #[error("path points into the state directory: {0}")]
    Reserved(String),
}

/// Directory holding persisted session and undo state; never a valid target.
pub const STATE_DIR: &str = ".patchwright";

/// Validate `raw` and return its normalized form (`./` and empty segments
/// removed, no trailing slash).
pub fn normalize_rel_path(raw: &str) -> Result<String, InvalidPath> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(InvalidPath::Empty);
    }
    if raw.starts_with('/') {
        return Err(InvalidPath::Absolute(raw.to_string()));
    }
    if raw.starts_with('~') {
        return Err(InvalidPath::HomeRelative(raw.to_string()));
    }
    if raw.contains('\\') {
        return Err(InvalidPath::Backslash(raw.to_string()));
    }
    if has_drive_prefix(raw) {
        return Err(InvalidPath::DriveLetter(raw.to_string()));
    }

    let mut segments = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(InvalidPath::ParentTraversal(raw.to_string())),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(InvalidPath::Empty);
    }
    if segments[0] == STATE_DIR {
        return Err(InvalidPath::Reserved(raw.to_string()));
    }

    Ok(segments.join("/"))
}

/// `C:` or `c:/...`; a colon later in the name (`a:b.txt`) is allowed.
fn has_drive_prefix(s: &str) -> bool {
    match s.as_bytes() {
        [letter, b':'] => letter.is_ascii_alphabetic(),
        [letter, b':', b'/' | b'\\', ..] => letter.is_ascii_alphabetic(),
        _ => false,
    }
}
