use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Line ending convention detected in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    /// Convention of the first line break in `s` (LF when there is none).
    pub fn detect(s: &str) -> Self {
        match s.find('\n') {
            Some(i) if i > 0 && s.as_bytes()[i - 1] == b'\r' => LineEnding::CrLf,
            _ => LineEnding::Lf,
        }
    }

    /// Re-apply this convention to LF-normalized text.
    pub fn apply(self, lf_text: &str) -> String {
        match self {
            LineEnding::Lf => lf_text.to_string(),
            LineEnding::CrLf => lf_text.replace('\n', "\r\n"),
        }
    }
}

/// CRLF → LF.
pub fn normalize_newlines(s: &str) -> String {
    if s.contains('\r') {
        s.replace("\r\n", "\n")
    } else {
        s.to_string()
    }
}

/// First `max_chars` characters of `s` (char-boundary safe).
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Atomic write with robust temp file strategy
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    // Preserve original permissions
    #[cfg(unix)]
    let perms = fs::metadata(path)
        .map(|m| m.permissions())
        .unwrap_or_else(|_| std::os::unix::fs::PermissionsExt::from_mode(0o644));
    #[cfg(not(unix))]
    let perms = fs::metadata(path).map(|m| m.permissions()).ok();

    let tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;

    let mut file = tmp.as_file();
    file.write_all(data)?;
    file.sync_all()?;

    #[cfg(unix)]
    fs::set_permissions(tmp.path(), perms).context("set temp permissions")?;
    #[cfg(not(unix))]
    if let Some(perms) = perms {
        fs::set_permissions(tmp.path(), perms).context("set temp permissions")?;
    }

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("replace {}", path.display()))?;

    // fsync parent dir to ensure durability on Unix
    #[cfg(unix)]
    {
        if let Ok(parent_file) = fs::File::open(dir) {
            let _ = parent_file.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_and_restores_crlf() {
        assert_eq!(LineEnding::detect("a\r\nb\r\n"), LineEnding::CrLf);
        assert_eq!(LineEnding::detect("a\nb"), LineEnding::Lf);
        assert_eq!(LineEnding::detect("no newline"), LineEnding::Lf);
        assert_eq!(LineEnding::CrLf.apply("a\nb\n"), "a\r\nb\r\n");
        assert_eq!(normalize_newlines("a\r\nb\r\n"), "a\nb\n");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.txt");
        fs::write(&p, "old").unwrap();
        write_atomic(&p, b"new").unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap(), "new");
    }
}
