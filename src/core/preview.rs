//! Unified-diff previews of staged or proposed changes.
//!
//! Nothing here writes to disk. Direct-apply previews stage into a
//! throwaway [`StagingSession`] and diff its overlay.

use owo_colors::OwoColorize;
use serde::Serialize;
use similar::TextDiff;
use xxhash_rust::xxh64::xxh64;

use crate::{
    core::{
        apply_engine::{ApplyEngine, StageReport},
        directive::{Directive, ParseError},
        session::{ChangeAction, StagedChange, StagingSession},
    },
    infra::workspace::Workspace,
};

/// Lines of context around each hunk.
pub const CONTEXT_LINES: usize = 3;

/// Diff of one path.
#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub action: ChangeAction,
    /// Unified diff text; empty when the content is unchanged
    pub unified: String,
    /// Disk no longer matches what was captured when first staged
    pub drifted: bool,
}

/// Unified diff between two states of `path`. `None` means absent.
///
/// Headers are `a/<path>` and `b/<path>`, with `/dev/null` for the
/// missing side of a create or delete.
pub fn render_diff(path: &str, before: Option<&str>, after: Option<&str>) -> String {
    if before == after {
        return String::new();
    }

    let old_header = before.map_or_else(|| "/dev/null".to_string(), |_| format!("a/{path}"));
    let new_header = after.map_or_else(|| "/dev/null".to_string(), |_| format!("b/{path}"));
    let old = before.unwrap_or("");
    let new = after.unwrap_or("");

    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(&old_header, &new_header)
        .to_string()
}

/// Content fingerprint used to notice edits made behind the session's back.
pub fn content_hash(content: &str) -> u64 {
    xxh64(content.as_bytes(), 0)
}

fn diff_staged(change: &StagedChange, disk: Option<&str>) -> FileDiff {
    let prior = change.prior_exists.then_some(change.prior_content.as_str());
    let drifted = prior.map(content_hash) != disk.map(content_hash);
    // Show what commit would do to the file as it is now
    let before = if drifted { disk } else { prior };

    FileDiff {
        path: change.path.clone(),
        action: change.action(),
        unified: render_diff(&change.path, before, change.next_content.as_deref()),
        drifted,
    }
}

/// Diffs for every staged entry in path order.
///
/// A path that cannot be read now is diffed against its captured prior.
pub fn preview_session(session: &StagingSession, ws: &dyn Workspace) -> Vec<FileDiff> {
    session
        .list_staged()
        .into_iter()
        .map(|change| {
            let disk = match ws.read_file(&change.path) {
                Ok(disk) => disk,
                Err(_) => change
                    .prior_exists
                    .then(|| change.prior_content.clone()),
            };
            diff_staged(change, disk.as_deref())
        })
        .collect()
}

/// What applying `directives` directly would change, without writing.
pub fn preview_directives(
    ws: &mut dyn Workspace,
    directives: Vec<Result<Directive, ParseError>>,
) -> (Vec<FileDiff>, StageReport) {
    let mut scratch = StagingSession::new();
    let report = ApplyEngine::new(&mut *ws).stage_directives(&mut scratch, directives);
    let diffs = scratch
        .list_staged()
        .into_iter()
        .map(|change| {
            let prior = change.prior_exists.then_some(change.prior_content.as_str());
            diff_staged(change, prior)
        })
        .collect();
    (diffs, report)
}

/// Color a unified diff for terminal output.
pub fn colorize(diff: &str) -> String {
    let mut out = String::with_capacity(diff.len());
    for line in diff.split_inclusive('\n') {
        let painted = if line.starts_with("+++") || line.starts_with("---") {
            line.bold().to_string()
        } else if line.starts_with('+') {
            line.green().to_string()
        } else if line.starts_with('-') {
            line.red().to_string()
        } else if line.starts_with("@@") {
            line.cyan().to_string()
        } else {
            line.to_string()
        };
        out.push_str(&painted);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::directive::parse_directives, infra::workspace::MemoryWorkspace};

    #[test]
    fn modify_diff_has_headers_and_hunk() {
        let diff = render_diff("src/a.rs", Some("a\nb\nc\n"), Some("a\nB\nc\n"));
        insta::assert_snapshot!(diff, @r"
        --- a/src/a.rs
        +++ b/src/a.rs
        @@ -1,3 +1,3 @@
         a
        -b
        +B
         c
        ");
    }

    #[test]
    fn create_and_delete_use_dev_null() {
        let created = render_diff("n.txt", None, Some("x\n"));
        assert!(created.starts_with("--- /dev/null\n+++ b/n.txt\n"));
        let deleted = render_diff("o.txt", Some("x\n"), None);
        assert!(deleted.starts_with("--- a/o.txt\n+++ /dev/null\n"));
    }

    #[test]
    fn unchanged_content_renders_nothing() {
        assert!(render_diff("a", Some("same"), Some("same")).is_empty());
    }

    #[test]
    fn preview_directives_leaves_workspace_alone() {
        let mut ws = MemoryWorkspace::with_files([("a.txt", "one\n")]);
        let text = "```file\npath: a.txt\ntwo\n```\n```delete\npath: missing.txt\n```";
        let (diffs, report) = preview_directives(&mut ws, parse_directives(text));

        assert_eq!(ws.get("a.txt"), Some("one\n"));
        assert_eq!(report.staged.len(), 2);
        assert_eq!(diffs[0].action, ChangeAction::Modify);
        assert!(diffs[0].unified.contains("-one"));
        assert_eq!(diffs[1].action, ChangeAction::Unchanged);
        assert!(diffs[1].unified.is_empty());
    }

    #[test]
    fn session_preview_flags_external_edits() {
        let mut ws = MemoryWorkspace::with_files([("a.txt", "v1\n")]);
        let mut session = StagingSession::new();
        session.stage_write(&ws, "a.txt", "v2\n").unwrap();
        assert!(!preview_session(&session, &ws)[0].drifted);

        ws.write_file("a.txt", "other\n").unwrap();
        let diff = &preview_session(&session, &ws)[0];
        assert!(diff.drifted);
        assert!(diff.unified.contains("-other"));
    }
}
