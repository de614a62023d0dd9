//! Staged mutation store.
//!
//! [`StagingSession`] holds proposed file states that have not been
//! written to disk, plus a ring of per-step checkpoints of that overlay.
//! It is the only owner of overlay entries: callers go through its
//! methods, which keeps the first-stage capture of each file's real
//! starting state intact.

use std::collections::{BTreeMap, VecDeque};
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::infra::{
    io::truncate_chars,
    paths::{InvalidPath, normalize_rel_path},
    workspace::Workspace,
};

/// Default number of checkpoints kept.
pub const DEFAULT_CHECKPOINT_CAP: usize = 50;

/// One path's pending change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedChange {
    pub path: String,
    /// Whether the file existed when this path was first staged
    pub prior_exists: bool,
    /// Disk content at first stage (empty when it did not exist)
    pub prior_content: String,
    /// Proposed content; `None` stages a deletion
    pub next_content: Option<String>,
}

/// What committing a [`StagedChange`] would do on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Modify,
    Delete,
    Unchanged,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangeAction::Create => "create",
            ChangeAction::Modify => "modify",
            ChangeAction::Delete => "delete",
            ChangeAction::Unchanged => "unchanged",
        })
    }
}

impl StagedChange {
    pub fn action(&self) -> ChangeAction {
        match (&self.next_content, self.prior_exists) {
            (None, true) => ChangeAction::Delete,
            (None, false) => ChangeAction::Unchanged,
            (Some(_), false) => ChangeAction::Create,
            (Some(next), true) if *next == self.prior_content => ChangeAction::Unchanged,
            (Some(_), true) => ChangeAction::Modify,
        }
    }
}

/// Overlay snapshot taken at the start of an agent step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    /// `path → next_content` for every staged entry at snapshot time
    pub snapshot: BTreeMap<String, Option<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    InvalidPath(#[from] InvalidPath),

    #[error("failed to read current state of {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Overlay of uncommitted file states with checkpoint/revert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingSession {
    step: u64,
    staged: BTreeMap<String, StagedChange>,
    checkpoints: VecDeque<Checkpoint>,
    checkpoint_cap: usize,
}

impl Default for StagingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingSession {
    pub fn new() -> Self {
        Self {
            step: 0,
            staged: BTreeMap::new(),
            checkpoints: VecDeque::new(),
            checkpoint_cap: DEFAULT_CHECKPOINT_CAP,
        }
    }

    /// Bound the checkpoint ring (minimum 1).
    pub fn with_checkpoint_cap(mut self, cap: usize) -> Self {
        self.set_checkpoint_cap(cap);
        self
    }

    pub fn set_checkpoint_cap(&mut self, cap: usize) {
        self.checkpoint_cap = cap.max(1);
        self.prune_checkpoints();
    }

    /// Current step counter.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Stage `next` as the new content of `path`.
    ///
    /// The first stage of a path records its real state from `ws`; later
    /// stages only replace the proposed content.
    pub fn stage_write(
        &mut self,
        ws: &dyn Workspace,
        path: &str,
        next: impl Into<String>,
    ) -> Result<&StagedChange, StageError> {
        self.stage(ws, path, Some(next.into()))
    }

    /// Stage removal of `path`, same capture rule as [`Self::stage_write`].
    pub fn stage_delete(
        &mut self,
        ws: &dyn Workspace,
        path: &str,
    ) -> Result<&StagedChange, StageError> {
        self.stage(ws, path, None)
    }

    fn stage(
        &mut self,
        ws: &dyn Workspace,
        path: &str,
        next: Option<String>,
    ) -> Result<&StagedChange, StageError> {
        let path = normalize_rel_path(path)?;

        if let Some(existing) = self.staged.get_mut(&path) {
            debug!(path = %path, "restage");
            existing.next_content = next;
        } else {
            let prior = ws.read_file(&path).map_err(|source| StageError::Read {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path, prior_exists = prior.is_some(), "first stage");
            self.staged.insert(
                path.clone(),
                StagedChange {
                    path: path.clone(),
                    prior_exists: prior.is_some(),
                    prior_content: prior.unwrap_or_default(),
                    next_content: next,
                },
            );
        }

        Ok(&self.staged[&path])
    }

    /// Content of `path` as the session sees it, untruncated.
    ///
    /// Staged content wins over disk; a staged deletion reads as `None`.
    pub fn current_content(
        &self,
        ws: &dyn Workspace,
        path: &str,
    ) -> Result<Option<String>, StageError> {
        let path = normalize_rel_path(path)?;
        if let Some(change) = self.staged.get(&path) {
            return Ok(change.next_content.clone());
        }
        ws.read_file(&path)
            .map_err(|source| StageError::Read { path, source })
    }

    /// Staged content of `path`, else disk content cut to `max_chars`.
    ///
    /// Invalid paths, missing files, and read errors all read as `None`.
    pub fn read_file(&self, ws: &dyn Workspace, path: &str, max_chars: usize) -> Option<String> {
        let path = normalize_rel_path(path).ok()?;
        if let Some(change) = self.staged.get(&path) {
            return change.next_content.clone();
        }
        let content = ws.read_file(&path).ok()??;
        Some(truncate_chars(&content, max_chars).to_string())
    }

    pub fn get(&self, path: &str) -> Option<&StagedChange> {
        let path = normalize_rel_path(path).ok()?;
        self.staged.get(&path)
    }

    /// All staged changes ordered by path.
    pub fn list_staged(&self) -> Vec<&StagedChange> {
        self.staged.values().collect()
    }

    /// Checkpoints, oldest first.
    pub fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }

    /// Check every staged and snapshotted path, e.g. after loading a
    /// persisted session.
    pub fn validate_paths(&self) -> Result<(), InvalidPath> {
        for (key, change) in &self.staged {
            normalize_rel_path(key)?;
            normalize_rel_path(&change.path)?;
        }
        for path in self.checkpoints.iter().flat_map(|c| c.snapshot.keys()) {
            normalize_rel_path(path)?;
        }
        Ok(())
    }

    /// Start a new step: bump the counter and snapshot the overlay.
    pub fn begin_step(&mut self, label: impl Into<String>) -> u64 {
        self.step += 1;
        let snapshot = self
            .staged
            .iter()
            .map(|(p, c)| (p.clone(), c.next_content.clone()))
            .collect();

        let label = label.into();
        info!(step = self.step, label = %label, "checkpoint");
        self.checkpoints.push_back(Checkpoint {
            step: self.step,
            timestamp: Utc::now(),
            label,
            snapshot,
        });
        self.prune_checkpoints();
        self.step
    }

    /// Return the overlay to the snapshot taken at `step`.
    ///
    /// Later checkpoints are discarded (no redo). Returns `false` and
    /// changes nothing when no checkpoint has that step.
    pub fn revert_to_step(&mut self, step: u64) -> bool {
        let Some(idx) = self.checkpoints.iter().rposition(|c| c.step == step) else {
            debug!(step, "no checkpoint for step");
            return false;
        };

        let snapshot = &self.checkpoints[idx].snapshot;
        self.staged.retain(|path, _| snapshot.contains_key(path));
        for (path, change) in self.staged.iter_mut() {
            change.next_content = snapshot[path].clone();
        }

        self.checkpoints.truncate(idx + 1);
        self.step = step;
        info!(step, staged = self.staged.len(), "reverted");
        true
    }

    /// Drop every staged change; checkpoints stay.
    pub fn discard_all(&mut self) {
        self.staged.clear();
    }

    /// Remove one entry after it was committed.
    pub(crate) fn remove(&mut self, path: &str) -> Option<StagedChange> {
        self.staged.remove(path)
    }

    fn prune_checkpoints(&mut self) {
        while self.checkpoints.len() > self.checkpoint_cap {
            self.checkpoints.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::workspace::MemoryWorkspace;

    fn overlay(s: &StagingSession) -> BTreeMap<String, Option<String>> {
        s.list_staged()
            .into_iter()
            .map(|c| (c.path.clone(), c.next_content.clone()))
            .collect()
    }

    #[test]
    fn first_stage_captures_disk_state_once() {
        let mut ws = MemoryWorkspace::with_files([("a.txt", "disk")]);
        let mut s = StagingSession::new();

        s.stage_write(&ws, "a.txt", "v1").unwrap();
        ws.write_file("a.txt", "changed on disk").unwrap();
        let c = s.stage_write(&ws, "./a.txt", "v2").unwrap();

        assert!(c.prior_exists);
        assert_eq!(c.prior_content, "disk");
        assert_eq!(c.next_content.as_deref(), Some("v2"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn staged_content_shadows_disk() {
        let mut ws = MemoryWorkspace::with_files([("a.txt", "disk")]);
        let mut s = StagingSession::new();
        s.stage_write(&ws, "a.txt", "staged").unwrap();
        ws.write_file("a.txt", "later").unwrap();

        assert_eq!(s.read_file(&ws, "a.txt", 3).as_deref(), Some("staged"));
        assert_eq!(s.read_file(&ws, "missing.txt", 10), None);
        assert_eq!(s.read_file(&ws, "../x", 10), None);
    }

    #[test]
    fn disk_reads_are_truncated() {
        let ws = MemoryWorkspace::with_files([("big.txt", "abcdef")]);
        let s = StagingSession::new();
        assert_eq!(s.read_file(&ws, "big.txt", 4).as_deref(), Some("abcd"));
    }

    #[test]
    fn staged_delete_reads_as_absent() {
        let ws = MemoryWorkspace::with_files([("a.txt", "x")]);
        let mut s = StagingSession::new();
        let c = s.stage_delete(&ws, "a.txt").unwrap();
        assert_eq!(c.action(), ChangeAction::Delete);
        assert_eq!(s.read_file(&ws, "a.txt", 100), None);
        assert_eq!(s.current_content(&ws, "a.txt").unwrap(), None);
    }

    #[test]
    fn invalid_paths_are_refused() {
        let ws = MemoryWorkspace::new();
        let mut s = StagingSession::new();
        assert!(matches!(
            s.stage_write(&ws, "/etc/passwd", "x"),
            Err(StageError::InvalidPath(InvalidPath::Absolute(_)))
        ));
        assert!(s.is_empty());
    }

    #[test]
    fn tampered_entries_fail_validation() {
        let ws = MemoryWorkspace::new();
        let mut session = StagingSession::new();
        session.begin_step("one");
        session.stage_write(&ws, "evil.txt", "x").unwrap();
        assert!(session.validate_paths().is_ok());

        let json = serde_json::to_string(&session)
            .unwrap()
            .replace("evil.txt", "../evil.txt");
        let tampered: StagingSession = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            tampered.validate_paths(),
            Err(InvalidPath::ParentTraversal(_))
        ));
    }

    #[test]
    fn list_is_ordered_by_path() {
        let ws = MemoryWorkspace::new();
        let mut s = StagingSession::new();
        for p in ["z.rs", "a/b.rs", "m.rs"] {
            s.stage_write(&ws, p, "").unwrap();
        }
        let paths: Vec<_> = s.list_staged().iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a/b.rs", "m.rs", "z.rs"]);
    }

    #[test]
    fn revert_restores_first_step_overlay() {
        let ws = MemoryWorkspace::new();
        let mut s = StagingSession::new();

        s.stage_write(&ws, "keep.txt", "base").unwrap();
        let first = s.begin_step("one");
        let expected = overlay(&s);

        s.stage_write(&ws, "keep.txt", "step1").unwrap();
        s.stage_write(&ws, "new.txt", "step1").unwrap();
        s.begin_step("two");
        s.stage_write(&ws, "keep.txt", "step2").unwrap();

        assert!(s.revert_to_step(first));
        assert_eq!(overlay(&s), expected);
        assert_eq!(s.step(), first);
        assert_eq!(s.checkpoints().count(), 1);
    }

    #[test]
    fn revert_to_unknown_step_is_noop() {
        let ws = MemoryWorkspace::new();
        let mut s = StagingSession::new();
        s.begin_step("one");
        s.stage_write(&ws, "a", "x").unwrap();
        let before = overlay(&s);

        assert!(!s.revert_to_step(42));
        assert_eq!(overlay(&s), before);
        assert_eq!(s.step(), 1);
    }

    #[test]
    fn restage_after_revert_recaptures_disk() {
        let mut ws = MemoryWorkspace::new();
        let mut s = StagingSession::new();
        let first = s.begin_step("one");
        s.stage_write(&ws, "a.txt", "agent").unwrap();
        assert!(s.revert_to_step(first));
        assert!(s.get("a.txt").is_none());

        ws.write_file("a.txt", "user wrote this").unwrap();
        let c = s.stage_write(&ws, "a.txt", "agent again").unwrap();
        assert!(c.prior_exists);
        assert_eq!(c.prior_content, "user wrote this");
    }

    #[test]
    fn checkpoint_ring_drops_oldest() {
        let mut s = StagingSession::new().with_checkpoint_cap(3);
        for i in 0..5 {
            s.begin_step(format!("step {i}"));
        }
        let steps: Vec<u64> = s.checkpoints().map(|c| c.step).collect();
        assert_eq!(steps, vec![3, 4, 5]);
        assert!(!s.revert_to_step(1));
    }

    #[test]
    fn discard_keeps_checkpoints() {
        let ws = MemoryWorkspace::new();
        let mut s = StagingSession::new();
        s.begin_step("one");
        s.stage_write(&ws, "a", "x").unwrap();
        s.discard_all();
        assert!(s.is_empty());
        assert_eq!(s.checkpoints().count(), 1);
    }

    #[test]
    fn actions_reflect_prior_state() {
        let ws = MemoryWorkspace::with_files([("old.txt", "same")]);
        let mut s = StagingSession::new();
        assert_eq!(s.stage_write(&ws, "new.txt", "x").unwrap().action(), ChangeAction::Create);
        assert_eq!(
            s.stage_write(&ws, "old.txt", "same").unwrap().action(),
            ChangeAction::Unchanged
        );
        assert_eq!(s.stage_write(&ws, "old.txt", "diff").unwrap().action(), ChangeAction::Modify);
        assert_eq!(s.stage_delete(&ws, "ghost.txt").unwrap().action(), ChangeAction::Unchanged);
    }
}
