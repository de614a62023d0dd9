//! Undo log for changes committed to disk.
//!
//! Each commit records one [`UndoBatch`]: the state of every touched path
//! captured immediately before it was written or deleted. Undo pops the
//! newest batch and replays those states in reverse order. A batch is
//! undone once and never redone.

use std::collections::VecDeque;
use std::io;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::infra::{
    paths::{InvalidPath, normalize_rel_path},
    workspace::{Workspace, parent_dir},
};

/// Default number of batches kept.
pub const DEFAULT_UNDO_CAP: usize = 20;

/// State of one path before a commit touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoOp {
    pub path: String,
    pub prior_exists: bool,
    pub prior_content: String,
}

impl UndoOp {
    /// Read the current state of `path` so it can be restored later.
    pub fn capture(ws: &dyn Workspace, path: &str) -> io::Result<Self> {
        let prior = ws.read_file(path)?;
        Ok(Self {
            path: path.to_string(),
            prior_exists: prior.is_some(),
            prior_content: prior.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoBatch {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub ops: Vec<UndoOp>,
}

/// A path that could not be put back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndoFailure {
    pub path: String,
    pub error: String,
}

/// Outcome of [`UndoLog::undo_last`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct UndoReport {
    pub batch_id: String,
    pub label: String,
    /// Paths rewritten to their prior content
    pub restored: Vec<String>,
    /// Paths removed because they did not exist before; directories left
    /// empty by a removal are pruned as well
    pub removed: Vec<String>,
    pub failures: Vec<UndoFailure>,
}

impl UndoReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Bounded stack of committed batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoLog {
    batches: VecDeque<UndoBatch>,
    cap: usize,
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            batches: VecDeque::new(),
            cap: DEFAULT_UNDO_CAP,
        }
    }

    /// Bound the stack (minimum 1).
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.set_cap(cap);
        self
    }

    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        self.prune();
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batches, oldest first.
    pub fn batches(&self) -> impl Iterator<Item = &UndoBatch> {
        self.batches.iter()
    }

    /// Check every recorded path, e.g. after loading the log from disk.
    pub fn validate_paths(&self) -> Result<(), InvalidPath> {
        for op in self.batches.iter().flat_map(|b| &b.ops) {
            normalize_rel_path(&op.path)?;
        }
        Ok(())
    }

    /// Record a committed batch. Empty batches are not recorded.
    pub fn push_batch(&mut self, label: impl Into<String>, ops: Vec<UndoOp>) -> Option<String> {
        if ops.is_empty() {
            return None;
        }

        let id = generate_batch_id();
        let label = label.into();
        info!(id = %id, label = %label, ops = ops.len(), "undo batch recorded");
        self.batches.push_back(UndoBatch {
            id: id.clone(),
            timestamp: Utc::now(),
            label,
            ops,
        });
        self.prune();
        Some(id)
    }

    /// Pop the newest batch and reverse it; `None` when there is nothing
    /// to undo.
    ///
    /// Paths are restored newest-op first. A path that fails is reported
    /// and the rest of the batch is still restored.
    #[instrument(skip(self, ws))]
    pub fn undo_last(&mut self, ws: &mut dyn Workspace) -> Option<UndoReport> {
        let batch = self.batches.pop_back()?;
        let mut report = UndoReport {
            batch_id: batch.id.clone(),
            label: batch.label.clone(),
            ..UndoReport::default()
        };

        for op in batch.ops.iter().rev() {
            let result = if let Err(e) = normalize_rel_path(&op.path) {
                Err(io::Error::new(io::ErrorKind::InvalidInput, e))
            } else if op.prior_exists {
                restore(ws, op).map(|()| report.restored.push(op.path.clone()))
            } else {
                remove(ws, &op.path).map(|()| report.removed.push(op.path.clone()))
            };

            if let Err(e) = result {
                warn!(path = %op.path, error = %e, "undo failed for path");
                report.failures.push(UndoFailure {
                    path: op.path.clone(),
                    error: e.to_string(),
                });
            }
        }

        info!(
            id = %report.batch_id,
            restored = report.restored.len(),
            removed = report.removed.len(),
            failed = report.failures.len(),
            "undo complete"
        );
        Some(report)
    }

    fn prune(&mut self) {
        while self.batches.len() > self.cap {
            self.batches.pop_front();
        }
    }
}

/// Delete a file the batch created, then any directories that became empty.
fn remove(ws: &mut dyn Workspace, path: &str) -> io::Result<()> {
    ws.delete(path)?;
    if let Some(parent) = parent_dir(path)
        && let Err(e) = ws.prune_empty_dirs(parent)
    {
        debug!(dir = parent, error = %e, "left directory in place");
    }
    Ok(())
}

fn restore(ws: &mut dyn Workspace, op: &UndoOp) -> io::Result<()> {
    if let Some(parent) = parent_dir(&op.path) {
        ws.create_dir_all(parent)?;
    }
    ws.write_file(&op.path, &op.prior_content)
}

/// Sortable, filesystem-safe batch id.
fn generate_batch_id() -> String {
    let ts = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let alphabet = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect();
    format!("{ts}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::workspace::MemoryWorkspace;

    fn commit(ws: &mut MemoryWorkspace, log: &mut UndoLog, label: &str, writes: &[(&str, Option<&str>)]) {
        let mut ops = Vec::new();
        for (path, next) in writes {
            ops.push(UndoOp::capture(ws, path).unwrap());
            match next {
                Some(c) => ws.write_file(path, c).unwrap(),
                None => {
                    ws.delete(path).unwrap();
                }
            }
        }
        log.push_batch(label, ops);
    }

    #[test]
    fn undo_restores_pre_commit_state() {
        let mut ws = MemoryWorkspace::with_files([("a.txt", "A"), ("gone.txt", "G")]);
        let mut log = UndoLog::new();
        commit(
            &mut ws,
            &mut log,
            "batch",
            &[("a.txt", Some("A2")), ("new/b.txt", Some("B")), ("gone.txt", None)],
        );
        assert_eq!(ws.get("a.txt"), Some("A2"));
        assert!(!ws.contains("gone.txt"));

        let report = log.undo_last(&mut ws).unwrap();
        assert!(report.is_clean());
        assert_eq!(ws.get("a.txt"), Some("A"));
        assert_eq!(ws.get("gone.txt"), Some("G"));
        assert!(!ws.contains("new/b.txt"));
        assert_eq!(report.removed, vec!["new/b.txt".to_string()]);
    }

    #[test]
    fn repeated_path_in_batch_returns_to_first_capture() {
        let mut ws = MemoryWorkspace::with_files([("a.txt", "v0")]);
        let mut log = UndoLog::new();
        commit(&mut ws, &mut log, "twice", &[("a.txt", Some("v1")), ("a.txt", Some("v2"))]);
        log.undo_last(&mut ws).unwrap();
        assert_eq!(ws.get("a.txt"), Some("v0"));
    }

    #[test]
    fn undo_twice_pops_distinct_batches_then_reports_empty() {
        let mut ws = MemoryWorkspace::new();
        let mut log = UndoLog::new();
        commit(&mut ws, &mut log, "first", &[("a", Some("1"))]);
        commit(&mut ws, &mut log, "second", &[("b", Some("2"))]);

        assert_eq!(log.undo_last(&mut ws).unwrap().label, "second");
        assert_eq!(log.undo_last(&mut ws).unwrap().label, "first");
        assert!(log.undo_last(&mut ws).is_none());
        assert!(ws.is_empty());
    }

    #[test]
    fn missing_file_on_undo_is_not_an_error() {
        let mut ws = MemoryWorkspace::new();
        let mut log = UndoLog::new();
        commit(&mut ws, &mut log, "create", &[("a", Some("1"))]);
        ws.delete("a").unwrap();

        let report = log.undo_last(&mut ws).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn one_failing_path_does_not_stop_the_rest() {
        let mut ws = MemoryWorkspace::with_files([("a", "A"), ("b", "B")]);
        let mut log = UndoLog::new();
        commit(&mut ws, &mut log, "both", &[("a", Some("A2")), ("b", Some("B2"))]);
        ws.fail_writes_to("b");

        let report = log.undo_last(&mut ws).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "b");
        assert_eq!(ws.get("a"), Some("A"));
        assert!(log.is_empty());
    }

    #[test]
    fn escaping_paths_are_refused_without_touching_siblings() {
        let mut ws = MemoryWorkspace::with_files([("a", "A2")]);
        let mut log = UndoLog::new();
        let ops = vec![
            UndoOp {
                path: "a".into(),
                prior_exists: true,
                prior_content: "A".into(),
            },
            UndoOp {
                path: "../outside.txt".into(),
                prior_exists: true,
                prior_content: "pwned".into(),
            },
        ];
        log.push_batch("tampered", ops);
        assert!(log.validate_paths().is_err());

        let report = log.undo_last(&mut ws).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "../outside.txt");
        assert_eq!(report.restored, vec!["a".to_string()]);
        assert_eq!(ws.get("a"), Some("A"));
        assert_eq!(ws.len(), 1);
    }

    #[test]
    fn cap_drops_oldest_and_empty_batches_are_skipped() {
        let mut log = UndoLog::new().with_cap(2);
        assert!(log.push_batch("empty", Vec::new()).is_none());
        for label in ["1", "2", "3"] {
            let op = UndoOp {
                path: label.into(),
                prior_exists: false,
                prior_content: String::new(),
            };
            log.push_batch(label, vec![op]);
        }
        let labels: Vec<_> = log.batches().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["2", "3"]);
    }

    #[test]
    fn batch_ids_are_distinct() {
        assert_ne!(generate_batch_id(), generate_batch_id());
    }
}
