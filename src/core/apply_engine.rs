//! Apply flows between parsed directives, the staging overlay, and disk.
//!
//! Three entry points, all confirmation-agnostic (callers decide whether
//! to prompt):
//! - [`ApplyEngine::stage_directives`] / [`ApplyEngine::run_agent_step`]
//!   put directives into a [`StagingSession`] without touching disk.
//! - [`ApplyEngine::commit_session`] writes the overlay and records one
//!   undo batch.
//! - [`ApplyEngine::apply_directives`] writes directives straight to disk,
//!   also recording one undo batch.
//!
//! Each directive succeeds or fails on its own; failures are collected in
//! the report and never roll back siblings.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    core::{
        directive::{Directive, DirectiveKind, ParseError, ToolCall, parse_directives},
        patch::{PatchError, apply_edits},
        session::{StageError, StagingSession},
        undo::{UndoLog, UndoOp},
    },
    infra::{
        io::LineEnding,
        paths::normalize_rel_path,
        workspace::{Workspace, parent_dir},
    },
};

/// Shared stop flag checked between directive applications.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken
{
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self)
    {
        self.cancelled
            .store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool
    {
        self.cancelled
            .load(Ordering::SeqCst)
    }

    /// Clear the flag for the next turn.
    pub fn reset(&self)
    {
        self.cancelled
            .store(false, Ordering::SeqCst);
    }
}

/// Storage failure while committing one path.
#[derive(Debug, thiserror::Error)]
pub enum CommitError
{
    #[error("failed to capture prior state of {path}")]
    Capture
    {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}")]
    Write
    {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to delete {path}")]
    Delete
    {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Why one directive was not applied.
#[derive(Debug, thiserror::Error)]
pub enum DirectiveError
{
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("edit of {path} failed: {source}")]
    Patch
    {
        path: String,
        #[source]
        source: PatchError,
    },

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl DirectiveError
{
    /// Short machine-readable code, suitable for feeding back to the model.
    pub fn code(&self) -> &'static str
    {
        match self
        {
            DirectiveError::Parse(ParseError::InvalidPath { .. }) => "invalid-path",
            DirectiveError::Parse(_) => "parse-error",
            DirectiveError::Patch { source, .. } => source.reason(),
            DirectiveError::Stage(StageError::InvalidPath(_)) => "invalid-path",
            DirectiveError::Stage(StageError::Read { .. }) => "read-error",
            DirectiveError::Commit(_) => "commit-error",
        }
    }
}

/// A directive that failed, with its position in the parsed list.
#[derive(Debug)]
pub struct Failure
{
    pub index: usize,
    pub kind: Option<DirectiveKind>,
    pub path: Option<String>,
    pub error: DirectiveError,
}

impl Failure
{
    fn new(
        index: usize,
        directive: Option<&Directive>,
        error: impl Into<DirectiveError>,
    ) -> Self
    {
        Self {
            index,
            kind: directive.map(Directive::kind),
            path: directive
                .and_then(Directive::path)
                .map(str::to_string),
            error: error.into(),
        }
    }
}

/// Render failures as a retry prompt for the model.
pub fn model_feedback(failures: &[Failure]) -> Option<String>
{
    if failures.is_empty()
    {
        return None;
    }

    let mut out = String::from("Some directives could not be applied:\n");
    for f in failures
    {
        let kind = f
            .kind
            .map(|k| k.tag())
            .unwrap_or("directive");
        let path = f
            .path
            .as_deref()
            .unwrap_or("-");
        out.push_str(&format!(
            "- #{} {kind} {path} [{}]: {}\n",
            f.index + 1,
            f.error.code(),
            error_chain(&f.error)
        ));
    }
    out.push_str("Re-read the affected files and resend corrected directives.");
    Some(out)
}

fn error_chain(e: &dyn std::error::Error) -> String
{
    let mut msg = e.to_string();
    let mut cur = e.source();
    while let Some(s) = cur
    {
        let part = s.to_string();
        // Some messages already embed their cause
        if !msg.contains(&part)
        {
            msg.push_str(": ");
            msg.push_str(&part);
        }
        cur = s.source();
    }
    msg
}

/// Outcome of staging a batch of directives.
#[derive(Debug, Default)]
pub struct StageReport
{
    /// Checkpoint step opened for this batch, if any
    pub step: Option<u64>,
    pub staged: Vec<String>,
    pub requests: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub failures: Vec<Failure>,
    pub cancelled: bool,
}

impl StageReport
{
    pub fn feedback(&self) -> Option<String>
    {
        model_feedback(&self.failures)
    }
}

/// Outcome of a disk commit (staged or direct).
#[derive(Debug, Default)]
pub struct CommitReport
{
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    pub requests: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub failures: Vec<Failure>,
    /// Id of the recorded undo batch; `None` when nothing was written
    pub undo_batch: Option<String>,
    pub cancelled: bool,
}

impl CommitReport
{
    pub fn touched(&self) -> usize
    {
        self.written
            .len()
            + self
                .deleted
                .len()
    }

    pub fn feedback(&self) -> Option<String>
    {
        model_feedback(&self.failures)
    }
}

/// File content supplied in answer to a `request` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestedFile
{
    pub path: String,
    /// `None` when the file does not exist (or the path is invalid)
    pub content: Option<String>,
}

/// Read requested files through the session (staged content wins).
pub fn gather_requested(
    session: &StagingSession,
    ws: &dyn Workspace,
    paths: &[String],
    max_chars: usize,
) -> Vec<RequestedFile>
{
    paths
        .iter()
        .map(|p| RequestedFile {
            path: p.clone(),
            content: session.read_file(ws, p, max_chars),
        })
        .collect()
}

enum Committed
{
    Written,
    Deleted,
}

/// Drives directives against one workspace.
pub struct ApplyEngine<'w>
{
    ws: &'w mut dyn Workspace,
    cancel: CancellationToken,
}

impl<'w> ApplyEngine<'w>
{
    pub fn new(ws: &'w mut dyn Workspace) -> Self
    {
        Self { ws, cancel: CancellationToken::new() }
    }

    /// Observe `cancel` between directive applications.
    pub fn with_cancellation(
        mut self,
        cancel: CancellationToken,
    ) -> Self
    {
        self.cancel = cancel;
        self
    }

    /// Stage each directive into `session`; disk is not written.
    ///
    /// Stops before the next directive once cancelled; anything staged so
    /// far stays in the overlay.
    #[instrument(skip_all, fields(count = directives.len()))]
    pub fn stage_directives(
        &mut self,
        session: &mut StagingSession,
        directives: Vec<Result<Directive, ParseError>>,
    ) -> StageReport
    {
        let mut report = StageReport::default();

        for (index, parsed) in directives
            .into_iter()
            .enumerate()
        {
            if self
                .cancel
                .is_cancelled()
            {
                info!(index, "staging cancelled");
                report.cancelled = true;
                break;
            }

            let directive = match parsed
            {
                Ok(d) => d,
                Err(e) =>
                {
                    report
                        .failures
                        .push(Failure::new(index, None, e));
                    continue;
                }
            };

            match self.stage_one(session, &directive)
            {
                Ok(Some(path)) => report
                    .staged
                    .push(path),
                Ok(None) => match directive
                {
                    Directive::RequestFiles { paths } => report
                        .requests
                        .extend(paths),
                    Directive::ToolCall(call) => report
                        .tool_calls
                        .push(call),
                    Directive::WriteFile { .. }
                    | Directive::ApplyEdit { .. }
                    | Directive::DeleteFile { .. } =>
                    {}
                },
                Err(e) =>
                {
                    warn!(index, error = %e, "directive not staged");
                    report
                        .failures
                        .push(Failure::new(index, Some(&directive), e));
                }
            }
        }

        report
    }

    fn stage_one(
        &mut self,
        session: &mut StagingSession,
        directive: &Directive,
    ) -> Result<Option<String>, DirectiveError>
    {
        let ws: &dyn Workspace = &*self.ws;
        let staged = match directive
        {
            Directive::WriteFile { path, content } => session.stage_write(ws, path, content.as_str())?,
            Directive::ApplyEdit { path, body } =>
            {
                let current = session
                    .current_content(ws, path)?
                    .unwrap_or_default();
                let next = patched(path, &current, body)?;
                session.stage_write(ws, path, next)?
            }
            Directive::DeleteFile { path } => session.stage_delete(ws, path)?,
            Directive::RequestFiles { .. } | Directive::ToolCall(_) => return Ok(None),
        };

        debug!(path = %staged.path, action = %staged.action(), "staged");
        Ok(Some(
            staged
                .path
                .clone(),
        ))
    }

    /// One agent step: checkpoint, parse `text`, stage what it proposes.
    #[instrument(skip(self, session, text))]
    pub fn run_agent_step(
        &mut self,
        session: &mut StagingSession,
        text: &str,
        label: &str,
    ) -> StageReport
    {
        let step = session.begin_step(label);
        let mut report = self.stage_directives(session, parse_directives(text));
        report.step = Some(step);
        report
    }

    /// Write every staged change to disk in path order.
    ///
    /// Committed entries leave the overlay; failed ones stay for review.
    /// Successful writes form one undo batch.
    #[instrument(skip(self, session, undo))]
    pub fn commit_session(
        &mut self,
        session: &mut StagingSession,
        undo: &mut UndoLog,
        label: &str,
    ) -> CommitReport
    {
        let mut report = CommitReport::default();
        let mut ops = Vec::new();

        let pending: Vec<(String, Option<String>)> = session
            .list_staged()
            .into_iter()
            .map(|c| (c.path.clone(), c.next_content.clone()))
            .collect();

        for (index, (path, next)) in pending
            .into_iter()
            .enumerate()
        {
            if self
                .cancel
                .is_cancelled()
            {
                info!(index, "commit cancelled");
                report.cancelled = true;
                break;
            }

            if let Err(e) = normalize_rel_path(&path)
            {
                warn!(path = %path, error = %e, "refusing staged path");
                report
                    .failures
                    .push(Failure {
                        index,
                        kind: None,
                        path: Some(path),
                        error: StageError::InvalidPath(e).into(),
                    });
                continue;
            }

            match self.commit_one(&path, next.as_deref())
            {
                Ok((op, done)) =>
                {
                    ops.push(op);
                    session.remove(&path);
                    record(&mut report, path, done);
                }
                Err(e) =>
                {
                    warn!(path = %path, error = %e, "commit failed");
                    report
                        .failures
                        .push(Failure {
                            index,
                            kind: None,
                            path: Some(path),
                            error: e.into(),
                        });
                }
            }
        }

        report.undo_batch = undo.push_batch(label, ops);
        report
    }

    /// Apply directives straight to disk without staging.
    #[instrument(skip(self, undo, directives), fields(count = directives.len()))]
    pub fn apply_directives(
        &mut self,
        undo: &mut UndoLog,
        directives: Vec<Result<Directive, ParseError>>,
        label: &str,
    ) -> CommitReport
    {
        let mut report = CommitReport::default();
        let mut ops = Vec::new();

        for (index, parsed) in directives
            .into_iter()
            .enumerate()
        {
            if self
                .cancel
                .is_cancelled()
            {
                info!(index, "apply cancelled");
                report.cancelled = true;
                break;
            }

            let directive = match parsed
            {
                Ok(d) => d,
                Err(e) =>
                {
                    report
                        .failures
                        .push(Failure::new(index, None, e));
                    continue;
                }
            };

            // Directives can be built by hand, not only parsed
            if let Some(Err(source)) = directive
                .path()
                .map(normalize_rel_path)
            {
                warn!(index, error = %source, "directive path refused");
                let e = ParseError::InvalidPath { kind: directive.kind(), source };
                report
                    .failures
                    .push(Failure::new(index, Some(&directive), e));
                continue;
            }

            let outcome = match &directive
            {
                Directive::WriteFile { path, content } => self
                    .commit_one(path, Some(content))
                    .map_err(DirectiveError::from),
                Directive::ApplyEdit { path, body } => self.apply_edit_to_disk(path, body),
                Directive::DeleteFile { path } => self
                    .commit_one(path, None)
                    .map_err(DirectiveError::from),
                Directive::RequestFiles { paths } =>
                {
                    report
                        .requests
                        .extend(paths.iter().cloned());
                    continue;
                }
                Directive::ToolCall(call) =>
                {
                    report
                        .tool_calls
                        .push(call.clone());
                    continue;
                }
            };

            match outcome
            {
                Ok((op, done)) =>
                {
                    let path = op
                        .path
                        .clone();
                    ops.push(op);
                    record(&mut report, path, done);
                }
                Err(e) =>
                {
                    warn!(index, error = %e, "directive not applied");
                    report
                        .failures
                        .push(Failure::new(index, Some(&directive), e));
                }
            }
        }

        report.undo_batch = undo.push_batch(label, ops);
        report
    }

    fn apply_edit_to_disk(
        &mut self,
        path: &str,
        body: &str,
    ) -> Result<(UndoOp, Committed), DirectiveError>
    {
        let current = self
            .ws
            .read_file(path)
            .map_err(|source| CommitError::Capture { path: path.to_string(), source })?
            .unwrap_or_default();
        let next = patched(path, &current, body)?;
        Ok(self.commit_one(path, Some(&next))?)
    }

    /// Capture, then write or delete one path.
    fn commit_one(
        &mut self,
        path: &str,
        next: Option<&str>,
    ) -> Result<(UndoOp, Committed), CommitError>
    {
        let op = UndoOp::capture(&*self.ws, path)
            .map_err(|source| CommitError::Capture { path: path.to_string(), source })?;

        match next
        {
            Some(content) =>
            {
                if let Some(parent) = parent_dir(path)
                {
                    self.ws
                        .create_dir_all(parent)
                        .map_err(|source| CommitError::Write { path: path.to_string(), source })?;
                }
                self.ws
                    .write_file(path, content)
                    .map_err(|source| CommitError::Write { path: path.to_string(), source })?;
                Ok((op, Committed::Written))
            }
            None =>
            {
                self.ws
                    .delete(path)
                    .map_err(|source| CommitError::Delete { path: path.to_string(), source })?;
                Ok((op, Committed::Deleted))
            }
        }
    }
}

/// Run the patch engine and restore the file's CRLF convention.
fn patched(
    path: &str,
    current: &str,
    body: &str,
) -> Result<String, DirectiveError>
{
    let outcome = apply_edits(current, body)
        .map_err(|source| DirectiveError::Patch { path: path.to_string(), source })?;
    debug!(path, applied = outcome.applied_count, "edit applied");
    Ok(LineEnding::detect(current).apply(&outcome.updated))
}

fn record(
    report: &mut CommitReport,
    path: String,
    done: Committed,
)
{
    match done
    {
        Committed::Written => report
            .written
            .push(path),
        Committed::Deleted => report
            .deleted
            .push(path),
    }
}
