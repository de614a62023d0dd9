//! **patchwright** - Turn LLM edit directives into safe, reviewable file changes
//!
//! Model output is parsed into typed directives, staged into an overlay with
//! per-step checkpoints, previewed as unified diffs, and committed to disk with
//! an undo log.

/// Command-line interface with clap integration
pub mod cli;

/// Shell completion generation
pub mod completion;

/// Command handlers behind the CLI
pub mod cli_ext {
    /// `parse`, `preview`, `apply`
    pub mod directive_cmd;

    /// Project resolution, input reading, `read`/`files`/`init`
    pub mod project;

    /// Session and undo commands (`step`, `status`, `commit`, `undo`, ...)
    pub mod session_cmd;
}

/// Core pipeline - directive parsing, patching, staging, undo
pub mod core {
    /// Fenced-block scanner and typed directives
    pub mod directive;
    pub use directive::{Directive, DirectiveKind, ParseError, ToolCall, parse_directives};

    /// SEARCH/REPLACE patch engine
    pub mod patch;
    pub use patch::{PatchError, PatchOutcome, apply_edits};

    /// Staged mutation store with checkpoints
    pub mod session;
    pub use session::{ChangeAction, Checkpoint, StageError, StagedChange, StagingSession};

    /// Undo log of committed batches
    pub mod undo;
    pub use undo::{UndoBatch, UndoLog, UndoOp, UndoReport};

    /// Stage, commit, and direct-apply flows with cancellation
    pub mod apply_engine;
    pub use apply_engine::{ApplyEngine, CancellationToken, CommitReport, StageReport};

    /// Unified-diff previews
    pub mod preview;
    pub use preview::{FileDiff, preview_directives, preview_session};

    /// Session/undo persistence under `.patchwright/`
    pub mod state;
    pub use state::StateStore;
}

/// Infrastructure - paths, filesystem, caching, I/O, configuration, logging
pub mod infra {
    /// Project-relative path guard
    pub mod paths;
    pub use paths::{InvalidPath, STATE_DIR, normalize_rel_path};

    /// Storage collaborator trait with disk and in-memory implementations
    pub mod workspace;
    pub use workspace::{FsWorkspace, MemoryWorkspace, Workspace};

    /// Time-bounded single-value cache with injectable clock
    pub mod cache;
    pub use cache::{Clock, FreshCache, ManualClock, SystemClock};

    /// Line endings, truncation, atomic writes
    pub mod io;

    /// Configuration management with TOML support
    pub mod config;
    pub use config::{Config, load_config};

    /// Tracing subscriber setup
    pub mod logging;
}

// Strategic re-exports for library consumers
pub use cli::{AppContext, Cli, Commands};
pub use core::{ApplyEngine, CancellationToken, Directive, StagingSession, UndoLog, parse_directives};
pub use infra::{Config, FsWorkspace, MemoryWorkspace, Workspace, load_config};
