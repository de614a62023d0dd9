use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shared application context for global flags
#[derive(Clone, Debug)]
pub struct AppContext {
    pub root: PathBuf,  // global --root (expanded, canonical)
    pub quiet: bool,    // global --quiet
    pub no_color: bool, // global --no-color
    pub verbose: bool,  // global --verbose
}

#[derive(Parser)]
#[command(name = "pwr")]
#[command(
    about = "Parse LLM edit directives, stage them safely, and apply or undo them on disk"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project root all paths are relative to
    #[arg(long, global = true, default_value = ".")]
    pub root: String,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Debug logging to stderr (overrides PATCHWRIGHT_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the directives found in model output
    Parse(ParseArgs),

    /// Show the diff directives would produce, without writing
    Preview(InputArgs),

    /// Apply directives directly to disk (preview unless --yes)
    Apply(ApplyArgs),

    /// Checkpoint, then stage directives into the session
    Step(StepArgs),

    /// Show staged changes
    Status(JsonArgs),

    /// Unified diff of staged changes against disk
    Diff,

    /// List session checkpoints
    Checkpoints(JsonArgs),

    /// Return the staged overlay to a checkpoint
    Revert(RevertArgs),

    /// Drop every staged change
    Discard,

    /// Write staged changes to disk
    Commit(CommitArgs),

    /// Reverse the most recent commit or apply
    Undo,

    /// List undo batches, newest first
    History(JsonArgs),

    /// Print a file as the session sees it
    Read(ReadArgs),

    /// List project files (gitignore-aware)
    Files,

    /// Initialize a patchwright.toml config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Where directive text comes from.
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// File holding model output ("-" for stdin)
    pub input: Option<PathBuf>,

    /// Read model output from clipboard
    #[arg(long, conflicts_with = "input")]
    pub from_clipboard: bool,
}

#[derive(Args, Debug)]
pub struct ParseArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Write changes (without this only a preview is shown)
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Label recorded with the undo batch
    #[arg(long, default_value = "apply")]
    pub label: String,

    /// Print a retry prompt for the model when directives fail
    #[arg(long)]
    pub feedback: bool,
}

#[derive(Args, Debug)]
pub struct StepArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Label recorded with the checkpoint
    #[arg(long, default_value = "step")]
    pub label: String,

    /// Print a retry prompt for the model when directives fail
    #[arg(long)]
    pub feedback: bool,
}

#[derive(Args, Debug)]
pub struct JsonArgs {
    /// Machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RevertArgs {
    /// Checkpoint step to return to
    pub step: u64,
}

#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Label recorded with the undo batch
    #[arg(long, default_value = "commit")]
    pub label: String,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Project-relative path
    pub path: String,

    /// Character limit for disk content (defaults to config read_max_chars)
    #[arg(long)]
    pub max_chars: Option<usize>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,

    /// Output directory; if omitted and --stdout not set, prints error
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Print completion script to stdout instead of a file
    #[arg(long)]
    pub stdout: bool,
}

/// Typed CLI failures, each with its own exit code
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Unusable input: no directives, bad paths, unreadable input file
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing root, corrupt or locked state, failed undo
    #[error("state issue: {0}")]
    State(String),

    /// Directives that could not be applied or committed
    #[error("conflicts: {0}")]
    Conflicts(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Converts errors to process exit codes
pub fn exit_code_for(e: &CliError) -> i32 {
    match e {
        CliError::InvalidInput(_) => 3,
        CliError::State(_) => 4,
        CliError::Conflicts(_) => 2,
        CliError::Internal(_) => 5,
    }
}

/// Exit code for any error surfaced from a command handler
pub fn exit_code_for_any(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<CliError>().map_or(5, exit_code_for)
}
