//! Project resolution shared by every command, plus the commands that only
//! look at the project (`read`, `files`, `init`).

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::debug;

use crate::{
    cli::{AppContext, CliError, InitArgs, InputArgs, ReadArgs},
    core::{session::StagingSession, state::StateStore, undo::UndoLog},
    infra::{
        cache::SystemClock,
        config::{self, Config},
        workspace::{FsWorkspace, Workspace},
    },
};

/// Expand `~`/`$VAR` in `--root` and canonicalize it.
pub fn resolve_root(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .map_err(|e| CliError::InvalidInput(format!("cannot expand --root {raw}: {e}")))?;
    let root = dunce::canonicalize(Path::new(expanded.as_ref()))
        .map_err(|e| CliError::State(format!("project root {raw} is not accessible: {e}")))?;
    if !root.is_dir() {
        return Err(CliError::State(format!("project root {} is not a directory", root.display())).into());
    }
    Ok(root)
}

/// Everything a command needs about the project it runs in.
pub struct Project {
    pub config: Config,
    pub workspace: FsWorkspace,
    pub store: StateStore,
}

impl Project {
    pub fn open(ctx: &AppContext) -> Result<Self> {
        let config = config::load_config(&ctx.root)
            .map_err(|e| CliError::InvalidInput(format!("{e:#}")))?;
        let workspace = FsWorkspace::new(&ctx.root)
            .with_ignore_patterns(&config.ignore_patterns)
            .map_err(|e| CliError::InvalidInput(format!("bad ignore_patterns: {e:#}")))?
            .with_listing_cache(config.file_list_ttl(), Arc::new(SystemClock::new()));
        let store = StateStore::new(&ctx.root);
        debug!(root = %ctx.root.display(), "project opened");
        Ok(Self {
            config,
            workspace,
            store,
        })
    }

    /// Persisted session with configured checkpoint cap.
    pub fn load_session(&self) -> Result<StagingSession> {
        let mut session = self
            .store
            .load_session()
            .map_err(|e| CliError::State(format!("{e:#}")))?;
        session.set_checkpoint_cap(self.config.checkpoint_cap);
        Ok(session)
    }

    /// Persisted undo log with configured cap.
    pub fn load_undo(&self) -> Result<UndoLog> {
        let mut undo = self
            .store
            .load_undo()
            .map_err(|e| CliError::State(format!("{e:#}")))?;
        undo.set_cap(self.config.undo_cap);
        Ok(undo)
    }
}

/// Read model output from a file, stdin (`-`), or the clipboard.
pub fn read_input(args: &InputArgs) -> Result<String> {
    match (&args.input, args.from_clipboard) {
        (_, true) => get_clipboard_content(),
        (Some(path), false) if path.as_os_str() == "-" => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
        (Some(path), false) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))
            .map_err(|e| CliError::InvalidInput(format!("{e:#}")).into()),
        (None, false) => Err(CliError::InvalidInput(
            "Must specify an input file, '-' for stdin, or --from-clipboard".to_string(),
        )
        .into()),
    }
}

fn get_clipboard_content() -> Result<String> {
    use arboard::Clipboard;
    let mut clipboard = Clipboard::new().context("Failed to access clipboard")?;
    clipboard
        .get_text()
        .context("Failed to get text from clipboard")
}

/// `pwr read`: staged content wins, disk content is truncated.
pub fn read_run(args: ReadArgs, ctx: &AppContext) -> Result<()> {
    let project = Project::open(ctx)?;
    let session = project.load_session()?;
    let max = args.max_chars.unwrap_or(project.config.read_max_chars);

    match session.read_file(&project.workspace, &args.path, max) {
        Some(content) => {
            print!("{content}");
            Ok(())
        }
        None => Err(CliError::InvalidInput(format!(
            "{} does not exist, is staged for deletion, or is not a valid project path",
            args.path
        ))
        .into()),
    }
}

/// `pwr files`
pub fn files_run(ctx: &AppContext) -> Result<()> {
    let mut project = Project::open(ctx)?;
    let files = project
        .workspace
        .list_files()
        .context("Failed to list project files")?;
    for f in files {
        println!("{f}");
    }
    Ok(())
}

/// `pwr init`
pub fn init_run(args: InitArgs, ctx: &AppContext) -> Result<()> {
    let path = config::init(&ctx.root, args.force)
        .map_err(|e| CliError::InvalidInput(format!("{e:#}")))?;
    if !ctx.quiet {
        println!("Created config file at {}", path.display());
    }
    Ok(())
}
