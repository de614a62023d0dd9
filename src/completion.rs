//! Shell completion generation using clap_complete.

use anyhow::{Context, Result};
use clap::{Command, CommandFactory};
use clap_complete::{generate, generate_to, Shell as CompletionShell};
use std::{fs, io};

use crate::cli::{Cli, CliError, CompletionsArgs, Shell};

const BIN_NAME: &str = "pwr";

impl From<Shell> for CompletionShell {
    fn from(shell: Shell) -> Self {
        match shell {
            Shell::Bash => CompletionShell::Bash,
            Shell::Zsh => CompletionShell::Zsh,
            Shell::Fish => CompletionShell::Fish,
            Shell::PowerShell => CompletionShell::PowerShell,
            Shell::Elvish => CompletionShell::Elvish,
        }
    }
}

pub fn run(args: CompletionsArgs) -> Result<()> {
    let mut cmd: Command = Cli::command();
    let shell: CompletionShell = args.shell.into();

    if args.stdout {
        generate(shell, &mut cmd, BIN_NAME, &mut io::stdout());
        return Ok(());
    }

    let dir = args.out_dir.ok_or_else(|| {
        CliError::InvalidInput("--out-dir is required unless --stdout is set".to_string())
    })?;

    fs::create_dir_all(&dir).context("create --out-dir")?;
    let path =
        generate_to(shell, &mut cmd, BIN_NAME, &dir).context("generate completion file")?;

    eprintln!("Wrote {} completion to {}", BIN_NAME, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_completion_file_for_binary_name() {
        let tmp = TempDir::new().unwrap();
        run(CompletionsArgs {
            shell: Shell::Bash,
            out_dir: Some(tmp.path().to_path_buf()),
            stdout: false,
        })
        .unwrap();
        let script = fs::read_to_string(tmp.path().join("pwr.bash")).unwrap();
        assert!(script.contains("pwr"));
    }

    #[test]
    fn missing_out_dir_is_invalid_input() {
        let err = run(CompletionsArgs {
            shell: Shell::Zsh,
            out_dir: None,
            stdout: false,
        })
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::InvalidInput(_))));
    }
}
