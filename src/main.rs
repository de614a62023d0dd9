use anyhow::Result;
use clap::Parser;
use patchwright::{
    cli::{AppContext, Cli, Commands, exit_code_for_any},
    cli_ext::{directive_cmd, project, session_cmd},
    infra::logging,
};

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.no_color);

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(exit_code_for_any(&e));
    }
}

fn run(cli: Cli) -> Result<()> {
    // Build a context once per command; completions need no project
    let ctx = || -> Result<AppContext> {
        Ok(AppContext {
            root: project::resolve_root(&cli.root)?,
            quiet: cli.quiet,
            no_color: cli.no_color,
            verbose: cli.verbose,
        })
    };

    match cli.command {
        Commands::Parse(args) => directive_cmd::parse_run(args, &ctx()?),
        Commands::Preview(args) => directive_cmd::preview_run(args, &ctx()?),
        Commands::Apply(args) => directive_cmd::apply_run(args, &ctx()?),
        Commands::Step(args) => session_cmd::step_run(args, &ctx()?),
        Commands::Status(args) => session_cmd::status_run(args, &ctx()?),
        Commands::Diff => session_cmd::diff_run(&ctx()?),
        Commands::Checkpoints(args) => session_cmd::checkpoints_run(args, &ctx()?),
        Commands::Revert(args) => session_cmd::revert_run(args, &ctx()?),
        Commands::Discard => session_cmd::discard_run(&ctx()?),
        Commands::Commit(args) => session_cmd::commit_run(args, &ctx()?),
        Commands::Undo => session_cmd::undo_run(&ctx()?),
        Commands::History(args) => session_cmd::history_run(args, &ctx()?),
        Commands::Read(args) => project::read_run(args, &ctx()?),
        Commands::Files => project::files_run(&ctx()?),
        Commands::Init(args) => project::init_run(args, &ctx()?),
        Commands::Completions(args) => patchwright::completion::run(args),
    }
}
