//! `parse`, `preview`, and `apply`: commands that act on model output
//! directly without the persisted session.

use anyhow::Result;
use miette::Diagnostic;
use owo_colors::OwoColorize;
use serde_json::json;
use tracing::info;

use crate::{
    cli::{AppContext, ApplyArgs, CliError, InputArgs, ParseArgs},
    cli_ext::project::{Project, read_input},
    core::{
        apply_engine::{
            ApplyEngine, CommitReport, DirectiveError, Failure, RequestedFile, gather_requested,
            model_feedback,
        },
        directive::{Directive, ParseError, ToolCall, parse_directives},
        preview::{FileDiff, colorize, preview_directives},
        session::StagingSession,
    },
};

/// Parsed directives, or an invalid-input error when there are none.
fn parse_input(args: &InputArgs) -> Result<Vec<Result<Directive, ParseError>>> {
    let text = read_input(args)?;
    let directives = parse_directives(&text);
    if directives.is_empty() {
        return Err(CliError::InvalidInput("no directive blocks found".to_string()).into());
    }
    Ok(directives)
}

/// `pwr parse`
pub fn parse_run(args: ParseArgs, ctx: &AppContext) -> Result<()> {
    let text = read_input(&args.input)?;
    let directives = parse_directives(&text);

    if args.json {
        let entries: Vec<_> = directives
            .iter()
            .enumerate()
            .map(|(index, d)| match d {
                Ok(d) => json!({ "index": index, "directive": d }),
                Err(e) => json!({ "index": index, "error": e.to_string() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if directives.is_empty() && !ctx.quiet {
        eprintln!("No directive blocks found.");
    }
    for (index, d) in directives.iter().enumerate() {
        match d {
            Ok(d) => println!("#{:<3} {}", index + 1, describe(d)),
            Err(e) => println!("#{:<3} {} {e}", index + 1, paint_err("error:", ctx)),
        }
    }
    Ok(())
}

/// `pwr preview`
pub fn preview_run(args: InputArgs, ctx: &AppContext) -> Result<()> {
    let directives = parse_input(&args)?;
    let mut project = Project::open(ctx)?;
    let session = project.load_session()?;
    let (diffs, report) = preview_directives(&mut project.workspace, directives);

    print_diffs(&diffs, ctx);
    print_failures(&report.failures, ctx);
    let requested = requested_files(&project, &session, &report.requests);
    print_followups(&requested, &report.tool_calls, ctx);

    if report.failures.is_empty() {
        Ok(())
    } else {
        Err(CliError::Conflicts(format!("{} directive(s) would fail", report.failures.len())).into())
    }
}

/// `pwr apply`: preview by default, write with `--yes`.
pub fn apply_run(args: ApplyArgs, ctx: &AppContext) -> Result<()> {
    if !args.yes {
        if !ctx.quiet {
            eprintln!("Safety mode: showing preview only. Use --yes to write changes.");
        }
        return preview_run(args.input, ctx);
    }

    let directives = parse_input(&args.input)?;
    let mut project = Project::open(ctx)?;
    let _lock = project
        .store
        .lock()
        .map_err(|e| CliError::State(format!("{e:#}")))?;
    let mut undo = project.load_undo()?;
    let session = project.load_session()?;

    let report =
        ApplyEngine::new(&mut project.workspace).apply_directives(&mut undo, directives, &args.label);
    project
        .store
        .save_undo(&undo)
        .map_err(|e| CliError::State(format!("{e:#}")))?;
    info!(written = report.written.len(), deleted = report.deleted.len(), "apply finished");

    print_commit(&report, ctx);
    let requested = requested_files(&project, &session, &report.requests);
    print_followups(&requested, &report.tool_calls, ctx);
    if args.feedback {
        print_feedback(&report.failures);
    }
    finish(&report.failures)
}

/// Answer `request` directives as the session sees the files.
pub(crate) fn requested_files(
    project: &Project,
    session: &StagingSession,
    paths: &[String],
) -> Vec<RequestedFile> {
    gather_requested(session, &project.workspace, paths, project.config.read_max_chars)
}

/// Exit status for a run that may have partially failed.
pub(crate) fn finish(failures: &[Failure]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let reasons: Vec<&str> = failures.iter().map(|f| f.error.code()).collect();
    Err(CliError::Conflicts(format!("{} failed ({})", failures.len(), reasons.join(", "))).into())
}

pub(crate) fn describe(d: &Directive) -> String {
    match d {
        Directive::WriteFile { path, content } => {
            format!("file    {path} ({} lines)", content.lines().count())
        }
        Directive::ApplyEdit { path, body } => {
            let blocks = body.lines().filter(|l| l.trim() == "<<<<<<< SEARCH").count();
            format!("edit    {path} ({blocks} block(s))")
        }
        Directive::DeleteFile { path } => format!("delete  {path}"),
        Directive::RequestFiles { paths } => format!("request {}", paths.join(", ")),
        Directive::ToolCall(call) => format!("tool    {} {}", call.name, call.args),
    }
}

fn paint_err(s: &str, ctx: &AppContext) -> String {
    if ctx.no_color { s.to_string() } else { s.red().bold().to_string() }
}

pub(crate) fn print_diffs(diffs: &[FileDiff], ctx: &AppContext) {
    for d in diffs {
        if d.drifted && !ctx.quiet {
            eprintln!("note: {} changed on disk since it was staged", d.path);
        }
        if d.unified.is_empty() {
            if !ctx.quiet {
                println!("{} ({}, no content change)", d.path, d.action);
            }
            continue;
        }
        if ctx.no_color {
            print!("{}", d.unified);
        } else {
            print!("{}", colorize(&d.unified));
        }
    }
}

/// One line per failure, plus miette help for patch errors.
pub(crate) fn print_failures(failures: &[Failure], ctx: &AppContext) {
    for f in failures {
        let target = f.path.as_deref().unwrap_or("-");
        eprintln!(
            "{} #{} {target}: {}",
            paint_err("failed", ctx),
            f.index + 1,
            f.error
        );
        if let DirectiveError::Patch { source, .. } = &f.error
            && let Some(help) = source.help()
        {
            eprintln!("  help: {help}");
        }
    }
}

/// Requested file contents always print; tool calls are informational.
pub(crate) fn print_followups(requested: &[RequestedFile], tools: &[ToolCall], ctx: &AppContext) {
    for file in requested {
        match &file.content {
            Some(content) => {
                println!("--- requested: {} ---", file.path);
                print!("{content}");
                if !content.ends_with('\n') {
                    println!();
                }
            }
            None => println!("--- requested: {} (missing) ---", file.path),
        }
    }
    if ctx.quiet {
        return;
    }
    for call in tools {
        println!("Tool call: {} {}", call.name, call.args);
    }
}

pub(crate) fn print_commit(report: &CommitReport, ctx: &AppContext) {
    if !ctx.quiet {
        for p in &report.written {
            println!("wrote   {p}");
        }
        for p in &report.deleted {
            println!("deleted {p}");
        }
        if let Some(id) = &report.undo_batch {
            println!(
                "Recorded undo batch {id} ({} file(s)); run `pwr undo` to reverse.",
                report.touched()
            );
        }
        if report.cancelled {
            println!("Cancelled before all changes were written.");
        }
    }
    print_failures(&report.failures, ctx);
}

/// Retry prompt printer shared with `step`.
pub(crate) fn print_feedback(failures: &[Failure]) {
    if let Some(prompt) = model_feedback(failures) {
        println!("{prompt}");
    }
}
