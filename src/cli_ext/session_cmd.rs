//! Commands over the persisted staging session and undo log.
//!
//! Every mutating command holds the state lock for its whole
//! load-modify-save cycle.

use anyhow::Result;
use owo_colors::OwoColorize;
use serde_json::json;
use tabled::{Table, Tabled};

use crate::{
    cli::{AppContext, CliError, CommitArgs, JsonArgs, RevertArgs, StepArgs},
    cli_ext::{
        directive_cmd::{
            finish, print_commit, print_diffs, print_failures, print_feedback, print_followups,
            requested_files,
        },
        project::{Project, read_input},
    },
    core::{
        apply_engine::ApplyEngine,
        preview::{content_hash, preview_session},
        state::StateLock,
    },
    infra::workspace::Workspace,
};

fn state_err(e: anyhow::Error) -> anyhow::Error {
    CliError::State(format!("{e:#}")).into()
}

fn locked(ctx: &AppContext) -> Result<(Project, StateLock)> {
    let project = Project::open(ctx)?;
    let lock = project.store.lock().map_err(state_err)?;
    Ok((project, lock))
}

/// `pwr step`: checkpoint, then stage.
pub fn step_run(args: StepArgs, ctx: &AppContext) -> Result<()> {
    let text = read_input(&args.input)?;
    let (mut project, _lock) = locked(ctx)?;
    let mut session = project.load_session()?;

    let report =
        ApplyEngine::new(&mut project.workspace).run_agent_step(&mut session, &text, &args.label);
    project.store.save_session(&session).map_err(state_err)?;

    if !ctx.quiet {
        if let Some(step) = report.step {
            println!("Checkpoint {step} ({})", args.label);
        }
        for p in &report.staged {
            println!("staged  {p}");
        }
        if report.cancelled {
            println!("Cancelled; earlier directives stay staged.");
        }
    }
    print_failures(&report.failures, ctx);
    let requested = requested_files(&project, &session, &report.requests);
    print_followups(&requested, &report.tool_calls, ctx);
    if args.feedback {
        print_feedback(&report.failures);
    }
    finish(&report.failures)
}

#[derive(Tabled)]
struct StatusRow {
    path: String,
    action: String,
    #[tabled(rename = "on disk")]
    disk: String,
}

/// `pwr status`
pub fn status_run(args: JsonArgs, ctx: &AppContext) -> Result<()> {
    let project = Project::open(ctx)?;
    let session = project.load_session()?;

    let rows: Vec<_> = session
        .list_staged()
        .into_iter()
        .map(|c| {
            let disk = match project.workspace.read_file(&c.path) {
                Ok(Some(now))
                    if c.prior_exists && content_hash(&now) == content_hash(&c.prior_content) =>
                {
                    "as staged"
                }
                Ok(None) if !c.prior_exists => "as staged",
                Ok(_) => "changed",
                Err(_) => "unreadable",
            };
            (c, disk)
        })
        .collect();

    if args.json {
        let staged: Vec<_> = rows
            .iter()
            .map(|(c, disk)| json!({ "path": c.path, "action": c.action(), "disk": disk }))
            .collect();
        let out = json!({ "step": session.step(), "staged": staged });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Step {}, {} staged change(s)", session.step(), session.len());
    if rows.is_empty() {
        return Ok(());
    }
    let table: Vec<StatusRow> = rows
        .into_iter()
        .map(|(c, disk)| StatusRow {
            path: c.path.clone(),
            action: paint_action(&c.action().to_string(), ctx),
            disk: disk.to_string(),
        })
        .collect();
    println!("{}", Table::new(table));
    Ok(())
}

fn paint_action(action: &str, ctx: &AppContext) -> String {
    if ctx.no_color {
        return action.to_string();
    }
    match action {
        "create" => action.green().to_string(),
        "delete" => action.red().to_string(),
        "modify" => action.yellow().to_string(),
        _ => action.dimmed().to_string(),
    }
}

/// `pwr diff`
pub fn diff_run(ctx: &AppContext) -> Result<()> {
    let project = Project::open(ctx)?;
    let session = project.load_session()?;
    if session.is_empty() {
        if !ctx.quiet {
            println!("Nothing staged.");
        }
        return Ok(());
    }
    print_diffs(&preview_session(&session, &project.workspace), ctx);
    Ok(())
}

#[derive(Tabled)]
struct CheckpointRow {
    step: u64,
    time: String,
    label: String,
    files: usize,
}

/// `pwr checkpoints`
pub fn checkpoints_run(args: JsonArgs, ctx: &AppContext) -> Result<()> {
    let project = Project::open(ctx)?;
    let session = project.load_session()?;

    if args.json {
        let list: Vec<_> = session
            .checkpoints()
            .map(|c| {
                json!({
                    "step": c.step,
                    "timestamp": c.timestamp,
                    "label": c.label,
                    "files": c.snapshot.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    let rows: Vec<CheckpointRow> = session
        .checkpoints()
        .map(|c| CheckpointRow {
            step: c.step,
            time: c.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            label: c.label.clone(),
            files: c.snapshot.len(),
        })
        .collect();
    if rows.is_empty() {
        if !ctx.quiet {
            println!("No checkpoints.");
        }
        return Ok(());
    }
    println!("{}", Table::new(rows));
    Ok(())
}

/// `pwr revert <STEP>`
pub fn revert_run(args: RevertArgs, ctx: &AppContext) -> Result<()> {
    let (project, _lock) = locked(ctx)?;
    let mut session = project.load_session()?;

    if !session.revert_to_step(args.step) {
        if !ctx.quiet {
            eprintln!("No checkpoint for step {}; nothing changed.", args.step);
        }
        return Ok(());
    }
    project.store.save_session(&session).map_err(state_err)?;
    if !ctx.quiet {
        println!("Reverted to step {} ({} staged change(s))", args.step, session.len());
    }
    Ok(())
}

/// `pwr discard`
pub fn discard_run(ctx: &AppContext) -> Result<()> {
    let (project, _lock) = locked(ctx)?;
    let mut session = project.load_session()?;
    let dropped = session.len();
    session.discard_all();
    project.store.save_session(&session).map_err(state_err)?;
    if !ctx.quiet {
        println!("Discarded {dropped} staged change(s).");
    }
    Ok(())
}

/// `pwr commit`
pub fn commit_run(args: CommitArgs, ctx: &AppContext) -> Result<()> {
    let (mut project, _lock) = locked(ctx)?;
    let mut session = project.load_session()?;
    let mut undo = project.load_undo()?;

    if session.is_empty() {
        if !ctx.quiet {
            println!("Nothing staged.");
        }
        return Ok(());
    }

    let report = ApplyEngine::new(&mut project.workspace).commit_session(
        &mut session,
        &mut undo,
        &args.label,
    );
    // Persisted even on partial failure
    project.store.save_session(&session).map_err(state_err)?;
    project.store.save_undo(&undo).map_err(state_err)?;

    print_commit(&report, ctx);
    finish(&report.failures)
}

/// `pwr undo`
pub fn undo_run(ctx: &AppContext) -> Result<()> {
    let (mut project, _lock) = locked(ctx)?;
    let mut undo = project.load_undo()?;

    let Some(report) = undo.undo_last(&mut project.workspace) else {
        if !ctx.quiet {
            println!("Nothing to undo.");
        }
        return Ok(());
    };
    project.store.save_undo(&undo).map_err(state_err)?;

    if !ctx.quiet {
        println!("Undid {} ({})", report.batch_id, report.label);
        for p in &report.restored {
            println!("restored {p}");
        }
        for p in &report.removed {
            println!("removed  {p}");
        }
    }
    if report.is_clean() {
        return Ok(());
    }
    for f in &report.failures {
        eprintln!("failed {}: {}", f.path, f.error);
    }
    Err(CliError::State(format!("{} path(s) could not be restored", report.failures.len())).into())
}

#[derive(Tabled)]
struct HistoryRow {
    id: String,
    time: String,
    label: String,
    files: usize,
}

/// `pwr history`
pub fn history_run(args: JsonArgs, ctx: &AppContext) -> Result<()> {
    let project = Project::open(ctx)?;
    let undo = project.load_undo()?;
    let mut batches: Vec<_> = undo.batches().collect();
    batches.reverse();

    if args.json {
        let list: Vec<_> = batches
            .iter()
            .map(|b| {
                let paths: Vec<&str> = b.ops.iter().map(|op| op.path.as_str()).collect();
                json!({ "id": b.id, "timestamp": b.timestamp, "label": b.label, "paths": paths })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if batches.is_empty() {
        if !ctx.quiet {
            println!("No undo history.");
        }
        return Ok(());
    }
    let rows: Vec<HistoryRow> = batches
        .into_iter()
        .map(|b| HistoryRow {
            id: b.id.clone(),
            time: b.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            label: b.label.clone(),
            files: b.ops.len(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}
