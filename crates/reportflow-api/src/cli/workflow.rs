//! CLI workflow subcommands: start, show, list, run, reset.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use reportflow_core::queue::EnqueueOptions;
use reportflow_infra::definition::load_definition;
use reportflow_types::error::EngineError;
use reportflow_types::job::JobPayload;
use reportflow_types::workflow::{RunOutcome, StepStatus, WorkflowInstance, WorkflowStatus};

use super::{format_time, parse_id, print_json, short_id};
use crate::state::EngineContext;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Create a workflow from a YAML or JSON definition and run it.
    Start {
        /// Path to the definition file.
        file: PathBuf,

        /// Override the definition's owner id.
        #[arg(long)]
        owner: Option<String>,

        /// Enqueue the run for `rflow serve` instead of running it here.
        #[arg(long)]
        detach: bool,
    },

    /// Show a workflow and its steps.
    Show {
        /// Workflow UUID.
        id: String,
    },

    /// List recent workflows.
    #[command(alias = "ls")]
    List {
        /// Maximum number of workflows to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Run (or resume) a workflow from its current step.
    Run {
        /// Workflow UUID.
        id: String,

        /// Enqueue the run for `rflow serve` instead of running it here.
        #[arg(long)]
        detach: bool,
    },

    /// Reset a workflow to its first step. Refused while it is running.
    Reset {
        /// Workflow UUID.
        id: String,
    },
}

pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    ctx: &EngineContext,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Start {
            file,
            owner,
            detach,
        } => handle_start(&file, owner, detach, ctx, json).await,
        WorkflowCommand::Show { id } => handle_show(parse_id(&id, "workflow")?, ctx, json).await,
        WorkflowCommand::List { limit } => handle_list(limit, ctx, json).await,
        WorkflowCommand::Run { id, detach } => {
            handle_run(parse_id(&id, "workflow")?, detach, ctx, json).await
        }
        WorkflowCommand::Reset { id } => handle_reset(parse_id(&id, "workflow")?, ctx, json).await,
    }
}

// ---------------------------------------------------------------------------
// Start / run
// ---------------------------------------------------------------------------

async fn handle_start(
    file: &Path,
    owner: Option<String>,
    detach: bool,
    ctx: &EngineContext,
    json: bool,
) -> Result<()> {
    let mut definition = load_definition(file).await?;
    if let Some(owner) = owner {
        definition.owner_id = owner;
    }

    let instance = ctx
        .engine
        .create_workflow(definition)
        .await
        .context("Failed to create workflow")?;

    if !json {
        println!();
        println!(
            "  {} Created workflow '{}' ({} steps)",
            style("*").green().bold(),
            style(&instance.name).cyan(),
            instance.steps.len()
        );
        println!("  ID: {}", instance.id);
    }

    if detach {
        enqueue_run(instance.id, ctx, json).await
    } else {
        let outcome = ctx.engine.run_workflow(instance.id).await?;
        print_outcome(instance.id, &outcome, json)
    }
}

async fn handle_run(id: Uuid, detach: bool, ctx: &EngineContext, json: bool) -> Result<()> {
    // Fail fast with a clear message instead of enqueueing a poison job.
    ctx.engine.get_workflow(id).await?;

    if detach {
        return enqueue_run(id, ctx, json).await;
    }
    let outcome = ctx.engine.run_workflow(id).await?;
    print_outcome(id, &outcome, json)
}

async fn enqueue_run(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    if ctx.queue.is_fallback_mode() {
        tracing::warn!("queue is in fallback mode; the detached run only lives as long as this process");
    }
    let job_id = ctx
        .queue
        .enqueue(
            ctx.workflow_queue(),
            &JobPayload::RunWorkflow { workflow_id: id },
            EnqueueOptions::default(),
        )
        .await?;

    if json {
        print_json(&serde_json::json!({ "workflow_id": id, "job_id": job_id, "queued": true }))
    } else {
        println!(
            "  {} Queued run on '{}' (job {})",
            style("->").cyan(),
            ctx.workflow_queue(),
            job_id
        );
        println!();
        Ok(())
    }
}

fn print_outcome(id: Uuid, outcome: &RunOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "workflow_id": id, "result": outcome }));
    }
    match outcome {
        RunOutcome::Completed => {
            println!("  {} Workflow completed", style("✓").green().bold());
        }
        RunOutcome::Failed { step_index, error } => {
            println!(
                "  {} Workflow failed at step {step_index}: {}",
                style("✗").red().bold(),
                style(error).red()
            );
        }
        RunOutcome::Skipped { reason } => {
            println!("  {} Nothing to do ({reason:?})", style("-").dim());
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show / list
// ---------------------------------------------------------------------------

fn status_cell(status: WorkflowStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        WorkflowStatus::Completed => cell.fg(Color::Green),
        WorkflowStatus::Failed => cell.fg(Color::Red),
        WorkflowStatus::Running => cell.fg(Color::Yellow),
        WorkflowStatus::Pending | WorkflowStatus::Paused => cell,
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Running => cell.fg(Color::Yellow),
        StepStatus::Pending => cell,
    }
}

async fn handle_show(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    let wf = ctx.engine.get_workflow(id).await?;
    if json {
        return print_json(&wf);
    }

    println!();
    println!("  {} ({})", style(&wf.name).cyan().bold(), wf.id);
    println!("  Owner:   {}", wf.owner_id);
    println!("  Status:  {}", wf.status);
    println!("  Step:    {}/{}", wf.current_step_index, wf.steps.len());
    println!("  Created: {}", format_time(Some(wf.created_at)));
    if let Some(holder) = &wf.locked_by {
        println!("  Locked:  by {holder} at {}", format_time(wf.locked_at));
    }
    if let Some(error) = &wf.error {
        println!("  Error:   {}", style(error).red());
    }
    println!();

    println!("{}", steps_table(&wf));
    println!();
    Ok(())
}

fn steps_table(wf: &WorkflowInstance) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Tool"),
            Cell::new("Status"),
            Cell::new("Completed"),
            Cell::new("Error"),
        ]);

    for (i, step) in wf.steps.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i),
            Cell::new(&step.name),
            Cell::new(&step.tool),
            step_status_cell(step.status),
            Cell::new(format_time(step.completed_at)),
            Cell::new(step.error.as_deref().unwrap_or("")),
        ]);
    }
    table
}

async fn handle_list(limit: u32, ctx: &EngineContext, json: bool) -> Result<()> {
    let workflows = ctx.engine.list_workflows(limit).await?;
    if json {
        return print_json(&workflows);
    }
    if workflows.is_empty() {
        println!("  No workflows yet. Start one with `rflow workflow start <file>`.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Owner"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Updated"),
        ]);

    for wf in &workflows {
        table.add_row(vec![
            Cell::new(short_id(&wf.id)),
            Cell::new(&wf.name),
            Cell::new(&wf.owner_id),
            status_cell(wf.status),
            Cell::new(format!("{}/{}", wf.completed_steps(), wf.steps.len())),
            Cell::new(format_time(Some(wf.updated_at))),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Reset
// ---------------------------------------------------------------------------

async fn handle_reset(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    let wf = match ctx.engine.reset_workflow(id).await {
        Ok(wf) => wf,
        Err(EngineError::LockContention(_)) => {
            bail!("workflow {id} is currently running; reset it after the run finishes")
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        print_json(&wf)
    } else {
        println!(
            "  {} Workflow '{}' reset to step 0",
            style("*").green().bold(),
            style(&wf.name).cyan()
        );
        Ok(())
    }
}
