//! CLI schedule subcommands.
//!
//! Timers only run inside `rflow serve`. Commands here persist the change and
//! stop the short-lived timer the scheduler starts for it. A running `serve`
//! re-syncs with the schedule table every `scheduler.reconcile_interval_ms`,
//! and its timers re-check their schedule before each fire.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use uuid::Uuid;

use reportflow_types::schedule::{NewSchedule, Schedule, ScheduleStatus};

use super::{format_time, parse_id, print_json, short_id};
use crate::state::EngineContext;

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Attach a cron schedule to an existing workflow.
    Create {
        /// Workflow UUID to run on each tick.
        #[arg(long)]
        workflow: String,

        /// Cron expression (5 or 6 fields) or a phrase like "every 5 minutes".
        cron: String,
    },

    /// Show one schedule.
    Show {
        /// Schedule UUID.
        id: String,
    },

    /// List schedules.
    #[command(alias = "ls")]
    List {
        /// Only show schedules with this status (active, paused, failed).
        #[arg(long)]
        status: Option<ScheduleStatus>,
    },

    /// Pause a schedule.
    Pause {
        /// Schedule UUID.
        id: String,
    },

    /// Reactivate a paused or failed schedule.
    Resume {
        /// Schedule UUID.
        id: String,
    },

    /// Delete a schedule.
    Delete {
        /// Schedule UUID.
        id: String,

        /// Skip confirmation prompt.
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_schedule_command(
    cmd: ScheduleCommand,
    ctx: &EngineContext,
    json: bool,
) -> Result<()> {
    match cmd {
        ScheduleCommand::Create { workflow, cron } => {
            create_schedule(parse_id(&workflow, "workflow")?, cron, ctx, json).await
        }
        ScheduleCommand::Show { id } => show_schedule(parse_id(&id, "schedule")?, ctx, json).await,
        ScheduleCommand::List { status } => list_schedules(status, ctx, json).await,
        ScheduleCommand::Pause { id } => pause_schedule(parse_id(&id, "schedule")?, ctx, json).await,
        ScheduleCommand::Resume { id } => {
            resume_schedule(parse_id(&id, "schedule")?, ctx, json).await
        }
        ScheduleCommand::Delete { id, force } => {
            delete_schedule(parse_id(&id, "schedule")?, force, ctx, json).await
        }
    }
}

fn status_cell(status: ScheduleStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        ScheduleStatus::Active => cell.fg(Color::Green),
        ScheduleStatus::Paused => cell.fg(Color::Yellow),
        ScheduleStatus::Failed => cell.fg(Color::Red),
    }
}

async fn create_schedule(
    workflow_id: Uuid,
    cron: String,
    ctx: &EngineContext,
    json: bool,
) -> Result<()> {
    ctx.engine.get_workflow(workflow_id).await?;

    let result = ctx
        .scheduler
        .register_schedule(NewSchedule { cron, workflow_id })
        .await;
    ctx.scheduler.shutdown().await;
    let schedule = result?;

    if json {
        return print_json(&schedule);
    }
    println!();
    println!(
        "  {} Schedule created ({})",
        style("*").green().bold(),
        style(&schedule.cron).cyan()
    );
    println!("  ID: {}", schedule.id);
    println!(
        "  {}",
        style("A running `rflow serve` picks it up within its reconcile interval.").dim()
    );
    println!();
    Ok(())
}

async fn show_schedule(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    let schedule = ctx.scheduler.get_schedule(id).await?;
    if json {
        return print_json(&schedule);
    }
    print_schedule(&schedule);
    Ok(())
}

fn print_schedule(s: &Schedule) {
    println!();
    println!("  Schedule {}", style(s.id).cyan().bold());
    println!("  Workflow: {}", s.workflow_id);
    println!("  Cron:     {}", s.cron);
    println!("  Status:   {}", s.status);
    println!("  Last run: {}", format_time(s.last_run_at));
    if let Some(error) = &s.last_error {
        println!("  Error:    {}", style(error).red());
    }
    println!("  Created:  {}", format_time(Some(s.created_at)));
    println!();
}

async fn list_schedules(
    status: Option<ScheduleStatus>,
    ctx: &EngineContext,
    json: bool,
) -> Result<()> {
    let schedules = ctx.scheduler.list_schedules(status).await?;
    if json {
        return print_json(&schedules);
    }
    if schedules.is_empty() {
        println!("  No schedules.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Cron"),
            Cell::new("Status"),
            Cell::new("Last Run"),
            Cell::new("Error"),
        ]);

    for s in &schedules {
        table.add_row(vec![
            Cell::new(short_id(&s.id)),
            Cell::new(short_id(&s.workflow_id)),
            Cell::new(&s.cron),
            status_cell(s.status),
            Cell::new(format_time(s.last_run_at)),
            Cell::new(s.last_error.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn pause_schedule(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    // stop_schedule is a no-op for unknown ids; the CLI should say so.
    ctx.scheduler.get_schedule(id).await?;
    ctx.scheduler.stop_schedule(id).await?;
    let schedule = ctx.scheduler.get_schedule(id).await?;

    if json {
        print_json(&schedule)
    } else {
        println!("  {} Schedule {} paused", style("*").yellow().bold(), short_id(&id));
        Ok(())
    }
}

async fn resume_schedule(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    let result = ctx.scheduler.resume_schedule(id).await;
    ctx.scheduler.shutdown().await;
    let schedule = result?;

    if json {
        print_json(&schedule)
    } else {
        println!("  {} Schedule {} resumed", style("*").green().bold(), short_id(&id));
        Ok(())
    }
}

async fn delete_schedule(id: Uuid, force: bool, ctx: &EngineContext, json: bool) -> Result<()> {
    let schedule = ctx.scheduler.get_schedule(id).await?;

    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete schedule {} ({}) for workflow {}?",
                short_id(&schedule.id),
                schedule.cron,
                short_id(&schedule.workflow_id)
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    if !ctx.scheduler.delete_schedule(id).await? {
        bail!("schedule {id} disappeared before it could be deleted");
    }

    if json {
        print_json(&serde_json::json!({ "deleted": true, "id": id }))
    } else {
        println!(
            "  {} Schedule {} deleted",
            style("*").green().bold(),
            short_id(&id)
        );
        Ok(())
    }
}
