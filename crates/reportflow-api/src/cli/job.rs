//! CLI job subcommands: inspect, force-retry and purge queued jobs.

use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use reportflow_types::job::{Job, JobStatus};

use super::{format_time, parse_id, print_json};
use crate::state::EngineContext;

const HOUR: u64 = 3_600;

#[derive(Subcommand)]
pub enum JobCommand {
    /// Show one job.
    Show {
        /// Job UUID.
        id: String,
    },

    /// Re-attempt a job now, ignoring its backoff.
    Retry {
        /// Job UUID.
        id: String,
    },

    /// Purge finished jobs past their retention.
    Cleanup {
        /// Purge completed jobs that finished more than this many hours ago.
        #[arg(long, default_value = "24")]
        completed_older_than_hours: u64,

        /// Purge failed jobs that finished more than this many hours ago.
        #[arg(long, default_value = "168")]
        failed_older_than_hours: u64,
    },

    /// Show job counts per status for a queue.
    Counts {
        /// Queue name.
        #[arg(default_value = "workflows")]
        queue: String,
    },
}

pub async fn handle_job_command(cmd: JobCommand, ctx: &EngineContext, json: bool) -> Result<()> {
    if ctx.queue.is_fallback_mode() && !json {
        eprintln!(
            "  {} Durable queue unavailable; showing the empty in-process queue.",
            style("!").yellow().bold()
        );
    }

    match cmd {
        JobCommand::Show { id } => show_job(parse_id(&id, "job")?, ctx, json).await,
        JobCommand::Retry { id } => retry_job(parse_id(&id, "job")?, ctx, json).await,
        JobCommand::Cleanup {
            completed_older_than_hours,
            failed_older_than_hours,
        } => {
            cleanup(
                Duration::from_secs(completed_older_than_hours * HOUR),
                Duration::from_secs(failed_older_than_hours * HOUR),
                ctx,
                json,
            )
            .await
        }
        JobCommand::Counts { queue } => counts(&queue, ctx, json).await,
    }
}

fn status_label(status: JobStatus) -> String {
    match status {
        JobStatus::Completed => style(status).green().to_string(),
        JobStatus::Failed => style(status).red().to_string(),
        JobStatus::Active => style(status).yellow().to_string(),
        JobStatus::Pending => status.to_string(),
    }
}

fn print_job(job: &Job) {
    println!();
    println!("  Job {}", style(job.id).cyan().bold());
    println!("  Queue:     {}", job.queue_name);
    println!("  Name:      {}", job.job_name);
    println!("  Status:    {}", status_label(job.status));
    println!("  Attempts:  {}/{}", job.attempts, job.max_attempts);
    println!("  Priority:  {}", job.priority);
    if let Some(key) = &job.dedup_key {
        println!("  Dedup key: {key}");
    }
    println!("  Created:   {}", format_time(Some(job.created_at)));
    println!("  Due:       {}", format_time(Some(job.scheduled_at)));
    println!("  Claimed:   {}", format_time(job.claimed_at));
    println!("  Finished:  {}", format_time(job.finished_at));
    if let Some(error) = &job.last_error {
        println!("  Error:     {}", style(error).red());
    }
    println!("  Payload:   {}", job.payload);
    println!();
}

async fn show_job(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    let Some(job) = ctx.queue.get_job(id).await? else {
        anyhow::bail!("job {id} not found");
    };
    if json {
        return print_json(&job);
    }
    print_job(&job);
    Ok(())
}

async fn retry_job(id: Uuid, ctx: &EngineContext, json: bool) -> Result<()> {
    let job = ctx.queue.retry_job(id).await?;
    if json {
        return print_json(&job);
    }
    println!(
        "  {} Job {} will be re-attempted by the next worker poll",
        style("*").green().bold(),
        job.id
    );
    Ok(())
}

async fn cleanup(
    completed_older_than: Duration,
    failed_older_than: Duration,
    ctx: &EngineContext,
    json: bool,
) -> Result<()> {
    let completed = ctx.queue.cleanup_completed(completed_older_than).await?;
    let failed = ctx.queue.cleanup_failed(failed_older_than).await?;

    if json {
        return print_json(&serde_json::json!({
            "completed_removed": completed,
            "failed_removed": failed,
        }));
    }
    println!(
        "  {} Removed {completed} completed and {failed} failed jobs",
        style("*").green().bold()
    );
    Ok(())
}

async fn counts(queue: &str, ctx: &EngineContext, json: bool) -> Result<()> {
    let counts = ctx.queue.counts(queue).await?;
    if json {
        return print_json(&serde_json::json!({
            "queue": queue,
            "backend": ctx.queue.backend_kind(),
            "counts": counts,
        }));
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Queue").fg(Color::Cyan),
            Cell::new("Pending"),
            Cell::new("Active"),
            Cell::new("Completed"),
            Cell::new("Failed"),
        ]);
    table.add_row(vec![
        Cell::new(queue),
        Cell::new(counts.pending),
        Cell::new(counts.active).fg(Color::Yellow),
        Cell::new(counts.completed).fg(Color::Green),
        Cell::new(counts.failed).fg(Color::Red),
    ]);
    println!("{table}");
    Ok(())
}
