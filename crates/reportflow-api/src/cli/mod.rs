//! CLI command definitions for the `rflow` binary.
//!
//! Noun-verb layout (`rflow workflow start`, `rflow schedule pause`), each
//! noun in its own module with a `handle_*_command` entry point.

pub mod breaker;
pub mod job;
pub mod schedule;
pub mod serve;
pub mod workflow;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Run report workflows on schedules through a durable job queue.
#[derive(Parser)]
#[command(name = "rflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run queue workers and the scheduler until interrupted.
    Serve,

    /// Start, inspect, run and reset workflows.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Manage cron schedules.
    Schedule {
        #[command(subcommand)]
        action: schedule::ScheduleCommand,
    },

    /// Inspect and manage queued jobs.
    Job {
        #[command(subcommand)]
        action: job::JobCommand,
    },

    /// Inspect and reset circuit breakers.
    Breaker {
        #[command(subcommand)]
        action: breaker::BreakerCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared output helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_id(raw: &str, what: &str) -> anyhow::Result<Uuid> {
    raw.trim()
        .parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a valid {what} id"))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub(crate) fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["rflow", "job", "show", "x", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn bad_ids_are_rejected_with_context() {
        let err = parse_id("not-a-uuid", "workflow").unwrap_err();
        assert!(err.to_string().contains("not a valid workflow id"));
        let id = Uuid::now_v7();
        assert_eq!(parse_id(&format!(" {id} "), "job").unwrap(), id);
    }

    #[test]
    fn missing_times_render_as_dash() {
        assert_eq!(format_time(None), "-");
    }
}
