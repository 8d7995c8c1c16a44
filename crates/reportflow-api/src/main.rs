//! reportflow CLI entry point.
//!
//! Binary name: `rflow`
//!
//! Parses CLI arguments, wires the engine context, then dispatches to the
//! command handler or runs the worker process (`rflow serve`).

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use reportflow_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::EngineContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,reportflow_core=debug,reportflow_infra=debug",
        _ => "trace",
    };
    // Commands that block on `serve` want progress logs by default.
    let filter = match (&cli.command, cli.verbose, cli.quiet) {
        (Commands::Serve, 0, false) => "info",
        _ => filter,
    };

    if let Err(e) = init_tracing(&TracingOptions {
        default_filter: filter.to_string(),
        json: cli.json,
        enable_otel: cli.otel,
    }) {
        eprintln!("warning: tracing not initialized: {e}");
    }

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "rflow", &mut std::io::stdout());
        return Ok(());
    }

    let ctx = EngineContext::init().await?;
    tracing::debug!(data_dir = %ctx.data_dir.display(), "engine context ready");

    let result = match cli.command {
        Commands::Serve => cli::serve::run_serve(&ctx, cli.json).await,
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &ctx, cli.json).await
        }
        Commands::Schedule { action } => {
            cli::schedule::handle_schedule_command(action, &ctx, cli.json).await
        }
        Commands::Job { action } => cli::job::handle_job_command(action, &ctx, cli.json).await,
        Commands::Breaker { action } => {
            cli::breaker::handle_breaker_command(action, &ctx, cli.json).await
        }
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}
