//! CLI circuit breaker subcommands.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use reportflow_types::breaker::BreakerPhase;

use super::{format_time, print_json};
use crate::state::EngineContext;

#[derive(Subcommand)]
pub enum BreakerCommand {
    /// List persisted breaker state.
    #[command(alias = "ls")]
    List,

    /// Close a breaker and clear its failure count.
    ///
    /// A running `rflow serve` picks the reset up on its next call through
    /// the breaker.
    Reset {
        /// Breaker name (usually the tool name).
        name: String,
    },
}

pub async fn handle_breaker_command(
    cmd: BreakerCommand,
    ctx: &EngineContext,
    json: bool,
) -> Result<()> {
    match cmd {
        BreakerCommand::List => list_breakers(ctx, json).await,
        BreakerCommand::Reset { name } => reset_breaker(&name, ctx, json).await,
    }
}

async fn list_breakers(ctx: &EngineContext, json: bool) -> Result<()> {
    let snapshots = ctx.breakers.snapshots().await?;
    if json {
        return print_json(&snapshots);
    }
    if snapshots.is_empty() {
        println!("  No breakers have recorded state yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Phase"),
            Cell::new("Failures"),
            Cell::new("Opened"),
            Cell::new("Last Error"),
        ]);

    for snap in &snapshots {
        let phase = Cell::new(snap.phase.to_string());
        let phase = match snap.phase {
            BreakerPhase::Closed => phase.fg(Color::Green),
            BreakerPhase::Open => phase.fg(Color::Red),
            BreakerPhase::HalfOpen => phase.fg(Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(&snap.name),
            phase,
            Cell::new(snap.consecutive_failures),
            Cell::new(format_time(snap.opened_at)),
            Cell::new(snap.last_error.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn reset_breaker(name: &str, ctx: &EngineContext, json: bool) -> Result<()> {
    let breaker = ctx.breakers.get(name).await;
    let before = breaker.phase();
    breaker.reset().await;

    if json {
        return print_json(&breaker.snapshot());
    }
    println!(
        "  {} Breaker '{}' reset ({before} -> closed)",
        style("*").green().bold(),
        style(name).cyan()
    );
    Ok(())
}
