//! `palletmap` – command line entry point.
//!
//! | Command  | Effect                                                        |
//! |----------|---------------------------------------------------------------|
//! | `run`    | Launch the deployment in a config file and print the live map |
//! | `check`  | Load and validate a config file                               |
//! | `schema` | Print the JSON Schema of the segment wire envelope            |
//!
//! Ctrl-C stops a running deployment gracefully: every edge node and the
//! central node finish their current tick before the final report prints.

mod render;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use palletmap_middleware::wire;
use palletmap_runtime::{DeploymentConfig, config, init_tracing, launch};
use palletmap_sim::ChaosConfig;
use tokio::sync::watch;
use tracing::warn;

#[derive(Parser)]
#[command(name = "palletmap", version, about = "Warehouse pallet positioning pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a deployment and print the active-tag map
    Run(RunArgs),
    /// Validate a deployment file
    Check(CheckArgs),
    /// Print the JSON Schema of the segment envelope
    Schema,
}

#[derive(Args)]
struct RunArgs {
    /// Deployment file
    #[arg(short, long, default_value = "config/warehouse.toml")]
    config: PathBuf,
    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,
    /// Map refresh period (milliseconds)
    #[arg(long, default_value_t = 1000)]
    refresh_ms: u64,
    /// Print one JSON line per refresh instead of a table
    #[arg(long)]
    json: bool,
    /// Duplicate and reorder segments in transit
    #[arg(long)]
    chaos: bool,
}

#[derive(Args)]
struct CheckArgs {
    /// Deployment file
    #[arg(short, long, default_value = "config/warehouse.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = init_tracing("palletmap");

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Check(args) => cmd_check(args),
        Commands::Schema => cmd_schema(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

async fn cmd_run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut cfg = config::load_from(&args.config)?;
    if args.chaos && cfg.chaos.is_none() {
        cfg.chaos = Some(ChaosConfig::default());
    }
    if cfg.simulation.is_none() {
        warn!("no [simulation] block; the map only fills from external readings");
    }
    print_summary(&cfg);

    let handle = launch(&cfg)?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let ctrlc_installed = match ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping deployment …".yellow().bold());
        let _ = stop_tx.send(true);
    }) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to install Ctrl-C handler; use --duration to stop");
            false
        }
    };

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut refresh = tokio::time::interval(Duration::from_millis(args.refresh_ms.max(50)));
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed(), if ctrlc_installed => break,
            _ = &mut deadline => break,
            _ = refresh.tick() => {
                let reader = handle.reader();
                let entries = reader.active_tags();
                let status = reader.status();
                if args.json {
                    println!("{}", render::json_line(&entries, &status)?);
                } else {
                    print!("{}", render::table(&entries, &status));
                }
            }
        }
    }

    let report = handle.shutdown().await?;
    println!();
    println!("{}", "Deployment stopped".bold().underline());
    println!(
        "  central  : {} cycles, {} active, {} stale, {} rejected in last cycle",
        report.last_cycle.cycle,
        report.last_cycle.active_tags,
        report.last_cycle.stale_tags,
        report.last_cycle.rejections(),
    );
    for edge in &report.edges {
        println!(
            "  {:<9}: {} segments, {} failed solves, {} rejected, {} resets, {} dropped",
            edge.edge_node.as_str(),
            edge.sequence,
            edge.failed_solves,
            edge.rejected_estimates,
            edge.filter_resets,
            edge.dropped_readings,
        );
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// check / schema
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_check(args: CheckArgs) -> Result<(), Box<dyn Error>> {
    let cfg = config::load_from(&args.config)?;
    println!(
        "{} {}",
        "✓".green().bold(),
        args.config.display().to_string().bold()
    );
    print_summary(&cfg);
    Ok(())
}

fn cmd_schema() -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(&wire::envelope_schema())?);
    Ok(())
}

fn print_summary(cfg: &DeploymentConfig) {
    let g = &cfg.geometry;
    println!(
        "  {} edge node(s), {} anchor(s), {} reader(s), {} obstacle(s), {} known tag(s)",
        g.edges.len(),
        g.anchors.len(),
        g.readers.len(),
        g.obstacles.len(),
        cfg.tags.len(),
    );
    for edge in &g.edges {
        println!(
            "    {} {} anchors, {} readers",
            format!("{:<12}", edge.node.as_str()).cyan(),
            edge.anchors.len(),
            edge.readers.len(),
        );
    }
    println!(
        "  trilateration {:?}, filter {:?}, tick {} ms, fusion every {} ms",
        cfg.trilateration.strategy, cfg.filter.strategy, cfg.tick_ms, cfg.fusion_interval_ms,
    );
    if let Some(sim) = &cfg.simulation {
        println!("  simulating {} pallet(s), seed {}", sim.pallets.len(), sim.seed);
    }
    if cfg.chaos.is_some() {
        println!("  {}", "chaos transport enabled".yellow());
    }
}
