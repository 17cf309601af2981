use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

use commands::CliContext;

#[derive(Parser)]
#[command(
    name = "switchyard",
    about = "Switchyard — blue/green rollout orchestrator",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to switchyard.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the state database (default: .switchyard, or
    /// [store].data_dir from the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start, inspect, or cancel rollouts
    Rollout {
        #[command(subcommand)]
        action: RolloutAction,
    },
    /// Print the deployment ledger for a unit
    History {
        #[arg(short, long)]
        unit: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
enum RolloutAction {
    /// Start a blue/green rollout and wait for it to finish.
    ///
    /// Exits nonzero if a rollout is already in flight for the unit or
    /// the rollout ends in any state other than complete.
    Start {
        /// Deployable unit (logical service) to roll out
        #[arg(short, long)]
        unit: String,
        /// Artifact reference (image/version) for the candidate group
        #[arg(short, long)]
        artifact: String,
        /// Number of targets in the candidate group
        #[arg(short, long, default_value_t = 2)]
        size: u32,
    },
    /// Show the current state, split, and health of a rollout
    Status {
        #[arg(short, long)]
        id: String,
    },
    /// Cancel an in-flight rollout (forces the rollback path)
    Cancel {
        #[arg(short, long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchyard=info".parse()?),
        )
        .init();

    let Cli {
        config,
        data_dir,
        command,
    } = Cli::parse();
    let ctx = CliContext::open(config.as_deref(), data_dir.as_deref())?;

    match command {
        Commands::Rollout { action } => match action {
            RolloutAction::Start {
                unit,
                artifact,
                size,
            } => commands::rollout::start(&ctx, &unit, &artifact, size).await,
            RolloutAction::Status { id } => commands::rollout::status(&ctx, &id),
            RolloutAction::Cancel { id } => commands::rollout::cancel(&ctx, &id).await,
        },
        Commands::History { unit, format } => commands::history::show(&ctx, &unit, &format),
    }
}
