mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(about = "Transport-agnostic messaging for agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Onboard {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration, adapters and storage backends
    Status,

    /// Route one envelope and print the per-target results
    Send {
        /// Target address `scheme:destination` (repeatable)
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,

        /// JSON object used as the payload
        #[arg(short, long)]
        payload: Option<String>,

        /// Tenant id (defaults to bus.tenantId)
        #[arg(long)]
        tenant: Option<String>,

        /// Opaque credential carried in metadata
        #[arg(long)]
        token: Option<String>,
    },

    /// List audit records, newest first
    Audit {
        /// Tenant id (defaults to bus.tenantId)
        #[arg(long)]
        tenant: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print the event log of one aggregate
    Events {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        aggregate: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(force).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Send {
            targets,
            payload,
            tenant,
            token,
        } => {
            commands::send::run(targets, payload, tenant, token).await?;
        }
        Commands::Audit { tenant, limit } => {
            commands::audit::run(tenant, limit).await?;
        }
        Commands::Events { tenant, aggregate } => {
            commands::events::run(&tenant, &aggregate).await?;
        }
    }

    Ok(())
}
