// Warmpool CLI
//
// Design Decision: Use clap derive with env fallbacks for the connection flags.
// Design Decision: Everything else comes from PoolConfig::from_env (after .env is loaded).
// Design Decision: Support text/json output formats for scripting.

mod commands;
mod output;
mod telemetry;

use anyhow::Context;
use clap::{Parser, Subcommand};
use warmpool::PoolConfig;

use crate::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "warmpool")]
#[command(about = "Warmpool CLI - Seed, lease, monitor and drain a warm worker pool")]
#[command(version)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Execution service base URL
    #[arg(long, env = "EXECUTION_API_URL")]
    pub execution_api_url: Option<String>,

    /// Record partition of the pool
    #[arg(long, env = "WARMPOOL_PARTITION")]
    pub partition: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch workers into the pool
    Seed {
        /// Number of workers to launch
        count: usize,

        /// Launches in flight at once
        #[arg(long, default_value_t = warmpool::launcher::DEFAULT_LAUNCH_CONCURRENCY)]
        concurrency: usize,
    },

    /// Lease workers to generated requesters
    Grab {
        /// Number of grab attempts
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Show launching / available / occupied counts
    Monitor,

    /// Stop and delete up to N leased workers
    Reap {
        /// Maximum number of workers to reap
        #[arg(long, default_value_t = 1)]
        max: usize,
    },

    /// Stop every worker and delete every record
    Drain {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Replace leased workers until interrupted
    Run,
}

impl Cli {
    /// Environment configuration with the command-line overrides applied
    fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let mut config = PoolConfig::from_env().context("Invalid pool configuration")?;
        if let Some(url) = &self.database_url {
            config = config.with_database_url(url);
        }
        if let Some(url) = &self.execution_api_url {
            config = config.with_execution_api_url(url);
        }
        if let Some(partition) = &self.partition {
            config = config.with_partition(partition);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(TelemetryConfig::from_env());

    let cli = Cli::parse();
    let config = cli.pool_config()?;
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Seed { count, concurrency } => {
            commands::seed::run(&config, output_format, count, concurrency).await
        }
        Commands::Grab { count } => commands::grab::run(&config, output_format, count).await,
        Commands::Monitor => commands::monitor::run(&config, output_format).await,
        Commands::Reap { max } => commands::reap::run(&config, output_format, max).await,
        Commands::Drain { yes } => commands::drain::run(&config, output_format, yes).await,
        Commands::Run => commands::replenish::run(&config, output_format).await,
    }
}
