//! `jobrelay`: runs the outbox bridge and job workers against Postgres.
//!
//! Commands that report something print JSON on stdout; logs go to stderr.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use jobrelay_core::JobId;
use jobrelay_infra::RelayConfig;

#[derive(Parser)]
#[command(name = "jobrelay", version)]
#[command(about = "Relay outbox events into a durable job queue and run workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database schema (idempotent)
    Migrate,

    /// Run the bridge and a worker pool until interrupted
    Run {
        #[arg(long)]
        dry_run: bool,
    },

    /// Bridge outbox rows into the job queue
    Bridge {
        /// Run a single cycle and print its report
        #[arg(long)]
        once: bool,
    },

    /// Run a worker pool until interrupted
    Worker {
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Print a stats snapshot
    Stats,

    /// Re-enqueue a dead job as a new pending job
    Replay { job_id: JobId },

    /// Delete done jobs older than the given age
    Prune {
        #[arg(long, default_value_t = 168)]
        older_than_hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    jobrelay_observability::init();

    let cli = Cli::parse();
    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    match cli.command {
        Commands::Migrate => commands::migrate(&config).await,
        Commands::Run { dry_run } => commands::run(&config, dry_run).await,
        Commands::Bridge { once } => commands::bridge(&config, once).await,
        Commands::Worker {
            concurrency,
            dry_run,
        } => commands::worker(&config, concurrency, dry_run).await,
        Commands::Stats => commands::stats(&config).await,
        Commands::Replay { job_id } => commands::replay(&config, job_id).await,
        Commands::Prune { older_than_hours } => commands::prune(&config, older_than_hours).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["jobrelay", "replay", "42"]).unwrap();
        assert!(matches!(cli.command, Commands::Replay { job_id } if job_id == JobId::new(42)));

        let cli = Cli::try_parse_from(["jobrelay", "worker", "--concurrency", "4", "--dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Worker { concurrency: Some(4), dry_run: true }
        ));

        let cli = Cli::try_parse_from(["jobrelay", "prune"]).unwrap();
        assert!(matches!(cli.command, Commands::Prune { older_than_hours: 168 }));

        assert!(Cli::try_parse_from(["jobrelay", "replay", "not-a-number"]).is_err());
    }
}
