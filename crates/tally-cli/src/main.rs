//! 🚀 tally-cli: the front door. Parses args, loads config, sets up logging,
//! then lets the library do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tally::{Command, Outcome, TallyError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "Seed a search store and count group members that match a filter")]
struct Cli {
    /// TOML config file. `TALLY_*` environment variables apply either way.
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Create the person and group collections with their mappings.
    Setup,
    /// Generate and bulk-load N synthetic people.
    LoadPersons {
        #[arg(long)]
        count: usize,
    },
    /// Generate and bulk-load N groups whose members come from stored people.
    LoadGroups {
        #[arg(long)]
        count: usize,
        /// How many stored people to sample as the member pool, 1 to 10 000.
        #[arg(long)]
        pool_size: Option<usize>,
    },
    /// Count matching members per group and write the result file.
    Aggregate {
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overlap scrolling and aggregation through a bounded queue.
        #[arg(long)]
        streaming: bool,
    },
    /// Document counts for both collections and for the aggregate filter.
    Count,
    /// Cluster health, the short version.
    Health,
}

impl From<CliCommand> for Command {
    fn from(command: CliCommand) -> Self {
        match command {
            CliCommand::Setup => Command::Setup,
            CliCommand::LoadPersons { count } => Command::LoadPersons { count },
            CliCommand::LoadGroups { count, pool_size } => Command::LoadGroups { count, pool_size },
            CliCommand::Aggregate { output, streaming } => Command::Aggregate { output, streaming },
            CliCommand::Count => Command::Count,
            CliCommand::Health => Command::Health,
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<Outcome> {
    // 🔒 a config path that doesn't exist is a typo, not a request for defaults
    if let Some(path) = &cli.config {
        let exists = path.try_exists().with_context(|| {
            format!("💀 Couldn't check whether the config file exists: '{}'", path.display())
        })?;
        if !exists {
            return Err::<Outcome, _>(TallyError::Configuration(format!(
                "config file '{}' not found. Relative paths resolve against the current directory.",
                path.display()
            )))
            .context("💀 In tally-cli, main, we couldn't find the config file");
        }
    }

    let app_config = tally::app_config::load_config(cli.config.as_deref())
        .map_err(|e| TallyError::Configuration(format!("{e:#}")))
        .context("💀 In tally-cli, main, we couldn't load the config. Take a look at the file and the TALLY_* env vars")?;

    tally::run(&app_config, cli.command.into()).await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(outcome) => {
            if let Outcome::Aggregated { output, matched_people, merged } = &outcome {
                info!(
                    "✅ {matched_people} matching people across {} group(s) → {}",
                    merged.len(),
                    output.display()
                );
            }
            println!("{}", outcome.table());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }

            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like the search store isn't reachable. \
                    Double-check that Elasticsearch is actually running and that store.Elasticsearch.url points at it. \
                    If you're using Docker, try `docker ps` to see what's up, or `docker compose up -d` to resurrect it. ☕"
                );
            }

            let code = err.downcast_ref::<TallyError>().map_or(1, TallyError::exit_code);
            ExitCode::from(code)
        }
    }
}
