use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use followup_chain::batch::{self, ResultSink};
use followup_chain::context::{Alert, AnalysisRun, SeedContext};
use followup_chain::output::write_json;
use followup_chain::{backend_from_config, ChainDefinition, ChainError, ChainRunner, Config};

/// Follow-up chain runner - bounded investigative chains over analysis alerts
#[derive(Parser, Debug)]
#[command(name = "followup-chain", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one chain against a seed context file
    Run {
        /// Seed context JSON (alert, analysis_history, current_analysis)
        #[arg(long)]
        context: PathBuf,

        /// Chain definition (.json or .toml); defaults to the standard investigation
        #[arg(long)]
        chain: Option<PathBuf>,

        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the chain result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run a chain for every high-severity alert
    Batch {
        /// Alerts JSON array
        #[arg(long)]
        alerts: PathBuf,

        /// Prior analysis runs JSON array, oldest first
        #[arg(long)]
        history: PathBuf,

        /// Current analysis run JSON
        #[arg(long)]
        current: PathBuf,

        #[arg(long)]
        chain: Option<PathBuf>,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Identifier used in result file names; defaults to a timestamp
        #[arg(long)]
        run_id: Option<String>,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ChainError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn load_definition(path: Option<&Path>) -> Result<ChainDefinition, ChainError> {
    match path {
        Some(p) => ChainDefinition::from_file(p),
        None => Ok(ChainDefinition::default_investigation()),
    }
}

fn build_runner(config: &Config) -> Result<ChainRunner, ChainError> {
    let llm = backend_from_config(&config.llm)?;
    info!(model = %llm.model(), provider = ?config.llm.provider, "LLM backend ready");
    Ok(ChainRunner::new(llm, config.chain.clone()))
}

async fn run(args: Args) -> Result<(), ChainError> {
    match args.command {
        Command::Run {
            context,
            chain,
            config,
            output,
        } => {
            let config = Config::load(config.as_deref())?;
            let definition = load_definition(chain.as_deref())?;
            let seed: SeedContext = read_json(&context)?;
            let runner = build_runner(&config)?;

            let result = runner.run(&definition, seed).await?;
            match output {
                Some(path) => {
                    write_json(&path, &result)?;
                    info!(path = %path.display(), "chain result written");
                }
                None => println!("{}", serde_json::to_string_pretty(&result)?),
            }
        }
        Command::Batch {
            alerts,
            history,
            current,
            chain,
            config,
            run_id,
        } => {
            let config = Config::load(config.as_deref())?;
            let definition = load_definition(chain.as_deref())?;
            let alerts: Vec<Alert> = read_json(&alerts)?;
            let history: Vec<AnalysisRun> = read_json(&history)?;
            let current: AnalysisRun = read_json(&current)?;
            let runner = build_runner(&config)?;

            let sink = ResultSink::new(
                &config.output_dir,
                run_id.unwrap_or_else(batch::default_run_id),
            );
            let outcomes =
                batch::investigate_alerts(&runner, &definition, &alerts, &history, &current, &sink)
                    .await;
            let failed = outcomes.iter().filter(|o| o.is_failed()).count();
            if failed > 0 {
                warn!(failed, total = outcomes.len(), "some alert chains failed");
            }
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args).await?;
    Ok(())
}
