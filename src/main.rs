use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

use lakehouse::bootstrap::Stores;
use lakehouse::config::Config;
use lakehouse::logging;
use lakehouse::observability::init_metrics;
use lakehouse::pipeline::{Orchestrator, RetryPolicy, Stage};
use lakehouse::server;

#[derive(Parser)]
#[command(name = "lakehouse")]
#[command(about = "Raw -> staged -> curated wine quality pipeline and query API")]
#[command(version)]
struct Cli {
    /// Path to the TOML config (defaults to $LAKEHOUSE_CONFIG or ./lakehouse.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingest, transform and load in order
    Run {
        /// Identifies the run for stage checkpoints
        #[arg(long)]
        run_id: Option<String>,
        /// Skip stages already completed for this run id
        #[arg(long)]
        resume: bool,
        /// Whole-run retries on failure (defaults to pipeline.retries)
        #[arg(long)]
        retries: Option<u32>,
        /// Delay between retries (defaults to pipeline.retry_delay_secs)
        #[arg(long)]
        retry_delay_secs: Option<u64>,
    },
    /// Copy the configured source files into the raw layer
    Ingest,
    /// Normalize raw files into the staging table
    Transform,
    /// Enrich staged rows into the curated collection
    Load,
    /// Serve the query API
    Serve {
        /// Overrides api.port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect or reset the incremental load cursor
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    Show,
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = logging::init_logging(&config.logging);

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands, mut config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.api.port = port;
            }
            server::start_server(&config).await
        }
        Commands::Run {
            run_id,
            resume,
            retries,
            retry_delay_secs,
        } => {
            init_metrics(config.metrics.listen_addr.as_deref());
            if resume {
                config.pipeline.resume_from_checkpoint = true;
            }
            let policy = RetryPolicy {
                retries: retries.unwrap_or(config.pipeline.retries),
                delay: Duration::from_secs(retry_delay_secs.unwrap_or(config.pipeline.retry_delay_secs)),
            };
            let run_id = run_id.unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());

            let orchestrator = orchestrator(&config)?;
            let report = orchestrator.run_with_retries(&run_id, policy).await?;
            println!("\n📊 Run '{}' finished as {:?} after {} attempt(s)", report.run_id, report.state, report.attempts);
            for stage in &report.stages {
                let mark = if stage.skipped { "⏭️" } else { "✅" };
                println!("   {} {:<9} {}", mark, stage.stage.as_str(), stage.detail);
            }
            Ok(())
        }
        Commands::Ingest => run_single(&config, Stage::Ingest).await,
        Commands::Transform => run_single(&config, Stage::Transform).await,
        Commands::Load => run_single(&config, Stage::Load).await,
        Commands::Cursor { action } => {
            let orchestrator = orchestrator(&config)?;
            let watermark = orchestrator.watermark();
            match action {
                CursorAction::Show => {
                    println!("{} = {}", watermark.name(), watermark.current().await?);
                }
                CursorAction::Reset => {
                    watermark.reset().await?;
                    println!("{} reset", watermark.name());
                }
            }
            Ok(())
        }
    }
}

fn orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let stores = Stores::open(config).context("opening stores")?;
    Ok(Orchestrator::new(&stores, config))
}

async fn run_single(config: &Config, stage: Stage) -> anyhow::Result<()> {
    init_metrics(config.metrics.listen_addr.as_deref());
    let orchestrator = orchestrator(config)?;
    let outcome = orchestrator.run_stage(stage).await?;
    info!("Stage '{}' done", stage);
    println!("✅ {}: {}", outcome.stage, outcome.detail);
    Ok(())
}
