use anyhow::Result;
use clap::{Parser, Subcommand};
use ethos_sync::SyncConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ethos-cli")]
#[command(about = "Ethnicity store command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the schema and load the concept seed.
    CreateDb,
    /// Drop the schema and everything in it.
    DropDb,
    /// Reload the concept seed into an existing schema.
    Seed,
    /// Extract every enabled source, upsert participants and resolve them.
    Sync,
    /// Print the best ethnicity code for one participant.
    Resolve { participant_id: String },
    /// Re-resolve every stored participant.
    Recompute,
    /// Summarize recent runs from the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(config: &SyncConfig) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.environment.default_log_filter()))
    };

    let console = config
        .environment
        .console_logging()
        .then(|| fmt::layer().with_target(false).with_filter(filter()));

    let (file, guard) = if config.environment.file_logging() {
        let (writer, guard) = tracing_appender::non_blocking(config.log_file_appender()?);
        let layer = fmt::layer().with_ansi(false).with_writer(writer).with_filter(filter());
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;
    // flushes the file writer on exit
    let _log_guard = init_tracing(&config)?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::CreateDb => {
            let concepts = ethos_sync::create_store_from_env().await?;
            println!("schema created: concepts={concepts}");
        }
        Commands::DropDb => {
            ethos_sync::drop_store_from_env().await?;
            println!("schema dropped");
        }
        Commands::Seed => {
            let concepts = ethos_sync::seed_vocabulary_from_env().await?;
            println!("vocabulary seeded: concepts={concepts}");
        }
        Commands::Sync => {
            let summary = ethos_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} failed_sources={} participants={} resolved={} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.failed_sources,
                summary.participants_upserted,
                summary.resolved_participants,
                summary.reports_dir
            );
        }
        Commands::Resolve { participant_id } => {
            let code = ethos_sync::resolve_from_env(&participant_id).await?;
            println!("{participant_id}\t{code}");
        }
        Commands::Recompute => {
            let outcome = ethos_sync::recompute_all_from_env().await?;
            println!(
                "recompute complete: resolved={} no_data={} failures={}",
                outcome.resolved.len(),
                outcome.no_data.len(),
                outcome.failures.len()
            );
        }
        Commands::Report { runs } => {
            println!("{}", ethos_sync::report_runs_markdown(runs, Some(config.workspace_root.clone()))?);
        }
    }

    Ok(())
}
