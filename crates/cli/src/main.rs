mod config;
mod serve;

use std::error::Error;
use std::future::Future;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use runsync_core::{SyncOrchestrator, TriggerResponse};
use runsync_engine::GraphqlEngine;
use runsync_postgres::PostgresStorage;

use crate::config::Config;

type CliResult = Result<(), Box<dyn Error>>;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Keeps local run, step and log state in sync with an execution engine.
#[derive(Parser)]
#[command(
    name = "runsync",
    version,
    about = "Run status sync engine for a GraphQL execution engine"
)]
struct Cli {
    /// Path to the TOML config file (default: ./runsync.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic sync driver and the HTTP trigger hook
    Serve {
        /// Port to listen on (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one reconciliation pass and exit
    Tick,

    /// Sync one run now, ignoring the cursor
    Sync {
        /// Engine run id
        run_id: String,
    },

    /// Apply the database schema
    Migrate,

    /// Print the effective configuration with secrets redacted
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Config => cmd_config(&config),
        Commands::Serve { port } => block_on(cmd_serve(config, port)),
        Commands::Tick => block_on(cmd_tick(config, cli.output)),
        Commands::Sync { run_id } => block_on(cmd_sync(config, run_id, cli.output)),
        Commands::Migrate => block_on(cmd_migrate(config)),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the default filter.
fn init_logging(json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "runsync=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing init failed: {err}");
    }
}

fn block_on(command: impl Future<Output = CliResult>) {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(command) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn orchestrator(
    config: &Config,
) -> Result<SyncOrchestrator<GraphqlEngine, PostgresStorage>, Box<dyn Error>> {
    let engine = GraphqlEngine::new(config.engine_config()?);
    let storage = PostgresStorage::connect(config.database_url()?).await?;
    Ok(SyncOrchestrator::new(
        Arc::new(engine),
        Arc::new(storage),
        config.sync_settings(),
    ))
}

// ─── Subcommands ────────────────────────────────────────────────────────────

fn cmd_config(config: &Config) {
    match serde_json::to_string_pretty(&config.redacted()) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

async fn cmd_serve(config: Config, port: Option<u16>) -> CliResult {
    let orchestrator = orchestrator(&config).await?;
    orchestrator.storage().migrate().await?;
    serve::start_server(
        Arc::new(orchestrator),
        port.unwrap_or(config.server.port),
        config.interval(),
    )
    .await
}

async fn cmd_tick(config: Config, output: OutputFormat) -> CliResult {
    let report = orchestrator(&config).await?.tick().await?;
    match output {
        OutputFormat::Text => println!("{report}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

async fn cmd_sync(config: Config, run_id: String, output: OutputFormat) -> CliResult {
    let response = orchestrator(&config).await?.trigger_sync(&run_id).await;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Text => print_trigger_response(&run_id, &response),
    }
    match response {
        TriggerResponse::Synced { .. } => Ok(()),
        _ => Err(format!("run {run_id} was not synced").into()),
    }
}

fn print_trigger_response(run_id: &str, response: &TriggerResponse) {
    match response {
        TriggerResponse::Synced {
            status,
            output_locations,
            log_count,
            ..
        } => {
            println!("run {run_id}: {status} ({log_count} log entries written)");
            for location in output_locations {
                match &location.name {
                    Some(name) => println!("  {name}: {}", location.path),
                    None => println!("  {}", location.path),
                }
            }
        }
        TriggerResponse::NotFound { message } | TriggerResponse::Error { message } => {
            println!("{message}");
        }
    }
}

async fn cmd_migrate(config: Config) -> CliResult {
    let storage = PostgresStorage::connect(config.database_url()?).await?;
    storage.migrate().await?;
    println!("migrations applied");
    Ok(())
}
