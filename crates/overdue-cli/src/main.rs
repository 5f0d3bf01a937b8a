//! overdue CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "overdue")]
#[command(about = "Claim overdue units from a shared PostgreSQL table", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "OVERDUE_CONFIG", default_value = "overdue.kdl")]
    config: String,

    /// Database URL, overriding the one in the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the database schema
    Migrate,
    /// Claim overdue units once and commit
    Claim {
        /// Maximum number of units to claim (defaults to the configured batch size)
        #[arg(long)]
        limit: Option<u32>,
        /// Roll the claim back instead of committing it
        #[arg(long)]
        dry_run: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run workers until interrupted
    Work {
        /// Number of concurrent workers (defaults to the configured count)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Manage units on behalf of their owning process
    Unit {
        #[command(subcommand)]
        command: UnitCommands,
    },
    /// Record the outcome of a unit's stage
    Mark {
        /// Unit ID
        unit: String,
        /// New status: pending, completed or failed
        status: String,
        /// Stage kind (defaults to the configured claim stage)
        #[arg(long)]
        stage: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file (defaults to --config)
        path: Option<String>,
    },
}

#[derive(Subcommand)]
enum UnitCommands {
    /// Create a unit or set how long ago it was last updated
    Touch {
        /// Unit ID
        id: String,
        /// How long ago the unit was last updated, e.g. "2h"
        #[arg(long)]
        age: Option<String>,
    },
    /// Delete a unit and its work records
    Delete {
        /// Unit ID
        id: String,
    },
    /// List units with their work records
    List,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let load = || commands::load_config(&cli.config, cli.database_url.as_deref());

    match &cli.command {
        Commands::Migrate => {
            commands::migrate(&load()?).await?;
        }
        Commands::Claim {
            limit,
            dry_run,
            json,
        } => {
            commands::claim::run(&load()?, *limit, *dry_run, *json).await?;
        }
        Commands::Work { workers } => {
            commands::work::run(&load()?, *workers).await?;
        }
        Commands::Unit { command } => match command {
            UnitCommands::Touch { id, age } => {
                commands::unit::touch(&load()?, id, age.as_deref()).await?;
            }
            UnitCommands::Delete { id } => {
                commands::unit::delete(&load()?, id).await?;
            }
            UnitCommands::List => {
                commands::unit::list(&load()?).await?;
            }
        },
        Commands::Mark {
            unit,
            status,
            stage,
        } => {
            commands::mark(&load()?, unit, status, stage.as_deref()).await?;
        }
        Commands::Validate { path } => {
            commands::validate(path.as_deref().unwrap_or(&cli.config))?;
        }
    }

    Ok(())
}
