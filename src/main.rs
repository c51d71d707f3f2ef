use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "flowmaster")]
#[command(version, about = "Master flow orchestration engine")]
pub struct Cli {
    /// Path to flowmaster.toml
    #[arg(short, long, global = true, default_value = flowmaster::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Flow database path. Overrides the config file and FLOWMASTER_DATABASE.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Log filter directive, e.g. "debug" or "flowmaster=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered flow types and their phases
    Types,
    /// Create a flow on its initial phase
    Create {
        flow_type: String,
        #[arg(long)]
        client: String,
        #[arg(long)]
        engagement: String,
        #[arg(long)]
        user: String,
        /// Flow configuration as a JSON object
        #[arg(long)]
        config_json: Option<String>,
    },
    /// Execute one phase of a flow
    Advance {
        flow_id: String,
        /// Phase to run instead of the current one
        #[arg(long)]
        phase: Option<String>,
        /// Input overrides as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Keep advancing until the flow stops running
        #[arg(long, conflicts_with = "phase")]
        all: bool,
    },
    /// Show lifecycle and current phase of a flow
    Status {
        flow_id: String,
        /// Include the full master and child records
        #[arg(long)]
        full: bool,
    },
    /// List the flows of one tenant
    List {
        #[arg(long)]
        client: String,
        #[arg(long)]
        engagement: String,
        #[arg(long = "type")]
        flow_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    Pause {
        flow_id: String,
    },
    Resume {
        flow_id: String,
    },
    Cancel {
        flow_id: String,
    },
    /// Return a failed flow to running
    Recover {
        flow_id: String,
    },
    /// Soft-delete a flow, or remove it permanently with --purge
    Delete {
        flow_id: String,
        #[arg(long)]
        purge: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default flowmaster.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = cmd::load_config(&cli)?;
    let _log_guard = flowmaster::logging::init(&config.logging)?;

    match &cli.command {
        Commands::Types => cmd::cmd_types(&cli)?,
        Commands::Config { command } => cmd::cmd_config(&cli, &config, command.clone())?,
        Commands::Create {
            flow_type,
            client,
            engagement,
            user,
            config_json,
        } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_create(&app, &cli, flow_type, client, engagement, user, config_json.as_deref())
                .await?;
        }
        Commands::Advance {
            flow_id,
            phase,
            input,
            all,
        } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_advance(&app, &cli, flow_id, phase.as_deref(), input.as_deref(), *all).await?;
        }
        Commands::Status { flow_id, full } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_status(&app, &cli, flow_id, *full).await?;
        }
        Commands::List {
            client,
            engagement,
            flow_type,
            status,
        } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_list(&app, &cli, client, engagement, flow_type.as_deref(), status.as_deref())
                .await?;
        }
        Commands::Pause { flow_id } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_lifecycle(&app, &cli, flow_id, cmd::LifecycleAction::Pause).await?;
        }
        Commands::Resume { flow_id } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_lifecycle(&app, &cli, flow_id, cmd::LifecycleAction::Resume).await?;
        }
        Commands::Cancel { flow_id } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_lifecycle(&app, &cli, flow_id, cmd::LifecycleAction::Cancel).await?;
        }
        Commands::Recover { flow_id } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_lifecycle(&app, &cli, flow_id, cmd::LifecycleAction::Recover).await?;
        }
        Commands::Delete { flow_id, purge } => {
            let app = cmd::App::open(&config)?;
            cmd::cmd_delete(&app, &cli, flow_id, *purge).await?;
        }
    }

    Ok(())
}
