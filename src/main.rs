use clap::{Parser, Subcommand};
use logship::cli::Role;
use logship::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logship")]
#[command(about = "Log file shipping and ingestion", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail configured log files and ship them to a server
    Tailer,
    /// Accept shipped batches and persist them
    Server,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long, value_enum)]
        role: Role,
        #[arg(long)]
        stdout: bool,
    },
    Validate {
        #[arg(long, value_enum)]
        role: Role,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logship=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let explicit = cli.config.as_deref();

    match cli.command {
        Commands::Tailer => {
            let config_path = resolve_config_path(explicit, Role::Tailer.as_str());
            logship::cli::tailer::run(config_path).await?;
        }
        Commands::Server => {
            let config_path = resolve_config_path(explicit, Role::Server.as_str());
            logship::cli::server::run(config_path).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { role, stdout } => {
                logship::cli::config::init(role, stdout)?;
            }
            ConfigAction::Validate { role } => {
                let config_path = resolve_config_path(explicit, role.as_str());
                logship::cli::config::validate(role, config_path)?;
            }
        },
    }

    Ok(())
}
