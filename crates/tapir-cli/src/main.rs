use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tapir_core::{Config, Result};

#[derive(Parser)]
#[command(name = "tapir")]
#[command(about = "TAPIR - a Table Access Protocol service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the TAP service
    Serve,

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Where to write it
        #[arg(default_value = "./config/default.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved configuration
    Show,
}

fn init_tracing(cli: &Cli, config: &Config) {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(&path.display().to_string()),
        None => Config::from_env(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Serve => {
            let config = load_config(&cli)?;
            init_tracing(&cli, &config);
            info!("Starting TAPIR {}", tapir_core::VERSION);
            tapir_api::server::run(config).await?;
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { path, force } => {
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    );
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let rendered = toml::to_string_pretty(&Config::default())?;
                std::fs::write(path, rendered)?;
                println!("Wrote default configuration to {}", path.display());
                Ok(())
            }
            ConfigAction::Show => {
                let config = load_config(&cli)?;
                let rendered = toml::to_string_pretty(&config)?;
                println!("{}", rendered);
                Ok(())
            }
        },
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "tapir", &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
