use anyhow::Result;
use clap::{Parser, Subcommand};
use launchpad::config::{DEFAULT_CONFIG_FILE, PlatformConfig};
use launchpad::observability::{LogFormat, init_logging};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "launchpad")]
#[command(version, about = "Build, deploy and serve static sites per tenant subdomain")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "LAUNCHPAD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Log output format. Overrides `[logging] format`.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API, live log gateway, log pipeline and reverse proxy
    Serve {
        /// Do not start the reverse proxy listener
        #[arg(long)]
        no_proxy: bool,
    },
    /// Run only the reverse proxy against the registry database
    Proxy,
    /// Run a local development artifact store
    Artifacts {
        /// Listen address (defaults to the host of `artifacts.base_url`)
        #[arg(long)]
        addr: Option<String>,
        /// Directory holding stored objects (defaults to `artifacts.root`)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Create the registry and log store schemas
    InitDb,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = PlatformConfig::load_or_default(&cli.config)?;
    config.apply_env_overrides();
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(config.logging.format);

    match cli.command {
        Commands::Serve { no_proxy } => cmd::cmd_serve(config, no_proxy).await?,
        Commands::Proxy => cmd::cmd_proxy(config).await?,
        Commands::Artifacts { addr, root } => cmd::cmd_artifacts(config, addr, root).await?,
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command)?,
    }

    Ok(())
}
