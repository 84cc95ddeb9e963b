use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod run;
pub mod schema;

use config::ConfigArgs;
use run::RunArgs;
use schema::SchemaArgs;

use hitlgate::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "hitlgate",
    about = "Human-in-the-loop review gateway",
    version = "0.1.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the review service
    Run(RunArgs),

    /// Emit JSON-Schema for the wire messages into `<root>/schemas`
    Schema(SchemaArgs),

    /// Handle configuration
    Config(ConfigArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self {
            root,
            config_manager,
        }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
