use std::{env, path::PathBuf};

use clap::Parser;
use hitlgate::config::{ConfigManager, EnvConfigManager};

mod cli;

use cli::{Cli, CliContext};

/// Resolve the hitlgate root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("HITLGATE_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./hitlgate")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let env_file = root.join("config").join(".env");
    let context = CliContext::new(root, ConfigManager(EnvConfigManager::new(env_file)));

    let command = cli.command.unwrap_or_else(cli::default_command);
    cli::execute(&context, command).await
}
