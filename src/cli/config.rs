use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

/// Edits `<root>/config/.env`. Keys are the `HITL_*` settings.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    Add { key: String, value: String },
    Update { key: String, value: String },
    Delete { key: String },
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Add { key, value } => {
            match context.config_manager.0.set(&key, &value).await {
                Ok(_) => println!("✅ Config added."),
                Err(err) => eprintln!("❌ Config could not be added: {}", err),
            }
        }
        ConfigCommands::Update { key, value } => {
            match context.config_manager.0.set(&key, &value).await {
                Ok(_) => println!("✅ Config updated."),
                Err(err) => eprintln!("❌ Config could not be updated: {}", err),
            }
        }
        ConfigCommands::Delete { key } => {
            context.config_manager.0.del(&key).await;
            println!("✅ Config deleted.");
        }
    }
    Ok(())
}
