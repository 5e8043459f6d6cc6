//! Command-line interface and daemon wiring.

mod worker;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::infrastructure::backends::ProviderRegistry;
use crate::infrastructure::config::PROVIDER_CONFIG_PREFIX;

#[derive(Parser)]
#[command(name = "kiln-worker", version, about = "Distributed CI build worker daemon")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker daemon (default)
    Run,
    /// List available provider backends and their options
    Providers,
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => worker::run().await,
        Commands::Providers => {
            list_providers();
            Ok(())
        }
    }
}

fn list_providers() {
    let registry = ProviderRegistry::new();
    for entry in registry.entries() {
        println!("{:<10} {}", entry.name, entry.display_name);
        for (key, purpose) in entry.options {
            println!("    {PROVIDER_CONFIG_PREFIX}{key:<24} {purpose}");
        }
        println!();
    }
}
