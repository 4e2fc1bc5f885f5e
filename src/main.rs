use reporter_harness::logging::{self, LoggingConfig};
use reporter_harness::Result;

mod app_config;
mod commands;

use app_config::{resolve_config, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    use clap::Parser;

    let cli = Cli::parse();

    let mut logging_config = LoggingConfig::default();
    if cli.verbose {
        logging_config.level = "debug".to_string();
        logging_config
            .module_levels
            .insert("reporter_harness".to_string(), "debug".to_string());
    }
    logging::init(&logging_config)?;

    let config = resolve_config(cli.config.as_deref())?;
    tracing::debug!(command = cli.command.name(), "running");

    match cli.command {
        Commands::Up { proxy, address } => commands::up_command(config, proxy, address).await,
        Commands::Sweep { label } => commands::sweep_command(&config, &label).await,
        Commands::Env { session, address } => commands::env_command(config, &session, address).await,
    }
}
