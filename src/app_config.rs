//! CLI argument parsing and configuration resolution for the operator binary

use clap::{Parser, Subcommand};
use reporter_harness::{HarnessConfig, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Command-line interface definition for the harness
#[derive(Parser)]
#[command(name = "reporter-harness")]
#[command(about = "Dependency infrastructure and chaos tooling for the report service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML config file; falls back to $REPORTER_HARNESS_CONFIG
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot the dependency containers, print the service env, wait for Ctrl-C
    Up {
        /// Also start the fault proxy and print proxied endpoints
        #[arg(long)]
        proxy: bool,

        /// Address the service will listen on, used in the printed env
        #[arg(long, default_value = "127.0.0.1:8080")]
        address: SocketAddr,
    },

    /// Remove containers and networks left behind by a session
    Sweep {
        /// Session label value
        #[arg(long)]
        label: String,
    },

    /// Print the service env map for a session started with `up`
    Env {
        #[arg(long)]
        session: String,

        #[arg(long, default_value = "127.0.0.1:8080")]
        address: SocketAddr,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Up { .. } => "up",
            Commands::Sweep { .. } => "sweep",
            Commands::Env { .. } => "env",
        }
    }
}

/// Explicit file first, then the usual environment-driven load
pub fn resolve_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => {
            let mut config = HarnessConfig::load_from_file(path)?;
            config.override_from_env()?;
            config.validate()?;
            Ok(config)
        }
        None => HarnessConfig::load(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sweep() {
        let cli = Cli::parse_from(["reporter-harness", "sweep", "--label", "abc123"]);
        match cli.command {
            Commands::Sweep { label } => assert_eq!(label, "abc123"),
            _ => panic!("expected sweep"),
        }
    }

    #[test]
    fn test_up_defaults() {
        let cli = Cli::parse_from(["reporter-harness", "up"]);
        assert_eq!(cli.command.name(), "up");
        match cli.command {
            Commands::Up { proxy, address } => {
                assert!(!proxy);
                assert_eq!(address.port(), 8080);
            }
            _ => panic!("expected up"),
        }
    }
}
