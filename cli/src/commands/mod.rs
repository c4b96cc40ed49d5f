//! CLI command definitions and dispatch.

mod hash;
mod inject;
mod scan;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use cainject_core::{InjectConfig, LogLevel};

/// cainject - add a CA certificate to every trust store of a container image.
#[derive(Parser)]
#[command(name = "cainject", version, about)]
pub struct Cli {
    /// Configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Inject a CA certificate into an image
    Inject(inject::InjectArgs),
    /// Print the OpenSSL subject hash of a certificate
    Hash(hash::HashArgs),
    /// List the trust stores of an image without changing it
    Scan(scan::ScanArgs),
}

impl Cli {
    /// The configuration file, or defaults without one.
    pub fn load_config(&self) -> Result<InjectConfig, Box<dyn std::error::Error>> {
        match &self.config {
            Some(path) => Ok(InjectConfig::from_file(path)?),
            None => Ok(InjectConfig::default()),
        }
    }

    /// Log level from `-v` flags, else from the configuration.
    pub fn log_level(&self, config: &InjectConfig) -> LogLevel {
        match self.verbose {
            0 => config.log_level,
            1 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: InjectConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Inject(args) => inject::execute(args, config).await,
        Command::Hash(args) => hash::execute(args).await,
        Command::Scan(args) => scan::execute(args, config).await,
    }
}
