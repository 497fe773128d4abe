//! CLI command definitions for the `deskchat` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (`deskchat jobs list`, `deskchat config show`).

pub mod config;
pub mod jobs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Inspect and maintain the deskchat message delivery queue.
#[derive(Parser)]
#[command(name = "deskchat", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding config.toml and the queue database.
    #[arg(long, global = true, env = "DESKCHAT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter implied by the verbosity flags, if any were given.
    pub fn filter_override(&self) -> Option<&'static str> {
        match self.verbose {
            0 if self.quiet => Some("error"),
            0 => None,
            1 => Some("info,deskchat=debug"),
            _ => Some("trace"),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and maintain queued messages.
    Jobs {
        #[command(subcommand)]
        action: jobs::JobsCommand,
    },

    /// Show the effective configuration.
    Config {
        #[command(subcommand)]
        action: config::ConfigCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
