//! deskchat operator CLI entry point.
//!
//! Binary name: `deskchat`
//!
//! Parses CLI arguments, loads configuration, opens the delivery queue
//! database, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use deskchat_infra::config::{load_config, resolve_data_dir};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "deskchat", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);

    // Logging settings live in config.toml, so read it before the subscriber exists
    let config = load_config(&data_dir).await;
    if let Err(e) =
        deskchat_observe::tracing_setup::init_tracing(&config.logging, cli.filter_override())
    {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let state = AppState::init(data_dir, config).await?;

    let result = match cli.command {
        Commands::Jobs { action } => cli::jobs::handle_jobs_command(action, &state, cli.json).await,
        Commands::Config { action } => {
            cli::config::handle_config_command(action, &state, cli.json).await
        }
        Commands::Completions { .. } => Ok(()),
    };

    deskchat_observe::tracing_setup::shutdown_tracing();
    result
}
