//! Configuration display.

use anyhow::Result;
use clap::Subcommand;
use console::style;

use deskchat_core::identity::IdentityProvider;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration (file values merged over defaults).
    Show,
}

pub async fn handle_config_command(cmd: ConfigCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ConfigCommand::Show => show_config(state, json),
    }
}

fn show_config(state: &AppState, json: bool) -> Result<()> {
    // Only report whether a token is present; its value stays secret.
    let token_set = state.identity.conversation_token().is_some();

    if json {
        let result = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "conversation_token_set": token_set,
            "config": state.config,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!();
    println!("  Data dir:            {}", style(state.data_dir.display()).cyan());
    println!(
        "  Conversation token:  {}",
        if token_set {
            style("set").green()
        } else {
            style("not set").yellow()
        }
    );
    println!();
    for line in toml::to_string_pretty(&state.config)?.lines() {
        println!("  {line}");
    }
    println!();

    Ok(())
}
