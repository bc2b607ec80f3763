//! Kickoff CLI - Operator tools for tournament sync
//!
//! Inspects the local cache and mutation queue, and drives sync by hand.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{resolve_db_path, resolve_user, Options};
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::list::run_list;
use crate::commands::queue::{run_dead_letters, run_discard, run_retry};
use crate::commands::status::run_status;
use crate::commands::sync::{run_pull, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "kickoff=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = Options {
        db_path: resolve_db_path(cli.db_path),
        settings_path: cli.settings,
        user: resolve_user(cli.user),
        json: cli.json,
    };

    match cli.command {
        Commands::Status => run_status(&options).await?,
        Commands::List => run_list(&options).await?,
        Commands::Sync => run_sync(&options).await?,
        Commands::Pull { id } => run_pull(&id, &options).await?,
        Commands::Conflicts { id } => run_conflicts(&id, &options).await?,
        Commands::Resolve { id, keep } => run_resolve(&id, keep, &options).await?,
        Commands::DeadLetters => run_dead_letters(&options).await?,
        Commands::Retry { id } => run_retry(&id, &options).await?,
        Commands::Discard { id } => run_discard(&id, &options).await?,
    }

    Ok(())
}
