use kickoff_core::models::SyncStatus;

use crate::cli::KeepSide;
use crate::commands::common::{
    format_conflict_lines, format_sync_result, normalize_tournament_id, open_orchestrator,
    print_json, Options,
};
use crate::error::CliError;

pub async fn run_conflicts(id: &str, options: &Options) -> Result<(), CliError> {
    let id = normalize_tournament_id(id)?;
    let orchestrator = open_orchestrator(options).await?;
    // Conflicts are found by comparing against the remote copy, so pull first
    let result = orchestrator.sync_down(&id).await;

    if options.json {
        return print_json(&result.conflicts);
    }

    match result.status {
        SyncStatus::Conflict => {
            for line in format_conflict_lines(&result.conflicts) {
                println!("{line}");
            }
        }
        SyncStatus::Offline => println!("Offline; cannot compare with the remote copy."),
        SyncStatus::Error => {
            return Err(CliError::SyncFailed(
                result.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        SyncStatus::Synced | SyncStatus::Updated => println!("No conflicts."),
    }
    Ok(())
}

pub async fn run_resolve(id: &str, keep: KeepSide, options: &Options) -> Result<(), CliError> {
    let id = normalize_tournament_id(id)?;
    let orchestrator = open_orchestrator(options).await?;
    let result = orchestrator.resolve_conflict(&id, keep.into()).await;

    if options.json {
        print_json(&result)?;
    } else {
        for line in format_sync_result(&result) {
            println!("{line}");
        }
    }

    match result.status {
        SyncStatus::Error | SyncStatus::Offline => Err(CliError::SyncFailed(
            result
                .error
                .unwrap_or_else(|| "remote store unreachable".to_string()),
        )),
        _ => Ok(()),
    }
}
