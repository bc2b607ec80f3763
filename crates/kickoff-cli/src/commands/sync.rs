use kickoff_core::models::SyncStatus;
use kickoff_core::SyncReport;

use crate::commands::common::{
    format_sync_result, normalize_tournament_id, open_orchestrator, print_json, Options,
};
use crate::error::CliError;

pub async fn run_sync(options: &Options) -> Result<(), CliError> {
    let orchestrator = open_orchestrator(options).await?;
    let report = orchestrator.sync_up().await?;

    if options.json {
        print_json(&report)?;
    } else {
        for line in format_sync_report(&report) {
            println!("{line}");
        }
    }

    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(CliError::SyncFailed(format!(
            "{} tournaments could not be pushed",
            report.failed.len()
        )))
    }
}

pub async fn run_pull(id: &str, options: &Options) -> Result<(), CliError> {
    let id = normalize_tournament_id(id)?;
    let orchestrator = open_orchestrator(options).await?;
    let result = orchestrator.sync_tournament(&id).await;

    if options.json {
        print_json(&result)?;
    } else {
        for line in format_sync_result(&result) {
            println!("{line}");
        }
    }

    match (result.status, result.error) {
        (SyncStatus::Error, Some(error)) => Err(CliError::SyncFailed(error)),
        _ => Ok(()),
    }
}

pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    if report.offline {
        return vec!["Offline; edits stay queued until the remote store is reachable".to_string()];
    }

    let mut lines = vec![format!(
        "Sync completed: {} delivered, {} retried, {} dead-lettered",
        report.queue.delivered, report.queue.retried, report.queue.dead_lettered
    )];
    lines.push(format!(
        "Tournaments: {} uploaded, {} pushed, {} in sync, {} behind remote",
        report.uploaded, report.pushed, report.in_sync, report.skipped
    ));
    for failure in &report.failed {
        lines.push(format!("  failed {}: {}", failure.tournament_id, failure.error));
    }
    lines
}
