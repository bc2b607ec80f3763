use kickoff_core::models::SyncState;
use serde::Serialize;

use crate::commands::common::{open_orchestrator, print_json, Options};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusItem {
    pub online: bool,
    pub state: SyncState,
    pub pending_count: usize,
    pub failed_count: usize,
    pub cache_bytes: u64,
    pub cross_process_lock: bool,
    pub db_path: String,
}

pub async fn run_status(options: &Options) -> Result<(), CliError> {
    let orchestrator = open_orchestrator(options).await?;
    let queue = orchestrator.queue_status().await?;
    let status = StatusItem {
        online: orchestrator.monitor().is_online(),
        state: orchestrator.state(),
        pending_count: queue.pending_count,
        failed_count: queue.failed_count,
        cache_bytes: orchestrator.local().usage_bytes().await?,
        cross_process_lock: orchestrator.is_cross_process(),
        db_path: options.db_path.display().to_string(),
    };

    if options.json {
        return print_json(&status);
    }

    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &StatusItem) -> Vec<String> {
    let lock = if status.cross_process_lock {
        "file"
    } else {
        "process"
    };
    vec![
        format!("Database:  {}", status.db_path),
        format!(
            "Network:   {}",
            if status.online { "online" } else { "offline" }
        ),
        format!("State:     {:?}", status.state),
        format!(
            "Queue:     {} pending, {} failed",
            status.pending_count, status.failed_count
        ),
        format!("Cache:     {} bytes", status.cache_bytes),
        format!("Locking:   {lock}"),
    ]
}
