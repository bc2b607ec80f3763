use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use kickoff_core::db::Database;
use kickoff_core::models::{PendingMutation, SyncConflict, SyncResult, Tournament};
use kickoff_core::{
    CrossContextLock, LibSqlLocalCache, LibSqlRemoteStore, NetworkMonitor, RemoteConfig,
    SyncOrchestrator, SyncSettings, TournamentId,
};
use serde::Serialize;

use crate::error::CliError;

pub type Orchestrator = SyncOrchestrator<LibSqlLocalCache, LibSqlRemoteStore>;

/// Global flags shared by every command
#[derive(Debug, Clone)]
pub struct Options {
    pub db_path: PathBuf,
    pub settings_path: Option<PathBuf>,
    pub user: Option<String>,
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct TournamentListItem {
    pub id: String,
    pub title: String,
    pub status: String,
    pub date: Option<String>,
    pub version: i64,
    pub is_public: bool,
    pub share_code: Option<String>,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct MutationItem {
    pub id: String,
    pub kind: String,
    pub entity_id: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: i64,
    pub enqueued_at_iso: String,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("KICKOFF_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kickoff")
        .join("kickoff.db")
}

pub fn resolve_user(cli_user: Option<String>) -> Option<String> {
    cli_user
        .or_else(|| env::var("KICKOFF_USER").ok())
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty())
}

/// Lock files live next to the database so every process on the device shares them
pub fn lock_dir(db_path: &Path) -> Option<PathBuf> {
    db_path.parent().map(|parent| parent.join("locks"))
}

pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings, CliError> {
    let settings = match path {
        Some(path) => SyncSettings::load(path)?,
        None => SyncSettings::default(),
    };
    Ok(settings.with_env_overrides())
}

pub fn normalize_tournament_id(id: &str) -> Result<TournamentId, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyTournamentId);
    }
    trimmed
        .parse()
        .map_err(|_| CliError::InvalidTournamentId(trimmed.to_string()))
}

pub fn normalize_mutation_id(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyMutationId);
    }
    Ok(trimmed.to_string())
}

pub async fn open_local_cache(options: &Options) -> Result<LibSqlLocalCache, CliError> {
    let settings = load_settings(options.settings_path.as_deref())?;
    let db = open_database(&options.db_path).await?;
    Ok(LibSqlLocalCache::new(db.into_shared(), &settings))
}

pub async fn open_orchestrator(options: &Options) -> Result<Orchestrator, CliError> {
    open_orchestrator_with(options, &RemoteConfig::from_env()).await
}

pub async fn open_orchestrator_with(
    options: &Options,
    remote_config: &RemoteConfig,
) -> Result<Orchestrator, CliError> {
    if !remote_config.is_configured() {
        return Err(CliError::SyncNotConfigured);
    }
    let settings = load_settings(options.settings_path.as_deref())?;
    let db = open_database(&options.db_path).await?.into_shared();

    let monitor = NetworkMonitor::online();
    let remote = match LibSqlRemoteStore::connect(remote_config, monitor.clone()).await {
        Ok(remote) => remote,
        Err(error) if error.is_network() => {
            // Keep working from the cache; every remote call now fails fast
            tracing::warn!("Remote store unreachable ({error}); running offline");
            monitor.set_online(false);
            LibSqlRemoteStore::open_in_memory(monitor.clone()).await?
        }
        Err(error) => return Err(error.into()),
    };

    let lock = CrossContextLock::probe(lock_dir(&options.db_path).as_deref(), &settings);
    let local = Arc::new(LibSqlLocalCache::new(db.clone(), &settings));
    let orchestrator =
        SyncOrchestrator::new(local, Arc::new(remote), db, lock, monitor, settings).await?;

    Ok(match options.user.as_deref() {
        Some(user) => orchestrator.with_current_user(user),
        None => orchestrator,
    })
}

async fn open_database(path: &Path) -> Result<Database, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(path).await?)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn tournament_to_list_item(tournament: &Tournament) -> TournamentListItem {
    let now_ms = Utc::now().timestamp_millis();
    TournamentListItem {
        id: tournament.id.to_string(),
        title: tournament.title.clone(),
        status: tournament.status.to_string(),
        date: tournament.date.clone(),
        version: tournament.version,
        is_public: tournament.is_public,
        share_code: tournament.share_code.clone(),
        updated_at: tournament.updated_at,
        relative_time: format_relative_time(tournament.updated_at, now_ms),
    }
}

pub fn format_tournament_lines(tournaments: &[Tournament]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    tournaments
        .iter()
        .map(|tournament| {
            let id = tournament.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let title = truncate(&tournament.title, 32);
            let relative_time = format_relative_time(tournament.updated_at, now_ms);
            let visibility = tournament
                .share_code
                .as_deref()
                .filter(|_| tournament.is_public)
                .map_or_else(String::new, |code| format!("  public:{code}"));

            format!(
                "{short_id:<13}  {title:<32}  v{:<4} {relative_time:<10}{visibility}",
                tournament.version
            )
        })
        .collect()
}

pub fn mutation_to_item(mutation: &PendingMutation) -> MutationItem {
    MutationItem {
        id: mutation.id.clone(),
        kind: mutation.kind().to_string(),
        entity_id: mutation.entity_id(),
        attempts: mutation.attempts,
        last_error: mutation.last_error.clone(),
        enqueued_at: mutation.enqueued_at,
        enqueued_at_iso: format_timestamp(mutation.enqueued_at),
    }
}

pub fn format_mutation_lines(mutations: &[PendingMutation]) -> Vec<String> {
    mutations
        .iter()
        .map(|mutation| {
            let error = mutation.last_error.as_deref().unwrap_or("-");
            format!(
                "{}  {:<18} {}  attempts={}  {}  last_error={error}",
                mutation.id,
                mutation.kind(),
                mutation.entity_id(),
                mutation.attempts,
                format_timestamp(mutation.enqueued_at),
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let scope = match conflict {
                SyncConflict::Match { match_id, .. } => format!("match {match_id}"),
                SyncConflict::General { entity_type, .. } => entity_type.as_str().to_string(),
            };
            format!(
                "{scope:<44}  {:<16} local={} remote={}",
                conflict.field(),
                conflict.local_value(),
                conflict.remote_value()
            )
        })
        .collect()
}

pub fn format_sync_result(result: &SyncResult) -> Vec<String> {
    let mut lines = vec![format!("Status: {:?}", result.status)];
    if let Some(tournament) = &result.data {
        lines.push(format!(
            "Tournament: {} ({}) v{}",
            tournament.title, tournament.id, tournament.version
        ));
    }
    if let Some(error) = &result.error {
        lines.push(format!("Error: {error}"));
    }
    if !result.conflicts.is_empty() {
        lines.push(format!("{} conflicting fields:", result.conflicts.len()));
        lines.extend(
            format_conflict_lines(&result.conflicts)
                .into_iter()
                .map(|line| format!("  {line}")),
        );
    }
    lines
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    truncated.push_str("...");
    truncated
}
