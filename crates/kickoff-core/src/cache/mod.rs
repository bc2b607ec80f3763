//! Local persistent cache (offline tier)

mod cleanup;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use libsql::{params, Connection};

pub use cleanup::{select_evictions, FinishedEntry};

use crate::config::SyncSettings;
use crate::db::{int_or_null, is_disk_full_error, text_or_null, SharedDatabase};
use crate::error::{Error, Result};
use crate::models::{CachedTournament, LiveMatch, MatchId, MatchStatus, Tournament, TournamentId};
use crate::util::now_millis;

/// Live matches of one tournament, keyed by match
pub type LiveMatchMap = HashMap<MatchId, LiveMatch>;

/// Trait for the local, network-free storage tier
pub trait LocalCache: Send + Sync {
    /// Get a cached tournament by ID
    fn get(
        &self,
        id: &TournamentId,
    ) -> impl Future<Output = Result<Option<CachedTournament>>> + Send;

    /// Insert or replace a cached tournament
    fn save(&self, entry: &CachedTournament) -> impl Future<Output = Result<()>> + Send;

    /// Remove a tournament and its live matches
    fn delete(&self, id: &TournamentId) -> impl Future<Output = Result<()>> + Send;

    /// List every cached tournament, most recently updated first
    fn list(&self) -> impl Future<Output = Result<Vec<CachedTournament>>> + Send;

    /// Load the live match map of a tournament, repairing abandoned timers
    fn live_matches(
        &self,
        tournament_id: &TournamentId,
    ) -> impl Future<Output = Result<LiveMatchMap>> + Send;

    /// Replace the live match map of a tournament
    fn save_live_matches(
        &self,
        tournament_id: &TournamentId,
        matches: &LiveMatchMap,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// libSQL implementation of `LocalCache`
#[derive(Clone)]
pub struct LibSqlLocalCache {
    db: SharedDatabase,
    quota_bytes: Option<u64>,
    retention: Duration,
    keep_finished: usize,
}

impl LibSqlLocalCache {
    /// Create a cache over the shared local database
    pub fn new(db: SharedDatabase, settings: &SyncSettings) -> Self {
        Self {
            db,
            quota_bytes: settings.quota_bytes,
            retention: settings.retention(),
            keep_finished: settings.keep_finished,
        }
    }

    /// Bytes currently used by cached payloads
    pub async fn usage_bytes(&self) -> Result<u64> {
        let db = self.db.lock().await;
        usage_bytes(db.connection()).await
    }

    /// Drop finished live matches beyond the keep-count and older than the retention window.
    ///
    /// Returns the number of matches removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut maps = HashMap::new();
        let mut rows = conn
            .query("SELECT tournament_id, data FROM live_matches", ())
            .await?;
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let data: String = row.get(1)?;
            let Ok(id) = id.parse::<TournamentId>() else {
                continue;
            };
            match serde_json::from_str::<LiveMatchMap>(&data) {
                Ok(map) => {
                    maps.insert(id, map);
                }
                Err(error) => {
                    tracing::warn!("Skipping unreadable live match map for {id}: {error}");
                }
            }
        }

        let finished = maps
            .values()
            .flat_map(HashMap::values)
            .filter(|live| live.status == MatchStatus::Finished)
            .map(|live| FinishedEntry {
                tournament_id: live.tournament_id,
                match_id: live.match_id,
                updated_at: live.updated_at,
            })
            .collect();

        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(retention_ms);
        let evictions = select_evictions(finished, self.keep_finished, cutoff);

        let mut touched = Vec::new();
        for entry in &evictions {
            if let Some(map) = maps.get_mut(&entry.tournament_id) {
                map.remove(&entry.match_id);
                touched.push(entry.tournament_id);
            }
        }
        touched.sort();
        touched.dedup();

        for tournament_id in touched {
            if let Some(map) = maps.get(&tournament_id) {
                write_live_map(conn, &tournament_id, map).await?;
            }
        }

        if !evictions.is_empty() {
            tracing::warn!(
                "Local cache cleanup removed {} finished live matches",
                evictions.len()
            );
        }
        Ok(evictions.len())
    }

    /// Run a write, cleaning up and retrying exactly once on quota exhaustion
    async fn with_quota_retry<F, Fut>(&self, write: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        match write().await {
            Err(error) if is_quota_error(&error) => {
                tracing::warn!("Local cache write hit storage quota, cleaning up: {error}");
                let removed = self.cleanup().await?;
                write().await.map_err(|error| {
                    if is_quota_error(&error) {
                        Error::Storage(format!(
                            "storage quota still exceeded after removing {removed} finished matches: {error}"
                        ))
                    } else {
                        error
                    }
                })
            }
            other => other,
        }
    }

    async fn write_tournament(&self, entry: &CachedTournament) -> Result<()> {
        let data = serde_json::to_string(&entry.tournament)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        let id = entry.tournament.id.to_string();

        self.check_quota(conn, "tournaments", "id", &id, data.len())
            .await?;

        conn.execute(
            "INSERT OR REPLACE INTO tournaments
                (id, owner_id, data, version, updated_at, dirty, last_synced_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                text_or_null(entry.tournament.owner_id.as_deref()),
                data,
                entry.tournament.version,
                entry.tournament.updated_at,
                i64::from(entry.dirty),
                int_or_null(entry.last_synced_at)
            ],
        )
        .await?;
        Ok(())
    }

    async fn write_live_matches(
        &self,
        tournament_id: &TournamentId,
        matches: &LiveMatchMap,
    ) -> Result<()> {
        let data = serde_json::to_string(matches)?;
        let db = self.db.lock().await;
        let conn = db.connection();

        self.check_quota(
            conn,
            "live_matches",
            "tournament_id",
            &tournament_id.to_string(),
            data.len(),
        )
        .await?;
        write_live_map(conn, tournament_id, matches).await
    }

    async fn check_quota(
        &self,
        conn: &Connection,
        table: &str,
        key_column: &str,
        key: &str,
        incoming: usize,
    ) -> Result<()> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };

        let used = usage_bytes(conn).await?;
        let mut rows = conn
            .query(
                &format!("SELECT LENGTH(data) FROM {table} WHERE {key_column} = ?"),
                [key],
            )
            .await?;
        let existing = match rows.next().await? {
            Some(row) => u64::try_from(row.get::<i64>(0)?).unwrap_or(0),
            None => 0,
        };

        let projected = used.saturating_sub(existing) + incoming as u64;
        if projected > quota {
            return Err(Error::QuotaExceeded(format!(
                "{projected} bytes needed, {quota} bytes allowed"
            )));
        }
        Ok(())
    }
}

fn is_quota_error(error: &Error) -> bool {
    matches!(error, Error::QuotaExceeded(_)) || is_disk_full_error(error)
}

async fn usage_bytes(conn: &Connection) -> Result<u64> {
    let mut rows = conn
        .query(
            "SELECT COALESCE((SELECT SUM(LENGTH(data)) FROM tournaments), 0)
                  + COALESCE((SELECT SUM(LENGTH(data)) FROM live_matches), 0)",
            (),
        )
        .await?;
    let used = match rows.next().await? {
        Some(row) => row.get::<i64>(0)?,
        None => 0,
    };
    Ok(u64::try_from(used).unwrap_or(0))
}

async fn write_live_map(
    conn: &Connection,
    tournament_id: &TournamentId,
    matches: &LiveMatchMap,
) -> Result<()> {
    if matches.is_empty() {
        conn.execute(
            "DELETE FROM live_matches WHERE tournament_id = ?",
            [tournament_id.to_string()],
        )
        .await?;
        return Ok(());
    }

    let data = serde_json::to_string(matches)?;
    conn.execute(
        "INSERT OR REPLACE INTO live_matches (tournament_id, data, updated_at) VALUES (?, ?, ?)",
        params![tournament_id.to_string(), data, now_millis()],
    )
    .await?;
    Ok(())
}

/// Write a repaired map only if the stored row still holds `expected`.
///
/// Another connection may have replaced the map since it was read; its write wins
/// and the repair is applied again on the next read.
async fn replace_live_map_if_unchanged(
    conn: &Connection,
    tournament_id: &TournamentId,
    expected: &str,
    matches: &LiveMatchMap,
) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE live_matches SET data = ?, updated_at = ? WHERE tournament_id = ? AND data = ?",
            params![
                serde_json::to_string(matches)?,
                now_millis(),
                tournament_id.to_string(),
                expected
            ],
        )
        .await?;
    Ok(updated == 1)
}

fn parse_cached(data: &str, dirty: i64, last_synced_at: Option<i64>) -> Result<CachedTournament> {
    let tournament: Tournament = serde_json::from_str(data)?;
    Ok(CachedTournament {
        tournament,
        dirty: dirty != 0,
        last_synced_at,
    })
}

impl LocalCache for LibSqlLocalCache {
    async fn get(&self, id: &TournamentId) -> Result<Option<CachedTournament>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT data, dirty, last_synced_at FROM tournaments WHERE id = ?",
                [id.to_string()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let data: String = row.get(0)?;
        let cached = parse_cached(&data, row.get(1)?, row.get::<Option<i64>>(2)?)?;
        Ok(Some(cached))
    }

    async fn save(&self, entry: &CachedTournament) -> Result<()> {
        self.with_quota_retry(|| self.write_tournament(entry)).await
    }

    async fn delete(&self, id: &TournamentId) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("DELETE FROM tournaments WHERE id = ?", [id.to_string()])
            .await?;
        conn.execute(
            "DELETE FROM live_matches WHERE tournament_id = ?",
            [id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CachedTournament>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, data, dirty, last_synced_at FROM tournaments ORDER BY updated_at DESC",
                (),
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let data: String = row.get(1)?;
            match parse_cached(&data, row.get(2)?, row.get::<Option<i64>>(3)?) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    tracing::warn!("Skipping unreadable cached tournament {id}: {error}");
                }
            }
        }
        Ok(entries)
    }

    async fn live_matches(&self, tournament_id: &TournamentId) -> Result<LiveMatchMap> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let mut rows = conn
            .query(
                "SELECT data FROM live_matches WHERE tournament_id = ?",
                [tournament_id.to_string()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(HashMap::new());
        };
        let data: String = row.get(0)?;
        drop(rows);
        let mut matches: LiveMatchMap = serde_json::from_str(&data)?;

        let now = now_millis();
        let mut repaired = 0usize;
        for live in matches.values_mut() {
            if live.repair_if_stale(now) {
                repaired += 1;
            }
        }

        if repaired > 0 {
            tracing::warn!(
                "Paused {repaired} abandoned running match timers in tournament {tournament_id}"
            );
            match replace_live_map_if_unchanged(conn, tournament_id, &data, &matches).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Live matches of {tournament_id} changed during repair; not persisted");
                }
                Err(error) => tracing::warn!("Failed to persist repaired live matches: {error}"),
            }
        }
        Ok(matches)
    }

    async fn save_live_matches(
        &self,
        tournament_id: &TournamentId,
        matches: &LiveMatchMap,
    ) -> Result<()> {
        self.with_quota_retry(|| self.write_live_matches(tournament_id, matches))
            .await
    }
}
