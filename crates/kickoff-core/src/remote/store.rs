//! libSQL implementation of the remote store

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use libsql::{params, params_from_iter, Connection, Row, Transaction, Value};

use super::schema::REMOTE_MIGRATIONS;
use super::RemoteStore;
use crate::cache::LiveMatchMap;
use crate::config::RemoteConfig;
use crate::db::{int_or_null, text_or_null, Database, SharedDatabase};
use crate::error::{Error, Result};
use crate::models::{
    LiveMatch, Match, MatchChange, MatchPatch, Team, Tournament, TournamentChange, TournamentId,
};
use crate::network::NetworkMonitor;
use crate::util::{normalize_share_code, now_millis};

const TOURNAMENT_COLUMNS: &str = "id, owner_id, title, date, status, location, is_public, \
     share_code, groups_json, fields_json, version, created_at, updated_at";

const MATCH_COLUMNS: &str = "id, round, group_id, field_id, team_a, team_b, scheduled_at, \
     score_a, score_b, status, timer_started_at, elapsed_seconds, referee";

/// Remote store over a libSQL connection (Turso in production)
#[derive(Clone)]
pub struct LibSqlRemoteStore {
    db: SharedDatabase,
    monitor: NetworkMonitor,
}

impl LibSqlRemoteStore {
    pub const fn new(db: SharedDatabase, monitor: NetworkMonitor) -> Self {
        Self { db, monitor }
    }

    /// Connect using the configured URL, migrating the remote schema if needed
    pub async fn connect(config: &RemoteConfig, monitor: NetworkMonitor) -> Result<Self> {
        let db = if let Some(path) = config.file_path() {
            Database::open_with(path, REMOTE_MIGRATIONS).await?
        } else {
            let (Some(url), Some(token)) = (config.url.as_deref(), config.auth_token.as_deref())
            else {
                return Err(Error::InvalidInput(
                    "Remote store requires KICKOFF_REMOTE_URL and KICKOFF_REMOTE_TOKEN".into(),
                ));
            };
            Database::open_remote(url, token, REMOTE_MIGRATIONS)
                .await
                .map_err(into_network)?
        };
        tracing::info!("Connected to remote store");
        Ok(Self::new(db.into_shared(), monitor))
    }

    /// In-memory remote store (useful for testing)
    pub async fn open_in_memory(monitor: NetworkMonitor) -> Result<Self> {
        let db = Database::open_in_memory_with(REMOTE_MIGRATIONS).await?;
        Ok(Self::new(db.into_shared(), monitor))
    }

    pub const fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    fn ensure_online(&self) -> Result<()> {
        if self.monitor.is_online() {
            Ok(())
        } else {
            Err(Error::offline())
        }
    }
}

/// Failures reaching the remote store, as opposed to it refusing a statement
fn is_transport(error: &libsql::Error) -> bool {
    match error {
        libsql::Error::ConnectionFailed(_)
        | libsql::Error::InvalidTlsConfiguration(_)
        | libsql::Error::WriteDelegation(_) => true,
        // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_IOERR, SQLITE_CANTOPEN
        libsql::Error::SqliteFailure(code, _) => matches!(code & 0xff, 5 | 6 | 10 | 14),
        libsql::Error::Hrana(source) => {
            let message = source.to_string();
            ["http error", "stream closed", "unexpected response"]
                .iter()
                .any(|hint| message.starts_with(hint))
        }
        _ => false,
    }
}

/// Transport failures surface as network errors; anything else the store refused is final
fn into_network(error: Error) -> Error {
    match error {
        Error::LibSql(source) if is_transport(&source) => Error::Network {
            message: source.to_string(),
            offline: false,
        },
        Error::LibSql(source) => Error::Rejected(source.to_string()),
        other => other,
    }
}

async fn finish<T>(tx: Transaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            tx.rollback().await.ok();
            Err(error)
        }
    }
}

fn parse_id<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|error| Error::InvalidInput(format!("invalid id '{value}': {error}")))
}

fn parse_optional_id<T>(value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    value.as_deref().map(parse_id).transpose()
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn parse_root(row: &Row) -> Result<Tournament> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let groups: String = row.get(8)?;
    let fields: String = row.get(9)?;

    Ok(Tournament {
        id: parse_id(&id)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        date: row.get(3)?,
        status: status.parse()?,
        location: row.get(5)?,
        is_public: row.get::<i64>(6)? != 0,
        share_code: row.get(7)?,
        groups: serde_json::from_str(&groups)?,
        fields: serde_json::from_str(&fields)?,
        teams: Vec::new(),
        matches: Vec::new(),
        version: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn parse_match(row: &Row) -> Result<Match> {
    let id: String = row.get(0)?;
    let status: String = row.get(9)?;

    Ok(Match {
        id: parse_id(&id)?,
        round: to_u32(row.get(1)?),
        group_id: row.get(2)?,
        field_id: row.get(3)?,
        team_a: parse_optional_id(row.get(4)?)?,
        team_b: parse_optional_id(row.get(5)?)?,
        scheduled_at: row.get(6)?,
        score_a: row.get::<Option<i64>>(7)?.map(to_u32),
        score_b: row.get::<Option<i64>>(8)?.map(to_u32),
        status: status.parse()?,
        timer_started_at: row.get(10)?,
        elapsed_seconds: to_u32(row.get(11)?),
        referee: row.get(12)?,
    })
}

async fn load_children(conn: &Connection, tournament: &mut Tournament) -> Result<()> {
    let mut rows = conn
        .query(
            "SELECT id, name, group_id FROM teams WHERE tournament_id = ? ORDER BY position",
            [tournament.id.to_string()],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        let id: String = row.get(0)?;
        tournament.teams.push(Team {
            id: parse_id(&id)?,
            name: row.get(1)?,
            group_id: row.get(2)?,
        });
    }

    let mut rows = conn
        .query(
            &format!(
                "SELECT {MATCH_COLUMNS} FROM matches WHERE tournament_id = ? ORDER BY position"
            ),
            [tournament.id.to_string()],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        tournament.matches.push(parse_match(&row)?);
    }
    Ok(())
}

async fn load_where(conn: &Connection, clause: &str, value: String) -> Result<Vec<Tournament>> {
    let mut rows = conn
        .query(
            &format!("SELECT {TOURNAMENT_COLUMNS} FROM tournaments WHERE {clause}"),
            [value],
        )
        .await?;

    let mut tournaments = Vec::new();
    while let Some(row) = rows.next().await? {
        tournaments.push(parse_root(&row)?);
    }
    drop(rows);

    for tournament in &mut tournaments {
        load_children(conn, tournament).await?;
    }
    Ok(tournaments)
}

async fn load_one(conn: &Connection, id: &TournamentId) -> Result<Option<Tournament>> {
    Ok(load_where(conn, "id = ?", id.to_string())
        .await?
        .into_iter()
        .next())
}

async fn current_version(conn: &Connection, id: &TournamentId) -> Result<Option<i64>> {
    let mut rows = conn
        .query(
            "SELECT version FROM tournaments WHERE id = ?",
            [id.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn version_miss(entity: String, expected: i64, actual: Option<i64>) -> Error {
    match actual {
        None => Error::NotFound(entity),
        Some(actual_version) => Error::OptimisticLock {
            entity_id: entity,
            expected_version: expected,
            actual_version,
        },
    }
}

/// Zero rows matched the gate: tell a deleted row from a concurrent writer
async fn tournament_miss(conn: &Connection, id: &TournamentId, expected: i64) -> Error {
    match current_version(conn, id).await {
        Ok(actual) => version_miss(id.to_string(), expected, actual),
        Err(error) => error,
    }
}

/// Conditional version bump; the only way any tournament mutation proceeds
async fn bump_version(conn: &Connection, id: &TournamentId, base_version: i64) -> Result<i64> {
    let updated = conn
        .execute(
            "UPDATE tournaments SET version = ?, updated_at = ? WHERE id = ? AND version = ?",
            params![base_version + 1, now_millis(), id.to_string(), base_version],
        )
        .await?;
    if updated == 0 {
        return Err(tournament_miss(conn, id, base_version).await);
    }
    Ok(base_version + 1)
}

async fn write_children(conn: &Connection, tournament: &Tournament) -> Result<()> {
    let id = tournament.id.to_string();
    conn.execute("DELETE FROM teams WHERE tournament_id = ?", [id.as_str()])
        .await?;
    conn.execute("DELETE FROM matches WHERE tournament_id = ?", [id.as_str()])
        .await?;

    for (position, team) in tournament.teams.iter().enumerate() {
        conn.execute(
            "INSERT INTO teams (id, tournament_id, position, name, group_id) VALUES (?, ?, ?, ?, ?)",
            params![
                team.id.to_string(),
                id.as_str(),
                i64::try_from(position).unwrap_or(i64::MAX),
                team.name.as_str(),
                text_or_null(team.group_id.as_deref())
            ],
        )
        .await?;
    }

    for (position, game) in tournament.matches.iter().enumerate() {
        let values = vec![
            Value::Text(game.id.to_string()),
            Value::Text(id.clone()),
            Value::Integer(i64::try_from(position).unwrap_or(i64::MAX)),
            Value::Integer(i64::from(game.round)),
            text_or_null(game.group_id.as_deref()),
            text_or_null(game.field_id.as_deref()),
            text_or_null(game.team_a.map(|team| team.to_string()).as_deref()),
            text_or_null(game.team_b.map(|team| team.to_string()).as_deref()),
            int_or_null(game.scheduled_at),
            int_or_null(game.score_a.map(i64::from)),
            int_or_null(game.score_b.map(i64::from)),
            Value::Text(game.status.as_str().to_string()),
            int_or_null(game.timer_started_at),
            Value::Integer(i64::from(game.elapsed_seconds)),
            text_or_null(game.referee.as_deref()),
        ];
        conn.execute(
            &format!(
                "INSERT INTO matches (id, tournament_id, position, {}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                &MATCH_COLUMNS["id, ".len()..]
            ),
            params_from_iter(values),
        )
        .await?;
    }
    Ok(())
}

fn root_values(tournament: &Tournament) -> Result<Vec<Value>> {
    Ok(vec![
        text_or_null(tournament.owner_id.as_deref()),
        Value::Text(tournament.title.clone()),
        text_or_null(tournament.date.as_deref()),
        Value::Text(tournament.status.as_str().to_string()),
        text_or_null(tournament.location.as_deref()),
        Value::Integer(i64::from(tournament.is_public)),
        text_or_null(tournament.share_code.as_deref()),
        Value::Text(serde_json::to_string(&tournament.groups)?),
        Value::Text(serde_json::to_string(&tournament.fields)?),
    ])
}

async fn create_in(conn: &Connection, tournament: &Tournament) -> Result<Tournament> {
    let mut values = vec![Value::Text(tournament.id.to_string())];
    values.extend(root_values(tournament)?);
    values.push(Value::Integer(tournament.created_at));
    values.push(Value::Integer(tournament.updated_at));

    let inserted = conn
        .execute(
            &format!(
                "INSERT INTO tournaments ({TOURNAMENT_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?) \
                 ON CONFLICT(id) DO NOTHING"
            ),
            params_from_iter(values),
        )
        .await?;

    if inserted > 0 {
        write_children(conn, tournament).await?;
    } else {
        tracing::debug!("Tournament {} already exists remotely", tournament.id);
    }

    load_one(conn, &tournament.id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("tournament {}", tournament.id)))
}

async fn replace_in(conn: &Connection, tournament: &Tournament, base_version: i64) -> Result<i64> {
    let mut values = root_values(tournament)?;
    values.push(Value::Integer(base_version + 1));
    values.push(Value::Integer(tournament.updated_at.max(now_millis())));
    values.push(Value::Text(tournament.id.to_string()));
    values.push(Value::Integer(base_version));

    let updated = conn
        .execute(
            "UPDATE tournaments SET owner_id = ?, title = ?, date = ?, status = ?, location = ?, \
             is_public = ?, share_code = ?, groups_json = ?, fields_json = ?, version = ?, \
             updated_at = ? WHERE id = ? AND version = ?",
            params_from_iter(values),
        )
        .await?;
    if updated == 0 {
        return Err(tournament_miss(conn, &tournament.id, base_version).await);
    }

    write_children(conn, tournament).await?;
    Ok(base_version + 1)
}

fn tournament_columns(change: &TournamentChange) -> Vec<(&'static str, Value)> {
    match change {
        TournamentChange::Title(title) => vec![("title", Value::Text(title.clone()))],
        TournamentChange::Date(date) => vec![("date", text_or_null(date.as_deref()))],
        TournamentChange::Status(status) => {
            vec![("status", Value::Text(status.as_str().to_string()))]
        }
        TournamentChange::Location(location) => {
            vec![("location", text_or_null(location.as_deref()))]
        }
        TournamentChange::Visibility {
            is_public,
            share_code,
        } => vec![
            ("is_public", Value::Integer(i64::from(*is_public))),
            ("share_code", text_or_null(share_code.as_deref())),
        ],
    }
}

fn match_column(change: &MatchChange) -> (&'static str, Value) {
    match change {
        MatchChange::ScoreA(score) => ("score_a", int_or_null(score.map(i64::from))),
        MatchChange::ScoreB(score) => ("score_b", int_or_null(score.map(i64::from))),
        MatchChange::Status(status) => ("status", Value::Text(status.as_str().to_string())),
        MatchChange::TimerStartedAt(started) => ("timer_started_at", int_or_null(*started)),
        MatchChange::ElapsedSeconds(seconds) => {
            ("elapsed_seconds", Value::Integer(i64::from(*seconds)))
        }
        MatchChange::Referee(referee) => ("referee", text_or_null(referee.as_deref())),
    }
}

fn assignments(columns: &[(&'static str, Value)]) -> String {
    columns
        .iter()
        .map(|(column, _)| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn update_fields_in(
    conn: &Connection,
    id: &TournamentId,
    changes: &[TournamentChange],
    base_version: i64,
) -> Result<i64> {
    let version = bump_version(conn, id, base_version).await?;

    let columns: Vec<_> = changes.iter().flat_map(tournament_columns).collect();
    if !columns.is_empty() {
        let sql = format!("UPDATE tournaments SET {} WHERE id = ?", assignments(&columns));
        let mut values: Vec<Value> = columns.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Text(id.to_string()));
        conn.execute(&sql, params_from_iter(values)).await?;
    }
    Ok(version)
}

async fn update_matches_in(
    conn: &Connection,
    id: &TournamentId,
    patches: &[MatchPatch],
    base_version: i64,
) -> Result<i64> {
    let version = bump_version(conn, id, base_version).await?;

    for patch in patches.iter().filter(|patch| !patch.is_empty()) {
        let columns: Vec<_> = patch.changes.iter().map(match_column).collect();
        let sql = format!(
            "UPDATE matches SET {} WHERE tournament_id = ? AND id = ?",
            assignments(&columns)
        );
        let mut values: Vec<Value> = columns.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Text(id.to_string()));
        values.push(Value::Text(patch.match_id.to_string()));

        if conn.execute(&sql, params_from_iter(values)).await? == 0 {
            return Err(Error::NotFound(format!(
                "match {} in tournament {id}",
                patch.match_id
            )));
        }
    }
    Ok(version)
}

async fn delete_in(conn: &Connection, id: &TournamentId) -> Result<()> {
    let id = id.to_string();
    let removed = conn
        .execute("DELETE FROM tournaments WHERE id = ?", [id.as_str()])
        .await?;
    if removed == 0 {
        return Err(Error::NotFound(format!("tournament {id}")));
    }
    for table in ["teams", "matches", "live_matches"] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE tournament_id = ?"),
            [id.as_str()],
        )
        .await?;
    }
    Ok(())
}

async fn live_version(conn: &Connection, live: &LiveMatch) -> Result<Option<i64>> {
    let mut rows = conn
        .query(
            "SELECT version FROM live_matches WHERE tournament_id = ? AND match_id = ?",
            [live.tournament_id.to_string(), live.match_id.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

async fn save_live_in(conn: &Connection, live: &LiveMatch, base_version: i64) -> Result<i64> {
    let version = base_version + 1;
    let mut stored = live.clone();
    stored.version = version;
    let data = serde_json::to_string(&stored)?;
    let tournament_id = live.tournament_id.to_string();
    let match_id = live.match_id.to_string();

    let written = if base_version == 0 {
        conn.execute(
            "INSERT INTO live_matches (tournament_id, match_id, data, version, updated_at)
             VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(tournament_id, match_id) DO NOTHING",
            params![tournament_id, match_id, data, live.updated_at],
        )
        .await?
    } else {
        conn.execute(
            "UPDATE live_matches SET data = ?, version = ?, updated_at = ?
             WHERE tournament_id = ? AND match_id = ? AND version = ?",
            params![
                data,
                version,
                live.updated_at,
                tournament_id,
                match_id,
                base_version
            ],
        )
        .await?
    };

    if written == 0 {
        let actual = live_version(conn, live).await?;
        return Err(version_miss(
            format!("live match {}", live.key()),
            base_version,
            actual,
        ));
    }
    Ok(version)
}

impl RemoteStore for LibSqlRemoteStore {
    async fn get(&self, id: &TournamentId) -> Result<Option<Tournament>> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        load_one(db.connection(), id).await.map_err(into_network)
    }

    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Tournament>> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        load_where(
            db.connection(),
            "owner_id = ? ORDER BY updated_at DESC",
            owner_id.to_string(),
        )
        .await
        .map_err(into_network)
    }

    async fn get_by_share_code(&self, share_code: &str) -> Result<Option<Tournament>> {
        let Some(code) = normalize_share_code(share_code) else {
            return Ok(None);
        };
        self.ensure_online()?;
        let db = self.db.lock().await;
        Ok(
            load_where(db.connection(), "share_code = ? AND is_public = 1", code)
                .await
                .map_err(into_network)?
                .into_iter()
                .next(),
        )
    }

    async fn create(&self, tournament: &Tournament) -> Result<Tournament> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await.map_err(|e| into_network(e.into()))?;
        let result = create_in(&tx, tournament).await;
        finish(tx, result).await.map_err(into_network)
    }

    async fn replace(&self, tournament: &Tournament, base_version: i64) -> Result<i64> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await.map_err(|e| into_network(e.into()))?;
        let result = replace_in(&tx, tournament, base_version).await;
        finish(tx, result).await.map_err(into_network)
    }

    async fn update_tournament_fields(
        &self,
        id: &TournamentId,
        changes: &[TournamentChange],
        base_version: i64,
    ) -> Result<i64> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await.map_err(|e| into_network(e.into()))?;
        let result = update_fields_in(&tx, id, changes, base_version).await;
        finish(tx, result).await.map_err(into_network)
    }

    async fn update_matches(
        &self,
        id: &TournamentId,
        patches: &[MatchPatch],
        base_version: i64,
    ) -> Result<i64> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await.map_err(|e| into_network(e.into()))?;
        let result = update_matches_in(&tx, id, patches, base_version).await;
        finish(tx, result).await.map_err(into_network)
    }

    async fn delete(&self, id: &TournamentId) -> Result<()> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await.map_err(|e| into_network(e.into()))?;
        let result = delete_in(&tx, id).await;
        finish(tx, result).await.map_err(into_network)
    }

    async fn live_matches(&self, tournament_id: &TournamentId) -> Result<LiveMatchMap> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        let load = async {
            let mut rows = db
                .connection()
                .query(
                    "SELECT data, version FROM live_matches WHERE tournament_id = ?",
                    [tournament_id.to_string()],
                )
                .await?;
            let mut matches = HashMap::new();
            while let Some(row) = rows.next().await? {
                let data: String = row.get(0)?;
                let mut live: LiveMatch = serde_json::from_str(&data)?;
                live.version = row.get(1)?;
                matches.insert(live.match_id, live);
            }
            Ok::<_, Error>(matches)
        };
        load.await.map_err(into_network)
    }

    async fn save_live_match(&self, live: &LiveMatch, base_version: i64) -> Result<i64> {
        self.ensure_online()?;
        let db = self.db.lock().await;
        save_live_in(db.connection(), live, base_version)
            .await
            .map_err(into_network)
    }
}
