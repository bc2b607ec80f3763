//! Normalized schema of the shared remote store

use crate::db::Migration;

/// Remote store schema; every lockable root carries an integer `version`
pub const REMOTE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "normalized tournaments, teams, matches and live matches",
    statements: &[
        "CREATE TABLE IF NOT EXISTS tournaments (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            title TEXT NOT NULL,
            date TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            location TEXT,
            is_public INTEGER NOT NULL DEFAULT 0,
            share_code TEXT,
            groups_json TEXT NOT NULL DEFAULT '[]',
            fields_json TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_tournaments_owner ON tournaments(owner_id)",
        "CREATE INDEX IF NOT EXISTS idx_tournaments_share_code ON tournaments(share_code)",
        "CREATE TABLE IF NOT EXISTS teams (
            id TEXT NOT NULL,
            tournament_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            group_id TEXT,
            PRIMARY KEY (tournament_id, id)
        )",
        "CREATE TABLE IF NOT EXISTS matches (
            id TEXT NOT NULL,
            tournament_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            round INTEGER NOT NULL DEFAULT 1,
            group_id TEXT,
            field_id TEXT,
            team_a TEXT,
            team_b TEXT,
            scheduled_at INTEGER,
            score_a INTEGER,
            score_b INTEGER,
            status TEXT NOT NULL DEFAULT 'scheduled',
            timer_started_at INTEGER,
            elapsed_seconds INTEGER NOT NULL DEFAULT 0,
            referee TEXT,
            PRIMARY KEY (tournament_id, id)
        )",
        "CREATE TABLE IF NOT EXISTS live_matches (
            tournament_id TEXT NOT NULL,
            match_id TEXT NOT NULL,
            data TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (tournament_id, match_id)
        )",
    ],
}];
