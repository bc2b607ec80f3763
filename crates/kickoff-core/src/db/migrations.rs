//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// One schema step, applied inside a single transaction
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// Local cache schema
pub const LOCAL_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "tournament and live match cache",
        statements: &[
            "CREATE TABLE IF NOT EXISTS tournaments (
                id TEXT PRIMARY KEY,
                owner_id TEXT,
                data TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                last_synced_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_tournaments_owner ON tournaments(owner_id)",
            "CREATE INDEX IF NOT EXISTS idx_tournaments_updated ON tournaments(updated_at DESC)",
            // One JSON map of match_id -> LiveMatch per tournament
            "CREATE TABLE IF NOT EXISTS live_matches (
                tournament_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        ],
    },
    Migration {
        version: 2,
        description: "durable mutation queue",
        statements: &[
            "CREATE TABLE IF NOT EXISTS mutations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                next_attempt_at INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_mutations_status ON mutations(status, seq)",
            "CREATE INDEX IF NOT EXISTS idx_mutations_entity ON mutations(entity_type, entity_id)",
        ],
    },
    Migration {
        version: 3,
        description: "claim lease for in-flight mutations",
        statements: &["ALTER TABLE mutations ADD COLUMN claimed_at INTEGER"],
    },
];

/// Run all pending migrations from `steps`
pub async fn run(conn: &Connection, steps: &[Migration]) -> Result<()> {
    ensure_version_table(conn).await?;
    let version = get_version(conn).await?;

    for step in steps.iter().filter(|step| step.version > version) {
        apply(conn, step).await?;
    }

    Ok(())
}

async fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        (),
    )
    .await?;
    Ok(())
}

/// Get the current schema version
pub async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn apply(conn: &Connection, step: &Migration) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    // Using a transaction for atomicity
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in step.statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            [i64::from(step.version)],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!(
        "Migrated database to version {} ({})",
        step.version,
        step.description
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn, LOCAL_MIGRATIONS).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn, LOCAL_MIGRATIONS).await.unwrap();
        run(&conn, LOCAL_MIGRATIONS).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_schema_creates_queue_table() {
        let conn = setup().await;
        run(&conn, LOCAL_MIGRATIONS).await.unwrap();

        assert!(table_exists(&conn, "tournaments").await);
        assert!(table_exists(&conn, "live_matches").await);
        assert!(table_exists(&conn, "mutations").await);
    }
}
