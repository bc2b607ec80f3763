//! Durable mutation rows in the local database

use std::collections::HashSet;

use libsql::{params, params_from_iter, Connection, Row};
use uuid::Uuid;

use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{EntityType, MutationPayload, MutationStatus, PendingMutation, QueueStatus};
use crate::util::{compact_text, now_millis};

const COLUMNS: &str =
    "id, payload, enqueued_at, attempts, last_error, status, next_attempt_at, entity_type, entity_id";

/// Queue persistence over the `mutations` table
#[derive(Clone)]
pub struct MutationStore {
    db: SharedDatabase,
}

fn parse_row(row: &Row) -> Result<PendingMutation> {
    let payload: String = row.get(1)?;
    let status: String = row.get(5)?;
    Ok(PendingMutation {
        id: row.get(0)?,
        payload: serde_json::from_str(&payload)?,
        enqueued_at: row.get(2)?,
        attempts: u32::try_from(row.get::<i64>(3)?).unwrap_or(0),
        last_error: row.get(4)?,
        status: status.parse()?,
        next_attempt_at: row.get(6)?,
    })
}

async fn collect(conn: &Connection, sql: &str, values: Vec<String>) -> Result<Vec<PendingMutation>> {
    let mut rows = conn.query(sql, params_from_iter(values)).await?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next().await? {
        let id: String = row.get(0)?;
        match parse_row(&row) {
            Ok(entry) => entries.push(entry),
            Err(error) => tracing::warn!("Skipping unreadable queued mutation {id}: {error}"),
        }
    }
    Ok(entries)
}

impl MutationStore {
    pub const fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Return rows whose claim is older than `lease_ms` to the pending set.
    ///
    /// A live sender acknowledges well inside the lease, so only rows orphaned
    /// by a terminated process come back.
    pub async fn reclaim_expired(&self, now_ms: i64, lease_ms: u64) -> Result<u64> {
        let cutoff = now_ms.saturating_sub(i64::try_from(lease_ms).unwrap_or(i64::MAX));
        let db = self.db.lock().await;
        let reclaimed = db
            .connection()
            .execute(
                "UPDATE mutations SET status = 'pending', claimed_at = NULL
                 WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at <= ?)",
                [cutoff],
            )
            .await?;
        Ok(reclaimed)
    }

    /// Persist a payload, folding it into the newest pending row for the same entity when possible
    pub async fn enqueue(&self, payload: MutationPayload) -> Result<PendingMutation> {
        let entity_type = payload.entity_type();
        let entity_id = payload.entity_id();
        let db = self.db.lock().await;
        let conn = db.connection();

        let newest = collect(
            conn,
            &format!(
                "SELECT {COLUMNS} FROM mutations
                 WHERE entity_type = ? AND entity_id = ? AND status != 'dead'
                 ORDER BY seq DESC LIMIT 1"
            ),
            vec![entity_type.to_string(), entity_id.clone()],
        )
        .await?
        .into_iter()
        .next();

        if let Some(mut existing) = newest.filter(|row| row.status == MutationStatus::Pending) {
            if let Some(merged) = existing.payload.clone().coalesce(payload.clone()) {
                conn.execute(
                    "UPDATE mutations SET kind = ?, payload = ? WHERE id = ? AND status = 'pending'",
                    params![merged.kind(), serde_json::to_string(&merged)?, existing.id.as_str()],
                )
                .await?;
                tracing::debug!("Coalesced {} into queued mutation {}", merged.kind(), existing.id);
                existing.payload = merged;
                return Ok(existing);
            }
        }

        let entry = PendingMutation {
            id: Uuid::now_v7().to_string(),
            payload,
            enqueued_at: now_millis(),
            attempts: 0,
            last_error: None,
            status: MutationStatus::Pending,
            next_attempt_at: 0,
        };
        conn.execute(
            "INSERT INTO mutations
                (id, kind, entity_type, entity_id, payload, enqueued_at, status, next_attempt_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0)",
            params![
                entry.id.as_str(),
                entry.kind(),
                entity_type.as_str(),
                entity_id,
                serde_json::to_string(&entry.payload)?,
                entry.enqueued_at
            ],
        )
        .await?;
        Ok(entry)
    }

    /// Claim the oldest due row of every entity with nothing already in flight.
    ///
    /// The `pending -> processing` transition is conditional, so a row is never
    /// handed to two concurrent callers.
    pub async fn claim_due(&self, now_ms: i64) -> Result<Vec<PendingMutation>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let queued = collect(
            conn,
            &format!(
                "SELECT {COLUMNS} FROM mutations
                 WHERE status IN ('pending', 'processing') ORDER BY seq"
            ),
            Vec::new(),
        )
        .await?;

        let mut seen = HashSet::new();
        let mut claimed = Vec::new();
        for mut entry in queued {
            if !seen.insert((entry.entity_type(), entry.entity_id())) {
                continue;
            }
            if entry.status != MutationStatus::Pending || entry.next_attempt_at > now_ms {
                continue;
            }
            let updated = conn
                .execute(
                    "UPDATE mutations SET status = 'processing', claimed_at = ?
                     WHERE id = ? AND status = 'pending'",
                    params![now_ms, entry.id.as_str()],
                )
                .await?;
            if updated == 1 {
                entry.status = MutationStatus::Processing;
                claimed.push(entry);
            }
        }
        Ok(claimed)
    }

    /// Delivered; drop the row
    pub async fn complete(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute("DELETE FROM mutations WHERE id = ?", [id])
            .await?;
        Ok(())
    }

    /// Hand a claimed row back without counting an attempt
    pub async fn release(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "UPDATE mutations SET status = 'pending', claimed_at = NULL
                 WHERE id = ? AND status = 'processing'",
                [id],
            )
            .await?;
        Ok(())
    }

    /// Record a failed attempt and schedule the next one
    pub async fn schedule_retry(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "UPDATE mutations
                 SET status = 'pending', attempts = ?, last_error = ?, next_attempt_at = ?,
                     claimed_at = NULL
                 WHERE id = ?",
                params![i64::from(attempts), compact_text(error), next_attempt_at, id],
            )
            .await?;
        Ok(())
    }

    /// Move a row to the dead-letter set
    pub async fn bury(&self, id: &str, attempts: u32, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "UPDATE mutations SET status = 'dead', attempts = ?, last_error = ?, claimed_at = NULL
                 WHERE id = ?",
                params![i64::from(attempts), compact_text(error), id],
            )
            .await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT
                    COALESCE(SUM(CASE WHEN status != 'dead' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'dead' THEN 1 ELSE 0 END), 0)
                 FROM mutations",
                (),
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(QueueStatus::default());
        };
        Ok(QueueStatus {
            pending_count: usize::try_from(row.get::<i64>(0)?).unwrap_or(0),
            failed_count: usize::try_from(row.get::<i64>(1)?).unwrap_or(0),
        })
    }

    /// Earliest scheduled retry among pending rows
    pub async fn next_attempt_at(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT MIN(next_attempt_at) FROM mutations WHERE status = 'pending'",
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<i64>>(0)?),
            None => Ok(None),
        }
    }

    /// Rows in queue order, optionally filtered by status
    pub async fn list(&self, status: Option<MutationStatus>) -> Result<Vec<PendingMutation>> {
        let db = self.db.lock().await;
        match status {
            Some(status) => {
                collect(
                    db.connection(),
                    &format!("SELECT {COLUMNS} FROM mutations WHERE status = ? ORDER BY seq"),
                    vec![status.as_str().to_string()],
                )
                .await
            }
            None => {
                collect(
                    db.connection(),
                    &format!("SELECT {COLUMNS} FROM mutations ORDER BY seq"),
                    Vec::new(),
                )
                .await
            }
        }
    }

    /// Every row targeting one entity
    pub async fn for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PendingMutation>> {
        let db = self.db.lock().await;
        collect(
            db.connection(),
            &format!(
                "SELECT {COLUMNS} FROM mutations WHERE entity_type = ? AND entity_id = ? ORDER BY seq"
            ),
            vec![entity_type.to_string(), entity_id.to_string()],
        )
        .await
    }

    /// Return a dead letter to the pending set with a fresh attempt budget
    pub async fn revive(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let revived = db
            .connection()
            .execute(
                "UPDATE mutations
                 SET status = 'pending', attempts = 0, next_attempt_at = 0, last_error = NULL
                 WHERE id = ? AND status = 'dead'",
                [id],
            )
            .await?;
        if revived == 0 {
            return Err(Error::NotFound(format!("dead letter {id}")));
        }
        Ok(())
    }

    /// Delete a row that is not currently in flight
    pub async fn discard(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let removed = db
            .connection()
            .execute(
                "DELETE FROM mutations WHERE id = ? AND status != 'processing'",
                [id],
            )
            .await?;
        if removed == 0 {
            return Err(Error::NotFound(format!("queued mutation {id}")));
        }
        Ok(())
    }

    /// Delete every idle row for one entity, returning how many were removed
    pub async fn discard_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<u64> {
        let db = self.db.lock().await;
        let removed = db
            .connection()
            .execute(
                "DELETE FROM mutations
                 WHERE entity_type = ? AND entity_id = ? AND status != 'processing'",
                [entity_type.as_str(), entity_id],
            )
            .await?;
        Ok(removed)
    }
}
