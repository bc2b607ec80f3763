//! Durable, ordered, at-least-once delivery of local writes to the remote store

mod store;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

pub use store::MutationStore;

use crate::config::SyncSettings;
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{EntityType, MutationPayload, MutationStatus, PendingMutation, QueueStatus};
use crate::network::NetworkMonitor;
use crate::util::now_millis;

/// Where queued mutations are delivered
pub trait MutationSink: Send + Sync {
    fn deliver(&self, mutation: &PendingMutation) -> impl Future<Output = Result<()>> + Send;
}

/// Outcome of one `process` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// The pass stopped early because the device went offline
    pub offline: bool,
}

impl ProcessReport {
    /// Some send failed and was rescheduled or given up on
    pub const fn has_failures(&self) -> bool {
        self.retried > 0 || self.dead_lettered > 0
    }
}

/// Mutation queue persisted in the local database
pub struct MutationQueue<S> {
    store: MutationStore,
    sink: S,
    monitor: NetworkMonitor,
    settings: SyncSettings,
    status: watch::Sender<QueueStatus>,
}

impl<S: MutationSink> MutationQueue<S> {
    /// Open the queue, returning rows orphaned by a crash to the pending set.
    ///
    /// Rows another live process has claimed keep their claim until its lease expires.
    pub async fn open(
        db: SharedDatabase,
        sink: S,
        monitor: NetworkMonitor,
        settings: &SyncSettings,
    ) -> Result<Self> {
        let store = MutationStore::new(db);
        let reclaimed = store
            .reclaim_expired(now_millis(), settings.claim_lease_ms)
            .await?;
        if reclaimed > 0 {
            tracing::warn!("Re-queued {reclaimed} mutations interrupted by a previous shutdown");
        }

        let (status, _) = watch::channel(store.status().await?);
        Ok(Self {
            store,
            sink,
            monitor,
            settings: settings.clone(),
            status,
        })
    }

    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Durably record a mutation; returns as soon as it is persisted
    pub async fn enqueue(&self, payload: MutationPayload) -> Result<PendingMutation> {
        let entry = self.store.enqueue(payload).await?;
        tracing::debug!(
            "Queued {} for {} {}",
            entry.kind(),
            entry.entity_type(),
            entry.entity_id()
        );
        self.publish().await?;
        Ok(entry)
    }

    /// Drain every due mutation against the sink.
    ///
    /// Safe to call concurrently: rows are claimed before sending, and rows of an
    /// entity with a mutation already in flight wait for the next pass.
    pub async fn process(&self) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();

        let reclaimed = self
            .store
            .reclaim_expired(now_millis(), self.settings.claim_lease_ms)
            .await?;
        if reclaimed > 0 {
            tracing::warn!("Re-queued {reclaimed} mutations whose sender stopped responding");
        }

        while self.monitor.is_online() {
            let batch = self.store.claim_due(now_millis()).await?;
            if batch.is_empty() {
                break;
            }

            for mutation in batch {
                if report.offline {
                    self.store.release(&mutation.id).await?;
                    continue;
                }
                if !self.monitor.is_online() {
                    report.offline = true;
                    self.store.release(&mutation.id).await?;
                    continue;
                }

                match self.sink.deliver(&mutation).await {
                    Ok(()) => {
                        self.store.complete(&mutation.id).await?;
                        report.delivered += 1;
                    }
                    Err(error) if error.is_offline() => {
                        tracing::debug!("Offline while sending {}; will resend", mutation.id);
                        report.offline = true;
                        self.store.release(&mutation.id).await?;
                    }
                    Err(error) => self.record_failure(&mutation, &error, &mut report).await?,
                }
            }

            self.publish().await?;
            if report.offline {
                break;
            }
        }

        if !self.monitor.is_online() {
            report.offline = true;
        }
        self.publish().await?;
        Ok(report)
    }

    async fn record_failure(
        &self,
        mutation: &PendingMutation,
        error: &Error,
        report: &mut ProcessReport,
    ) -> Result<()> {
        let attempts = mutation.attempts.saturating_add(1);
        let message = error.to_string();

        if !error.is_retryable() || attempts >= self.settings.max_attempts {
            tracing::warn!(
                "Dead-lettering {} {} after {attempts} attempts: {message}",
                mutation.kind(),
                mutation.entity_id()
            );
            self.store.bury(&mutation.id, attempts, &message).await?;
            report.dead_lettered += 1;
            return Ok(());
        }

        let delay = self.settings.backoff_for(attempts);
        if error.is_benign() {
            tracing::debug!("Sending {} aborted, retrying in {delay:?}", mutation.id);
        } else {
            tracing::warn!(
                "Sending {} failed (attempt {attempts}), retrying in {delay:?}: {message}",
                mutation.id
            );
        }
        let next_attempt_at = now_millis().saturating_add(duration_millis(delay));
        self.store
            .schedule_retry(&mutation.id, attempts, &message, next_attempt_at)
            .await?;
        report.retried += 1;
        Ok(())
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.store.status().await
    }

    /// Live counters; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status.subscribe()
    }

    async fn publish(&self) -> Result<()> {
        let current = self.store.status().await?;
        self.status.send_if_modified(|status| {
            if *status == current {
                false
            } else {
                *status = current;
                true
            }
        });
        Ok(())
    }

    /// When the next pending row becomes due, if any
    pub async fn next_attempt_at(&self) -> Result<Option<i64>> {
        self.store.next_attempt_at().await
    }

    /// Every queued row, in queue order
    pub async fn entries(&self) -> Result<Vec<PendingMutation>> {
        self.store.list(None).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
        self.store.list(Some(MutationStatus::Dead)).await
    }

    pub async fn entries_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PendingMutation>> {
        self.store.for_entity(entity_type, entity_id).await
    }

    /// Put a dead letter back into automatic processing
    pub async fn retry_dead_letter(&self, id: &str) -> Result<()> {
        self.store.revive(id).await?;
        tracing::info!("Dead letter {id} re-queued");
        self.publish().await
    }

    /// Drop a queued or dead mutation for good
    pub async fn discard(&self, id: &str) -> Result<()> {
        self.store.discard(id).await?;
        tracing::info!("Mutation {id} discarded");
        self.publish().await
    }

    /// Drop everything not in flight for one entity
    pub async fn discard_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<u64> {
        let removed = self.store.discard_entity(entity_type, entity_id).await?;
        if removed > 0 {
            tracing::debug!("Discarded {removed} queued mutations for {entity_type} {entity_id}");
        }
        self.publish().await?;
        Ok(removed)
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{MatchChange, MatchPatch, Tournament, TournamentId};
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records deliveries; fails with queued errors first
    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
        failures: Mutex<Vec<Error>>,
        in_flight: Mutex<HashSet<String>>,
        duplicates: AtomicUsize,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        fn failing(errors: Vec<Error>) -> Self {
            Self {
                failures: Mutex::new(errors),
                ..Self::default()
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl MutationSink for Arc<RecordingSink> {
        async fn deliver(&self, mutation: &PendingMutation) -> Result<()> {
            if !self.in_flight.lock().unwrap().insert(mutation.id.clone()) {
                self.duplicates.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.lock().unwrap().remove(&mutation.id);

            let failure = {
                let mut failures = self.failures.lock().unwrap();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            if let Some(error) = failure {
                return Err(error);
            }
            self.delivered.lock().unwrap().push(mutation.entity_id());
            Ok(())
        }
    }

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            ..SyncSettings::default()
        }
    }

    async fn setup(
        sink: RecordingSink,
        monitor: NetworkMonitor,
    ) -> (MutationQueue<Arc<RecordingSink>>, Arc<RecordingSink>, SharedDatabase) {
        let db = Database::open_in_memory().await.unwrap().into_shared();
        let sink = Arc::new(sink);
        let queue = MutationQueue::open(db.clone(), Arc::clone(&sink), monitor, &fast_settings())
            .await
            .unwrap();
        (queue, sink, db)
    }

    fn save(title: &str) -> MutationPayload {
        MutationPayload::SaveTournament {
            tournament: Tournament::new(title),
        }
    }

    fn transient() -> Error {
        Error::Network {
            message: "connection reset".to_string(),
            offline: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_then_process_delivers_in_order() {
        let (queue, sink, _db) = setup(RecordingSink::default(), NetworkMonitor::online()).await;
        let first = save("One");
        let second = save("Two");
        let expected = vec![first.entity_id(), second.entity_id()];
        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();
        assert_eq!(queue.status().await.unwrap().pending_count, 2);

        let report = queue.process().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(sink.delivered(), expected);
        assert_eq!(queue.status().await.unwrap(), QueueStatus::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_same_entity_patches_coalesce() {
        let (queue, _sink, _db) = setup(RecordingSink::default(), NetworkMonitor::online()).await;
        let tournament_id = TournamentId::new();
        let match_id = crate::models::MatchId::new();
        for score in 1..=3 {
            queue
                .enqueue(MutationPayload::UpdateMatches {
                    tournament_id,
                    updates: vec![MatchPatch::new(match_id).with(MatchChange::ScoreA(Some(score)))],
                    base_version: None,
                })
                .await
                .unwrap();
        }

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].payload {
            MutationPayload::UpdateMatches { updates, .. } => {
                assert_eq!(updates[0].changes, vec![MatchChange::ScoreA(Some(3))]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_does_not_consume_attempts() {
        let monitor = NetworkMonitor::new(false);
        let (queue, sink, _db) = setup(RecordingSink::default(), monitor.clone()).await;
        queue.enqueue(save("Offline")).await.unwrap();

        let report = queue.process().await.unwrap();
        assert!(report.offline);
        assert!(sink.delivered().is_empty());
        assert_eq!(queue.entries().await.unwrap()[0].attempts, 0);

        monitor.set_online(true);
        assert_eq!(queue.process().await.unwrap().delivered, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_error_from_sink_releases_row() {
        let (queue, _sink, _db) = setup(
            RecordingSink::failing(vec![Error::offline()]),
            NetworkMonitor::online(),
        )
        .await;
        queue.enqueue(save("Flaky")).await.unwrap();

        let report = queue.process().await.unwrap();
        assert!(report.offline);
        let entry = &queue.entries().await.unwrap()[0];
        assert_eq!(entry.status, MutationStatus::Pending);
        assert_eq!(entry.attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_failures_retry_then_dead_letter() {
        let (queue, sink, _db) = setup(
            RecordingSink::failing(vec![transient(), transient(), transient()]),
            NetworkMonitor::online(),
        )
        .await;
        let mut status = queue.subscribe();
        queue.enqueue(save("Doomed")).await.unwrap();

        let report = queue.process().await.unwrap();
        assert_eq!(report.retried, 2);
        assert_eq!(report.dead_lettered, 1);
        assert!(sink.delivered().is_empty());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert!(dead[0].last_error.as_deref().unwrap().contains("connection reset"));
        assert_eq!(
            *status.borrow_and_update(),
            QueueStatus {
                pending_count: 0,
                failed_count: 1
            }
        );

        // Dead letters are excluded from automatic passes
        assert_eq!(queue.process().await.unwrap(), ProcessReport::default());

        queue.retry_dead_letter(&dead[0].id).await.unwrap();
        assert_eq!(queue.process().await.unwrap().delivered, 1);
        assert_eq!(queue.status().await.unwrap(), QueueStatus::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_optimistic_lock_dead_letters_immediately() {
        let (queue, _sink, _db) = setup(
            RecordingSink::failing(vec![Error::OptimisticLock {
                entity_id: "t1".to_string(),
                expected_version: 1,
                actual_version: 2,
            }]),
            NetworkMonitor::online(),
        )
        .await;
        queue.enqueue(save("Contested")).await.unwrap();

        let report = queue.process().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(queue.dead_letters().await.unwrap()[0].attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discard_removes_dead_letter() {
        let (queue, _sink, _db) = setup(
            RecordingSink::failing(vec![Error::InvalidInput("bad payload".to_string())]),
            NetworkMonitor::online(),
        )
        .await;
        queue.enqueue(save("Broken")).await.unwrap();
        queue.process().await.unwrap();

        let dead = queue.dead_letters().await.unwrap();
        queue.discard(&dead[0].id).await.unwrap();
        assert_eq!(queue.status().await.unwrap(), QueueStatus::default());
        assert!(matches!(
            queue.discard(&dead[0].id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_process_sends_each_mutation_once() {
        let sink = RecordingSink {
            delay: Some(Duration::from_millis(5)),
            ..RecordingSink::default()
        };
        let (queue, sink, _db) = setup(sink, NetworkMonitor::online()).await;
        let queue = Arc::new(queue);
        for index in 0..10 {
            queue.enqueue(save(&format!("Cup {index}"))).await.unwrap();
        }

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process().await }
        });
        let second = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process().await }
        });
        let delivered =
            first.await.unwrap().unwrap().delivered + second.await.unwrap().unwrap().delivered;

        assert_eq!(delivered, 10);
        assert_eq!(sink.duplicates.load(Ordering::SeqCst), 0);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for id in sink.delivered() {
            *counts.entry(id).or_default() += 1;
        }
        assert!(counts.values().all(|count| *count == 1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rows_in_flight_at_crash_are_requeued() {
        let (queue, sink, db) = setup(RecordingSink::default(), NetworkMonitor::online()).await;
        queue.enqueue(save("Interrupted")).await.unwrap();
        let lease = fast_settings().claim_lease_ms;
        let claimed_long_ago = now_millis() - i64::try_from(lease).unwrap() - 1_000;
        let claimed = MutationStore::new(db.clone())
            .claim_due(claimed_long_ago)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        drop(queue);

        let reopened = MutationQueue::open(
            db,
            Arc::clone(&sink),
            NetworkMonitor::online(),
            &fast_settings(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.process().await.unwrap().delivered, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_claim_held_by_live_sender_survives_second_open() {
        let (queue, sink, db) = setup(RecordingSink::default(), NetworkMonitor::online()).await;
        queue.enqueue(save("Held")).await.unwrap();
        let store = MutationStore::new(db.clone());
        assert_eq!(store.claim_due(now_millis()).await.unwrap().len(), 1);

        // Another process opens the same database while the send is in flight
        let second = MutationQueue::open(
            db,
            Arc::clone(&sink),
            NetworkMonitor::online(),
            &fast_settings(),
        )
        .await
        .unwrap();
        assert_eq!(second.process().await.unwrap().delivered, 0);
        assert!(sink.delivered().is_empty());
        let listed = second.store.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, MutationStatus::Processing);

        // Once the lease runs out the row is fair game again
        let lease = fast_settings().claim_lease_ms;
        let later = now_millis() + i64::try_from(lease).unwrap();
        assert_eq!(store.reclaim_expired(later, lease).await.unwrap(), 1);
        assert_eq!(second.process().await.unwrap().delivered, 1);
        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_later_rows_wait_for_earlier_row_of_same_entity() {
        let (queue, sink, db) = setup(RecordingSink::default(), NetworkMonitor::online()).await;
        let tournament = Tournament::new("Ordered");
        let id = tournament.id;
        queue
            .enqueue(MutationPayload::SaveTournament { tournament })
            .await
            .unwrap();

        // Hold the save in flight; the delete behind it must not be claimable
        let store = MutationStore::new(db);
        assert_eq!(store.claim_due(now_millis()).await.unwrap().len(), 1);
        queue
            .enqueue(MutationPayload::DeleteTournament { tournament_id: id })
            .await
            .unwrap();
        assert!(store.claim_due(now_millis()).await.unwrap().is_empty());
        assert!(sink.delivered().is_empty());
    }
}
