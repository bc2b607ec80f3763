//! Background task that drains the queue on writes, reconnects, retries and a timer

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::SyncOrchestrator;
use crate::cache::LocalCache;
use crate::models::SyncState;
use crate::remote::RemoteStore;
use crate::util::now_millis;

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<L, R> SyncOrchestrator<L, R>
where
    L: LocalCache + 'static,
    R: RemoteStore + 'static,
{
    /// Run sync in the background until the returned handle is aborted
    pub fn spawn_background(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run_background().await })
    }

    async fn run_background(&self) {
        let mut connectivity = self.monitor.subscribe();
        let mut ticker = self.settings.sync_interval().map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut retry_at = None;

        loop {
            tokio::select! {
                () = self.wake.notified() => {
                    retry_at = self.drain().await;
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    if online {
                        tracing::info!("Back online, syncing");
                        retry_at = self.sync_pass().await;
                    } else {
                        self.set_state(SyncState::Offline);
                    }
                }
                () = sleep_until(retry_at) => {
                    retry_at = self.drain().await;
                }
                () = tick(&mut ticker) => {
                    retry_at = self.sync_pass().await;
                }
            }
        }
    }

    async fn drain(&self) -> Option<Instant> {
        match self.process_queue().await {
            Ok(report) if report.dead_lettered > 0 => {
                tracing::warn!("{} mutations moved to dead letters", report.dead_lettered);
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!("Background queue pass failed: {error}");
                self.set_state(SyncState::Error);
            }
        }
        self.next_retry().await
    }

    async fn sync_pass(&self) -> Option<Instant> {
        if let Err(error) = self.sync_up().await {
            tracing::warn!("Background sync failed: {error}");
        }
        self.next_retry().await
    }

    /// Wake-up for the earliest scheduled retry
    async fn next_retry(&self) -> Option<Instant> {
        if !self.monitor.is_online() {
            return None;
        }
        let due = self.queue.next_attempt_at().await.ok().flatten()?;
        let wait = u64::try_from(due.saturating_sub(now_millis())).unwrap_or(0);
        // Rows blocked behind another process's in-flight send are already due
        let wait = wait.max(self.settings.backoff_base_ms);
        Some(Instant::now() + Duration::from_millis(wait))
    }
}
