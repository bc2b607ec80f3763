//! Offline-first synchronization between the local cache and the remote store
//!
//! Reads race the remote tier against a timeout and fall back to the cache.
//! Writes land in the cache first, then travel through the mutation queue.
//! Pulls never overwrite unconfirmed local edits; they surface conflicts instead.

mod conflict;
pub mod delta;
mod delivery;
mod worker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{watch, Notify};

pub use conflict::detect as detect_conflicts;
pub use delivery::RemoteDelivery;
pub use delta::{Freshness, PushOutcome};

use crate::cache::{LiveMatchMap, LocalCache};
use crate::config::SyncSettings;
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::lock::{CrossContextLock, Lock};
use crate::models::{
    CachedTournament, EntityType, LiveMatch, MatchPatch, MutationPayload, PendingMutation,
    QueueStatus, Resolution, SyncConflict, SyncResult, SyncState, SyncStatus, Tournament,
    TournamentId,
};
use crate::network::NetworkMonitor;
use crate::queue::{MutationQueue, MutationStore, ProcessReport};
use crate::remote::RemoteStore;
use crate::util::{generate_share_code, normalize_share_code, now_millis};

pub(crate) fn tournament_lock_key(id: &TournamentId) -> String {
    format!("tournament-{id}")
}

pub(crate) fn live_lock_key(tournament_id: &TournamentId) -> String {
    format!("live-{tournament_id}")
}

/// A tournament that could not be pushed during `sync_up`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub tournament_id: TournamentId,
    pub error: String,
}

/// Outcome of a full `sync_up` pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub queue: ProcessReport,
    /// Created remotely because no remote row existed
    pub uploaded: usize,
    pub pushed: usize,
    pub in_sync: usize,
    /// Remote copy is ahead; left for a pull
    pub skipped: usize,
    pub failed: Vec<SyncFailure>,
    pub offline: bool,
}

enum Upload {
    Uploaded,
    Pushed,
    InSync,
    Skipped,
}

enum Pulled {
    Missing,
    Current(Tournament),
    Updated(Tournament),
    Conflicted(Tournament, Vec<SyncConflict>),
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn owned_by(tournament: &Tournament, owner: Option<&str>) -> bool {
    match (owner, tournament.owner_id.as_deref()) {
        (None, _) | (Some(_), None) => true,
        (Some(owner), Some(id)) => owner == id,
    }
}

/// Coordinates the cache, remote store, queue and lock behind one surface
pub struct SyncOrchestrator<L, R> {
    local: Arc<L>,
    remote: Arc<R>,
    queue: MutationQueue<RemoteDelivery<L, R>>,
    pending: MutationStore,
    lock: CrossContextLock,
    monitor: NetworkMonitor,
    settings: SyncSettings,
    state: watch::Sender<SyncState>,
    conflicts: Mutex<HashMap<TournamentId, Vec<SyncConflict>>>,
    share_codes: Mutex<HashMap<String, TournamentId>>,
    current_user: Option<String>,
    wake: Notify,
}

impl<L: LocalCache, R: RemoteStore> SyncOrchestrator<L, R> {
    /// Wire the tiers together; `queue_db` holds the durable mutation queue
    pub async fn new(
        local: Arc<L>,
        remote: Arc<R>,
        queue_db: SharedDatabase,
        lock: CrossContextLock,
        monitor: NetworkMonitor,
        settings: SyncSettings,
    ) -> Result<Self> {
        let pending = MutationStore::new(queue_db.clone());
        let delivery = RemoteDelivery::new(
            Arc::clone(&local),
            Arc::clone(&remote),
            lock.clone(),
            pending.clone(),
        );
        let queue = MutationQueue::open(queue_db, delivery, monitor.clone(), &settings).await?;
        let initial = if monitor.is_online() {
            SyncState::Synced
        } else {
            SyncState::Offline
        };
        let (state, _) = watch::channel(initial);

        Ok(Self {
            local,
            remote,
            queue,
            pending,
            lock,
            monitor,
            settings,
            state,
            conflicts: Mutex::new(HashMap::new()),
            share_codes: Mutex::new(HashMap::new()),
            current_user: None,
            wake: Notify::new(),
        })
    }

    /// Owner assigned to new tournaments and used by `list_for_current_user`
    #[must_use]
    pub fn with_current_user(mut self, owner_id: impl Into<String>) -> Self {
        self.current_user = Some(owner_id.into());
        self
    }

    pub fn current_user(&self) -> Option<&str> {
        self.current_user.as_deref()
    }

    pub const fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    /// Whether writers in other processes are excluded too
    pub const fn is_cross_process(&self) -> bool {
        self.lock.is_cross_process()
    }

    /// Remote call bounded by the configured timeout; fails fast when offline
    async fn remote_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        if !self.monitor.is_online() {
            return Err(Error::offline());
        }
        let limit = self.settings.remote_timeout();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| Error::Aborted(format!("remote call exceeded {limit:?}")))?
    }

    async fn cached_tournament(&self, id: &TournamentId) -> Result<Option<Tournament>> {
        Ok(self.local.get(id).await?.map(|cached| cached.tournament))
    }

    /// Cache a remote copy unless that would hide unconfirmed local edits.
    ///
    /// Returns whichever copy the cache now holds. Cache failures are logged and
    /// the remote copy is returned.
    async fn write_through(&self, remote: Tournament) -> Tournament {
        let fallback = remote.clone();
        let local = &self.local;
        let result = self
            .lock
            .with_lock(&tournament_lock_key(&remote.id), move || async move {
                match local.get(&remote.id).await? {
                    Some(cached) if cached.dirty || cached.tournament.version > remote.version => {
                        Ok(cached.tournament)
                    }
                    _ => {
                        local.save(&CachedTournament::from_remote(remote.clone())).await?;
                        Ok(remote)
                    }
                }
            })
            .await;

        result.unwrap_or_else(|error| {
            tracing::warn!("Failed to cache remote copy of {}: {error}", fallback.id);
            fallback
        })
    }

    /// Queue a mutation. Callers hold the entity lock, so an acknowledgement
    /// never sees a local edit without its queued row.
    async fn enqueue(&self, payload: MutationPayload) -> Result<()> {
        self.queue.enqueue(payload).await?;
        Ok(())
    }

    /// Remote copy when reachable in time, otherwise the cached one
    pub async fn get(&self, id: &TournamentId) -> Result<Option<Tournament>> {
        match self.remote_call(self.remote.get(id)).await {
            Ok(Some(remote)) => Ok(Some(self.write_through(remote).await)),
            Ok(None) => self.cached_tournament(id).await,
            Err(error) => {
                let cached = self.cached_tournament(id).await?;
                if cached.is_none() && !error.is_network() {
                    return Err(error);
                }
                if !error.is_offline() {
                    tracing::debug!("Serving cached {id} after remote read failed: {error}");
                }
                Ok(cached)
            }
        }
    }

    /// Store locally, then queue the push. Returns the stored copy.
    pub async fn save(&self, tournament: &Tournament) -> Result<Tournament> {
        if tournament.title.trim().is_empty() {
            return Err(Error::InvalidInput("tournament title is required".to_string()));
        }

        let this = self;
        let saved = self
            .lock
            .with_lock(&tournament_lock_key(&tournament.id), move || async move {
                let mut next = tournament.clone();
                let previous = this.local.get(&next.id).await?;
                if let Some(previous) = &previous {
                    next.version = next.version.max(previous.tournament.version);
                    next.updated_at = next.updated_at.max(previous.tournament.updated_at);
                }
                if next.owner_id.is_none() {
                    next.owner_id.clone_from(&this.current_user);
                }
                next.touch();

                this.local
                    .save(&CachedTournament {
                        tournament: next.clone(),
                        dirty: true,
                        last_synced_at: previous.and_then(|previous| previous.last_synced_at),
                    })
                    .await?;
                this.enqueue(MutationPayload::SaveTournament {
                    tournament: next.clone(),
                })
                .await?;
                Ok(next)
            })
            .await?;

        self.wake.notify_one();
        Ok(saved)
    }

    pub async fn update_match(&self, id: &TournamentId, patch: MatchPatch) -> Result<Tournament> {
        self.update_matches(id, vec![patch], None).await
    }

    /// Granular match edit. Without `base_version` the push rebases onto the
    /// current remote version, so only the named fields are overwritten.
    pub async fn update_matches(
        &self,
        id: &TournamentId,
        patches: Vec<MatchPatch>,
        base_version: Option<i64>,
    ) -> Result<Tournament> {
        let patches: Vec<_> = patches.into_iter().filter(|patch| !patch.is_empty()).collect();
        if patches.is_empty() {
            return Err(Error::InvalidInput("no match changes given".to_string()));
        }

        let this = self;
        let updated = self
            .lock
            .with_lock(&tournament_lock_key(id), move || async move {
                let mut cached = this
                    .local
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("tournament {id}")))?;
                cached.tournament.apply_match_patches(&patches)?;
                cached.tournament.touch();
                cached.dirty = true;
                this.local.save(&cached).await?;
                this.enqueue(MutationPayload::UpdateMatches {
                    tournament_id: *id,
                    updates: patches,
                    base_version,
                })
                .await?;
                Ok(cached.tournament)
            })
            .await?;

        self.wake.notify_one();
        Ok(updated)
    }

    pub async fn delete(&self, id: &TournamentId) -> Result<()> {
        let this = self;
        self.lock
            .with_lock(&tournament_lock_key(id), move || async move {
                this.local.delete(id).await?;
                this.enqueue(MutationPayload::DeleteTournament { tournament_id: *id })
                    .await
            })
            .await?;
        self.forget_share_codes(id);
        self.clear_conflicts(id);
        self.wake.notify_one();
        Ok(())
    }

    /// Tournaments owned by the current user, newest first.
    ///
    /// Remote rows are merged into the cache when reachable; cached rows not yet
    /// pushed are always included.
    pub async fn list_for_current_user(&self) -> Result<Vec<Tournament>> {
        let owner = self.current_user.as_deref();
        let mut listed: HashMap<TournamentId, Tournament> = self
            .local
            .list()
            .await?
            .into_iter()
            .map(|cached| cached.tournament)
            .filter(|tournament| owned_by(tournament, owner))
            .map(|tournament| (tournament.id, tournament))
            .collect();

        if let Some(owner) = owner {
            match self.remote_call(self.remote.list_for_owner(owner)).await {
                Ok(remote) => {
                    for tournament in remote {
                        let merged = self.write_through(tournament).await;
                        listed.insert(merged.id, merged);
                    }
                }
                Err(error) if error.is_offline() => {}
                Err(error) => tracing::debug!("Listing from cache only: {error}"),
            }
        }

        let mut tournaments: Vec<_> = listed.into_values().collect();
        tournaments.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tournaments)
    }

    /// Public tournament by share code, remembered for later lookups
    pub async fn get_by_share_code(&self, share_code: &str) -> Result<Option<Tournament>> {
        let Some(code) = normalize_share_code(share_code) else {
            return Ok(None);
        };

        let known = locked(&self.share_codes).get(&code).copied();
        if let Some(id) = known {
            let found = self.get(&id).await?;
            if let Some(tournament) =
                found.filter(|t| t.is_public && t.share_code.as_deref() == Some(code.as_str()))
            {
                return Ok(Some(tournament));
            }
            locked(&self.share_codes).remove(&code);
        }

        match self.remote_call(self.remote.get_by_share_code(&code)).await {
            Ok(Some(remote)) => {
                let tournament = self.write_through(remote).await;
                locked(&self.share_codes).insert(code, tournament.id);
                Ok(Some(tournament))
            }
            Ok(None) => Ok(None),
            Err(error) => {
                let cached = self
                    .local
                    .list()
                    .await?
                    .into_iter()
                    .map(|cached| cached.tournament)
                    .find(|t| t.is_public && t.share_code.as_deref() == Some(code.as_str()));
                if cached.is_none() && !error.is_network() {
                    return Err(error);
                }
                Ok(cached)
            }
        }
    }

    fn forget_share_codes(&self, id: &TournamentId) {
        locked(&self.share_codes).retain(|_, known| known != id);
    }

    /// Local metadata edit pushed through the regular versioned path
    async fn edit_visibility<F>(&self, id: &TournamentId, edit: F) -> Result<Tournament>
    where
        F: FnOnce(&mut Tournament) + Send,
    {
        let this = self;
        let updated = self
            .lock
            .with_lock(&tournament_lock_key(id), move || async move {
                let mut cached = this
                    .local
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("tournament {id}")))?;
                edit(&mut cached.tournament);
                cached.tournament.touch();
                cached.dirty = true;
                this.local.save(&cached).await?;
                this.enqueue(MutationPayload::SaveTournament {
                    tournament: cached.tournament.clone(),
                })
                .await?;
                Ok(cached.tournament)
            })
            .await?;

        self.forget_share_codes(id);
        self.wake.notify_one();
        Ok(updated)
    }

    /// Publish, generating a share code on first use
    pub async fn make_public(&self, id: &TournamentId) -> Result<Tournament> {
        self.edit_visibility(id, |tournament| {
            tournament.is_public = true;
            if tournament.share_code.is_none() {
                tournament.share_code = Some(generate_share_code());
            }
        })
        .await
    }

    /// Hide from share-code lookups; the code is kept for a later re-publish
    pub async fn make_private(&self, id: &TournamentId) -> Result<Tournament> {
        self.edit_visibility(id, |tournament| tournament.is_public = false)
            .await
    }

    /// Replace the share code, invalidating the old one
    pub async fn regenerate_share_code(&self, id: &TournamentId) -> Result<String> {
        let updated = self
            .edit_visibility(id, |tournament| {
                tournament.share_code = Some(generate_share_code());
            })
            .await?;
        updated
            .share_code
            .ok_or_else(|| Error::InvalidInput(format!("tournament {id} has no share code")))
    }

    /// Cached live state; abandoned timers are paused on read.
    ///
    /// Read under the tournament's live lock so a repair never races a save.
    pub async fn live_matches(&self, tournament_id: &TournamentId) -> Result<LiveMatchMap> {
        let local = &self.local;
        self.lock
            .with_lock(&live_lock_key(tournament_id), move || async move {
                local.live_matches(tournament_id).await
            })
            .await
    }

    /// Merge newer remote live state into the cache
    pub async fn pull_live_matches(&self, tournament_id: &TournamentId) -> Result<LiveMatchMap> {
        let remote = match self.remote_call(self.remote.live_matches(tournament_id)).await {
            Ok(remote) => remote,
            Err(error) if error.is_network() => return self.live_matches(tournament_id).await,
            Err(error) => return Err(error),
        };

        let local = &self.local;
        self.lock
            .with_lock(&live_lock_key(tournament_id), move || async move {
                let mut merged = local.live_matches(tournament_id).await?;
                let mut changed = false;
                for (match_id, incoming) in remote {
                    let newer = merged
                        .get(&match_id)
                        .map_or(true, |current| incoming.version > current.version);
                    if newer {
                        merged.insert(match_id, incoming);
                        changed = true;
                    }
                }
                if changed {
                    local.save_live_matches(tournament_id, &merged).await?;
                }
                Ok(merged)
            })
            .await
    }

    /// Store live state locally and queue it; concurrent edits to the same
    /// tournament's live matches are serialized.
    pub async fn save_live_match(&self, live: &LiveMatch) -> Result<LiveMatch> {
        let this = self;
        let saved = self
            .lock
            .with_lock(&live_lock_key(&live.tournament_id), move || async move {
                let mut matches = this.local.live_matches(&live.tournament_id).await?;
                let mut next = live.clone();
                next.updated_at = now_millis().max(next.updated_at);
                if let Some(existing) = matches.get(&next.match_id) {
                    next.version = next.version.max(existing.version);
                }
                matches.insert(next.match_id, next.clone());
                this.local
                    .save_live_matches(&live.tournament_id, &matches)
                    .await?;
                this.enqueue(MutationPayload::SaveLiveMatch { live: next.clone() })
                    .await?;
                Ok(next)
            })
            .await?;

        self.wake.notify_one();
        Ok(saved)
    }

    /// Deliver due queued mutations now
    pub async fn process_queue(&self) -> Result<ProcessReport> {
        let report = self.queue.process().await?;
        self.settle_queue(&report);
        Ok(report)
    }

    /// Drain the queue, then reconcile every cached tournament with its remote row
    pub async fn sync_up(&self) -> Result<SyncReport> {
        if !self.monitor.is_online() {
            self.set_state(SyncState::Offline);
            return Ok(SyncReport {
                offline: true,
                ..SyncReport::default()
            });
        }
        self.set_state(SyncState::Syncing);

        let mut report = SyncReport::default();
        let cached = match self.queue.process().await {
            Ok(queue) => {
                report.queue = queue;
                self.local.list().await
            }
            Err(error) => Err(error),
        };
        let cached = match cached {
            Ok(cached) => cached,
            Err(error) => {
                self.set_state(SyncState::Error);
                return Err(error);
            }
        };

        for entry in cached {
            let id = entry.tournament.id;
            if !self.monitor.is_online() {
                report.offline = true;
                break;
            }
            match self.upload(&id).await {
                Ok(Upload::Uploaded) => report.uploaded += 1,
                Ok(Upload::Pushed) => report.pushed += 1,
                Ok(Upload::InSync) => report.in_sync += 1,
                Ok(Upload::Skipped) => report.skipped += 1,
                Err(error) if error.is_offline() => {
                    report.offline = true;
                    break;
                }
                Err(error) => {
                    tracing::warn!("Failed to push {id}: {error}");
                    report.failed.push(SyncFailure {
                        tournament_id: id,
                        error: error.to_string(),
                    });
                }
            }
        }

        report.offline |= report.queue.offline;
        self.set_state(if report.offline {
            SyncState::Offline
        } else if report.failed.is_empty() && !report.queue.has_failures() {
            SyncState::Synced
        } else {
            SyncState::Error
        });
        tracing::info!(
            uploaded = report.uploaded,
            pushed = report.pushed,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Sync up finished"
        );
        Ok(report)
    }

    /// Push one cached tournament if it is ahead of (or missing from) the remote store
    async fn upload(&self, id: &TournamentId) -> Result<Upload> {
        let this = self;
        self.lock
            .with_lock(&tournament_lock_key(id), move || async move {
                let Some(cached) = this.local.get(id).await? else {
                    return Ok(Upload::Skipped);
                };
                let base_version = cached.tournament.version;

                let outcome = match this.remote_call(delta::push(&*this.remote, &cached)).await {
                    Ok(outcome) => outcome,
                    Err(error) if error.is_optimistic_lock() => return Ok(Upload::Skipped),
                    Err(error) => return Err(error),
                };

                let upload = match outcome {
                    PushOutcome::Created(_) => Upload::Uploaded,
                    PushOutcome::Pushed(_) => Upload::Pushed,
                    PushOutcome::InSync(version)
                        if !cached.dirty && version == base_version =>
                    {
                        return Ok(Upload::InSync);
                    }
                    PushOutcome::InSync(_) => Upload::InSync,
                };
                delivery::acknowledge(
                    &*this.local,
                    &*this.remote,
                    &this.pending,
                    id,
                    None,
                    (base_version, outcome.version()),
                )
                .await?;
                Ok(upload)
            })
            .await
    }

    /// Pull the remote copy, overwriting the cache only when it holds no unconfirmed edits
    pub async fn sync_down(&self, id: &TournamentId) -> SyncResult {
        let remote = match self.remote_call(self.remote.get(id)).await {
            Ok(remote) => remote,
            Err(error) => return self.degraded(id, error).await,
        };

        let this = self;
        let pulled = self
            .lock
            .with_lock(&tournament_lock_key(id), move || async move {
                let cached = this.local.get(id).await?;
                let pulled = match (cached, remote) {
                    (None, None) => Pulled::Missing,
                    (Some(cached), None) => Pulled::Current(cached.tournament),
                    (None, Some(remote)) => {
                        this.local.save(&CachedTournament::from_remote(remote.clone())).await?;
                        Pulled::Updated(remote)
                    }
                    (Some(cached), Some(remote)) => match delta::compare(&cached, &remote) {
                        Freshness::InSync => {
                            if cached.dirty || cached.tournament.version != remote.version {
                                this.local
                                    .save(&CachedTournament::from_remote(remote.clone()))
                                    .await?;
                            }
                            Pulled::Current(remote)
                        }
                        Freshness::LocalAhead => Pulled::Current(cached.tournament),
                        Freshness::RemoteAhead if !cached.dirty => {
                            this.local
                                .save(&CachedTournament::from_remote(remote.clone()))
                                .await?;
                            Pulled::Updated(remote)
                        }
                        Freshness::RemoteAhead | Freshness::Diverged => {
                            let conflicts = conflict::detect(&cached.tournament, &remote);
                            Pulled::Conflicted(cached.tournament, conflicts)
                        }
                    },
                };
                Ok(pulled)
            })
            .await;

        match pulled {
            Ok(Pulled::Missing) => {
                SyncResult::error(Error::NotFound(format!("tournament {id}")), None)
            }
            Ok(Pulled::Current(tournament)) => {
                self.clear_conflicts(id);
                SyncResult::synced(Some(tournament))
            }
            Ok(Pulled::Updated(tournament)) => {
                self.clear_conflicts(id);
                SyncResult::updated(tournament)
            }
            Ok(Pulled::Conflicted(tournament, conflicts)) => {
                tracing::warn!("{} conflicting fields on {id}", conflicts.len());
                locked(&self.conflicts).insert(*id, conflicts.clone());
                self.set_state(SyncState::Conflict);
                SyncResult::conflict(tournament, conflicts)
            }
            Err(error) => self.degraded(id, error).await,
        }
    }

    /// Push then pull one tournament
    pub async fn sync_tournament(&self, id: &TournamentId) -> SyncResult {
        if !self.monitor.is_online() {
            self.set_state(SyncState::Offline);
            return self.degraded(id, Error::offline()).await;
        }
        self.set_state(SyncState::Syncing);

        if let Err(error) = self.queue.process().await {
            tracing::warn!("Queue pass failed before syncing {id}: {error}");
        }
        if let Err(error) = self.upload(id).await {
            let result = self.degraded(id, error).await;
            self.settle(&result);
            return result;
        }

        let result = self.sync_down(id).await;
        self.settle(&result);
        result
    }

    /// Settle a reported conflict by pushing or adopting one side wholesale
    pub async fn resolve_conflict(&self, id: &TournamentId, resolution: Resolution) -> SyncResult {
        if !self.monitor.is_online() {
            return self.degraded(id, Error::offline()).await;
        }

        let resolved = match resolution {
            Resolution::Local => self.keep_local(id).await,
            Resolution::Remote => self.keep_remote(id).await,
        };
        let result = match resolved {
            Ok(result) => result,
            Err(error) => return self.degraded(id, error).await,
        };

        if let Err(error) = self
            .queue
            .discard_entity(EntityType::Tournament, &id.to_string())
            .await
        {
            tracing::warn!("Failed to drop superseded mutations for {id}: {error}");
        }
        self.clear_conflicts(id);
        tracing::info!("Resolved conflict on {id} keeping {resolution:?}");
        self.settle(&result);
        result
    }

    async fn keep_local(&self, id: &TournamentId) -> Result<SyncResult> {
        let this = self;
        self.lock
            .with_lock(&tournament_lock_key(id), move || async move {
                let mut cached = this
                    .local
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("tournament {id}")))?;

                let mut retried = false;
                let version = loop {
                    let pushed = match this.remote_call(this.remote.get(id)).await? {
                        None => this
                            .remote_call(this.remote.create(&cached.tournament))
                            .await
                            .map(|created| created.version),
                        Some(current) => {
                            this.remote_call(this.remote.replace(&cached.tournament, current.version))
                                .await
                        }
                    };
                    match pushed {
                        Ok(version) => break version,
                        Err(error) if error.is_optimistic_lock() && !retried => retried = true,
                        Err(error) => return Err(error),
                    }
                };

                cached.tournament.version = version;
                cached.dirty = false;
                cached.last_synced_at = Some(now_millis());
                this.local.save(&cached).await?;
                Ok(SyncResult::synced(Some(cached.tournament)))
            })
            .await
    }

    async fn keep_remote(&self, id: &TournamentId) -> Result<SyncResult> {
        let this = self;
        self.lock
            .with_lock(&tournament_lock_key(id), move || async move {
                match this.remote_call(this.remote.get(id)).await? {
                    Some(remote) => {
                        this.local
                            .save(&CachedTournament::from_remote(remote.clone()))
                            .await?;
                        Ok(SyncResult::updated(remote))
                    }
                    None => {
                        this.local.delete(id).await?;
                        Ok(SyncResult::synced(None))
                    }
                }
            })
            .await
    }

    /// Cached copy with the failure folded in
    async fn degraded(&self, id: &TournamentId, error: Error) -> SyncResult {
        let cached = self.cached_tournament(id).await.ok().flatten();
        if error.is_offline() {
            return SyncResult::offline(cached);
        }
        if !error.is_benign() {
            tracing::warn!("Sync of {id} failed: {error}");
        }
        SyncResult::error(error, cached)
    }

    /// Conflicts recorded by the last pull of `id`
    pub fn conflicts(&self, id: &TournamentId) -> Vec<SyncConflict> {
        locked(&self.conflicts).get(id).cloned().unwrap_or_default()
    }

    /// Tournaments with unresolved conflicts
    pub fn conflicted(&self) -> Vec<TournamentId> {
        locked(&self.conflicts).keys().copied().collect()
    }

    fn clear_conflicts(&self, id: &TournamentId) {
        let remaining = {
            let mut conflicts = locked(&self.conflicts);
            if conflicts.remove(id).is_none() {
                return;
            }
            conflicts.len()
        };
        if remaining == 0 && *self.state.borrow() == SyncState::Conflict {
            let next = if self.monitor.is_online() {
                SyncState::Synced
            } else {
                SyncState::Offline
            };
            self.state.send_replace(next);
        }
    }

    fn settle(&self, result: &SyncResult) {
        self.set_state(match result.status {
            SyncStatus::Synced | SyncStatus::Updated => SyncState::Synced,
            SyncStatus::Conflict => SyncState::Conflict,
            SyncStatus::Error => SyncState::Error,
            SyncStatus::Offline => SyncState::Offline,
        });
    }

    /// State after a queue pass: any retried or dead-lettered send is an error
    fn settle_queue(&self, report: &ProcessReport) {
        self.set_state(if report.offline {
            SyncState::Offline
        } else if report.has_failures() {
            SyncState::Error
        } else {
            SyncState::Synced
        });
    }

    /// Move the state machine; `Conflict` holds until every conflict is resolved
    fn set_state(&self, next: SyncState) {
        let next = if locked(&self.conflicts).is_empty() {
            next
        } else {
            SyncState::Conflict
        };
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!("Sync state {current:?} -> {next:?}");
                *current = next;
                true
            }
        });
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.queue.status().await
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<QueueStatus> {
        self.queue.subscribe()
    }

    pub async fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
        self.queue.entries().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
        self.queue.dead_letters().await
    }

    pub async fn retry_dead_letter(&self, id: &str) -> Result<()> {
        self.queue.retry_dead_letter(id).await?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn discard_mutation(&self, id: &str) -> Result<()> {
        self.queue.discard(id).await
    }
}

#[cfg(test)]
mod tests;
