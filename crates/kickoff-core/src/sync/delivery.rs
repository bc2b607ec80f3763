//! Sends queued mutations to the remote store and records the confirmed versions locally

use std::sync::Arc;

use super::delta;
use super::{live_lock_key, tournament_lock_key};
use crate::cache::LocalCache;
use crate::error::{Error, Result};
use crate::lock::{CrossContextLock, Lock};
use crate::models::{
    CachedTournament, EntityType, LiveMatch, MatchPatch, MutationPayload, PendingMutation,
    Tournament, TournamentId,
};
use crate::queue::{MutationSink, MutationStore};
use crate::remote::RemoteStore;

/// Record a successful push in the local cache. The caller holds the tournament lock.
///
/// With no other queued rows for the tournament, every local edit has reached the
/// remote store, so the remote copy (which may also carry other writers' edits) is
/// adopted. Otherwise only the base version moves forward and the row stays dirty.
pub(crate) async fn acknowledge<L: LocalCache, R: RemoteStore>(
    local: &L,
    remote: &R,
    pending: &MutationStore,
    id: &TournamentId,
    current: Option<&str>,
    versions: (i64, i64),
) -> Result<()> {
    let (base_version, new_version) = versions;
    let Some(mut cached) = local.get(id).await? else {
        return Ok(());
    };
    let Some(confirmed) = remote.get(id).await? else {
        return Ok(());
    };

    let outstanding = pending
        .for_entity(EntityType::Tournament, &id.to_string())
        .await?
        .iter()
        .any(|row| Some(row.id.as_str()) != current);
    if !outstanding || confirmed.same_content(&cached.tournament) {
        return local.save(&CachedTournament::from_remote(confirmed)).await;
    }
    if cached.tournament.version == base_version && new_version > base_version {
        cached.tournament.version = new_version;
        return local.save(&cached).await;
    }
    Ok(())
}

/// Queue sink that writes to the remote store
pub struct RemoteDelivery<L, R> {
    local: Arc<L>,
    remote: Arc<R>,
    lock: CrossContextLock,
    pending: MutationStore,
}

impl<L: LocalCache, R: RemoteStore> RemoteDelivery<L, R> {
    pub const fn new(
        local: Arc<L>,
        remote: Arc<R>,
        lock: CrossContextLock,
        pending: MutationStore,
    ) -> Self {
        Self {
            local,
            remote,
            lock,
            pending,
        }
    }

    /// Ack failures are logged: the remote write already happened, and the
    /// next sync reconciles the local bookkeeping.
    async fn acknowledge_locked(
        &self,
        mutation: &PendingMutation,
        id: &TournamentId,
        base_version: i64,
        new_version: i64,
    ) {
        let result = self
            .lock
            .with_lock(&tournament_lock_key(id), move || {
                acknowledge(
                    &*self.local,
                    &*self.remote,
                    &self.pending,
                    id,
                    Some(mutation.id.as_str()),
                    (base_version, new_version),
                )
            })
            .await;
        if let Err(error) = result {
            tracing::warn!("Failed to record remote version {new_version} for {id}: {error}");
        }
    }

    async fn save_tournament(&self, mutation: &PendingMutation, snapshot: &Tournament) -> Result<()> {
        let cached = match self.local.get(&snapshot.id).await? {
            Some(cached) if !cached.dirty => {
                tracing::debug!("{} already confirmed, nothing to send", snapshot.id);
                return Ok(());
            }
            Some(cached) => cached,
            None => CachedTournament::local_edit(snapshot.clone()),
        };

        let base_version = cached.tournament.version;
        let outcome = delta::push(&*self.remote, &cached).await?;
        self.acknowledge_locked(mutation, &snapshot.id, base_version, outcome.version())
            .await;
        Ok(())
    }

    async fn update_matches(
        &self,
        mutation: &PendingMutation,
        tournament_id: &TournamentId,
        updates: &[MatchPatch],
        base_version: Option<i64>,
    ) -> Result<()> {
        let rebase = base_version.is_none();
        let mut base = match base_version {
            Some(version) => version,
            None => self.remote_version(tournament_id).await?,
        };

        let mut retried = false;
        let new_version = loop {
            match self.remote.update_matches(tournament_id, updates, base).await {
                Ok(version) => break version,
                Err(Error::OptimisticLock { actual_version, .. }) if rebase && !retried => {
                    tracing::debug!("Rebasing match updates for {tournament_id} onto {actual_version}");
                    base = actual_version;
                    retried = true;
                }
                Err(error) => return Err(error),
            }
        };

        self.acknowledge_locked(mutation, tournament_id, base, new_version)
            .await;
        Ok(())
    }

    async fn remote_version(&self, tournament_id: &TournamentId) -> Result<i64> {
        self.remote
            .get(tournament_id)
            .await?
            .map(|tournament| tournament.version)
            .ok_or_else(|| Error::NotFound(format!("tournament {tournament_id}")))
    }

    /// Live matches are last-writer-wins: a version miss rebases once onto the stored version
    async fn save_live_match(&self, live: &LiveMatch) -> Result<()> {
        let mut base = self
            .remote
            .live_matches(&live.tournament_id)
            .await?
            .get(&live.match_id)
            .map_or(0, |stored| stored.version);
        if base != live.version {
            tracing::debug!(
                "Live match {} moved remotely ({} -> {base}); overwriting",
                live.key(),
                live.version
            );
        }

        let mut retried = false;
        let new_version = loop {
            match self.remote.save_live_match(live, base).await {
                Ok(version) => break version,
                Err(Error::OptimisticLock { actual_version, .. }) if !retried => {
                    base = actual_version;
                    retried = true;
                }
                Err(error) => return Err(error),
            }
        };

        let local = &self.local;
        let result = self
            .lock
            .with_lock(&live_lock_key(&live.tournament_id), move || async move {
                let mut map = local.live_matches(&live.tournament_id).await?;
                let Some(entry) = map.get_mut(&live.match_id) else {
                    return Ok(());
                };
                if entry.version >= new_version {
                    return Ok(());
                }
                entry.version = new_version;
                local.save_live_matches(&live.tournament_id, &map).await
            })
            .await;
        if let Err(error) = result {
            tracing::warn!("Failed to record live match version for {}: {error}", live.key());
        }
        Ok(())
    }

    async fn delete_tournament(&self, tournament_id: &TournamentId) -> Result<()> {
        match self.remote.delete(tournament_id).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => {
                tracing::debug!("Tournament {tournament_id} already gone remotely");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl<L: LocalCache, R: RemoteStore> MutationSink for RemoteDelivery<L, R> {
    async fn deliver(&self, mutation: &PendingMutation) -> Result<()> {
        match &mutation.payload {
            MutationPayload::SaveTournament { tournament } => {
                self.save_tournament(mutation, tournament).await
            }
            MutationPayload::UpdateMatches {
                tournament_id,
                updates,
                base_version,
            } => {
                self.update_matches(mutation, tournament_id, updates, *base_version)
                    .await
            }
            MutationPayload::DeleteTournament { tournament_id } => {
                self.delete_tournament(tournament_id).await
            }
            MutationPayload::SaveLiveMatch { live } => self.save_live_match(live).await,
        }
    }
}
