//! Tournament repository seam shared by the synced and the purely local backends

use std::future::Future;
use std::sync::Arc;

use crate::cache::LocalCache;
use crate::error::{Error, Result};
use crate::models::{CachedTournament, MatchPatch, Tournament, TournamentId};
use crate::remote::RemoteStore;
use crate::sync::SyncOrchestrator;
use crate::util::generate_share_code;

/// Trait for tournament storage operations
pub trait TournamentRepository: Send + Sync {
    fn get(&self, id: &TournamentId) -> impl Future<Output = Result<Option<Tournament>>> + Send;

    /// Store a tournament, returning the stored copy
    fn save(&self, tournament: &Tournament) -> impl Future<Output = Result<Tournament>> + Send;

    fn delete(&self, id: &TournamentId) -> impl Future<Output = Result<()>> + Send;

    fn update_match(
        &self,
        id: &TournamentId,
        patch: MatchPatch,
    ) -> impl Future<Output = Result<Tournament>> + Send;

    fn update_matches(
        &self,
        id: &TournamentId,
        patches: Vec<MatchPatch>,
        base_version: Option<i64>,
    ) -> impl Future<Output = Result<Tournament>> + Send;

    fn list_for_current_user(&self) -> impl Future<Output = Result<Vec<Tournament>>> + Send;

    /// Push pending local edits; a no-op for backends without a remote tier
    fn sync_up(&self) -> impl Future<Output = Result<()>> + Send;

    fn make_public(&self, id: &TournamentId) -> impl Future<Output = Result<Tournament>> + Send;

    fn make_private(&self, id: &TournamentId) -> impl Future<Output = Result<Tournament>> + Send;

    fn regenerate_share_code(
        &self,
        id: &TournamentId,
    ) -> impl Future<Output = Result<String>> + Send;
}

impl<L: LocalCache, R: RemoteStore> TournamentRepository for SyncOrchestrator<L, R> {
    async fn get(&self, id: &TournamentId) -> Result<Option<Tournament>> {
        Self::get(self, id).await
    }

    async fn save(&self, tournament: &Tournament) -> Result<Tournament> {
        Self::save(self, tournament).await
    }

    async fn delete(&self, id: &TournamentId) -> Result<()> {
        Self::delete(self, id).await
    }

    async fn update_match(&self, id: &TournamentId, patch: MatchPatch) -> Result<Tournament> {
        Self::update_match(self, id, patch).await
    }

    async fn update_matches(
        &self,
        id: &TournamentId,
        patches: Vec<MatchPatch>,
        base_version: Option<i64>,
    ) -> Result<Tournament> {
        Self::update_matches(self, id, patches, base_version).await
    }

    async fn list_for_current_user(&self) -> Result<Vec<Tournament>> {
        Self::list_for_current_user(self).await
    }

    async fn sync_up(&self) -> Result<()> {
        Self::sync_up(self).await.map(|_| ())
    }

    async fn make_public(&self, id: &TournamentId) -> Result<Tournament> {
        Self::make_public(self, id).await
    }

    async fn make_private(&self, id: &TournamentId) -> Result<Tournament> {
        Self::make_private(self, id).await
    }

    async fn regenerate_share_code(&self, id: &TournamentId) -> Result<String> {
        Self::regenerate_share_code(self, id).await
    }
}

/// Repository over the local cache alone, for installs with no remote store
pub struct LocalRepository<L> {
    cache: Arc<L>,
}

impl<L: LocalCache> LocalRepository<L> {
    pub const fn new(cache: Arc<L>) -> Self {
        Self { cache }
    }

    async fn edit(
        &self,
        id: &TournamentId,
        edit: impl FnOnce(&mut Tournament) -> Result<()> + Send,
    ) -> Result<Tournament> {
        let mut cached = self
            .cache
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tournament {id}")))?;
        edit(&mut cached.tournament)?;
        cached.tournament.touch();
        self.cache.save(&cached).await?;
        Ok(cached.tournament)
    }
}

impl<L: LocalCache> TournamentRepository for LocalRepository<L> {
    async fn get(&self, id: &TournamentId) -> Result<Option<Tournament>> {
        Ok(self.cache.get(id).await?.map(|cached| cached.tournament))
    }

    async fn save(&self, tournament: &Tournament) -> Result<Tournament> {
        if tournament.title.trim().is_empty() {
            return Err(Error::InvalidInput("tournament title is required".to_string()));
        }
        let mut stored = tournament.clone();
        stored.touch();
        // Nothing to confirm against, so rows are never dirty
        self.cache
            .save(&CachedTournament {
                tournament: stored.clone(),
                dirty: false,
                last_synced_at: None,
            })
            .await?;
        Ok(stored)
    }

    async fn delete(&self, id: &TournamentId) -> Result<()> {
        self.cache.delete(id).await
    }

    async fn update_match(&self, id: &TournamentId, patch: MatchPatch) -> Result<Tournament> {
        self.update_matches(id, vec![patch], None).await
    }

    async fn update_matches(
        &self,
        id: &TournamentId,
        patches: Vec<MatchPatch>,
        _base_version: Option<i64>,
    ) -> Result<Tournament> {
        self.edit(id, move |tournament| tournament.apply_match_patches(&patches))
            .await
    }

    async fn list_for_current_user(&self) -> Result<Vec<Tournament>> {
        let mut tournaments: Vec<_> = self
            .cache
            .list()
            .await?
            .into_iter()
            .map(|cached| cached.tournament)
            .collect();
        tournaments.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tournaments)
    }

    async fn sync_up(&self) -> Result<()> {
        Ok(())
    }

    async fn make_public(&self, id: &TournamentId) -> Result<Tournament> {
        self.edit(id, |tournament| {
            tournament.is_public = true;
            if tournament.share_code.is_none() {
                tournament.share_code = Some(generate_share_code());
            }
            Ok(())
        })
        .await
    }

    async fn make_private(&self, id: &TournamentId) -> Result<Tournament> {
        self.edit(id, |tournament| {
            tournament.is_public = false;
            Ok(())
        })
        .await
    }

    async fn regenerate_share_code(&self, id: &TournamentId) -> Result<String> {
        let code = generate_share_code();
        let stored = code.clone();
        self.edit(id, move |tournament| {
            tournament.share_code = Some(stored);
            Ok(())
        })
        .await?;
        Ok(code)
    }
}
