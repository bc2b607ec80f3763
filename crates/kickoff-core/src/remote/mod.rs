//! Remote relational store (shared tier) and its optimistic-locking protocol

mod schema;
mod store;

use std::future::Future;

pub use schema::REMOTE_MIGRATIONS;
pub use store::LibSqlRemoteStore;

use crate::cache::LiveMatchMap;
use crate::error::Result;
use crate::models::{LiveMatch, MatchPatch, Tournament, TournamentChange, TournamentId};

/// Trait for the shared remote tier.
///
/// Every mutating call that takes a `base_version` only applies when the stored
/// version still equals it, and returns the new version (`base_version + 1`).
/// A miss is reported as `Error::NotFound` when the row is gone and as
/// `Error::OptimisticLock` when a concurrent writer advanced it.
pub trait RemoteStore: Send + Sync {
    fn get(&self, id: &TournamentId) -> impl Future<Output = Result<Option<Tournament>>> + Send;

    fn list_for_owner(&self, owner_id: &str) -> impl Future<Output = Result<Vec<Tournament>>> + Send;

    /// Public tournament by share code
    fn get_by_share_code(
        &self,
        share_code: &str,
    ) -> impl Future<Output = Result<Option<Tournament>>> + Send;

    /// Insert-if-absent with `version = 1`; returns the stored row either way
    fn create(&self, tournament: &Tournament) -> impl Future<Output = Result<Tournament>> + Send;

    /// Replace the whole aggregate
    fn replace(
        &self,
        tournament: &Tournament,
        base_version: i64,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Granular metadata update touching only the named fields
    fn update_tournament_fields(
        &self,
        id: &TournamentId,
        changes: &[TournamentChange],
        base_version: i64,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Granular match update touching only the named fields of each match
    fn update_matches(
        &self,
        id: &TournamentId,
        patches: &[MatchPatch],
        base_version: i64,
    ) -> impl Future<Output = Result<i64>> + Send;

    fn delete(&self, id: &TournamentId) -> impl Future<Output = Result<()>> + Send;

    fn live_matches(
        &self,
        tournament_id: &TournamentId,
    ) -> impl Future<Output = Result<LiveMatchMap>> + Send;

    /// Versioned live match write; `base_version == 0` creates the row
    fn save_live_match(
        &self,
        live: &LiveMatch,
        base_version: i64,
    ) -> impl Future<Output = Result<i64>> + Send;
}
