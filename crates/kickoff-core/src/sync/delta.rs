//! Deciding which side is ahead, and pushing local edits as the smallest safe write

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::models::{
    CachedTournament, Match, MatchChange, MatchPatch, Tournament, TournamentChange,
};
use crate::remote::RemoteStore;

/// Which tier holds the newer copy of a tournament
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    InSync,
    LocalAhead,
    RemoteAhead,
    /// Both sides hold edits and share no base version
    Diverged,
}

/// Compare the cached copy against the remote row.
///
/// Versions decide. A dirty copy that shares no version with the remote row
/// cannot be ordered by clocks, so it is reported as diverged.
pub fn compare(cached: &CachedTournament, remote: &Tournament) -> Freshness {
    let local = &cached.tournament;
    if local.same_content(remote) {
        return Freshness::InSync;
    }
    if !cached.dirty {
        return Freshness::RemoteAhead;
    }
    if local.version == 0 || remote.version == 0 {
        return Freshness::Diverged;
    }

    if remote.version > local.version {
        Freshness::RemoteAhead
    } else {
        Freshness::LocalAhead
    }
}

fn fingerprint<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Layout fields of a match; changing any of them reshapes the schedule
fn slot_fingerprint(matches: &[Match]) -> u64 {
    let slots: Vec<_> = matches
        .iter()
        .map(|m| {
            (
                m.id,
                m.round,
                m.group_id.as_deref(),
                m.field_id.as_deref(),
                m.team_a,
                m.team_b,
                m.scheduled_at,
            )
        })
        .collect();
    fingerprint(&slots)
}

/// Content hashes of the structural sub-collections of a tournament
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprints {
    pub teams: u64,
    pub groups: u64,
    pub fields: u64,
    pub match_slots: u64,
}

impl Fingerprints {
    pub fn of(tournament: &Tournament) -> Self {
        Self {
            teams: fingerprint(&tournament.teams),
            groups: fingerprint(&tournament.groups),
            fields: fingerprint(&tournament.fields),
            match_slots: slot_fingerprint(&tournament.matches),
        }
    }

    /// Names of the sub-collections that differ
    pub fn changed(&self, other: &Self) -> Vec<&'static str> {
        [
            ("teams", self.teams == other.teams),
            ("groups", self.groups == other.groups),
            ("fields", self.fields == other.fields),
            ("matches", self.match_slots == other.match_slots),
        ]
        .into_iter()
        .filter_map(|(name, same)| (!same).then_some(name))
        .collect()
    }
}

/// How a local copy reaches the remote one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaPlan {
    Nothing,
    /// Membership or layout changed: replace the whole aggregate
    Replace,
    Granular {
        changes: Vec<TournamentChange>,
        patches: Vec<MatchPatch>,
    },
}

/// Plan the writes that turn `remote` into `local`
pub fn plan(remote: &Tournament, local: &Tournament) -> DeltaPlan {
    if local.same_content(remote) {
        return DeltaPlan::Nothing;
    }
    if local.owner_id != remote.owner_id
        || !Fingerprints::of(local).changed(&Fingerprints::of(remote)).is_empty()
    {
        return DeltaPlan::Replace;
    }

    DeltaPlan::Granular {
        changes: metadata_changes(remote, local),
        patches: match_patches(remote, local),
    }
}

/// Metadata fields that differ, as named-field changes
pub fn metadata_changes(remote: &Tournament, local: &Tournament) -> Vec<TournamentChange> {
    let mut changes = Vec::new();
    if local.title != remote.title {
        changes.push(TournamentChange::Title(local.title.clone()));
    }
    if local.date != remote.date {
        changes.push(TournamentChange::Date(local.date.clone()));
    }
    if local.status != remote.status {
        changes.push(TournamentChange::Status(local.status));
    }
    if local.location != remote.location {
        changes.push(TournamentChange::Location(local.location.clone()));
    }
    if local.is_public != remote.is_public || local.share_code != remote.share_code {
        changes.push(TournamentChange::Visibility {
            is_public: local.is_public,
            share_code: local.share_code.clone(),
        });
    }
    changes
}

/// Named-field changes of one match
pub fn match_changes(remote: &Match, local: &Match) -> Vec<MatchChange> {
    let mut changes = Vec::new();
    if local.score_a != remote.score_a {
        changes.push(MatchChange::ScoreA(local.score_a));
    }
    if local.score_b != remote.score_b {
        changes.push(MatchChange::ScoreB(local.score_b));
    }
    if local.status != remote.status {
        changes.push(MatchChange::Status(local.status));
    }
    if local.timer_started_at != remote.timer_started_at {
        changes.push(MatchChange::TimerStartedAt(local.timer_started_at));
    }
    if local.elapsed_seconds != remote.elapsed_seconds {
        changes.push(MatchChange::ElapsedSeconds(local.elapsed_seconds));
    }
    if local.referee != remote.referee {
        changes.push(MatchChange::Referee(local.referee.clone()));
    }
    changes
}

/// Per-match patches for matches present on both sides
pub fn match_patches(remote: &Tournament, local: &Tournament) -> Vec<MatchPatch> {
    local
        .matches
        .iter()
        .filter_map(|local_match| {
            let remote_match = remote.find_match(&local_match.id)?;
            let changes = match_changes(remote_match, local_match);
            (!changes.is_empty()).then(|| MatchPatch {
                match_id: local_match.id,
                changes,
            })
        })
        .collect()
}

/// Push `local` onto `current`, returning the resulting remote version.
///
/// Every step is conditional on the version returned by the previous one.
pub async fn push_delta<R: RemoteStore>(
    remote: &R,
    local: &Tournament,
    current: &Tournament,
) -> Result<i64> {
    match plan(current, local) {
        DeltaPlan::Nothing => Ok(current.version),
        DeltaPlan::Replace => {
            tracing::debug!("Structural change to {}, replacing aggregate", local.id);
            remote.replace(local, current.version).await
        }
        DeltaPlan::Granular { changes, patches } => {
            let mut version = current.version;
            if !changes.is_empty() {
                version = remote
                    .update_tournament_fields(&local.id, &changes, version)
                    .await?;
            }
            if !patches.is_empty() {
                version = remote.update_matches(&local.id, &patches, version).await?;
            }
            tracing::debug!(
                "Pushed {} field and {} match changes for {}",
                changes.len(),
                patches.len(),
                local.id
            );
            Ok(version)
        }
    }
}

/// Result of pushing a cached tournament
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote row did not exist and was created
    Created(i64),
    /// Local edits were written
    Pushed(i64),
    /// Remote already matched
    InSync(i64),
}

impl PushOutcome {
    pub const fn version(self) -> i64 {
        match self {
            Self::Created(version) | Self::Pushed(version) | Self::InSync(version) => version,
        }
    }
}

/// Bring the remote row up to the cached copy.
///
/// Fails with `OptimisticLock` when the remote is ahead or diverged; those edits belong to a pull.
pub async fn push<R: RemoteStore>(remote: &R, cached: &CachedTournament) -> Result<PushOutcome> {
    let local = &cached.tournament;
    let Some(current) = remote.get(&local.id).await? else {
        let created = remote.create(local).await?;
        return Ok(PushOutcome::Created(created.version));
    };

    match compare(cached, &current) {
        Freshness::InSync => Ok(PushOutcome::InSync(current.version)),
        Freshness::LocalAhead => push_delta(remote, local, &current)
            .await
            .map(PushOutcome::Pushed),
        Freshness::RemoteAhead | Freshness::Diverged => Err(Error::OptimisticLock {
            entity_id: local.id.to_string(),
            expected_version: local.version,
            actual_version: current.version,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Group, MatchStatus, Team};
    use crate::network::NetworkMonitor;
    use crate::remote::LibSqlRemoteStore;
    use pretty_assertions::assert_eq;

    fn sample() -> Tournament {
        let mut tournament = Tournament::new("Spring Cup");
        let home = Team::new("Lions");
        let away = Team::new("Tigers");
        tournament.matches.push(Match::new(home.id, away.id));
        tournament.teams.extend([home, away]);
        tournament.version = 4;
        tournament
    }

    fn dirty(tournament: Tournament) -> CachedTournament {
        CachedTournament::local_edit(tournament)
    }

    #[test]
    fn test_title_change_is_granular() {
        let remote = sample();
        let mut local = remote.clone();
        local.title = "Summer Cup".to_string();

        assert_eq!(
            plan(&remote, &local),
            DeltaPlan::Granular {
                changes: vec![TournamentChange::Title("Summer Cup".to_string())],
                patches: Vec::new(),
            }
        );
    }

    #[test]
    fn test_score_change_is_granular_patch() {
        let remote = sample();
        let mut local = remote.clone();
        local.matches[0].score_a = Some(2);
        local.matches[0].status = MatchStatus::Running;

        let DeltaPlan::Granular { changes, patches } = plan(&remote, &local) else {
            panic!("expected granular plan");
        };
        assert!(changes.is_empty());
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].changes,
            vec![
                MatchChange::ScoreA(Some(2)),
                MatchChange::Status(MatchStatus::Running)
            ]
        );
    }

    #[test]
    fn test_membership_and_layout_changes_are_structural() {
        let remote = sample();

        let mut added_team = remote.clone();
        added_team.teams.push(Team::new("Bears"));
        assert_eq!(plan(&remote, &added_team), DeltaPlan::Replace);

        let mut new_group = remote.clone();
        new_group.groups.push(Group {
            id: "a".to_string(),
            name: "Group A".to_string(),
        });
        assert_eq!(plan(&remote, &new_group), DeltaPlan::Replace);

        let mut moved_match = remote.clone();
        moved_match.matches[0].field_id = Some("pitch-2".to_string());
        assert_eq!(plan(&remote, &moved_match), DeltaPlan::Replace);
    }

    #[test]
    fn test_compare_uses_versions_and_dirty_flag() {
        let remote = sample();
        let mut local = remote.clone();
        local.title = "Edited".to_string();

        assert_eq!(compare(&dirty(local.clone()), &remote), Freshness::LocalAhead);

        let mut newer_remote = remote.clone();
        newer_remote.version = 5;
        assert_eq!(
            compare(&dirty(local.clone()), &newer_remote),
            Freshness::RemoteAhead
        );
        assert_eq!(
            compare(&CachedTournament::from_remote(local), &remote),
            Freshness::RemoteAhead
        );
    }

    #[test]
    fn test_unversioned_edit_diverges_regardless_of_clock() {
        let remote = sample();
        let mut local = remote.clone();
        local.version = 0;
        local.matches[0].score_a = Some(2);
        local.updated_at = remote.updated_at + 60_000;

        assert_eq!(compare(&dirty(local.clone()), &remote), Freshness::Diverged);
        assert_eq!(
            compare(&CachedTournament::from_remote(local.clone()), &remote),
            Freshness::RemoteAhead
        );

        let mut unversioned_remote = remote;
        unversioned_remote.version = 0;
        local.version = 4;
        assert_eq!(
            compare(&dirty(local), &unversioned_remote),
            Freshness::Diverged
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_refuses_unversioned_copy_of_existing_row() {
        let store = LibSqlRemoteStore::open_in_memory(NetworkMonitor::online())
            .await
            .unwrap();
        let mut tournament = sample();
        tournament.matches[0].score_a = Some(3);
        store.create(&tournament).await.unwrap();

        let mut local = tournament.clone();
        local.version = 0;
        local.matches[0].score_a = Some(2);
        local.updated_at += 60_000;
        let error = push(&store, &dirty(local)).await.unwrap_err();
        assert!(error.is_optimistic_lock());

        let stored = store.get(&tournament.id).await.unwrap().unwrap();
        assert_eq!(stored.matches[0].score_a, Some(3));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_granular_steps_chain_versions() {
        let store = LibSqlRemoteStore::open_in_memory(NetworkMonitor::online())
            .await
            .unwrap();
        let mut base = sample();
        let created = store.create(&base).await.unwrap();
        base.version = created.version;

        let mut local = base.clone();
        local.title = "Summer Cup".to_string();
        local.matches[0].score_b = Some(1);

        let version = push_delta(&store, &local, &created).await.unwrap();
        // Metadata step then match step, each bumping once
        assert_eq!(version, 3);

        let stored = store.get(&local.id).await.unwrap().unwrap();
        assert!(stored.same_content(&local));
        assert_eq!(stored.version, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_refuses_when_remote_ahead() {
        let store = LibSqlRemoteStore::open_in_memory(NetworkMonitor::online())
            .await
            .unwrap();
        let mut local = sample();
        let created = store.create(&local).await.unwrap();
        store.replace(&created, 1).await.unwrap();

        local.version = 1;
        local.title = "Local edit".to_string();
        let error = push(&store, &dirty(local)).await.unwrap_err();
        assert!(error.is_optimistic_lock());
    }
}
