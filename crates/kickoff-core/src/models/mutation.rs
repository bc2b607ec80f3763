//! Queued remote mutations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::TournamentId;
use super::live_match::LiveMatch;
use super::patch::{merge_match_patches, MatchPatch};
use super::tournament::Tournament;
use crate::error::Error;

/// Kind of entity a mutation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Tournament,
    LiveMatch,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tournament => "tournament",
            Self::LiveMatch => "live_match",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tournament" => Ok(Self::Tournament),
            "live_match" => Ok(Self::LiveMatch),
            other => Err(Error::InvalidInput(format!("unknown entity type '{other}'"))),
        }
    }
}

/// What a mutation does once it reaches the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationPayload {
    /// Push the local aggregate (delta or full replace, decided at send time)
    SaveTournament { tournament: Tournament },
    /// Granular match updates
    UpdateMatches {
        tournament_id: TournamentId,
        updates: Vec<MatchPatch>,
        /// Explicit base version; `None` rebases onto the current remote version
        #[serde(default)]
        base_version: Option<i64>,
    },
    DeleteTournament { tournament_id: TournamentId },
    SaveLiveMatch { live: LiveMatch },
}

impl MutationPayload {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SaveTournament { .. } => "save_tournament",
            Self::UpdateMatches { .. } => "update_matches",
            Self::DeleteTournament { .. } => "delete_tournament",
            Self::SaveLiveMatch { .. } => "save_live_match",
        }
    }

    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::SaveLiveMatch { .. } => EntityType::LiveMatch,
            _ => EntityType::Tournament,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Self::SaveTournament { tournament } => tournament.id.to_string(),
            Self::UpdateMatches { tournament_id, .. }
            | Self::DeleteTournament { tournament_id } => tournament_id.to_string(),
            Self::SaveLiveMatch { live } => live.key(),
        }
    }

    /// Fold a newer payload for the same entity into this one.
    ///
    /// Returns `None` when the two cannot be combined and must be sent in order.
    pub fn coalesce(self, newer: Self) -> Option<Self> {
        match (self, newer) {
            (_, newer @ (Self::DeleteTournament { .. } | Self::SaveTournament { .. })) => {
                Some(newer)
            }
            (Self::SaveLiveMatch { .. }, newer @ Self::SaveLiveMatch { .. }) => Some(newer),
            (
                Self::UpdateMatches {
                    tournament_id,
                    mut updates,
                    base_version,
                },
                Self::UpdateMatches {
                    updates: newer_updates,
                    base_version: newer_base,
                    ..
                },
            ) if base_version == newer_base || newer_base.is_none() => {
                merge_match_patches(&mut updates, newer_updates);
                Some(Self::UpdateMatches {
                    tournament_id,
                    updates,
                    base_version,
                })
            }
            (
                Self::SaveTournament { mut tournament },
                Self::UpdateMatches {
                    updates,
                    base_version: None,
                    ..
                },
            ) => {
                tournament.apply_match_patches(&updates).ok()?;
                Some(Self::SaveTournament { tournament })
            }
            _ => None,
        }
    }
}

/// Lifecycle state of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Processing,
    /// Retries exhausted; excluded from automatic processing
    Dead,
}

impl MutationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Dead => "dead",
        }
    }
}

impl FromStr for MutationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "dead" => Ok(Self::Dead),
            other => Err(Error::InvalidInput(format!(
                "unknown mutation status '{other}'"
            ))),
        }
    }
}

/// A durable queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: String,
    pub payload: MutationPayload,
    pub enqueued_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: MutationStatus,
    pub next_attempt_at: i64,
}

impl PendingMutation {
    pub const fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub const fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    pub fn entity_id(&self) -> String {
        self.payload.entity_id()
    }
}

/// Aggregate counters exposed to UI indicators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub failed_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchChange, MatchId};

    #[test]
    fn delete_supersedes_pending_save() {
        let tournament = Tournament::new("Cup");
        let id = tournament.id;
        let merged = MutationPayload::SaveTournament { tournament }
            .coalesce(MutationPayload::DeleteTournament { tournament_id: id })
            .unwrap();
        assert_eq!(merged, MutationPayload::DeleteTournament { tournament_id: id });
    }

    #[test]
    fn match_updates_merge_field_wise() {
        let tournament_id = TournamentId::new();
        let match_id = MatchId::new();
        let merged = MutationPayload::UpdateMatches {
            tournament_id,
            updates: vec![MatchPatch::new(match_id).with(MatchChange::ScoreA(Some(1)))],
            base_version: None,
        }
        .coalesce(MutationPayload::UpdateMatches {
            tournament_id,
            updates: vec![MatchPatch::new(match_id)
                .with(MatchChange::ScoreA(Some(2)))
                .with(MatchChange::ScoreB(Some(1)))],
            base_version: None,
        })
        .unwrap();

        let MutationPayload::UpdateMatches { updates, .. } = merged else {
            panic!("expected update_matches");
        };
        assert_eq!(
            updates[0].changes,
            vec![MatchChange::ScoreA(Some(2)), MatchChange::ScoreB(Some(1))]
        );
    }

    #[test]
    fn explicit_base_versions_do_not_merge_across_versions() {
        let tournament_id = TournamentId::new();
        let older = MutationPayload::UpdateMatches {
            tournament_id,
            updates: Vec::new(),
            base_version: Some(3),
        };
        let newer = MutationPayload::UpdateMatches {
            tournament_id,
            updates: Vec::new(),
            base_version: Some(4),
        };
        assert!(older.coalesce(newer).is_none());
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = MutationPayload::DeleteTournament {
            tournament_id: TournamentId::new(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "delete_tournament");
        assert_eq!(payload.entity_type(), EntityType::Tournament);
    }
}
