//! Granular (named-field) updates

use serde::{Deserialize, Serialize};

use super::ids::MatchId;
use super::tournament::{MatchStatus, TournamentStatus};

/// A single named-field change to a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum MatchChange {
    ScoreA(Option<u32>),
    ScoreB(Option<u32>),
    Status(MatchStatus),
    TimerStartedAt(Option<i64>),
    ElapsedSeconds(u32),
    Referee(Option<String>),
}

impl MatchChange {
    /// Field name, used as the coalescing key and in conflict reports
    pub const fn field(&self) -> &'static str {
        match self {
            Self::ScoreA(_) => "score_a",
            Self::ScoreB(_) => "score_b",
            Self::Status(_) => "status",
            Self::TimerStartedAt(_) => "timer_started_at",
            Self::ElapsedSeconds(_) => "elapsed_seconds",
            Self::Referee(_) => "referee",
        }
    }
}

/// Changes to one match, applied atomically
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPatch {
    pub match_id: MatchId,
    pub changes: Vec<MatchChange>,
}

impl MatchPatch {
    pub const fn new(match_id: MatchId) -> Self {
        Self {
            match_id,
            changes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, change: MatchChange) -> Self {
        self.set(change);
        self
    }

    /// Record a change, replacing an earlier change to the same field
    pub fn set(&mut self, change: MatchChange) {
        if let Some(existing) = self
            .changes
            .iter_mut()
            .find(|existing| existing.field() == change.field())
        {
            *existing = change;
        } else {
            self.changes.push(change);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Merge `newer` patches into `older`, later field values winning
pub fn merge_match_patches(older: &mut Vec<MatchPatch>, newer: Vec<MatchPatch>) {
    for patch in newer {
        if let Some(existing) = older.iter_mut().find(|p| p.match_id == patch.match_id) {
            for change in patch.changes {
                existing.set(change);
            }
        } else {
            older.push(patch);
        }
    }
}

/// A single named-field change to tournament metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum TournamentChange {
    Title(String),
    Date(Option<String>),
    Status(TournamentStatus),
    Location(Option<String>),
    Visibility {
        is_public: bool,
        share_code: Option<String>,
    },
}

impl TournamentChange {
    pub const fn field(&self) -> &'static str {
        match self {
            Self::Title(_) => "title",
            Self::Date(_) => "date",
            Self::Status(_) => "status",
            Self::Location(_) => "location",
            Self::Visibility { .. } => "visibility",
        }
    }
}
