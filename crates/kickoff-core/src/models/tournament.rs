//! Tournament aggregate model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{MatchId, TeamId, TournamentId};
use super::patch::{MatchChange, MatchPatch, TournamentChange};
use crate::error::Error;
use crate::util::now_millis;

/// Lifecycle of a tournament
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentStatus {
    #[default]
    Draft,
    Published,
    InProgress,
    Finished,
}

/// Lifecycle of a match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Scheduled,
    Running,
    Paused,
    Finished,
    Skipped,
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable storage representation
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

string_enum!(TournamentStatus {
    Draft => "draft",
    Published => "published",
    InProgress => "in_progress",
    Finished => "finished",
});

string_enum!(MatchStatus {
    Scheduled => "scheduled",
    Running => "running",
    Paused => "paused",
    Finished => "finished",
    Skipped => "skipped",
});

/// A group of teams (e.g. "Group A")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
}

/// A playing field / pitch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub name: String,
}

/// A participating team
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl Team {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TeamId::new(),
            name: name.into(),
            group_id: None,
        }
    }
}

/// A scheduled game between two teams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub field_id: Option<String>,
    #[serde(default)]
    pub team_a: Option<TeamId>,
    #[serde(default)]
    pub team_b: Option<TeamId>,
    /// Kick-off time (Unix ms)
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    #[serde(default)]
    pub score_a: Option<u32>,
    #[serde(default)]
    pub score_b: Option<u32>,
    #[serde(default)]
    pub status: MatchStatus,
    /// When the running timer was last started (Unix ms)
    #[serde(default)]
    pub timer_started_at: Option<i64>,
    #[serde(default)]
    pub elapsed_seconds: u32,
    #[serde(default)]
    pub referee: Option<String>,
}

impl Match {
    /// Create a scheduled match between two teams
    #[must_use]
    pub fn new(team_a: TeamId, team_b: TeamId) -> Self {
        Self {
            id: MatchId::new(),
            round: 1,
            group_id: None,
            field_id: None,
            team_a: Some(team_a),
            team_b: Some(team_b),
            scheduled_at: None,
            score_a: None,
            score_b: None,
            status: MatchStatus::Scheduled,
            timer_started_at: None,
            elapsed_seconds: 0,
            referee: None,
        }
    }

    /// Apply a list of named-field changes
    pub fn apply(&mut self, changes: &[MatchChange]) {
        for change in changes {
            match change {
                MatchChange::ScoreA(value) => self.score_a = *value,
                MatchChange::ScoreB(value) => self.score_b = *value,
                MatchChange::Status(value) => self.status = *value,
                MatchChange::TimerStartedAt(value) => self.timer_started_at = *value,
                MatchChange::ElapsedSeconds(value) => self.elapsed_seconds = *value,
                MatchChange::Referee(value) => self.referee.clone_from(value),
            }
        }
    }
}

/// Tournament aggregate root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: TournamentId,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub title: String,
    /// Calendar date (ISO 8601, e.g. `2026-05-01`)
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub status: TournamentStatus,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub share_code: Option<String>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub matches: Vec<Match>,
    /// Last remote version this copy is based on (0 = never persisted remotely)
    #[serde(default)]
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Tournament {
    /// Create a new, never-synced tournament
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: TournamentId::new(),
            owner_id: None,
            title: title.into(),
            date: None,
            status: TournamentStatus::Draft,
            location: None,
            is_public: false,
            share_code: None,
            groups: Vec::new(),
            fields: Vec::new(),
            teams: Vec::new(),
            matches: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn find_match(&self, id: &MatchId) -> Option<&Match> {
        self.matches.iter().find(|m| &m.id == id)
    }

    pub fn find_match_mut(&mut self, id: &MatchId) -> Option<&mut Match> {
        self.matches.iter_mut().find(|m| &m.id == id)
    }

    /// Apply granular match patches; unknown match ids are rejected
    pub fn apply_match_patches(&mut self, patches: &[MatchPatch]) -> crate::Result<()> {
        for patch in patches {
            let Some(target) = self.find_match_mut(&patch.match_id) else {
                return Err(Error::NotFound(format!(
                    "match {} in tournament {}",
                    patch.match_id, self.id
                )));
            };
            target.apply(&patch.changes);
        }
        Ok(())
    }

    /// Apply granular metadata changes
    pub fn apply_changes(&mut self, changes: &[TournamentChange]) {
        for change in changes {
            match change {
                TournamentChange::Title(value) => self.title.clone_from(value),
                TournamentChange::Date(value) => self.date.clone_from(value),
                TournamentChange::Status(value) => self.status = *value,
                TournamentChange::Location(value) => self.location.clone_from(value),
                TournamentChange::Visibility {
                    is_public,
                    share_code,
                } => {
                    self.is_public = *is_public;
                    self.share_code.clone_from(share_code);
                }
            }
        }
    }

    /// Same content, ignoring the version and timestamps
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.owner_id == other.owner_id
            && self.title == other.title
            && self.date == other.date
            && self.status == other.status
            && self.location == other.location
            && self.is_public == other.is_public
            && self.share_code == other.share_code
            && self.groups == other.groups
            && self.fields == other.fields
            && self.teams == other.teams
            && self.matches == other.matches
    }

    /// Bump the modification timestamp, never moving it backwards
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }
}

/// Local cache row: a tournament snapshot plus sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTournament {
    pub tournament: Tournament,
    /// Local edits not yet confirmed by the remote store
    pub dirty: bool,
    /// Last time this row matched the remote copy (Unix ms)
    pub last_synced_at: Option<i64>,
}

impl CachedTournament {
    /// Wrap a locally edited tournament
    pub const fn local_edit(tournament: Tournament) -> Self {
        Self {
            tournament,
            dirty: true,
            last_synced_at: None,
        }
    }

    /// Wrap a copy fetched from the remote store
    pub fn from_remote(tournament: Tournament) -> Self {
        Self {
            tournament,
            dirty: false,
            last_synced_at: Some(now_millis()),
        }
    }
}
