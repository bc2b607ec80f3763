//! Live match projection (high-frequency state while a game is in progress)

use serde::{Deserialize, Serialize};

use super::ids::{MatchId, TeamId, TournamentId};
use super::tournament::MatchStatus;
use crate::util::now_millis;

/// Grace period after the regular duration before a running timer counts as abandoned.
pub const STALE_GRACE_SECONDS: u32 = 5 * 60;
/// Absolute ceiling after which a running timer counts as abandoned.
pub const STALE_CEILING_SECONDS: u32 = 30 * 60;

/// An entry in the match event log (goal, card, substitution, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub team: Option<TeamId>,
    #[serde(default)]
    pub minute: u32,
    pub recorded_at: i64,
}

/// Tiebreaker state (penalty shoot-out, extra time)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiebreakerState {
    pub mode: String,
    #[serde(default)]
    pub score_a: u32,
    #[serde(default)]
    pub score_b: u32,
}

/// Live state of one match, versioned independently of its tournament
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMatch {
    pub tournament_id: TournamentId,
    pub match_id: MatchId,
    pub status: MatchStatus,
    pub duration_seconds: u32,
    /// Seconds accumulated before the current timer run
    #[serde(default)]
    pub elapsed_seconds: u32,
    /// Start of the current timer run (Unix ms)
    #[serde(default)]
    pub timer_started_at: Option<i64>,
    #[serde(default)]
    pub paused_at: Option<i64>,
    #[serde(default)]
    pub score_a: u32,
    #[serde(default)]
    pub score_b: u32,
    #[serde(default)]
    pub events: Vec<MatchEvent>,
    #[serde(default)]
    pub tiebreaker: Option<TiebreakerState>,
    #[serde(default)]
    pub version: i64,
    pub updated_at: i64,
}

impl LiveMatch {
    #[must_use]
    pub fn new(tournament_id: TournamentId, match_id: MatchId, duration_seconds: u32) -> Self {
        Self {
            tournament_id,
            match_id,
            status: MatchStatus::Scheduled,
            duration_seconds,
            elapsed_seconds: 0,
            timer_started_at: None,
            paused_at: None,
            score_a: 0,
            score_b: 0,
            events: Vec::new(),
            tiebreaker: None,
            version: 0,
            updated_at: now_millis(),
        }
    }

    /// Composite key used by the queue and lock table
    pub fn key(&self) -> String {
        format!("{}/{}", self.tournament_id, self.match_id)
    }

    /// Elapsed seconds including the current timer run
    pub fn elapsed_at(&self, now_ms: i64) -> u32 {
        let running = self.timer_started_at.map_or(0, |started| {
            let seconds = (now_ms - started).max(0) / 1000;
            u32::try_from(seconds).unwrap_or(u32::MAX)
        });
        self.elapsed_seconds.saturating_add(running)
    }

    /// Threshold after which a running timer is considered abandoned
    pub fn stale_after_seconds(&self) -> u32 {
        self.duration_seconds
            .saturating_add(STALE_GRACE_SECONDS)
            .min(STALE_CEILING_SECONDS)
    }

    /// Pause a timer left running by a terminated process.
    ///
    /// Returns `true` when the match was rewritten.
    pub fn repair_if_stale(&mut self, now_ms: i64) -> bool {
        if self.status != MatchStatus::Running || self.timer_started_at.is_none() {
            return false;
        }

        let elapsed = self.elapsed_at(now_ms);
        if elapsed <= self.stale_after_seconds() {
            return false;
        }

        self.status = MatchStatus::Paused;
        self.elapsed_seconds = elapsed.min(self.duration_seconds);
        self.timer_started_at = None;
        self.paused_at = Some(now_ms);
        self.updated_at = now_ms.max(self.updated_at);
        true
    }
}
