//! Data models for Kickoff

mod conflict;
mod ids;
mod live_match;
mod mutation;
mod patch;
mod tournament;

pub use conflict::{Resolution, SyncConflict, SyncResult, SyncState, SyncStatus};
pub use ids::{MatchId, TeamId, TournamentId};
pub use live_match::{
    LiveMatch, MatchEvent, TiebreakerState, STALE_CEILING_SECONDS, STALE_GRACE_SECONDS,
};
pub use mutation::{EntityType, MutationPayload, MutationStatus, PendingMutation, QueueStatus};
pub use patch::{merge_match_patches, MatchChange, MatchPatch, TournamentChange};
pub use tournament::{
    CachedTournament, Field, Group, Match, MatchStatus, Team, Tournament, TournamentStatus,
};
