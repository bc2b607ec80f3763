use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] kickoff_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Tournament ID cannot be empty")]
    EmptyTournamentId,
    #[error("Invalid tournament ID: {0}")]
    InvalidTournamentId(String),
    #[error("Mutation ID cannot be empty")]
    EmptyMutationId,
    #[error("Sync failed: {0}")]
    SyncFailed(String),
    #[error(
        "Sync is not configured. Set KICKOFF_REMOTE_URL and KICKOFF_REMOTE_TOKEN, or KICKOFF_REMOTE_URL=file:/path/to/remote.db."
    )]
    SyncNotConfigured,
}
