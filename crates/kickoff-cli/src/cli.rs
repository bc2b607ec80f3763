use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use kickoff_core::models::Resolution;

#[derive(Parser)]
#[command(name = "kickoff")]
#[command(about = "Inspect and drive Kickoff tournament sync from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional sync settings file (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Owner id used for new tournaments and list filtering
    #[arg(long, global = true, value_name = "ID")]
    pub user: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show connectivity, sync state and queue counts
    Status,
    /// List tournaments visible to the current user
    List,
    /// Drain the mutation queue and push every cached tournament
    Sync,
    /// Push then pull one tournament
    Pull {
        /// Tournament ID
        id: String,
    },
    /// Show fields changed on both sides of one tournament
    Conflicts {
        /// Tournament ID
        id: String,
    },
    /// Settle a conflict by keeping one side
    Resolve {
        /// Tournament ID
        id: String,
        /// Side that wins
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
    /// List mutations that exhausted their retries
    DeadLetters,
    /// Requeue a dead-lettered mutation
    Retry {
        /// Mutation ID
        id: String,
    },
    /// Drop a queued or dead-lettered mutation
    Discard {
        /// Mutation ID
        id: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
}

impl From<KeepSide> for Resolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Self::Local,
            KeepSide::Remote => Self::Remote,
        }
    }
}
