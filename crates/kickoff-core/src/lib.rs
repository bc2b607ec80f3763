//! kickoff-core - Core library for Kickoff
//!
//! This crate contains the tournament models, the on-device cache, the shared
//! remote store, the durable mutation queue, and the sync engine that keeps
//! them consistent for every Kickoff interface.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod sync;
pub mod util;

pub use cache::{LibSqlLocalCache, LocalCache};
pub use config::{RemoteConfig, SyncSettings};
pub use error::{Error, Result};
pub use lock::{CrossContextLock, Lock};
pub use models::{Tournament, TournamentId};
pub use network::NetworkMonitor;
pub use queue::MutationQueue;
pub use remote::{LibSqlRemoteStore, RemoteStore};
pub use repository::{LocalRepository, TournamentRepository};
pub use sync::{SyncOrchestrator, SyncReport};
