//! Sync conflict and sync result models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{MatchId, TournamentId};
use super::mutation::EntityType;
use super::tournament::Tournament;

/// A field that was changed independently on both tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncConflict {
    /// Conflicting value on one match (scores, status, referee)
    Match {
        tournament_id: TournamentId,
        match_id: MatchId,
        field: String,
        local_value: Value,
        remote_value: Value,
        local_timestamp: i64,
        remote_timestamp: i64,
    },
    /// Conflicting value on the aggregate itself (metadata or structure)
    General {
        entity_id: String,
        entity_type: EntityType,
        field: String,
        local_value: Value,
        remote_value: Value,
        local_timestamp: i64,
        remote_timestamp: i64,
    },
}

impl SyncConflict {
    pub fn field(&self) -> &str {
        match self {
            Self::Match { field, .. } | Self::General { field, .. } => field,
        }
    }

    pub const fn local_value(&self) -> &Value {
        match self {
            Self::Match { local_value, .. } | Self::General { local_value, .. } => local_value,
        }
    }

    pub const fn remote_value(&self) -> &Value {
        match self {
            Self::Match { remote_value, .. } | Self::General { remote_value, .. } => remote_value,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Self::Match { match_id, .. } => match_id.to_string(),
            Self::General { entity_id, .. } => entity_id.clone(),
        }
    }
}

/// Which side wins an explicit conflict resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Local,
    Remote,
}

/// Outcome of a per-entity sync step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Both tiers agree
    Synced,
    /// Local cache was refreshed from remote
    Updated,
    /// Both sides changed; nothing was overwritten
    Conflict,
    Error,
    Offline,
}

/// Result handed back to callers of the sync surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Tournament>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<SyncConflict>,
}

impl SyncResult {
    pub const fn synced(data: Option<Tournament>) -> Self {
        Self {
            status: SyncStatus::Synced,
            data,
            error: None,
            conflicts: Vec::new(),
        }
    }

    pub const fn updated(data: Tournament) -> Self {
        Self {
            status: SyncStatus::Updated,
            data: Some(data),
            error: None,
            conflicts: Vec::new(),
        }
    }

    pub const fn conflict(data: Tournament, conflicts: Vec<SyncConflict>) -> Self {
        Self {
            status: SyncStatus::Conflict,
            data: Some(data),
            error: None,
            conflicts,
        }
    }

    pub const fn offline(data: Option<Tournament>) -> Self {
        Self {
            status: SyncStatus::Offline,
            data,
            error: None,
            conflicts: Vec::new(),
        }
    }

    pub fn error(error: impl ToString, data: Option<Tournament>) -> Self {
        Self {
            status: SyncStatus::Error,
            data,
            error: Some(error.to_string()),
            conflicts: Vec::new(),
        }
    }
}

/// Sync state exposed to status indicators
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    #[default]
    Synced,
    Error,
    /// Sticky until every conflicted entity is resolved
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_variants_are_tagged() {
        let conflict = SyncConflict::Match {
            tournament_id: TournamentId::new(),
            match_id: MatchId::new(),
            field: "score_a".to_string(),
            local_value: json!(2),
            remote_value: json!(3),
            local_timestamp: 1,
            remote_timestamp: 2,
        };
        let value = serde_json::to_value(&conflict).unwrap();
        assert_eq!(value["type"], "match");
        assert_eq!(conflict.field(), "score_a");
        assert_eq!(conflict.local_value(), &json!(2));
        assert_eq!(conflict.remote_value(), &json!(3));
    }

    #[test]
    fn sync_result_omits_empty_fields() {
        let value = serde_json::to_value(SyncResult::synced(None)).unwrap();
        assert_eq!(value, json!({ "status": "synced" }));
    }
}
