//! Field-level conflict detection between a locally edited copy and a newer remote one

use serde::Serialize;
use serde_json::Value;

use super::delta::Fingerprints;
use crate::models::{EntityType, Match, SyncConflict, Tournament};

fn to_value<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

struct Scan<'a> {
    local: &'a Tournament,
    remote: &'a Tournament,
    conflicts: Vec<SyncConflict>,
}

impl Scan<'_> {
    fn general(&mut self, field: &str, local_value: Value, remote_value: Value) {
        if local_value == remote_value {
            return;
        }
        self.conflicts.push(SyncConflict::General {
            entity_id: self.local.id.to_string(),
            entity_type: EntityType::Tournament,
            field: field.to_string(),
            local_value,
            remote_value,
            local_timestamp: self.local.updated_at,
            remote_timestamp: self.remote.updated_at,
        });
    }

    fn match_field(&mut self, local: &Match, field: &str, local_value: Value, remote_value: Value) {
        if local_value == remote_value {
            return;
        }
        self.conflicts.push(SyncConflict::Match {
            tournament_id: self.local.id,
            match_id: local.id,
            field: field.to_string(),
            local_value,
            remote_value,
            local_timestamp: self.local.updated_at,
            remote_timestamp: self.remote.updated_at,
        });
    }
}

/// Every field where `local` and `remote` disagree.
///
/// Structural differences are reported per sub-collection; match-level
/// differences are reported per field for matches present on both sides.
pub fn detect(local: &Tournament, remote: &Tournament) -> Vec<SyncConflict> {
    let mut scan = Scan {
        local,
        remote,
        conflicts: Vec::new(),
    };

    scan.general("owner_id", to_value(&local.owner_id), to_value(&remote.owner_id));
    scan.general("title", to_value(&local.title), to_value(&remote.title));
    scan.general("date", to_value(&local.date), to_value(&remote.date));
    scan.general("status", to_value(&local.status), to_value(&remote.status));
    scan.general("location", to_value(&local.location), to_value(&remote.location));
    scan.general("is_public", to_value(&local.is_public), to_value(&remote.is_public));
    scan.general("share_code", to_value(&local.share_code), to_value(&remote.share_code));

    let local_prints = Fingerprints::of(local);
    for collection in local_prints.changed(&Fingerprints::of(remote)) {
        let (local_value, remote_value) = match collection {
            "teams" => (to_value(&local.teams), to_value(&remote.teams)),
            "groups" => (to_value(&local.groups), to_value(&remote.groups)),
            "fields" => (to_value(&local.fields), to_value(&remote.fields)),
            _ => (to_value(&local.matches), to_value(&remote.matches)),
        };
        scan.general(collection, local_value, remote_value);
    }

    for local_match in &local.matches {
        let Some(remote_match) = remote.find_match(&local_match.id) else {
            continue;
        };
        scan.match_field(
            local_match,
            "score_a",
            to_value(&local_match.score_a),
            to_value(&remote_match.score_a),
        );
        scan.match_field(
            local_match,
            "score_b",
            to_value(&local_match.score_b),
            to_value(&remote_match.score_b),
        );
        scan.match_field(
            local_match,
            "status",
            to_value(&local_match.status),
            to_value(&remote_match.status),
        );
        scan.match_field(
            local_match,
            "timer_started_at",
            to_value(&local_match.timer_started_at),
            to_value(&remote_match.timer_started_at),
        );
        scan.match_field(
            local_match,
            "elapsed_seconds",
            to_value(&local_match.elapsed_seconds),
            to_value(&remote_match.elapsed_seconds),
        );
        scan.match_field(
            local_match,
            "referee",
            to_value(&local_match.referee),
            to_value(&remote_match.referee),
        );
    }

    scan.conflicts
}
