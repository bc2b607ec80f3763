//! Bounded cleanup used when the local cache runs out of space

use crate::models::{MatchId, TournamentId};

/// A finished live match considered for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedEntry {
    pub tournament_id: TournamentId,
    pub match_id: MatchId,
    pub updated_at: i64,
}

/// Pick finished matches to drop: everything beyond the `keep` newest that
/// is also older than `cutoff_ms`.
pub fn select_evictions(
    mut finished: Vec<FinishedEntry>,
    keep: usize,
    cutoff_ms: i64,
) -> Vec<FinishedEntry> {
    finished.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    finished
        .into_iter()
        .skip(keep)
        .filter(|entry| entry.updated_at < cutoff_ms)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(updated_at: i64) -> FinishedEntry {
        FinishedEntry {
            tournament_id: TournamentId::new(),
            match_id: MatchId::new(),
            updated_at,
        }
    }

    #[test]
    fn keeps_newest_entries_regardless_of_age() {
        let evicted = select_evictions(vec![entry(1), entry(2), entry(3)], 3, 100);
        assert!(evicted.is_empty());
    }

    #[test]
    fn evicts_old_entries_beyond_keep_count() {
        let entries = vec![entry(10), entry(50), entry(200), entry(300)];
        let evicted = select_evictions(entries, 1, 100);
        let stamps: Vec<i64> = evicted.iter().map(|e| e.updated_at).collect();
        assert_eq!(stamps, vec![50, 10]);
    }

    #[test]
    fn recent_entries_survive_even_beyond_keep_count() {
        let evicted = select_evictions(vec![entry(500), entry(400)], 0, 100);
        assert!(evicted.is_empty());
    }
}
