use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::cache::LibSqlLocalCache;
use crate::db::Database;
use crate::lock::ProcessLock;
use crate::models::{Match, MatchChange, MatchStatus, Team};
use crate::remote::LibSqlRemoteStore;

type Orchestrator = SyncOrchestrator<LibSqlLocalCache, LibSqlRemoteStore>;

struct Harness {
    orchestrator: Orchestrator,
    remote: Arc<LibSqlRemoteStore>,
    monitor: NetworkMonitor,
}

async fn device(remote: Arc<LibSqlRemoteStore>, monitor: NetworkMonitor) -> Orchestrator {
    let db = Database::open_in_memory().await.unwrap().into_shared();
    let settings = SyncSettings {
        sync_interval_secs: None,
        ..SyncSettings::default()
    };
    let local = Arc::new(LibSqlLocalCache::new(db.clone(), &settings));
    SyncOrchestrator::new(
        local,
        remote,
        db,
        CrossContextLock::Process(ProcessLock::new()),
        monitor,
        settings,
    )
    .await
    .unwrap()
    .with_current_user("owner-1")
}

async fn harness() -> Harness {
    let monitor = NetworkMonitor::online();
    let remote = Arc::new(
        LibSqlRemoteStore::open_in_memory(monitor.clone())
            .await
            .unwrap(),
    );
    Harness {
        orchestrator: device(Arc::clone(&remote), monitor.clone()).await,
        remote,
        monitor,
    }
}

fn sample() -> Tournament {
    let mut tournament = Tournament::new("Spring Cup");
    let home = Team::new("Lions");
    let away = Team::new("Tigers");
    tournament.matches.push(Match::new(home.id, away.id));
    tournament.teams.extend([home, away]);
    tournament
}

/// Save and push, returning the confirmed copy
async fn synced(h: &Harness, tournament: &Tournament) -> Tournament {
    let saved = h.orchestrator.save(tournament).await.unwrap();
    h.orchestrator.sync_up().await.unwrap();
    h.orchestrator.local().get(&saved.id).await.unwrap().unwrap().tournament
}

/// A write by some other device, straight to the remote store
async fn remote_edit(
    remote: &LibSqlRemoteStore,
    id: &TournamentId,
    edit: impl FnOnce(&mut Tournament),
) -> Tournament {
    let mut current = remote.get(id).await.unwrap().unwrap();
    edit(&mut current);
    current.version = remote.replace(&current, current.version).await.unwrap();
    current
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offline_write_is_pushed_after_reconnect() {
    let h = harness().await;
    h.monitor.set_online(false);

    let tournament = sample();
    let saved = h.orchestrator.save(&tournament).await.unwrap();
    assert_eq!(saved.owner_id.as_deref(), Some("owner-1"));
    assert_eq!(h.orchestrator.queue_status().await.unwrap().pending_count, 1);

    let report = h.orchestrator.sync_up().await.unwrap();
    assert!(report.offline);
    assert_eq!(h.orchestrator.state(), SyncState::Offline);
    let cached = h.orchestrator.get(&tournament.id).await.unwrap().unwrap();
    assert_eq!(cached.title, "Spring Cup");

    h.monitor.set_online(true);
    let report = h.orchestrator.sync_up().await.unwrap();
    assert_eq!(report.queue.delivered, 1);
    assert_eq!(report.in_sync, 1);
    assert_eq!(h.orchestrator.state(), SyncState::Synced);

    let remote = h.remote.get(&tournament.id).await.unwrap().unwrap();
    assert_eq!(remote.version, 1);
    let local = h.orchestrator.local().get(&tournament.id).await.unwrap().unwrap();
    assert!(!local.dirty);
    assert_eq!(local.tournament.version, 1);
    assert_eq!(h.orchestrator.queue_status().await.unwrap(), QueueStatus::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_title_edit_on_version_four_lands_on_five() {
    let h = harness().await;
    let tournament = sample().with_owner("owner-1");
    let created = h.remote.create(&tournament).await.unwrap();
    for base in 1..4 {
        h.remote.replace(&created, base).await.unwrap();
    }

    let mut fetched = h.orchestrator.get(&tournament.id).await.unwrap().unwrap();
    assert_eq!(fetched.version, 4);
    fetched.title = "Summer Cup".to_string();
    h.orchestrator.save(&fetched).await.unwrap();

    let report = h.orchestrator.sync_up().await.unwrap();
    assert_eq!(report.queue.delivered, 1);

    let remote = h.remote.get(&tournament.id).await.unwrap().unwrap();
    assert_eq!(remote.version, 5);
    assert_eq!(remote.title, "Summer Cup");
    let local = h.orchestrator.local().get(&tournament.id).await.unwrap().unwrap();
    assert_eq!(local.tournament.version, 5);
    assert!(!local.dirty);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_edit_is_reported_not_overwritten() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    let id = base.id;

    remote_edit(&h.remote, &id, |t| t.matches[0].score_a = Some(5)).await;

    let mut mine = base.clone();
    mine.title = "Mine".to_string();
    mine.matches[0].score_a = Some(2);
    h.orchestrator.save(&mine).await.unwrap();

    let report = h.orchestrator.sync_up().await.unwrap();
    assert_eq!(report.queue.dead_lettered, 1);
    assert_eq!(report.skipped, 1);

    let result = h.orchestrator.sync_down(&id).await;
    assert_eq!(result.status, SyncStatus::Conflict);
    let fields: Vec<_> = result.conflicts.iter().map(SyncConflict::field).collect();
    assert_eq!(fields, vec!["title", "score_a"]);
    assert_eq!(result.data.unwrap().title, "Mine");
    assert_eq!(h.orchestrator.state(), SyncState::Conflict);
    assert_eq!(h.orchestrator.conflicted(), vec![id]);

    // Neither side was touched
    let remote = h.remote.get(&id).await.unwrap().unwrap();
    assert_eq!(remote.title, "Spring Cup");
    assert_eq!(remote.matches[0].score_a, Some(5));
    let local = h.orchestrator.local().get(&id).await.unwrap().unwrap();
    assert!(local.dirty);
    assert_eq!(local.tournament.matches[0].score_a, Some(2));

    // Conflict sticks through later passes
    h.orchestrator.sync_up().await.unwrap();
    assert_eq!(h.orchestrator.state(), SyncState::Conflict);

    let resolved = h.orchestrator.resolve_conflict(&id, Resolution::Remote).await;
    assert_eq!(resolved.status, SyncStatus::Updated);
    let local = h.orchestrator.local().get(&id).await.unwrap().unwrap();
    assert!(!local.dirty);
    assert_eq!(local.tournament.title, "Spring Cup");
    assert_eq!(local.tournament.matches[0].score_a, Some(5));
    assert_eq!(h.orchestrator.state(), SyncState::Synced);
    assert!(h.orchestrator.dead_letters().await.unwrap().is_empty());
    assert!(h.orchestrator.conflicts(&id).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unpushed_copy_of_existing_tournament_conflicts() {
    let h = harness().await;
    let mut theirs = sample().with_owner("owner-1");
    theirs.matches[0].score_a = Some(3);
    h.remote.create(&theirs).await.unwrap();

    // Same id written offline before this device ever saw the remote row
    h.monitor.set_online(false);
    let mut mine = theirs.clone();
    mine.version = 0;
    mine.matches[0].score_a = Some(2);
    let saved = h.orchestrator.save(&mine).await.unwrap();
    assert_eq!(saved.version, 0);
    assert!(saved.updated_at >= theirs.updated_at);
    h.monitor.set_online(true);

    let result = h.orchestrator.sync_down(&theirs.id).await;
    assert_eq!(result.status, SyncStatus::Conflict);
    let fields: Vec<_> = result.conflicts.iter().map(SyncConflict::field).collect();
    assert_eq!(fields, vec!["score_a"]);

    let report = h.orchestrator.sync_up().await.unwrap();
    assert_eq!(report.queue.dead_lettered, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.pushed + report.uploaded, 0);

    let remote = h.remote.get(&theirs.id).await.unwrap().unwrap();
    assert_eq!(remote.matches[0].score_a, Some(3));
    assert_eq!(remote.version, 1);
    let local = h.orchestrator.local().get(&theirs.id).await.unwrap().unwrap();
    assert!(local.dirty);
    assert_eq!(local.tournament.matches[0].score_a, Some(2));
    assert_eq!(h.orchestrator.state(), SyncState::Conflict);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dead_lettered_send_leaves_error_state() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    assert_eq!(h.orchestrator.state(), SyncState::Synced);

    let patch = MatchPatch::new(base.matches[0].id).with(MatchChange::ScoreA(Some(4)));
    h.orchestrator
        .update_matches(&base.id, vec![patch], Some(99))
        .await
        .unwrap();

    let report = h.orchestrator.sync_up().await.unwrap();
    assert_eq!(report.queue.dead_lettered, 1);
    assert!(report.failed.is_empty());
    assert_eq!(h.orchestrator.state(), SyncState::Error);
    assert_eq!(h.orchestrator.queue_status().await.unwrap().failed_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_pass_reports_failures_in_state() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;

    let patch = MatchPatch::new(base.matches[0].id).with(MatchChange::ScoreB(Some(1)));
    h.orchestrator
        .update_matches(&base.id, vec![patch], Some(99))
        .await
        .unwrap();

    let report = h.orchestrator.process_queue().await.unwrap();
    assert!(report.has_failures());
    assert_eq!(h.orchestrator.state(), SyncState::Error);

    // A clean pass afterwards settles back
    let dead = h.orchestrator.dead_letters().await.unwrap();
    h.orchestrator.discard_mutation(&dead[0].id).await.unwrap();
    let report = h.orchestrator.process_queue().await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(h.orchestrator.state(), SyncState::Synced);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resolving_with_local_pushes_wholesale() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    let id = base.id;
    remote_edit(&h.remote, &id, |t| t.location = Some("South Park".to_string())).await;

    let mut mine = base.clone();
    mine.title = "Mine".to_string();
    h.orchestrator.save(&mine).await.unwrap();
    h.orchestrator.sync_up().await.unwrap();
    assert_eq!(h.orchestrator.sync_down(&id).await.status, SyncStatus::Conflict);

    let resolved = h.orchestrator.resolve_conflict(&id, Resolution::Local).await;
    assert_eq!(resolved.status, SyncStatus::Synced);

    let remote = h.remote.get(&id).await.unwrap().unwrap();
    assert_eq!(remote.version, 3);
    assert_eq!(remote.title, "Mine");
    assert_eq!(remote.location, None);
    let local = h.orchestrator.local().get(&id).await.unwrap().unwrap();
    assert_eq!(local.tournament.version, 3);
    assert!(!local.dirty);
    assert_eq!(h.orchestrator.queue_status().await.unwrap(), QueueStatus::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_match_update_merges_with_remote_edit() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    let id = base.id;
    let match_id = base.matches[0].id;
    remote_edit(&h.remote, &id, |t| t.title = "Renamed".to_string()).await;

    h.orchestrator
        .update_match(
            &id,
            MatchPatch::new(match_id)
                .with(MatchChange::ScoreA(Some(3)))
                .with(MatchChange::Status(MatchStatus::Running)),
        )
        .await
        .unwrap();
    let report = h.orchestrator.sync_up().await.unwrap();
    assert_eq!(report.queue.delivered, 1);

    let remote = h.remote.get(&id).await.unwrap().unwrap();
    assert_eq!(remote.version, 3);
    assert_eq!(remote.title, "Renamed");
    assert_eq!(remote.matches[0].score_a, Some(3));

    let local = h.orchestrator.local().get(&id).await.unwrap().unwrap();
    assert!(!local.dirty);
    assert_eq!(local.tournament.title, "Renamed");
    assert_eq!(h.orchestrator.sync_down(&id).await.status, SyncStatus::Synced);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_keeps_unconfirmed_local_edit() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;

    h.monitor.set_online(false);
    let mut edited = base.clone();
    edited.title = "Offline edit".to_string();
    h.orchestrator.save(&edited).await.unwrap();
    h.monitor.set_online(true);

    let read = h.orchestrator.get(&base.id).await.unwrap().unwrap();
    assert_eq!(read.title, "Offline edit");
    let remote = h.remote.get(&base.id).await.unwrap().unwrap();
    assert_eq!(remote.title, "Spring Cup");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pull_refreshes_clean_copy() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    remote_edit(&h.remote, &base.id, |t| t.title = "Renamed".to_string()).await;

    let result = h.orchestrator.sync_down(&base.id).await;
    assert_eq!(result.status, SyncStatus::Updated);
    let local = h.orchestrator.local().get(&base.id).await.unwrap().unwrap();
    assert_eq!(local.tournament.title, "Renamed");
    assert_eq!(local.tournament.version, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_down_offline_serves_cache() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    h.monitor.set_online(false);

    let result = h.orchestrator.sync_down(&base.id).await;
    assert_eq!(result.status, SyncStatus::Offline);
    assert_eq!(result.data.unwrap().id, base.id);
    assert_eq!(
        h.orchestrator.sync_tournament(&base.id).await.status,
        SyncStatus::Offline
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_versions_only_increase() {
    let h = harness().await;
    let mut current = synced(&h, &sample()).await;
    let mut versions = vec![current.version];

    for round in 1..=3 {
        current.title = format!("Round {round}");
        h.orchestrator.save(&current).await.unwrap();
        let result = h.orchestrator.sync_tournament(&current.id).await;
        assert_eq!(result.status, SyncStatus::Synced);
        current = h.remote.get(&current.id).await.unwrap().unwrap();
        versions.push(current.version);
    }
    assert_eq!(versions, vec![1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_share_code_round_trip_between_devices() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;

    let published = h.orchestrator.make_public(&base.id).await.unwrap();
    let code = published.share_code.clone().unwrap();
    assert!(published.is_public);
    h.orchestrator.sync_up().await.unwrap();

    let viewer = device(Arc::clone(&h.remote), h.monitor.clone()).await;
    let found = viewer
        .get_by_share_code(&format!(" {} ", code.to_lowercase()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, base.id);

    h.orchestrator.make_private(&base.id).await.unwrap();
    h.orchestrator.sync_up().await.unwrap();
    assert!(viewer.get_by_share_code(&code).await.unwrap().is_none());

    let regenerated = h.orchestrator.regenerate_share_code(&base.id).await.unwrap();
    assert!(regenerated != code);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_merges_remote_and_unpushed_rows() {
    let h = harness().await;
    let remote_only = sample().with_owner("owner-1");
    h.remote.create(&remote_only).await.unwrap();
    h.remote
        .create(&sample().with_owner("someone-else"))
        .await
        .unwrap();

    h.monitor.set_online(false);
    let local_only = h.orchestrator.save(&sample()).await.unwrap();
    h.monitor.set_online(true);

    let listed: Vec<_> = h
        .orchestrator
        .list_for_current_user()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&remote_only.id));
    assert!(listed.contains(&local_only.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_reaches_remote() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;

    h.orchestrator.delete(&base.id).await.unwrap();
    assert!(h.orchestrator.local().get(&base.id).await.unwrap().is_none());
    h.orchestrator.sync_up().await.unwrap();
    assert!(h.remote.get(&base.id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_match_is_versioned_independently() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    let match_id = base.matches[0].id;

    let mut live = LiveMatch::new(base.id, match_id, 1200);
    live.status = MatchStatus::Running;
    live.timer_started_at = Some(now_millis());
    live.score_a = 1;
    h.orchestrator.save_live_match(&live).await.unwrap();
    h.orchestrator.process_queue().await.unwrap();

    let remote = h.remote.live_matches(&base.id).await.unwrap();
    assert_eq!(remote[&match_id].score_a, 1);
    assert_eq!(remote[&match_id].version, 1);
    let local = h.orchestrator.live_matches(&base.id).await.unwrap();
    assert_eq!(local[&match_id].version, 1);
    // Tournament version untouched
    assert_eq!(h.remote.get(&base.id).await.unwrap().unwrap().version, 1);

    let viewer = device(Arc::clone(&h.remote), h.monitor.clone()).await;
    let pulled = viewer.pull_live_matches(&base.id).await.unwrap();
    assert_eq!(pulled[&match_id].score_a, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_background_worker_drains_after_write() {
    let h = harness().await;
    let orchestrator = Arc::new(h.orchestrator);
    let worker = orchestrator.spawn_background();

    let saved = orchestrator.save(&sample()).await.unwrap();
    let mut drained = false;
    for _ in 0..100 {
        if orchestrator.queue_status().await.unwrap().pending_count == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.abort();

    assert!(drained);
    assert!(h.remote.get(&saved.id).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_changes_are_published() {
    let h = harness().await;
    let mut states = h.orchestrator.subscribe_state();
    h.monitor.set_online(false);

    h.orchestrator.sync_up().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SyncState::Offline);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_background_failure_is_published_as_error() {
    let h = harness().await;
    let base = synced(&h, &sample()).await;
    let orchestrator = Arc::new(h.orchestrator);
    let worker = orchestrator.spawn_background();

    let patch = MatchPatch::new(base.matches[0].id).with(MatchChange::ScoreA(Some(7)));
    orchestrator
        .update_matches(&base.id, vec![patch], Some(99))
        .await
        .unwrap();
    let mut settled = false;
    for _ in 0..100 {
        if orchestrator.queue_status().await.unwrap().failed_count == 1
            && orchestrator.state() == SyncState::Error
        {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.abort();

    assert!(settled);
}
