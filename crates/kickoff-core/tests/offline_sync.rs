//! End-to-end sync scenarios over on-disk databases

use std::path::Path;
use std::sync::Arc;

use kickoff_core::db::{Database, SharedDatabase};
use kickoff_core::lock::FileLock;
use kickoff_core::models::{
    LiveMatch, Match, MatchChange, MatchPatch, MatchStatus, QueueStatus, Team, Tournament,
};
use kickoff_core::queue::MutationStore;
use kickoff_core::remote::REMOTE_MIGRATIONS;
use kickoff_core::util::now_millis;
use kickoff_core::{
    CrossContextLock, LibSqlLocalCache, LibSqlRemoteStore, NetworkMonitor, RemoteStore,
    SyncOrchestrator, SyncSettings,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

type Orchestrator = SyncOrchestrator<LibSqlLocalCache, LibSqlRemoteStore>;

fn settings() -> SyncSettings {
    SyncSettings {
        sync_interval_secs: None,
        lock_timeout_ms: 2_000,
        ..SyncSettings::default()
    }
}

async fn remote_store(dir: &Path, monitor: &NetworkMonitor) -> Arc<LibSqlRemoteStore> {
    let db = Database::open_with(dir.join("remote.db"), REMOTE_MIGRATIONS)
        .await
        .unwrap();
    Arc::new(LibSqlRemoteStore::new(db.into_shared(), monitor.clone()))
}

async fn open_device(
    db: SharedDatabase,
    remote: Arc<LibSqlRemoteStore>,
    locks: &Path,
    monitor: &NetworkMonitor,
) -> Orchestrator {
    let settings = settings();
    let lock = FileLock::new(locks, settings.lock_timeout(), settings.stale_lock_after()).unwrap();
    let local = Arc::new(LibSqlLocalCache::new(db.clone(), &settings));
    SyncOrchestrator::new(
        local,
        remote,
        db,
        CrossContextLock::File(lock),
        monitor.clone(),
        settings,
    )
    .await
    .unwrap()
    .with_current_user("organizer")
}

fn tournament() -> Tournament {
    let mut tournament = Tournament::new("City League");
    let teams: Vec<_> = ["Owls", "Foxes", "Hawks", "Wolves"]
        .into_iter()
        .map(Team::new)
        .collect();
    tournament.matches.push(Match::new(teams[0].id, teams[1].id));
    tournament.matches.push(Match::new(teams[2].id, teams[3].id));
    tournament.teams = teams;
    tournament
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_edits_survive_restart_and_sync() {
    let tmp = TempDir::new().unwrap();
    let monitor = NetworkMonitor::new(false);
    let remote = remote_store(tmp.path(), &monitor).await;
    let local_path = tmp.path().join("local.db");
    let created = tournament();

    {
        let db = Database::open(&local_path).await.unwrap().into_shared();
        let device = open_device(db, Arc::clone(&remote), &tmp.path().join("locks"), &monitor).await;
        device.save(&created).await.unwrap();
        device
            .update_match(
                &created.id,
                MatchPatch::new(created.matches[0].id).with(MatchChange::ScoreA(Some(1))),
            )
            .await
            .unwrap();
        assert_eq!(device.queue_status().await.unwrap().pending_count, 1);
    }

    let db = Database::open(&local_path).await.unwrap().into_shared();
    let device = open_device(db, Arc::clone(&remote), &tmp.path().join("locks"), &monitor).await;
    assert_eq!(device.queue_status().await.unwrap().pending_count, 1);

    monitor.set_online(true);
    let report = device.sync_up().await.unwrap();
    assert_eq!(report.queue.delivered, 1);

    let stored = remote.get(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.matches[0].score_a, Some(1));
    assert_eq!(stored.owner_id.as_deref(), Some("organizer"));
    assert_eq!(device.queue_status().await.unwrap(), QueueStatus::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_send_is_retried_after_restart() {
    let tmp = TempDir::new().unwrap();
    let monitor = NetworkMonitor::online();
    let remote = remote_store(tmp.path(), &monitor).await;
    let local_path = tmp.path().join("local.db");
    let created = tournament();

    {
        let db = Database::open(&local_path).await.unwrap().into_shared();
        let device = open_device(db.clone(), Arc::clone(&remote), &tmp.path().join("locks"), &monitor)
            .await;
        device.save(&created).await.unwrap();
        // Claimed but never acknowledged, as if the process died mid-send
        let lease = i64::try_from(settings().claim_lease_ms).unwrap();
        let claimed = MutationStore::new(db)
            .claim_due(now_millis() - lease - 1_000)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    let db = Database::open(&local_path).await.unwrap().into_shared();
    let device = open_device(db, Arc::clone(&remote), &tmp.path().join("locks"), &monitor).await;
    let report = device.process_queue().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(remote.get(&created.id).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn send_in_flight_elsewhere_is_not_resent_on_open() {
    let tmp = TempDir::new().unwrap();
    let monitor = NetworkMonitor::online();
    let remote = remote_store(tmp.path(), &monitor).await;
    let local_path = tmp.path().join("local.db");
    let locks = tmp.path().join("locks");
    let created = tournament();

    let sender_db = Database::open(&local_path).await.unwrap().into_shared();
    let sender = open_device(sender_db.clone(), Arc::clone(&remote), &locks, &monitor).await;
    sender.save(&created).await.unwrap();
    let claimed = MutationStore::new(sender_db)
        .claim_due(now_millis())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // A second process starts while the first is still sending
    let db = Database::open(&local_path).await.unwrap().into_shared();
    let latecomer = open_device(db, Arc::clone(&remote), &locks, &monitor).await;
    let report = latecomer.process_queue().await.unwrap();
    assert_eq!(report.delivered, 0);
    assert!(remote.get(&created.id).await.unwrap().is_none());
    assert_eq!(latecomer.queue_status().await.unwrap().pending_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_processes_saving_live_matches_keep_both() {
    let tmp = TempDir::new().unwrap();
    let monitor = NetworkMonitor::new(false);
    let remote = remote_store(tmp.path(), &monitor).await;
    let local_path = tmp.path().join("local.db");
    let locks = tmp.path().join("locks");

    // Separate connections to one file, coordinated only by lock files
    let first_db = Database::open(&local_path).await.unwrap().into_shared();
    let second_db = Database::open(&local_path).await.unwrap().into_shared();
    let first = open_device(first_db, Arc::clone(&remote), &locks, &monitor).await;
    let second = open_device(second_db, Arc::clone(&remote), &locks, &monitor).await;
    assert!(first.is_cross_process());

    let created = first.save(&tournament()).await.unwrap();
    for round in 0..5 {
        let mut home = LiveMatch::new(created.id, created.matches[0].id, 20 * 60);
        home.score_a = round;
        let mut away = LiveMatch::new(created.id, created.matches[1].id, 20 * 60);
        away.score_b = round;
        let (a, b) = tokio::join!(first.save_live_match(&home), second.save_live_match(&away));
        a.unwrap();
        b.unwrap();
    }

    for device in [&first, &second] {
        let live = device.live_matches(&created.id).await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[&created.matches[0].id].score_a, 4);
        assert_eq!(live[&created.matches[1].id].score_b, 4);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_contexts_never_send_the_same_mutation_twice() {
    let tmp = TempDir::new().unwrap();
    let monitor = NetworkMonitor::online();
    let remote = remote_store(tmp.path(), &monitor).await;
    let db = Database::open(tmp.path().join("local.db"))
        .await
        .unwrap()
        .into_shared();
    let locks = tmp.path().join("locks");

    let first = open_device(db.clone(), Arc::clone(&remote), &locks, &monitor).await;
    let second = open_device(db, Arc::clone(&remote), &locks, &monitor).await;

    let mut created = Vec::new();
    for round in 0..4 {
        let mut next = tournament();
        next.title = format!("League {round}");
        created.push(first.save(&next).await.unwrap());
    }

    let (a, b) = tokio::join!(first.process_queue(), second.process_queue());
    assert_eq!(a.unwrap().delivered + b.unwrap().delivered, 4);

    for tournament in &created {
        let stored = remote.get(&tournament.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }
    assert_eq!(second.queue_status().await.unwrap(), QueueStatus::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn devices_editing_different_matches_both_land() {
    let tmp = TempDir::new().unwrap();
    let monitor = NetworkMonitor::online();
    let remote = remote_store(tmp.path(), &monitor).await;

    let phone_db = Database::open(tmp.path().join("phone.db")).await.unwrap().into_shared();
    let tablet_db = Database::open(tmp.path().join("tablet.db")).await.unwrap().into_shared();
    let phone = open_device(phone_db, Arc::clone(&remote), &tmp.path().join("phone-locks"), &monitor).await;
    let tablet = open_device(tablet_db, Arc::clone(&remote), &tmp.path().join("tablet-locks"), &monitor).await;

    let created = phone.save(&tournament()).await.unwrap();
    phone.sync_up().await.unwrap();
    tablet.get(&created.id).await.unwrap().unwrap();

    let first = created.matches[0].id;
    let second = created.matches[1].id;
    phone
        .update_match(&created.id, MatchPatch::new(first).with(MatchChange::ScoreA(Some(2))))
        .await
        .unwrap();
    tablet
        .update_match(
            &created.id,
            MatchPatch::new(second).with(MatchChange::Status(MatchStatus::Finished)),
        )
        .await
        .unwrap();

    phone.sync_up().await.unwrap();
    tablet.sync_up().await.unwrap();

    let stored = remote.get(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.matches[0].score_a, Some(2));
    assert_eq!(stored.matches[1].status, MatchStatus::Finished);

    // Both caches converge on the merged copy
    phone.sync_tournament(&created.id).await;
    let on_phone = phone.get(&created.id).await.unwrap().unwrap();
    let on_tablet = tablet.get(&created.id).await.unwrap().unwrap();
    assert!(on_phone.same_content(&stored));
    assert!(on_tablet.same_content(&stored));
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_timer_is_paused_on_read() {
    let tmp = TempDir::new().unwrap();
    let monitor = NetworkMonitor::new(false);
    let remote = remote_store(tmp.path(), &monitor).await;
    let db = Database::open(tmp.path().join("local.db")).await.unwrap().into_shared();
    let device = open_device(db, remote, &tmp.path().join("locks"), &monitor).await;

    let created = device.save(&tournament()).await.unwrap();
    let mut live = LiveMatch::new(created.id, created.matches[0].id, 20 * 60);
    live.status = MatchStatus::Running;
    live.timer_started_at = Some(now_millis() - 2 * 60 * 60 * 1000);
    device.save_live_match(&live).await.unwrap();

    let repaired = device.live_matches(&created.id).await.unwrap();
    let entry = &repaired[&created.matches[0].id];
    assert_eq!(entry.status, MatchStatus::Paused);
    assert_eq!(entry.timer_started_at, None);
    assert_eq!(entry.elapsed_seconds, 20 * 60);
}
