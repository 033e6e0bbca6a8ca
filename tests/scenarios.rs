use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edu_sync_core::gateway::mock::MockGateway;
use edu_sync_core::{EngineStatus, RemoteProgressDoc, Repository, Store, SyncConfig, SyncEngine, SyncStatus};
use tokio::sync::watch;

fn config() -> SyncConfig {
    SyncConfig {
        max_retry: 5,
        simulated_network_delay_ms: 0,
        simulated_failure_percent: 0,
    }
}

fn repository() -> Arc<Repository> {
    Arc::new(Repository::new(Arc::new(Store::open_in_memory().unwrap())))
}

/// Waits for one full Syncing -> (Idle | Error) transition, with a
/// generous timeout so a bug that drops a cycle fails the test instead
/// of hanging the suite.
async fn wait_for_cycle(rx: &mut watch::Receiver<EngineStatus>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow() != EngineStatus::Syncing {
            rx.changed().await.unwrap();
        }
        while *rx.borrow() == EngineStatus::Syncing {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("sync cycle never completed");
}

#[tokio::test]
async fn s1_offline_create_then_online_sync() {
    let repo = repository();
    let gateway = Arc::new(MockGateway::always_succeeding(0));
    let engine = SyncEngine::new(repo.clone(), gateway.clone(), config());

    let progress = repo.update_progress("u1", "l1", 10).await.unwrap();
    assert_eq!(progress.progress_percent, 10);
    assert_eq!(progress.sync_status, SyncStatus::Pending);

    let pending = repo.pending_journal_entries(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, progress.id);

    // Offline gate: trigger_sync while offline must not touch the gateway.
    engine.trigger_sync().await;
    assert_eq!(gateway.upload_count(), 0);
    assert_eq!(repo.pending_journal_entries(10).await.unwrap().len(), 1);

    let mut status_rx = engine.watch_status();
    engine.set_connectivity(true);
    wait_for_cycle(&mut status_rx).await;

    assert_eq!(gateway.upload_count(), 1);
    assert!(repo.pending_journal_entries(10).await.unwrap().is_empty());
    let status = repo.sync_status_for("u1", "l1").await.unwrap();
    assert_eq!(status, Some(SyncStatus::Synced));
}

#[tokio::test]
async fn s2_remote_newer_wins() {
    let repo = repository();
    let t0 = Utc::now();
    repo.upsert_progress_if_newer(RemoteProgressDoc {
        id: Some("p1".into()),
        user_id: Some("u1".into()),
        lesson_id: Some("l1".into()),
        progress_percent: Some(30),
        updated_at: Some(t0),
    })
    .await
    .unwrap();

    let accepted = repo
        .upsert_progress_if_newer(RemoteProgressDoc {
            id: Some("p1".into()),
            user_id: Some("u1".into()),
            lesson_id: Some("l1".into()),
            progress_percent: Some(80),
            updated_at: Some(t0 + chrono::Duration::hours(1)),
        })
        .await
        .unwrap();

    assert!(accepted);
    assert_eq!(repo.progress_percent_for("u1", "l1").await.unwrap(), Some(80));
    assert_eq!(
        repo.sync_status_for("u1", "l1").await.unwrap(),
        Some(SyncStatus::Synced)
    );
}

#[tokio::test]
async fn s3_local_newer_wins() {
    let repo = repository();
    let local = repo.update_progress("u1", "l1", 60).await.unwrap();

    let accepted = repo
        .upsert_progress_if_newer(RemoteProgressDoc {
            id: Some("remote-id".into()),
            user_id: Some("u1".into()),
            lesson_id: Some("l1".into()),
            progress_percent: Some(40),
            updated_at: Some(local.updated_at - chrono::Duration::hours(2)),
        })
        .await
        .unwrap();

    assert!(!accepted);
    assert_eq!(repo.progress_percent_for("u1", "l1").await.unwrap(), Some(60));
    assert_eq!(
        repo.sync_status_for("u1", "l1").await.unwrap(),
        Some(SyncStatus::Pending)
    );
}

#[tokio::test]
async fn s4_equal_timestamp_tie_break_goes_to_local() {
    let repo = repository();
    let local = repo.update_progress("u1", "l1", 45).await.unwrap();

    let accepted = repo
        .upsert_progress_if_newer(RemoteProgressDoc {
            id: Some("remote-id".into()),
            user_id: Some("u1".into()),
            lesson_id: Some("l1".into()),
            progress_percent: Some(90),
            updated_at: Some(local.updated_at),
        })
        .await
        .unwrap();

    assert!(!accepted);
    assert_eq!(repo.progress_percent_for("u1", "l1").await.unwrap(), Some(45));
}

#[tokio::test]
async fn s5_retry_cap_shelves_entry_after_five_failures() {
    let repo = repository();
    let gateway = Arc::new(MockGateway::always_failing(0));
    let engine = SyncEngine::new(repo.clone(), gateway.clone(), config());

    // Bring the engine online first, while the journal is still empty, so
    // the auto-triggered cycle from this transition is a harmless no-op.
    let mut status_rx = engine.watch_status();
    engine.set_connectivity(true);
    wait_for_cycle(&mut status_rx).await;

    repo.update_progress("u1", "l1", 10).await.unwrap();

    for _ in 0..5 {
        engine.trigger_sync().await;
    }
    let entries = repo.pending_journal_entries(u32::MAX).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].retry_count, 5);
    let calls_after_five = gateway.upload_count();

    engine.trigger_sync().await;
    assert_eq!(gateway.upload_count(), calls_after_five, "shelved entry must not be retried");
    let entries = repo.pending_journal_entries(u32::MAX).await.unwrap();
    assert_eq!(entries.len(), 1, "shelved entry stays in the store");
}

#[tokio::test]
async fn s6_conflict_injection_ordering() {
    let repo = repository();
    let gateway = Arc::new(MockGateway::always_succeeding(0));
    let engine = SyncEngine::new(repo.clone(), gateway.clone(), config());

    let t0 = Utc::now();
    // Seed a previously-synced row, both locally and on the "remote" side,
    // as if an earlier cycle had already uploaded it.
    repo.upsert_progress_if_newer(RemoteProgressDoc {
        id: Some("p1".into()),
        user_id: Some("u1".into()),
        lesson_id: Some("l1".into()),
        progress_percent: Some(10),
        updated_at: Some(t0),
    })
    .await
    .unwrap();
    gateway.seed_progress(serde_json::json!({
        "id": "p1",
        "userId": "u1",
        "lessonId": "l1",
        "progressPercent": 10,
        "updatedAt": t0.to_rfc3339(),
    }));

    let mut status_rx = engine.watch_status();
    engine.set_connectivity(true);
    wait_for_cycle(&mut status_rx).await;

    engine.queue_conflict_simulation("p1".to_string());
    engine.trigger_sync().await;

    assert_eq!(repo.progress_percent_for("u1", "l1").await.unwrap(), Some(100));
    let status = repo.sync_status_for("u1", "l1").await.unwrap();
    assert_eq!(status, Some(SyncStatus::Synced));
}
