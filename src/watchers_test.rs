use std::time::Duration;

use super::*;
use crate::identity::IdentityError;
use crate::record::SessionRecord;
use crate::test_helpers::{Harness, eventually};

fn offline_restore_harness() -> Harness {
    let h = Harness::new();
    h.identity.add_account("a@x.com", "secret", "u1");
    h.store.seed(
        SessionRecord {
            user_id: "u1".into(),
            email: Some("a@x.com".into()),
            display_name: None,
            password: Some("secret".into()),
            onboarding_completed: true,
            is_anonymous: false,
        },
        Some("old-token"),
    );
    for _ in 0..3 {
        h.identity.push_sign_in_error(IdentityError::Network("offline".into()));
    }
    h
}

#[tokio::test]
async fn connectivity_restored_retries_restore() {
    let h = offline_restore_harness();
    assert!(!h.reconciler.restore_session().await);

    let (tx, rx) = mpsc::channel(8);
    let watcher = spawn_lifecycle_watcher(h.reconciler.clone(), rx);
    tx.send(LifecycleEvent::ConnectivityRestored).await.unwrap();
    tx.send(LifecycleEvent::Foregrounded).await.unwrap();

    let reconciler = h.reconciler.clone();
    assert!(eventually(|| reconciler.state().phase == SessionPhase::Authenticated).await);
    // Three failed attempts at startup, then one shared retry.
    assert_eq!(h.identity.count("sign_in_with_email"), 4);

    drop(tx);
    tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn lifecycle_events_ignored_while_signed_in() {
    let h = Harness::new();
    h.identity.add_account("a@x.com", "secret", "u1");
    h.reconciler.login("a@x.com", "secret").await.unwrap();

    let (tx, rx) = mpsc::channel(8);
    let _watcher = spawn_lifecycle_watcher(h.reconciler.clone(), rx);
    tx.send(LifecycleEvent::Foregrounded).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.identity.count("sign_in_with_email"), 1);
    assert_eq!(h.store.reads.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn state_logger_stops_with_reconciler() {
    let h = Harness::new();
    let logger = spawn_state_logger(h.reconciler.subscribe_state());
    assert!(!h.reconciler.restore_session().await);

    drop(h);
    tokio::time::timeout(Duration::from_secs(1), logger)
        .await
        .unwrap()
        .unwrap();
}
