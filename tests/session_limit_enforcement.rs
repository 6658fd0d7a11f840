//! Session-limit admission (spec.md §8 scenarios 2 & 3): reject at limit,
//! and evict-oldest admits the new call while dropping the oldest session
//! record.

mod common;

use std::sync::Arc;
use std::time::Duration;

use voice_ferry_core::services::{
    AdmissionDecision, OverLimitAction, SessionLimitConfig, SessionLimitPolicy, SessionStore,
    StoreFailurePolicy,
};

use common::FakeSessionStore;

#[tokio::test]
async fn reject_action_busies_out_the_caller_once_the_limit_is_reached() {
    let store: Arc<dyn SessionStore> = Arc::new(FakeSessionStore::default());
    let config = SessionLimitConfig { enabled: true, global_default: 1, action: OverLimitAction::Reject };
    let policy = SessionLimitPolicy::new(config, store.clone(), StoreFailurePolicy::FailOpen);

    let first = policy.admit("alice").await.unwrap();
    let reservation_id = match first {
        AdmissionDecision::Admit { reservation_id } => reservation_id,
        other => panic!("expected Admit, got {other:?}"),
    };
    store
        .put_session(
            &voice_ferry_core::services::SessionRecord {
                session_id: reservation_id.clone(),
                username: "alice".into(),
                created_at: 0,
                payload: Default::default(),
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let second = policy.admit("alice").await.unwrap();
    assert_eq!(second, AdmissionDecision::Reject);
}

#[tokio::test]
async fn terminate_oldest_admits_the_new_call_and_drops_the_oldest_session_record() {
    let store: Arc<dyn SessionStore> = Arc::new(FakeSessionStore::default());
    let config = SessionLimitConfig { enabled: true, global_default: 1, action: OverLimitAction::TerminateOldest };
    let policy = SessionLimitPolicy::new(config, store.clone(), StoreFailurePolicy::FailOpen);

    let first = policy.admit("alice").await.unwrap();
    let oldest_id = match first {
        AdmissionDecision::Admit { reservation_id } => reservation_id,
        other => panic!("expected Admit, got {other:?}"),
    };
    store
        .put_session(
            &voice_ferry_core::services::SessionRecord {
                session_id: oldest_id.clone(),
                username: "alice".into(),
                created_at: 0,
                payload: Default::default(),
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let second = policy.admit("alice").await.unwrap();
    match second {
        AdmissionDecision::AdmitAfterEviction { evicted_session_id, .. } => {
            assert_eq!(evicted_session_id, oldest_id);
        }
        other => panic!("expected AdmitAfterEviction, got {other:?}"),
    }

    assert!(store.get_session(&oldest_id).await.unwrap().is_none());
}

#[tokio::test]
async fn disabled_limit_always_admits() {
    let store: Arc<dyn SessionStore> = Arc::new(FakeSessionStore::default());
    let config = SessionLimitConfig { enabled: false, global_default: 1, action: OverLimitAction::Reject };
    let policy = SessionLimitPolicy::new(config, store, StoreFailurePolicy::FailOpen);

    for _ in 0..5 {
        assert!(matches!(policy.admit("alice").await.unwrap(), AdmissionDecision::Admit { .. }));
    }
}
