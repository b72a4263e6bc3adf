//! Session behaviour seen from several workers at once.
//!
//! Every worker owns its own store client and authenticator. The
//! properties below only hold because none of them keeps state of its own.
//!
//! The Redis variants run only when `COHORT_TEST_REDIS_URL` points at a
//! disposable server.

use std::time::Duration;

use cohort_session::{
    MemorySessionStore, SessionAuthenticator, SessionError, SessionSettings, SessionStore,
};
use serde_json::json;

fn settings(ttl: Duration) -> SessionSettings {
    SessionSettings {
        ttl,
        cookie_name: "cohort.sid".into(),
        secret: "shared secret".into(),
        ..SessionSettings::default()
    }
}

/// Two "workers" sharing one in-memory service.
fn two_workers(
    ttl: Duration,
) -> (
    SessionAuthenticator<MemorySessionStore>,
    SessionAuthenticator<MemorySessionStore>,
) {
    let service = MemorySessionStore::new(ttl);
    let a = SessionAuthenticator::new(service.clone(), settings(ttl)).unwrap();
    let b = SessionAuthenticator::new(service, settings(ttl)).unwrap();
    (a, b)
}

#[tokio::test]
async fn test_cookie_from_one_worker_authenticates_on_another() {
    let (a, b) = two_workers(Duration::from_secs(60));
    let (id, cookie) = a.login(json!({"user": "grace"})).await.unwrap();

    let record = b.authenticate(Some(&cookie)).await.unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.payload, json!({"user": "grace"}));
}

#[tokio::test]
async fn test_concurrent_resolution_on_two_workers_agrees() {
    let (a, b) = two_workers(Duration::from_secs(60));
    let (_, cookie) = a.login(json!({"cart": [1, 2, 3]})).await.unwrap();

    let (ra, rb) = tokio::join!(a.authenticate(Some(&cookie)), b.authenticate(Some(&cookie)));
    assert_eq!(ra.unwrap().payload, rb.unwrap().payload);
}

#[tokio::test]
async fn test_logout_on_one_worker_is_seen_by_the_other() {
    let (a, b) = two_workers(Duration::from_secs(60));
    let (id, cookie) = a.login(json!(1)).await.unwrap();
    assert!(b.authenticate(Some(&cookie)).await.is_ok());

    b.logout(&id).await.unwrap();

    let err = a.authenticate(Some(&cookie)).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_on_either_worker_keeps_session_alive() {
    let ttl = Duration::from_secs(30);
    let (a, b) = two_workers(ttl);
    let (_, cookie) = a.login(json!(1)).await.unwrap();

    // Alternate workers, each access inside the TTL of the previous one.
    for worker in [&b, &a, &b, &a] {
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(worker.authenticate(Some(&cookie)).await.is_ok());
    }

    // An idle gap longer than the TTL ends it everywhere.
    tokio::time::advance(ttl + Duration::from_secs(1)).await;
    assert!(matches!(
        b.authenticate(Some(&cookie)).await,
        Err(SessionError::NotFound)
    ));
    assert!(matches!(
        a.authenticate(Some(&cookie)).await,
        Err(SessionError::NotFound)
    ));
}

#[tokio::test]
async fn test_worker_with_different_secret_rejects_cookie() {
    let service = MemorySessionStore::new(Duration::from_secs(60));
    let a = SessionAuthenticator::new(service.clone(), settings(Duration::from_secs(60))).unwrap();
    let other = SessionSettings {
        secret: "rotated".into(),
        ..settings(Duration::from_secs(60))
    };
    let b = SessionAuthenticator::new(service, other).unwrap();

    let (_, cookie) = a.login(json!(1)).await.unwrap();
    assert!(matches!(
        b.authenticate(Some(&cookie)).await,
        Err(SessionError::InvalidSignature)
    ));
}

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use cohort_session::RedisSessionStore;

    fn redis_url() -> Option<String> {
        std::env::var("COHORT_TEST_REDIS_URL").ok()
    }

    async fn connect(url: &str, ttl: Duration) -> SessionAuthenticator<RedisSessionStore> {
        let settings = SessionSettings {
            key_prefix: "cohort-test:sess:".into(),
            ..settings(ttl)
        };
        let store = RedisSessionStore::connect(url, &settings).await.unwrap();
        SessionAuthenticator::new(store, settings).unwrap()
    }

    #[tokio::test]
    async fn test_redis_cookie_from_one_client_authenticates_on_another() {
        let Some(url) = redis_url() else {
            return;
        };
        let a = connect(&url, Duration::from_secs(60)).await;
        let b = connect(&url, Duration::from_secs(60)).await;

        let (id, cookie) = a.login(json!({"user": "linus"})).await.unwrap();
        let record = b.authenticate(Some(&cookie)).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.payload, json!({"user": "linus"}));
        assert!(record.remaining() <= Duration::from_secs(60));

        b.logout(&id).await.unwrap();
        assert!(matches!(
            a.authenticate(Some(&cookie)).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_redis_session_expires_after_ttl() {
        let Some(url) = redis_url() else {
            return;
        };
        let a = connect(&url, Duration::from_millis(300)).await;
        let id = a.store().create(json!(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            a.store().resolve(&id).await,
            Err(SessionError::NotFound)
        ));
        assert!(matches!(
            a.store().touch(&id).await,
            Err(SessionError::NotFound)
        ));
    }
}
