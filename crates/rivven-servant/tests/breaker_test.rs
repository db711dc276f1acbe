//! Circuit breaking through the servant

mod common;

use common::*;
use rivven_servant::prelude::*;
use std::time::Duration;

const HOSTS: [&str; 2] = ["u0", "u1"];
const COOLDOWN: Duration = Duration::from_millis(200);

fn breaker_of(servant: &Servant, host: &str) -> Option<CircuitState> {
    servant
        .runtime()
        .servers
        .into_iter()
        .find(|s| s.server.contains(&format!("@{}:", host)))
        .and_then(|s| s.breaker)
}

#[tokio::test]
async fn test_breaker_trips_rejects_and_recovers() {
    let backend = FakeBackend::new();
    backend.fail_host("u1");
    let servant = servant(&backend, &HOSTS);

    // min_calls = 4, threshold = 0.5
    for _ in 0..4 {
        let err = servant.query(&ctx("b"), &which_server(1)).await.unwrap_err();
        assert!(err.is_server_fault(), "unexpected error {}", err);
    }
    assert_eq!(breaker_of(&servant, "u1"), Some(CircuitState::Open));

    let err = servant.query(&ctx("b"), &which_server(1)).await.unwrap_err();
    assert!(matches!(err, Error::BreakerOpen { .. }));
    assert_eq!(err.category(), ErrorCategory::RetryElsewhere);

    // The healthy shard is unaffected
    let ok = servant.query(&ctx("b"), &which_server(0)).await.unwrap();
    assert_eq!(served_by(&ok), "u0");
    assert_eq!(breaker_of(&servant, "u0"), Some(CircuitState::Closed));

    // Failed trial reopens immediately
    tokio::time::sleep(COOLDOWN + Duration::from_millis(50)).await;
    let err = servant.query(&ctx("b"), &which_server(1)).await.unwrap_err();
    assert!(!matches!(err, Error::BreakerOpen { .. }));
    assert_eq!(breaker_of(&servant, "u1"), Some(CircuitState::Open));
    let err = servant.query(&ctx("b"), &which_server(1)).await.unwrap_err();
    assert!(matches!(err, Error::BreakerOpen { .. }));

    // Successful trial closes
    backend.heal_host("u1");
    tokio::time::sleep(COOLDOWN + Duration::from_millis(50)).await;
    let ok = servant.query(&ctx("b"), &which_server(1)).await.unwrap();
    assert_eq!(served_by(&ok), "u1");
    assert_eq!(breaker_of(&servant, "u1"), Some(CircuitState::Closed));

    for _ in 0..3 {
        servant.query(&ctx("b"), &which_server(1)).await.unwrap();
    }
}

#[tokio::test]
async fn test_breaker_open_skips_server_entirely() {
    let backend = FakeBackend::new();
    backend.fail_host("u1");
    let servant = servant(&backend, &HOSTS);

    for _ in 0..4 {
        let _ = servant.query(&ctx("b"), &which_server(1)).await;
    }
    backend.heal_host("u1");

    for _ in 0..5 {
        let err = servant.query(&ctx("b"), &which_server(1)).await.unwrap_err();
        assert!(matches!(err, Error::BreakerOpen { .. }));
    }
    assert_eq!(backend.statements_on("u1"), 0);
    assert_eq!(backend.connects.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_request_errors_do_not_trip_breaker() {
    let backend = FakeBackend::new();
    backend.put("u1", "UserInfo", "uid=1", Some("{}"));
    let servant = servant(&backend, &HOSTS);

    // Merge preconditions fail after the server answered
    for _ in 0..6 {
        let err = servant
            .merge(&ctx("b"), &merge_request(1, 9, r#"{"a":1}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRowCount { .. }));
    }
    assert_eq!(breaker_of(&servant, "u1"), Some(CircuitState::Closed));
    servant.query(&ctx("b"), &which_server(1)).await.unwrap();
}

#[tokio::test]
async fn test_breaker_state_in_runtime_snapshot() {
    let backend = FakeBackend::new();
    let servant = servant(&backend, &HOSTS);

    let snapshot = servant.runtime();
    assert_eq!(snapshot.generation, 1);
    assert_eq!(snapshot.servers.len(), 3);
    assert!(snapshot
        .servers
        .iter()
        .all(|s| s.breaker == Some(CircuitState::Closed) && !s.retired));
    assert_eq!(snapshot.cache_store, CacheStoreKind::Mem);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["servers"][0]["breaker"], "closed");
}
