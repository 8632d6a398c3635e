//! Session registry, liveness monitor and session provider tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use devfleet::connection::registry::probe;
use devfleet::connection::{
    ConnectionError, DirectProvider, LivenessMonitor, MonitorConfig, PooledProvider,
    RegistryError, RemoteSession, SessionProvider, SessionRegistry, SessionTarget,
};

fn config() -> MonitorConfig {
    MonitorConfig {
        probe_interval: 1,
        probe_timeout: 1,
    }
}

/// Poll `check` for up to a second; closes happen on background tasks.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_checkout_removes_entry() {
    let registry = SessionRegistry::new();
    let session = MockSession::new("box");
    registry.publish("box", session.clone()).await;
    assert!(registry.contains("box").await);

    let out = registry.checkout("box").await.unwrap();
    assert_eq!(out.identifier(), "box");
    assert!(registry.is_empty().await);
    assert_eq!(
        registry.checkout("box").await.unwrap_err(),
        RegistryError::NotFound("box".into())
    );
}

#[tokio::test]
async fn test_probe_keeps_healthy_sessions() {
    let registry = SessionRegistry::new();
    let a = MockSession::new("a");
    let b = MockSession::new("b");
    registry.publish("a", a.clone()).await;
    registry.publish("b", b.clone()).await;

    let report = registry.probe_cycle(&config()).await;
    assert_eq!(report.probed, 2);
    assert_eq!(report.alive, 2);
    assert!(report.evicted.is_empty());
    assert_eq!(registry.keys().await, vec!["a", "b"]);
    assert_eq!(a.commands_matching("echo").len(), 1);
}

#[tokio::test]
async fn test_probe_evicts_dead_session_and_closes_it_once() {
    let registry = SessionRegistry::new();
    let healthy = MockSession::new("healthy");
    let dead = MockSession::new("dead");
    dead.kill_probe();
    registry.publish("healthy", healthy.clone()).await;
    registry.publish("dead", dead.clone()).await;

    let report = registry.probe_cycle(&config()).await;
    assert_eq!(report.evicted, vec!["dead".to_string()]);
    assert_eq!(registry.keys().await, vec!["healthy"]);
    assert!(eventually(|| dead.close_count() == 1).await);
    assert_eq!(healthy.close_count(), 0);

    // A second cycle no longer sees the evicted session.
    let report = registry.probe_cycle(&config()).await;
    assert!(report.evicted.is_empty());
    assert_eq!(dead.close_calls(), 1);
}

#[tokio::test]
async fn test_non_zero_probe_exit_is_not_death() {
    let registry = SessionRegistry::new();
    let session = MockSession::new("box");
    session.set_probe_exit(127);
    registry.publish("box", session.clone()).await;

    let report = registry.probe_cycle(&config()).await;
    assert_eq!(report.alive, 1);
    assert!(registry.contains("box").await);
    assert_eq!(session.close_count(), 0);
}

#[tokio::test]
async fn test_disconnected_sessions_are_skipped() {
    let registry = SessionRegistry::new();
    let session = MockSession::new("box");
    session.disconnect();
    registry.publish("box", session.clone()).await;

    let report = registry.probe_cycle(&config()).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.probed, 0);
    assert!(session.commands().is_empty());
}

#[tokio::test]
async fn test_publish_replacement_closes_previous() {
    let registry = SessionRegistry::new();
    let old = MockSession::new("box");
    let new = MockSession::new("box");
    registry.publish("box", old.clone()).await;
    registry.publish("box", new.clone()).await;

    // The previous session is closed on a background task.
    assert!(eventually(|| old.close_count() == 1).await);
    assert_eq!(new.close_count(), 0);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_probe_does_not_evict_replaced_entry() {
    let registry = Arc::new(SessionRegistry::new());
    let slow = MockSession::new("a");
    slow.set_probe_delay(Duration::from_millis(100));
    let stale = MockSession::new("b");
    stale.kill_probe();
    stale.set_close_delay(Duration::from_millis(300));
    registry.publish("a", slow.clone()).await;
    registry.publish("b", stale.clone()).await;

    let cycle = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.probe_cycle(&config()).await }
    });

    // Replace "b" while "a" is probed; the running cycle still holds the
    // old "b" from its snapshot and is queued behind this publish.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let fresh = MockSession::new("b-fresh");
    registry.publish("b", fresh.clone()).await;

    let report = cycle.await.unwrap();
    assert_eq!(report.probed, 2);
    assert!(report.evicted.is_empty());
    assert_eq!(
        registry.checkout("b").await.unwrap().identifier(),
        "b-fresh"
    );
    assert_eq!(fresh.close_count(), 0);
    assert!(eventually(|| stale.close_count() == 1).await);
}

#[tokio::test]
async fn test_probe_timeout_is_clamped_to_one_second() {
    let session = MockSession::new("box");
    session.set_probe_delay(Duration::from_secs(5));
    let config = MonitorConfig {
        probe_interval: 60,
        probe_timeout: 0,
    };

    let err = probe(session.as_ref(), &config).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout(1)));
    assert!(err.is_transport_failure());
}

#[tokio::test]
async fn test_close_all_drains() {
    let registry = SessionRegistry::new();
    let a = MockSession::new("a");
    registry.publish("a", a.clone()).await;
    registry.close_all().await;
    assert!(registry.is_empty().await);
    assert_eq!(a.close_count(), 1);
}

#[tokio::test]
async fn test_close_twice_releases_once() {
    let session = MockSession::new("box");
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.close_calls(), 2);
    assert_eq!(session.close_count(), 1);
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_monitor_evicts_in_background() {
    let registry = Arc::new(SessionRegistry::new());
    let dead = MockSession::new("dead");
    dead.kill_probe();
    registry.publish("dead", dead.clone()).await;

    let monitor = LivenessMonitor::start(Arc::clone(&registry), config());
    assert!(monitor.is_running());

    for _ in 0..100 {
        if registry.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.is_empty().await);
    assert!(eventually(|| dead.close_count() == 1).await);

    monitor.stop();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!monitor.is_running());
}

// ============================================================================
// Providers
// ============================================================================

fn target(name: &str) -> SessionTarget {
    SessionTarget::new(name, "10.0.0.1", "dev").home_dir(HOME)
}

#[tokio::test]
async fn test_pooled_provider_reuses_session() {
    let connector = MockConnector::new();
    let session = MockSession::new("box");
    connector.add("box", session.clone());

    let registry = Arc::new(SessionRegistry::new());
    let provider = PooledProvider::new(Arc::clone(&registry), connector.clone());

    let first = provider.acquire(&target("box")).await.unwrap();
    provider.release(first).await;
    assert!(registry.contains("box").await);

    let second = provider.acquire(&target("box")).await.unwrap();
    assert!(!registry.contains("box").await);
    provider.release(second).await;

    assert_eq!(connector.connects().len(), 1);
    assert_eq!(session.close_count(), 0);
}

#[tokio::test]
async fn test_pooled_provider_reopens_disconnected_session() {
    let connector = MockConnector::new();
    let stale = MockSession::new("box");
    let fresh = MockSession::new("box");
    connector.add("box", stale.clone());
    connector.add("box", fresh.clone());

    let registry = Arc::new(SessionRegistry::new());
    let provider = PooledProvider::new(Arc::clone(&registry), connector.clone());

    let session = provider.acquire(&target("box")).await.unwrap();
    provider.release(session).await;
    stale.disconnect();

    let session = provider.acquire(&target("box")).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(connector.connects().len(), 2);
    assert_eq!(stale.close_calls(), 1);
}

#[tokio::test]
async fn test_pooled_provider_closes_dead_session_on_release() {
    let connector = MockConnector::new();
    let session = MockSession::new("box");
    connector.add("box", session.clone());

    let registry = Arc::new(SessionRegistry::new());
    let provider = PooledProvider::new(Arc::clone(&registry), connector);

    let acquired = provider.acquire(&target("box")).await.unwrap();
    session.disconnect();
    provider.release(acquired).await;

    assert!(registry.is_empty().await);
    assert_eq!(session.close_calls(), 1);
}

#[tokio::test]
async fn test_direct_provider_closes_on_release() {
    let connector = MockConnector::new();
    let session = MockSession::new("box");
    connector.add("box", session.clone());

    let provider = DirectProvider::new(connector);
    let acquired = provider.acquire(&target("box")).await.unwrap();
    provider.release(acquired).await;
    assert_eq!(session.close_count(), 1);
}

#[tokio::test]
async fn test_unknown_server_fails_to_connect() {
    let provider = DirectProvider::new(MockConnector::new());
    assert!(provider.acquire(&target("ghost")).await.is_err());
}
