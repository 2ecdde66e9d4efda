//! Client pool lifecycle against the in-memory store

use cmis_store::core::{Config, Error};
use cmis_store::storage::{ClientPool, MemoryConnector, Phase};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config() -> Config {
    let mut config = Config::default();
    config.pool.repositories = vec!["bedroom".to_string(), "canopy".to_string()];
    config
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_retries_three_times_then_fails() {
    let connector = MemoryConnector::new();
    connector.set_unreachable(true);
    let pool = ClientPool::with_connector(config(), Arc::new(connector.clone()));

    let started = Instant::now();
    let err = pool.initialize().await.unwrap_err();

    assert_eq!(connector.ping_attempts(), 3);
    // two waits between three attempts, none after the last
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    match err {
        Error::Initialization { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected initialization error, got {:?}", other),
    }
    assert!(!pool.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn recorded_failure_is_returned_without_new_attempts() {
    let connector = MemoryConnector::new();
    connector.set_unreachable(true);
    let pool = ClientPool::with_connector(config(), Arc::new(connector.clone()));
    pool.initialize().await.unwrap_err();

    connector.set_unreachable(false);
    let err = pool.get_handle("bedroom").await.unwrap_err();
    assert!(matches!(err, Error::Initialization { attempts: 3, .. }));
    assert_eq!(connector.ping_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_outage_recovers_within_budget() {
    let connector = MemoryConnector::new();
    connector.fail_next_pings(2);
    let pool = ClientPool::with_connector(config(), Arc::new(connector.clone()));

    let started = Instant::now();
    pool.initialize().await.unwrap();

    assert_eq!(connector.ping_attempts(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    assert_eq!(pool.handle_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn configured_retry_budget_is_honored() {
    let mut config = config();
    config.pool.init_max_attempts = 5;
    config.pool.init_retry_delay = Duration::from_millis(250);
    let connector = MemoryConnector::new();
    connector.set_unreachable(true);
    let pool = ClientPool::with_connector(config, Arc::new(connector.clone()));

    let started = Instant::now();
    pool.initialize().await.unwrap_err();
    assert_eq!(connector.ping_attempts(), 5);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_initialization() {
    let connector = MemoryConnector::with_databases(["nemaki_conf", "bedroom", "canopy"]);
    let pool = Arc::new(ClientPool::with_connector(config(), Arc::new(connector.clone())));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let pool = pool.clone();
        let id = if i % 2 == 0 { "bedroom" } else { "canopy_closet" };
        tasks.push(tokio::spawn(async move { pool.get_handle(id).await }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(connector.ping_attempts(), 1);
    assert_eq!(pool.handle_count(), 5);
    let first = &handles[0];
    assert!(handles
        .iter()
        .step_by(2)
        .all(|handle| Arc::ptr_eq(handle, first)));
}

#[tokio::test]
async fn handles_follow_the_pool_phase() {
    let pool = ClientPool::with_connector(config(), Arc::new(MemoryConnector::new()));
    let bedroom = pool.get_handle("bedroom").await.unwrap();

    // bootstrap: reads against a missing database are absorbed
    assert_eq!(bedroom.phase(), Phase::Bootstrap);
    assert!(bedroom.get_tolerant("anything").await.unwrap().is_none());
    assert!(bedroom.absorb(bedroom.get("anything").await).unwrap().is_none());

    pool.mark_ready();
    assert_eq!(bedroom.phase(), Phase::Ready);
    let err = bedroom.get_tolerant("anything").await.unwrap_err();
    assert!(err.is_not_found());
}
