//! Integration Tests for the Watch Service
//!
//! Covers revision-cursor semantics, long-poll timeouts, the JSON contract
//! and a peer cache following another node's changes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use stampede_guard::models::{WatchRequest, WatchResponse};
use stampede_guard::watch::{ChangeFeed, WatchConfig};
use stampede_guard::{CacheError, CacheLayer, Config, Metrics, Revision, Upstream, WatchService};
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready_eq};

fn service() -> WatchService {
    WatchService::new(WatchConfig::default(), Arc::new(Metrics::new()))
}

// == Cursor Semantics ==

#[tokio::test(start_paused = true)]
async fn test_earlier_change_resolves_immediately() {
    let watch = service();
    watch.commit(["/cfg/db"]);
    watch.commit(["/users/1"]);

    let subscription = watch.subscribe(Revision::INIT, "/cfg/**", None).unwrap();
    assert!(subscription.is_immediate());
    assert_eq!(subscription.await, Ok(Revision(1)));
    assert_eq!(watch.registry_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_watch_at_head_waits_for_next_commit() {
    let watch = service();
    let head = watch.commit(["/cfg/db"]);

    let mut subscription = tokio_test::task::spawn(watch.subscribe(head, "/cfg/**", None).unwrap());
    assert_pending!(subscription.poll());
    assert_eq!(watch.registry_size(), 1);

    watch.commit(["/users/1"]);
    assert_pending!(subscription.poll());

    let next = watch.commit(["/cfg/cache"]);
    assert!(subscription.is_woken());
    assert_ready_eq!(subscription.poll(), Ok(next));
    assert_eq!(watch.registry_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_commit_wakes_every_matching_watcher() {
    let watch = service();
    let waiters: Vec<_> = (0..5)
        .map(|_| watch.subscribe(Revision::INIT, "/cfg/*", None).unwrap())
        .collect();
    let other = watch.subscribe(Revision::INIT, "/users/*", None).unwrap();
    assert_eq!(watch.registry_size(), 6);
    assert_eq!(watch.pattern_count(), 2);

    let revision = watch.commit(["/cfg/db"]);
    for waiter in waiters {
        assert_eq!(waiter.await, Ok(revision));
    }
    assert_eq!(watch.registry_size(), 1);
    assert!(other.cancel());
    assert_eq!(watch.registry_size(), 0);
}

// == Timeouts ==

#[tokio::test(start_paused = true)]
async fn test_jittered_timeout_resolves_not_modified() {
    let watch = service();
    let started = Instant::now();

    let outcome = watch
        .watch(Revision::INIT, "/cfg/**", Some(Duration::from_secs(10)))
        .await;

    let waited = started.elapsed();
    assert!(matches!(outcome, Err(CacheError::WatchTimeout { .. })));
    assert!(waited >= Duration::from_secs(8) && waited <= Duration::from_secs(12), "waited {waited:?}");
    assert_eq!(watch.registry_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_watches() {
    let watch = service();
    let pending = watch.subscribe(Revision::INIT, "/cfg/**", None).unwrap();

    watch.close();
    assert_eq!(pending.await, Err(CacheError::WatchCancelled));
}

// == Long-Poll Contract ==

#[tokio::test(start_paused = true)]
async fn test_long_poll_json_contract() {
    let watch = service();
    watch.commit(["/cfg/db", "/users/1"]);

    let request: WatchRequest =
        serde_json::from_value(json!({"last_known_revision": 0, "pattern": "/cfg/**"})).unwrap();
    let response = watch.long_poll(&request).await.unwrap();
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({"status": "changed", "revision": 1, "paths": ["/cfg/db"]})
    );

    let request: WatchRequest = serde_json::from_value(
        json!({"last_known_revision": 1, "pattern": "/cfg/**", "timeout_ms": 1000}),
    )
    .unwrap();
    let response = watch.long_poll(&request).await.unwrap();
    assert_eq!(response, WatchResponse::NotModified { revision: Revision(1) });
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({"status": "not_modified", "revision": 1})
    );
}

#[tokio::test(start_paused = true)]
async fn test_long_poll_rejects_bad_requests() {
    let watch = service();

    let too_long: WatchRequest =
        serde_json::from_value(json!({"pattern": "/cfg/**", "timeout_ms": 3_600_000})).unwrap();
    assert!(matches!(
        watch.long_poll(&too_long).await,
        Err(CacheError::InvalidRequest(_))
    ));

    let bad_glob: WatchRequest = serde_json::from_value(json!({"pattern": "/cfg/[db"})).unwrap();
    assert!(matches!(
        watch.long_poll(&bad_glob).await,
        Err(CacheError::InvalidPattern { .. })
    ));
}

// == Peer Caches ==

/// Upstream reading a value both nodes share.
struct SharedDatabase(Mutex<String>);

impl SharedDatabase {
    fn set(&self, value: &str) {
        *self.0.lock().unwrap() = value.to_string();
    }
}

#[async_trait]
impl Upstream<String> for SharedDatabase {
    async fn fetch(&self, _key: &str) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.0.lock().unwrap().clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_peer_refreshes_after_publisher_change() {
    let database = Arc::new(SharedDatabase(Mutex::new("v1".to_string())));
    let config = Config {
        ttl_jitter: 0.0,
        ..Config::default()
    };
    let node_a: CacheLayer<String> = CacheLayer::from_config(&config, database.clone());
    let node_b: CacheLayer<String> = CacheLayer::from_config(&config, database.clone());

    assert_eq!(node_a.get("cfg:db").await.unwrap(), "v1");
    assert_eq!(node_b.get("cfg:db").await.unwrap(), "v1");

    let feed: Arc<dyn ChangeFeed> = Arc::new(node_a.watch().clone());
    let subscriber = node_b.spawn_subscriber(feed, "cfg:*");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(node_a.watch().registry_size(), 1);

    database.set("v2");
    assert_eq!(node_a.refresh("cfg:db").await.unwrap(), "v2");
    assert_eq!(node_a.watch().head(), Revision(1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node_b.engine().peek("cfg:db").unwrap().value, "v2");

    subscriber.abort();
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_refresh_publishes_nothing() {
    let database = Arc::new(SharedDatabase(Mutex::new("v1".to_string())));
    let node: CacheLayer<String> = CacheLayer::from_config(&Config::default(), database);

    node.get("cfg:db").await.unwrap();
    node.refresh("cfg:db").await.unwrap();

    assert_eq!(node.watch().head(), Revision::INIT);
}

/// Upstream that reads the value first and then takes `latency` to answer.
struct SnapshotDatabase {
    value: Mutex<String>,
    latency: Mutex<Duration>,
}

impl SnapshotDatabase {
    fn new(value: &str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value.to_string()),
            latency: Mutex::new(latency),
        })
    }

    fn set(&self, value: &str, latency: Duration) {
        *self.value.lock().unwrap() = value.to_string();
        *self.latency.lock().unwrap() = latency;
    }
}

#[async_trait]
impl Upstream<String> for SnapshotDatabase {
    async fn fetch(&self, _key: &str) -> anyhow::Result<String> {
        let value = self.value.lock().unwrap().clone();
        let latency = *self.latency.lock().unwrap();
        tokio::time::sleep(latency).await;
        Ok(value)
    }
}

#[tokio::test(start_paused = true)]
async fn test_change_during_slow_fetch_is_not_overwritten() {
    let database = SnapshotDatabase::new("v1", Duration::from_millis(100));
    let config = Config {
        ttl_jitter: 0.0,
        ..Config::default()
    };
    let node_a: CacheLayer<String> = CacheLayer::from_config(&config, database.clone());
    let node_b: CacheLayer<String> = CacheLayer::from_config(&config, database.clone());
    node_a.get("cfg:db").await.unwrap();
    node_b.get("cfg:db").await.unwrap();

    let feed: Arc<dyn ChangeFeed> = Arc::new(node_a.watch().clone());
    let subscriber = node_b.spawn_subscriber(feed, "cfg:*");
    tokio::time::sleep(Duration::from_millis(10)).await;

    // node_b starts a slow refresh that reads "v1" before the change lands.
    database.set("v1", Duration::from_secs(2));
    let slow = {
        let node_b = node_b.engine().clone();
        tokio::spawn(async move { node_b.refresh("cfg:db").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    database.set("v2", Duration::from_millis(100));
    assert_eq!(node_a.refresh("cfg:db").await.unwrap(), "v2");
    assert_eq!(node_a.watch().head(), Revision(1));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node_b.engine().peek("cfg:db").unwrap().value, "v2");

    // The slow fetch still answers its caller but does not store "v1".
    assert_eq!(slow.await.unwrap().unwrap(), "v1");
    assert_eq!(node_b.engine().peek("cfg:db").unwrap().value, "v2");

    subscriber.abort();
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_during_slow_fetch_stays_invalidated() {
    let database = SnapshotDatabase::new("v1", Duration::from_millis(100));
    let node: CacheLayer<String> = CacheLayer::from_config(&Config::default(), database.clone());
    node.get("cfg:db").await.unwrap();

    database.set("v1", Duration::from_secs(1));
    let slow = {
        let engine = node.engine().clone();
        tokio::spawn(async move { engine.refresh("cfg:db").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    node.invalidate("cfg:db").unwrap();
    assert_eq!(slow.await.unwrap().unwrap(), "v1");

    assert!(node.engine().peek("cfg:db").is_none());
    assert_eq!(node.watch().head(), Revision(1));
}
