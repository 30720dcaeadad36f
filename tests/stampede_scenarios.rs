//! Integration Tests for Stampede Protection
//!
//! Drives the assembled cache layer through the timelines the refresh
//! strategies are meant to handle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use stampede_guard::{CacheError, CacheLayer, Config, RefreshStrategy, Upstream};
use tokio::time::Instant;

// == Helper Types ==

/// Upstream returning `v{n}` on its n-th call after a fixed latency.
struct SlowSource {
    calls: AtomicU32,
    latency: Duration,
}

impl SlowSource {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            latency,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream<String> for SlowSource {
    async fn fetch(&self, _key: &str) -> anyhow::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;
        Ok(format!("v{n}"))
    }
}

fn config(base_ttl: u64, stale_max_age: u64) -> Config {
    Config {
        base_ttl: Duration::from_secs(base_ttl),
        stale_max_age: Duration::from_secs(stale_max_age),
        ttl_jitter: 0.0,
        default_strategy: "scheduled".to_string(),
        ..Config::default()
    }
}

// == End-to-End Scenario ==

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate_under_burst() {
    let source = SlowSource::new(Duration::from_millis(500));
    let layer: CacheLayer<String> = CacheLayer::from_config(&config(60, 20), source.clone());
    let start = Instant::now();

    assert_eq!(layer.get("cfg:db").await.unwrap(), "v1");

    tokio::time::advance(start + Duration::from_secs(61) - Instant::now()).await;
    let burst_started = Instant::now();
    let reads = (0..50).map(|_| {
        let layer = layer.clone();
        tokio::spawn(async move { layer.get("cfg:db").await })
    });
    let results = join_all(reads).await;

    assert!(burst_started.elapsed() < Duration::from_millis(500));
    for result in results {
        assert_eq!(result.unwrap().unwrap(), "v1");
    }

    tokio::time::sleep_until(start + Duration::from_secs(62)).await;

    let entry = layer.engine().peek("cfg:db").unwrap();
    assert_eq!(entry.value, "v2");
    assert_eq!(entry.ttl, Duration::from_secs(60));
    assert!(!entry.is_expired_at(Instant::now()));

    let stats = layer.stats();
    assert_eq!(source.calls(), 2);
    assert_eq!(stats.background_refreshes, 1);
    assert_eq!(stats.stale_served, 50);
}

#[tokio::test(start_paused = true)]
async fn test_refreshed_ttls_are_jittered() {
    let source = SlowSource::new(Duration::ZERO);
    let config = Config {
        ttl_jitter: 0.1,
        ..config(60, 20)
    };
    let layer: CacheLayer<String> = CacheLayer::from_config(&config, source);

    let mut ttls = Vec::new();
    for n in 0..50 {
        let key = format!("cfg:{n}");
        layer.get(&key).await.unwrap();
        ttls.push(layer.engine().peek(&key).unwrap().ttl);
    }

    assert!(ttls.iter().all(|ttl| *ttl >= Duration::from_secs(54) && *ttl <= Duration::from_secs(66)));
    assert!(ttls.iter().any(|ttl| *ttl != ttls[0]));
}

// == Stale Bound ==

#[tokio::test(start_paused = true)]
async fn test_stale_within_budget_is_served_immediately() {
    let source = SlowSource::new(Duration::from_secs(1));
    let layer: CacheLayer<String> = CacheLayer::from_config(&config(60, 30), source.clone());

    layer.get("cfg:db").await.unwrap();
    tokio::time::advance(Duration::from_secs(60 + 10)).await;

    let started = Instant::now();
    assert_eq!(layer.get("cfg:db").await.unwrap(), "v1");
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(layer.engine().is_refreshing("cfg:db"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_beyond_budget_blocks_on_fetch() {
    let source = SlowSource::new(Duration::from_secs(1));
    let layer: CacheLayer<String> = CacheLayer::from_config(&config(60, 30), source.clone());

    layer.get("cfg:db").await.unwrap();
    tokio::time::advance(Duration::from_secs(60 + 31)).await;

    let started = Instant::now();
    assert_eq!(layer.get("cfg:db").await.unwrap(), "v2");
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(layer.stats().sync_fetches, 1);
}

// == Strict Policy ==

struct Failing;

#[async_trait]
impl Upstream<String> for Failing {
    async fn fetch(&self, key: &str) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(anyhow::anyhow!("connection refused").context(format!("loading {key}")))
    }
}

#[tokio::test(start_paused = true)]
async fn test_strict_caller_receives_upstream_error() {
    let layer: CacheLayer<String> = CacheLayer::from_config(&Config::default(), Arc::new(Failing));
    layer.configure_strategy("cfg:db", RefreshStrategy::Strict);

    let reads = (0..10).map(|_| {
        let layer = layer.clone();
        tokio::spawn(async move { layer.get("cfg:db").await })
    });
    let errors: Vec<CacheError> = join_all(reads)
        .await
        .into_iter()
        .map(|result| result.unwrap().unwrap_err())
        .collect();

    for err in &errors {
        assert_eq!(err, &errors[0]);
        assert!(err.to_string().contains("connection refused"));
    }
    assert_eq!(layer.stats().upstream_fetches, 1);
}
