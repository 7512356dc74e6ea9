use reel_sync::relay::{decode_log, CrossContextRelay, EventKind, RelayConfig, EVENT_LOG_KEY};
use reel_sync::store::{MemoryStore, SharedStore};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        poll_interval: Duration::from_millis(20),
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn polling_context_receives_other_contexts_event() {
    let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = CrossContextRelay::with_origin_id(shared.clone(), "A", fast_config());
    let b = CrossContextRelay::with_origin_id(shared, "B", fast_config());

    a.emit(EventKind::RatingUpdated, "m1", payload(json!({"avg": 5}))).await;

    let mut rx = b.subscribe();
    b.start_polling();
    let notification = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("notification within one interval")
        .expect("channel open");
    b.stop_polling();

    assert_eq!(notification.kind, EventKind::RatingUpdated);
    let detail = serde_json::to_value(&notification.detail).unwrap();
    assert_eq!(detail["movieId"], "m1");
    assert_eq!(detail["avg"], 5);
    assert_eq!(detail["browserId"], "A");
    assert_eq!(detail["source"], "cross-browser");
}

#[tokio::test]
async fn events_emitted_while_polling_arrive_and_never_loop_back() {
    let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = CrossContextRelay::with_origin_id(shared.clone(), "A", fast_config());
    let b = CrossContextRelay::with_origin_id(shared, "B", fast_config());
    let mut a_rx = a.subscribe();
    let mut b_rx = b.subscribe();
    a.start_polling();
    b.start_polling();

    a.emit(EventKind::RatingStatsUpdated, "m2", payload(json!({"average": 3.5, "total": 4})))
        .await;
    b.emit(EventKind::RatingUpdated, "m3", Map::new()).await;

    let at_b = timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
    let at_a = timeout(Duration::from_secs(1), a_rx.recv()).await.unwrap().unwrap();
    assert_eq!(at_b.detail.movie_id, "m2");
    assert_eq!(at_b.detail.browser_id, "A");
    assert_eq!(at_a.detail.movie_id, "m3");
    assert_eq!(at_a.detail.browser_id, "B");

    // A few more ticks: nothing else, in particular no self-echo.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a_rx.try_recv().is_err());
    assert!(b_rx.try_recv().is_err());

    a.stop_polling();
    b.stop_polling();
}

#[tokio::test]
async fn log_never_exceeds_capacity() {
    let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let relay = CrossContextRelay::with_origin_id(shared.clone(), "A", RelayConfig::default());
    for i in 0..75 {
        relay
            .emit(EventKind::RatingUpdated, &format!("m{}", i), Map::new())
            .await;
        let raw = shared.get(EVENT_LOG_KEY).await.unwrap().unwrap();
        assert!(decode_log(&raw).unwrap().len() <= 50);
    }
    let raw = shared.get(EVENT_LOG_KEY).await.unwrap().unwrap();
    let events = decode_log(&raw).unwrap();
    assert_eq!(events.len(), 50);
    assert_eq!(events[0].subject_id, "m25");
    assert_eq!(events[49].subject_id, "m74");
}

#[tokio::test]
async fn late_poller_misses_events_that_scrolled_out() {
    let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let config = RelayConfig {
        log_capacity: 3,
        ..fast_config()
    };
    let a = CrossContextRelay::with_origin_id(shared.clone(), "A", config.clone());
    for i in 0..5 {
        a.emit(EventKind::RatingUpdated, &format!("m{}", i), Map::new()).await;
    }

    let b = CrossContextRelay::with_origin_id(shared, "B", config);
    let mut rx = b.subscribe();
    assert_eq!(b.poll_once().await, 3);
    let seen: Vec<String> = (0..3).map(|_| rx.try_recv().unwrap().detail.movie_id).collect();
    assert_eq!(seen, vec!["m2", "m3", "m4"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emitters_do_not_lose_events() {
    let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let config = RelayConfig {
        log_capacity: 100,
        emit_max_attempts: 1_000,
        ..RelayConfig::default()
    };

    let mut tasks = Vec::new();
    for context in 0..4 {
        let relay = Arc::new(CrossContextRelay::with_origin_id(
            shared.clone(),
            format!("ctx-{}", context),
            config.clone(),
        ));
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                relay
                    .emit(EventKind::RatingUpdated, &format!("m{}", i), Map::new())
                    .await;
            }
            relay.metrics()
        }));
    }
    for task in tasks {
        let metrics = task.await.unwrap();
        assert_eq!(metrics.events_emitted, 10);
        assert_eq!(metrics.publish_failures, 0);
    }

    let raw = shared.get(EVENT_LOG_KEY).await.unwrap().unwrap();
    let ids: HashSet<String> = decode_log(&raw).unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(ids.len(), 40);
}

#[tokio::test]
async fn contexts_with_their_own_identity_store_see_each_other() {
    let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a_profile = MemoryStore::new();
    let b_profile = MemoryStore::new();
    let a = CrossContextRelay::new(shared.clone(), &a_profile, fast_config()).await;
    let b = CrossContextRelay::new(shared, &b_profile, fast_config()).await;
    assert_ne!(a.origin_id(), b.origin_id());

    let mut rx = b.subscribe();
    a.emit(EventKind::RatingUpdated, "m1", Map::new()).await;
    assert_eq!(b.poll_once().await, 1);
    assert_eq!(rx.try_recv().unwrap().detail.browser_id, a.origin_id());
}
