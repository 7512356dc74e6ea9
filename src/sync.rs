// src/sync.rs
//! Wires the rating cache to the relay for one context.
//!
//! Local writes invalidate or refresh the cache and are published to other
//! contexts; notifications from other contexts are applied to the cache so a
//! later read does not serve a stale value.

use crate::cache::RatingCache;
use crate::config::Config;
use crate::error::SyncError;
use crate::relay::{CrossContextRelay, EventKind, RelayConfig, RelayNotification};
use crate::store::SharedStore;
use crate::utils::now_millis;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingStats {
    pub average: f64,
    pub total: u64,
}

pub struct RatingSync {
    cache: Arc<RatingCache<RatingStats>>,
    relay: CrossContextRelay,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RatingSync {
    pub fn new(cache: RatingCache<RatingStats>, relay: CrossContextRelay) -> Self {
        Self {
            cache: Arc::new(cache),
            relay,
            listener: Mutex::new(None),
        }
    }

    pub async fn from_config(
        config: &Config,
        store: Arc<dyn SharedStore>,
        identity: &dyn SharedStore,
    ) -> Self {
        let relay = CrossContextRelay::new(store, identity, RelayConfig::from(config)).await;
        Self::new(RatingCache::with_default_ttl(config.rating_cache_ttl()), relay)
    }

    pub fn cache(&self) -> &RatingCache<RatingStats> {
        &self.cache
    }

    pub fn relay(&self) -> &CrossContextRelay {
        &self.relay
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayNotification> {
        self.relay.subscribe()
    }

    /// A rating was submitted here; cached stats for the movie are now stale.
    pub async fn record_rating(&self, movie_id: &str, payload: Map<String, Value>) {
        self.cache.invalidate(movie_id);
        self.relay.emit(EventKind::RatingUpdated, movie_id, payload).await;
    }

    /// Fresh stats arrived from the backend; cache them and tell the other contexts.
    pub async fn record_stats(&self, movie_id: &str, stats: RatingStats) {
        self.cache.set(movie_id, stats);
        let payload = match serde_json::to_value(stats) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        self.relay
            .emit(EventKind::RatingStatsUpdated, movie_id, payload)
            .await;
    }

    pub async fn stats_or_fetch<F, Fut>(&self, movie_id: &str, fetch: F) -> Result<RatingStats, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<RatingStats>>,
    {
        self.cache
            .get_or_fetch(movie_id, move || async move { fetch().await.map_err(SyncError::from) })
            .await
    }

    /// Starts relay polling and the task applying remote notifications to the cache.
    pub fn start(&self) {
        {
            let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            if listener.is_none() {
                let rx = self.relay.subscribe();
                let cache = Arc::clone(&self.cache);
                *listener = Some(tokio::spawn(apply_notifications(rx, cache)));
            }
        }
        self.relay.start_polling();
        info!("Rating sync started for context {}", self.relay.origin_id());
    }

    pub fn stop(&self) {
        self.relay.stop_polling();
        if let Some(task) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        info!("Rating sync stopped for context {}", self.relay.origin_id());
    }
}

impl Drop for RatingSync {
    fn drop(&mut self) {
        if let Some(task) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn apply_notifications(
    mut rx: broadcast::Receiver<RelayNotification>,
    cache: Arc<RatingCache<RatingStats>>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => apply_notification(&cache, &notification),
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    "Rating sync missed {} notifications, clearing cached stats",
                    skipped
                );
                cache.clear();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn apply_notification(cache: &RatingCache<RatingStats>, notification: &RelayNotification) {
    let movie_id = notification.detail.movie_id.as_str();
    match notification.kind {
        EventKind::RatingStatsUpdated => match notification.detail.payload_as::<RatingStats>() {
            Ok(stats) => {
                // A replayed event keeps only the TTL left since it was emitted.
                let age_ms = now_millis().saturating_sub(notification.detail.timestamp);
                let age = Duration::from_millis(age_ms);
                match cache.default_ttl().checked_sub(age) {
                    Some(remaining) if !remaining.is_zero() => {
                        debug!("Applying remote stats for movie {}: {:?}", movie_id, stats);
                        cache.set_with_ttl(movie_id, stats, remaining);
                    }
                    _ => {
                        debug!("Remote stats for movie {} are {:?} old, invalidating", movie_id, age);
                        cache.invalidate(movie_id);
                    }
                }
            }
            Err(e) => {
                debug!("Remote stats for movie {} unreadable ({}), invalidating", movie_id, e);
                cache.invalidate(movie_id);
            }
        },
        EventKind::RatingUpdated => {
            cache.invalidate(movie_id);
        }
    }
}
