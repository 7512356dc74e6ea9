// src/relay/mod.rs
//! Polling publish/subscribe relay between execution contexts that share
//! nothing but a key-value store.
//!
//! Every context appends its events to one capped JSON log in the shared
//! store and periodically re-reads that log, dispatching events it has not
//! seen yet (and did not emit itself) on a local broadcast channel. Delivery
//! is best effort: an event that scrolls out of the capped log before a
//! context polls is never seen by that context.

pub mod types;

pub use types::{
    decode_log, EventKind, NotificationDetail, RelayEvent, RelayMetrics, RelayNotification,
    RelayStatus, NOTIFICATION_SOURCE,
};

use crate::config::Config;
use crate::error::SyncError;
use crate::store::SharedStore;
use crate::utils::generate_origin_id;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Identity store key holding a context's persisted origin id.
pub const ORIGIN_ID_KEY: &str = "browser-id";
/// Shared store key holding the JSON-encoded event log.
pub const EVENT_LOG_KEY: &str = "cross-browser-events";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub log_capacity: usize,
    /// Read/append/compare-and-set rounds before an emit gives up on a contended log.
    pub emit_max_attempts: u32,
    pub channel_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            log_capacity: DEFAULT_LOG_CAPACITY,
            emit_max_attempts: 3,
            channel_size: 256,
        }
    }
}

impl From<&Config> for RelayConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.relay_poll_interval(),
            log_capacity: config.relay_log_capacity,
            emit_max_attempts: config.relay_emit_max_attempts,
            channel_size: config.relay_channel_size,
        }
    }
}

/// Newest processed timestamp plus the ids already processed at exactly that
/// timestamp, so same-millisecond events are neither lost nor repeated.
#[derive(Debug, Default)]
struct Watermark {
    emitted_at: u64,
    ids_at_watermark: HashSet<String>,
}

impl Watermark {
    fn is_unseen(&self, event: &RelayEvent) -> bool {
        if event.emitted_at != self.emitted_at {
            return event.emitted_at > self.emitted_at;
        }
        !event.id.is_empty() && !self.ids_at_watermark.contains(&event.id)
    }

    fn advance(&mut self, event: &RelayEvent) {
        if event.emitted_at > self.emitted_at {
            self.emitted_at = event.emitted_at;
            self.ids_at_watermark.clear();
        }
        if event.emitted_at == self.emitted_at && !event.id.is_empty() {
            self.ids_at_watermark.insert(event.id.clone());
        }
    }
}

#[derive(Debug, Default)]
struct RelayCounters {
    events_emitted: AtomicU64,
    publish_failures: AtomicU64,
    notifications_dispatched: AtomicU64,
    poll_failures: AtomicU64,
}

struct RelayInner {
    store: Arc<dyn SharedStore>,
    origin_id: String,
    config: RelayConfig,
    watermark: Mutex<Watermark>,
    notifications: broadcast::Sender<RelayNotification>,
    is_polling: AtomicBool,
    counters: RelayCounters,
}

impl RelayInner {
    async fn append_event(&self, event: &RelayEvent) -> Result<(), SyncError> {
        let max_attempts = self.config.emit_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_append(event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.should_retry() && attempt < max_attempts => {
                    debug!("Relay append attempt {}/{} lost a race: {}", attempt, max_attempts, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_append(&self, event: &RelayEvent) -> Result<(), SyncError> {
        let current = self.store.get(EVENT_LOG_KEY).await?;
        let mut events = match current.as_deref() {
            Some(raw) => decode_log(raw).unwrap_or_else(|e| {
                warn!("Relay log is unreadable, replacing it: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        events.push(event.clone());
        if events.len() > self.config.log_capacity {
            let overflow = events.len() - self.config.log_capacity;
            events.drain(..overflow);
        }

        let encoded = serde_json::to_string(&events)?;
        if self
            .store
            .compare_and_set(EVENT_LOG_KEY, current.as_deref(), &encoded)
            .await?
        {
            Ok(())
        } else {
            Err(SyncError::ConflictError(
                "relay log changed between read and write".to_string(),
            ))
        }
    }

    async fn poll_once(&self) -> usize {
        let raw = match self.store.get(EVENT_LOG_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                self.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Relay poll could not read the shared log: {}", e);
                return 0;
            }
        };
        let events = match decode_log(&raw) {
            Ok(events) => events,
            Err(e) => {
                self.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Relay poll skipped, {}", e);
                return 0;
            }
        };

        self.dispatch_unseen(events)
    }

    /// Filters out own and already seen events, then broadcasts the rest in
    /// `emitted_at` order. The watermark lock is held until the last send so
    /// two concurrent ticks cannot interleave their dispatches.
    fn dispatch_unseen(&self, events: Vec<RelayEvent>) -> usize {
        let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        let mut fresh: Vec<RelayEvent> = events
            .into_iter()
            .filter(|event| event.origin_id != self.origin_id)
            .filter(|event| watermark.is_unseen(event))
            .collect();
        fresh.sort_by_key(|event| event.emitted_at);
        fresh.dedup_by(|a, b| !a.id.is_empty() && a.id == b.id);
        for event in &fresh {
            watermark.advance(event);
            debug!(
                "Relay dispatching {} for movie {} from {}",
                event.kind, event.subject_id, event.origin_id
            );
            // No receivers is fine, the event is still consumed.
            let _ = self.notifications.send(RelayNotification::from(event));
        }
        self.counters
            .notifications_dispatched
            .fetch_add(fresh.len() as u64, Ordering::Relaxed);
        fresh.len()
    }
}

/// One context's view of the relay. Construct once per context and share it
/// by `Arc`; polling stops when it is dropped.
pub struct CrossContextRelay {
    inner: Arc<RelayInner>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CrossContextRelay {
    /// Resolves this context's origin id from `identity` (generating and
    /// persisting one on first use) and attaches to the log in `store`.
    pub async fn new(
        store: Arc<dyn SharedStore>,
        identity: &dyn SharedStore,
        config: RelayConfig,
    ) -> Self {
        let origin_id = resolve_origin_id(identity).await;
        Self::with_origin_id(store, origin_id, config)
    }

    pub fn with_origin_id(
        store: Arc<dyn SharedStore>,
        origin_id: impl Into<String>,
        config: RelayConfig,
    ) -> Self {
        let origin_id = origin_id.into();
        let (notifications, _) = broadcast::channel(config.channel_size.max(1));
        info!(
            "Relay context {} attached to {} store (poll every {:?}, log capacity {})",
            origin_id,
            store.backend_name(),
            config.poll_interval,
            config.log_capacity
        );
        Self {
            inner: Arc::new(RelayInner {
                store,
                origin_id,
                config,
                watermark: Mutex::new(Watermark::default()),
                notifications,
                is_polling: AtomicBool::new(false),
                counters: RelayCounters::default(),
            }),
            poll_handle: Mutex::new(None),
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.inner.origin_id
    }

    /// Publishes an event to every other context. Failures are logged, never returned.
    pub async fn emit(&self, kind: EventKind, subject_id: &str, payload: Map<String, Value>) {
        let event = RelayEvent::new(kind, subject_id, payload, self.inner.origin_id.as_str());
        match self.inner.append_event(&event).await {
            Ok(()) => {
                self.inner.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
                debug!("Relay emitted {} for movie {} ({})", kind, subject_id, event.id);
            }
            Err(e) => {
                self.inner.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Relay failed to publish {} for movie {}: {}", kind, subject_id, e);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayNotification> {
        self.inner.notifications.subscribe()
    }

    /// Runs a single poll tick and returns how many notifications it dispatched.
    pub async fn poll_once(&self) -> usize {
        self.inner.poll_once().await
    }

    /// Spawns the polling task. Must be called within a Tokio runtime; a
    /// second call while polling is a no-op.
    pub fn start_polling(&self) {
        let mut handle = self.poll_handle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.inner.is_polling.swap(true, Ordering::SeqCst) {
            debug!("Relay {} is already polling", self.inner.origin_id);
            return;
        }

        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(inner.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.poll_once().await;
            }
        }));
        info!(
            "Relay {} started polling every {:?}",
            self.inner.origin_id, self.inner.config.poll_interval
        );
    }

    pub fn stop_polling(&self) {
        let mut handle = self.poll_handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = handle.take() {
            task.abort();
            info!("Relay {} stopped polling", self.inner.origin_id);
        }
        self.inner.is_polling.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            origin_id: self.inner.origin_id.clone(),
            is_polling: self.inner.is_polling.load(Ordering::SeqCst),
            poll_interval: self.inner.config.poll_interval,
        }
    }

    pub fn metrics(&self) -> RelayMetrics {
        let counters = &self.inner.counters;
        RelayMetrics {
            events_emitted: counters.events_emitted.load(Ordering::Relaxed),
            publish_failures: counters.publish_failures.load(Ordering::Relaxed),
            notifications_dispatched: counters.notifications_dispatched.load(Ordering::Relaxed),
            poll_failures: counters.poll_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CrossContextRelay {
    fn drop(&mut self) {
        if let Some(task) = self
            .poll_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Reads the persisted origin id, or generates one and tries to persist it.
/// Store failures fall back to an in-memory id for this process.
async fn resolve_origin_id(identity: &dyn SharedStore) -> String {
    match identity.get(ORIGIN_ID_KEY).await {
        Ok(Some(existing)) if !existing.is_empty() => return existing,
        Ok(_) => {}
        Err(e) => {
            warn!("Could not read persisted origin id, using a transient one: {}", e);
            return generate_origin_id();
        }
    }

    let generated = generate_origin_id();
    match identity.compare_and_set(ORIGIN_ID_KEY, None, &generated).await {
        Ok(true) => {
            info!("Generated new relay origin id {}", generated);
            generated
        }
        // Someone persisted an id first; adopt it.
        Ok(false) => match identity.get(ORIGIN_ID_KEY).await {
            Ok(Some(existing)) if !existing.is_empty() => existing,
            _ => generated,
        },
        Err(e) => {
            warn!("Could not persist origin id {}, using it for this process only: {}", generated, e);
            generated
        }
    }
}
