//! Client-side rating synchronization: a TTL cache for rating statistics and
//! a polling relay that lets independent contexts see each other's rating
//! changes through a shared key-value store.

pub mod cache;
pub mod config;
pub mod error;
pub mod relay;
pub mod store;
pub mod sync;
pub mod utils;

pub use cache::{CacheStats, RatingCache, DEFAULT_RATING_TTL};
pub use error::SyncError;
pub use relay::{
    CrossContextRelay, EventKind, NotificationDetail, RelayConfig, RelayEvent, RelayNotification,
    RelayStatus,
};
pub use store::{FileStore, MemoryStore, RedisStore, SharedStore};
pub use sync::{RatingStats, RatingSync};
