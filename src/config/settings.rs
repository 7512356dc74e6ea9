use std::env;
use std::time::Duration;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub namespace: String,
    pub rating_cache_ttl_secs: u64,
    pub relay_poll_interval_ms: u64,
    pub relay_log_capacity: usize,
    pub relay_emit_max_attempts: u32,
    pub relay_channel_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost".to_string(),
            namespace: "reel-sync".to_string(),
            rating_cache_ttl_secs: 300,
            relay_poll_interval_ms: 2000,
            relay_log_capacity: 50,
            relay_emit_max_attempts: 3,
            relay_channel_size: 256,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            namespace: env::var("REEL_SYNC_NAMESPACE").unwrap_or(defaults.namespace),
            rating_cache_ttl_secs: env::var("RATING_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rating_cache_ttl_secs),
            relay_poll_interval_ms: env::var("RELAY_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.relay_poll_interval_ms),
            relay_log_capacity: env::var("RELAY_LOG_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.relay_log_capacity),
            relay_emit_max_attempts: env::var("RELAY_EMIT_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.relay_emit_max_attempts),
            relay_channel_size: env::var("RELAY_CHANNEL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.relay_channel_size),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.redis_url.is_empty() {
            return Err(SyncError::ConfigError("REDIS_URL cannot be empty".to_string()));
        }
        if self.relay_poll_interval_ms == 0 {
            return Err(SyncError::ConfigError(
                "RELAY_POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        if self.relay_log_capacity == 0 {
            return Err(SyncError::ConfigError(
                "RELAY_LOG_CAPACITY must be greater than zero".to_string(),
            ));
        }
        if self.relay_emit_max_attempts == 0 {
            return Err(SyncError::ConfigError(
                "RELAY_EMIT_MAX_ATTEMPTS must be greater than zero".to_string(),
            ));
        }
        if self.relay_channel_size == 0 {
            return Err(SyncError::ConfigError(
                "RELAY_CHANNEL_SIZE must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_and_log(&self) -> Result<(), SyncError> {
        self.validate()?;
        log::info!("Application Configuration Loaded: {:?}", self);
        Ok(())
    }

    pub fn rating_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rating_cache_ttl_secs)
    }

    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_interval_ms)
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rating_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.relay_poll_interval(), Duration::from_millis(2000));
        assert_eq!(config.relay_log_capacity, 50);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = Config {
            relay_log_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::ConfigError(_))));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config {
            relay_poll_interval_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::ConfigError(_))));
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = Config {
            log_level: "chatty".to_string(),
            ..Config::default()
        };
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
        let config = Config {
            log_level: "debug".to_string(),
            ..Config::default()
        };
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
    }
}
