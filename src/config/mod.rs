pub mod settings;

pub use settings::Config;

use crate::error::SyncError;
use std::sync::Arc;

/// Loads `.env` (if present) and the process environment into a validated `Config`.
pub fn load_config() -> Result<Arc<Config>, SyncError> {
    dotenv::dotenv().ok(); // Load .env file if present, ignore errors

    let config = Config::from_env();
    config.validate_and_log()?;

    Ok(Arc::new(config))
}
