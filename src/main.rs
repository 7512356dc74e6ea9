// src/main.rs
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use reel_sync::{
    config::{load_config, Config},
    relay::{CrossContextRelay, EventKind, RelayConfig},
    store::{FileStore, MemoryStore, RedisStore, SharedStore},
    utils::setup_logging,
};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "reel-sync", version, about = "Publish and watch rating events shared between contexts")]
struct Cli {
    /// Use a throwaway in-process store instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    /// File keeping this context's identity across runs
    #[arg(long, global = true, default_value = ".reel-sync/profile.json")]
    profile: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append one event to the shared log
    Emit {
        #[arg(long)]
        kind: EventKind,
        #[arg(long)]
        movie: String,
        /// JSON object merged into the notification other contexts receive
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Poll the shared log and print notifications until Ctrl-C
    Watch {
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Print this context's relay status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenv::dotenv().ok();
    setup_logging(Config::from_env().log_level_filter()).context("Failed to initialize logging")?;
    let config = load_config()?;

    let store: Arc<dyn SharedStore> = if cli.memory {
        warn!("Using an in-process store; other processes will not see these events");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::new(&config.redis_url, &config.namespace).await?)
    };
    let identity = FileStore::new(cli.profile.clone());

    let mut relay_config = RelayConfig::from(config.as_ref());
    if let Command::Watch {
        interval_ms: Some(ms),
    } = &cli.command
    {
        if *ms == 0 {
            bail!("--interval-ms must be greater than zero");
        }
        relay_config.poll_interval = Duration::from_millis(*ms);
    }
    let relay = CrossContextRelay::new(store, &identity, relay_config).await;

    match cli.command {
        Command::Emit {
            kind,
            movie,
            payload,
        } => {
            let payload: Map<String, Value> =
                serde_json::from_str(&payload).context("--payload must be a JSON object")?;
            relay.emit(kind, &movie, payload).await;
            if relay.metrics().publish_failures > 0 {
                bail!("Event {} for movie {} was not published, see log", kind, movie);
            }
            info!("Published {} for movie {}", kind, movie);
        }
        Command::Watch { .. } => {
            let mut rx = relay.subscribe();
            relay.start_polling();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(notification) => {
                            println!("{}", json!({"kind": notification.kind, "detail": notification.detail}));
                        }
                        Err(RecvError::Lagged(skipped)) => warn!("Watcher fell behind, {} notifications skipped", skipped),
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl-C received, stopping");
                        break;
                    }
                }
            }
            relay.stop_polling();
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&relay.status())?);
        }
    }

    Ok(())
}
