//! Courier Server
//!
//! Run with: cargo run --bin courier [config.toml]
//!
//! Without a config path the default locations are searched (see
//! [`Config::load_default`]). `COURIER_*` environment variables override
//! file settings and `RUST_LOG` overrides the configured log level.

use anyhow::Context;
use courier::api::{serve, ApiConfig, AppState};
use courier::config::{Config, LoggingConfig};
use courier::events::{Engine, LoggingNotifier, MissedMessageHook};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load_with_env(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_default(),
    };

    init_tracing(&config.logging);
    tracing::info!("Starting Courier v{}", env!("CARGO_PKG_VERSION"));

    let engine_config = config.engine_config();
    match &engine_config.snapshot_path {
        Some(path) => tracing::info!("Snapshot path: {:?}", path),
        None => tracing::info!("Persistence disabled, queues will not survive restarts"),
    }

    let (mut engine, handle) = Engine::new(engine_config);
    engine.register_gc_hook(Box::new(MissedMessageHook::new(LoggingNotifier)));
    let restored = engine.restore();
    tracing::info!("Restored {} event queues", restored);
    let engine_task = engine.spawn();

    let api_config = ApiConfig::from(&config.api);
    let state = AppState::new(handle.clone(), api_config.clone());
    let served = serve(state, &api_config).await;

    // serve() stops the engine on a signal; a server error still needs the dump
    if handle.shutdown().await.is_ok() {
        tracing::info!("Event engine stopped");
    }
    engine_task.await.context("event engine task failed")?;
    served?;

    tracing::info!("Courier stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("courier={},tower_http=debug", logging.level))
    });
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
