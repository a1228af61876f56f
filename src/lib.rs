//! # Courier
//!
//! Real-time event delivery for a chat server: every connected client owns an
//! event queue, producers post notices that fan out into those queues, and
//! clients drain them with long-poll requests.
//!
//! ## Features
//!
//! - **Collapsing queues**: pointer, restart and flag updates merge in place
//! - **Long polling**: parked requests resolve on the next event or heartbeat
//! - **Filtering**: event-type allowlists, narrows and firehose realms
//! - **Garbage collection**: idle queues are swept with per-user hooks
//! - **Persistence**: queues survive restarts through a JSON snapshot
//!
//! ## Modules
//!
//! - [`events`]: Queues, descriptors, registry, dispatch and the engine task
//! - [`config`]: TOML configuration with environment overrides
//! - [`api`]: REST API server with Axum
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier::events::{Engine, EngineConfig, Event, FetchOutcome, FetchRequest, Notice};
//! use courier::events::QueueOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (engine, handle) = Engine::new(EngineConfig::default());
//!     engine.spawn();
//!
//!     // A client registers a queue
//!     let queue_id = handle.register(10, 1, QueueOptions::default()).await?;
//!
//!     // A producer notifies the user
//!     let event = Event::new("pointer").with("pointer", 1042);
//!     handle.notify(Notice::Simple { event, users: vec![10] }).await?;
//!
//!     // The client polls
//!     if let FetchOutcome::Immediate { events, .. } =
//!         handle.fetch(FetchRequest::poll(10, queue_id, -1)).await?
//!     {
//!         println!("Received {} events", events.len());
//!     }
//!
//!     // Graceful shutdown
//!     handle.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod events;

// Re-export top-level types for convenience
pub use events::{
    ClientDescriptor, Engine, EngineConfig, EngineError, EngineHandle, EngineResult, Event,
    EventQueue, FetchOutcome, FetchRequest, Notice, QueueId, QueueOptions, Registry,
};

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use config::{
    ApiConfig as ConfigApiConfig, Config, ConfigError, LoggingConfig, PersistenceConfig,
    QueueConfig,
};
