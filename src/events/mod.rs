//! Courier Event Engine
//!
//! This module provides per-client event queues and their delivery:
//!
//! - **event**: Event records and the collapse table
//! - **queue**: Prunable per-client event log with collapsing
//! - **narrow**: Narrow predicates for message events
//! - **descriptor**: Client descriptors, transports and heartbeat timers
//! - **registry**: Indices over live descriptors, long-poll fetch
//! - **dispatch**: Fan-out of producer notices
//! - **gc**: Idle queue collection and GC hooks
//! - **persistence**: Snapshot dump and restore
//! - **engine**: The task that owns the registry
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Producer:  notice → EngineHandle → Engine task → Registry::dispatch → queues
//! Consumer:  long-poll → EngineHandle → Registry::fetch → Immediate | Parked
//! Timers:    heartbeat task → Command::Heartbeat → Engine task
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use courier::events::{Engine, EngineConfig, Event, FetchOutcome, FetchRequest, Notice, QueueOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (engine, handle) = Engine::new(EngineConfig::default());
//!     engine.spawn();
//!
//!     let queue_id = handle.register(1, 1, QueueOptions::default()).await?;
//!     handle
//!         .notify(Notice::Simple { event: Event::new("typing"), users: vec![1] })
//!         .await?;
//!
//!     if let FetchOutcome::Immediate { events, .. } =
//!         handle.fetch(FetchRequest::poll(1, queue_id, -1)).await?
//!     {
//!         println!("{} events", events.len());
//!     }
//!
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod descriptor;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod gc;
pub mod narrow;
pub mod persistence;
pub mod queue;
pub mod registry;

// Re-export commonly used types
pub use descriptor::{ClientDescriptor, QueueLimits, QueueOptions, Transport};
pub use dispatch::{Audience, DispatchStats, MessageNotice, MessageRecipient, Notice, WireNotice};
pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{EngineError, EngineResult};
pub use event::{CollapseClass, Event, QueueId, RealmId, UserId};
pub use gc::{GcHook, LoggingNotifier, MissedMessage, MissedMessageHook, OfflineNotifier, SweepReport};
pub use narrow::{NarrowOperator, NarrowTerm};
pub use persistence::{PersistenceError, PersistenceResult, SnapshotStore};
pub use queue::EventQueue;
pub use registry::{FetchOutcome, FetchRequest, Registry, RegistryStats};
