//! Event engine task
//!
//! One Tokio task owns the [`Registry`]. Everything that touches it (fetches,
//! cleanups, notices, heartbeat timers, GC sweeps, snapshot dumps) is a
//! [`Command`] processed in order by that task, so registry operations never
//! interleave. Callers talk to the task through a cloneable [`EngineHandle`].

use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::descriptor::{
    heartbeat_delay, HeartbeatScheduler, HeartbeatTimer, QueueLimits, QueueOptions,
};
use super::dispatch::{DispatchStats, Notice};
use super::error::{EngineError, EngineResult};
use super::event::{QueueId, RealmId, UserId};
use super::gc::{self, GcHook, SweepReport};
use super::persistence::SnapshotStore;
use super::registry::{FetchOutcome, FetchRequest, Registry, RegistryStats};

/// Runtime settings of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub limits: QueueLimits,
    pub gc_interval: Duration,
    pub heartbeat_min_secs: u64,
    pub heartbeat_jitter_secs: u64,
    /// Snapshot file; `None` disables persistence
    pub snapshot_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: QueueLimits::default(),
            gc_interval: Duration::from_secs(gc::DEFAULT_GC_INTERVAL_SECS),
            heartbeat_min_secs: 45,
            heartbeat_jitter_secs: 10,
            snapshot_path: None,
        }
    }
}

/// Work items processed by the engine task
#[derive(Debug)]
pub enum Command {
    Fetch {
        request: FetchRequest,
        reply: oneshot::Sender<EngineResult<FetchOutcome>>,
    },
    Cleanup {
        user_id: UserId,
        queue_id: QueueId,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Notify {
        notice: Notice,
        reply: oneshot::Sender<DispatchStats>,
    },
    Heartbeat {
        queue_id: QueueId,
        token: u64,
    },
    Disconnect {
        queue_id: QueueId,
        token: u64,
    },
    Sweep {
        reply: oneshot::Sender<SweepReport>,
    },
    Dump {
        reply: oneshot::Sender<EngineResult<usize>>,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Heartbeat timers backed by sleeping Tokio tasks
struct TokioHeartbeats {
    commands: mpsc::WeakUnboundedSender<Command>,
    min_secs: u64,
    jitter_secs: u64,
    next_token: AtomicU64,
}

impl HeartbeatScheduler for TokioHeartbeats {
    fn schedule(&self, queue_id: &str) -> HeartbeatTimer {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let delay = heartbeat_delay(self.min_secs, self.jitter_secs);
        let commands = self.commands.clone();
        let queue_id = queue_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Heartbeat { queue_id, token });
            }
        });

        HeartbeatTimer::new(token, Some(task.abort_handle()))
    }
}

/// The engine task and the registry it owns
pub struct Engine {
    registry: Registry,
    snapshots: Option<SnapshotStore>,
    heartbeats: TokioHeartbeats,
    gc_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Engine {
    /// Build an engine and the handle used to reach it. The process
    /// generation is the current unix time.
    pub fn new(config: EngineConfig) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Utc::now().timestamp();

        let engine = Self {
            registry: Registry::new(generation, config.limits),
            snapshots: config.snapshot_path.map(SnapshotStore::new),
            heartbeats: TokioHeartbeats {
                commands: tx.downgrade(),
                min_secs: config.heartbeat_min_secs,
                jitter_secs: config.heartbeat_jitter_secs,
                next_token: AtomicU64::new(0),
            },
            gc_interval: config.gc_interval,
            commands: rx,
        };
        (engine, EngineHandle { commands: tx })
    }

    pub fn register_gc_hook(&mut self, hook: Box<dyn GcHook>) {
        self.registry.register_gc_hook(hook);
    }

    /// Load the snapshot, if configured, and announce the restart to the
    /// restored queues
    pub fn restore(&mut self) -> usize {
        let Some(store) = &self.snapshots else {
            return 0;
        };
        let restored = store.restore(&mut self.registry);
        if restored > 0 {
            let notified = self.registry.send_restart_events();
            info!(restored, notified, "Sent restart events to restored queues");
        }
        restored
    }

    /// Run the engine on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let period = self.gc_interval.max(Duration::from_secs(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            generation = self.registry.generation(),
            queues = self.registry.len(),
            "Event engine started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let running = match command {
                        Some(command) => self.handle(command),
                        None => {
                            self.shutdown();
                            false
                        }
                    };
                    if !running {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    gc::sweep(&mut self.registry, Utc::now());
                }
            }
        }

        info!("Event engine stopped");
    }

    /// Process one command. Returns false once the engine should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Fetch { request, reply } => {
                let outcome = self.registry.fetch(request, &self.heartbeats, Utc::now());
                let _ = reply.send(outcome);
            }
            Command::Cleanup {
                user_id,
                queue_id,
                reply,
            } => {
                let _ = reply.send(self.registry.cleanup(user_id, &queue_id));
            }
            Command::Notify { notice, reply } => {
                let _ = reply.send(self.registry.dispatch(notice));
            }
            Command::Heartbeat { queue_id, token } => {
                if self.registry.heartbeat(&queue_id, token) {
                    debug!(queue_id = %queue_id, "Sent heartbeat");
                }
            }
            Command::Disconnect { queue_id, token } => {
                self.registry.disconnect(&queue_id, token);
            }
            Command::Sweep { reply } => {
                let _ = reply.send(gc::sweep(&mut self.registry, Utc::now()));
            }
            Command::Dump { reply } => {
                let _ = reply.send(self.dump());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn dump(&self) -> EngineResult<usize> {
        match &self.snapshots {
            Some(store) => store.dump(&self.registry).map_err(|e| {
                error!(error = %e, "Failed to dump event queues");
                EngineError::Persistence(e.to_string())
            }),
            None => Ok(0),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.dump();
    }
}

/// Cloneable handle to the engine task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Serve a long-poll request
    pub async fn fetch(&self, request: FetchRequest) -> EngineResult<FetchOutcome> {
        self.request(|reply| Command::Fetch { request, reply }).await?
    }

    /// Allocate a queue and return its id
    pub async fn register(
        &self,
        user_id: UserId,
        realm_id: RealmId,
        options: QueueOptions,
    ) -> EngineResult<QueueId> {
        match self.fetch(FetchRequest::register(user_id, realm_id, options)).await? {
            FetchOutcome::Immediate { queue_id, .. } | FetchOutcome::Parked { queue_id, .. } => {
                Ok(queue_id)
            }
        }
    }

    /// Delete a queue on behalf of its owner
    pub async fn cleanup(
        &self,
        user_id: UserId,
        queue_id: impl Into<QueueId>,
    ) -> EngineResult<()> {
        let queue_id = queue_id.into();
        self.request(|reply| Command::Cleanup {
            user_id,
            queue_id,
            reply,
        })
        .await?
    }

    /// Report that the client of a parked long-poll went away. Safe to call
    /// from `Drop`; ignored once the engine has stopped.
    pub fn disconnect(&self, queue_id: impl Into<QueueId>, token: u64) {
        let _ = self.commands.send(Command::Disconnect {
            queue_id: queue_id.into(),
            token,
        });
    }

    /// Dispatch a producer notice
    pub async fn notify(&self, notice: Notice) -> EngineResult<DispatchStats> {
        self.request(|reply| Command::Notify { notice, reply }).await
    }

    /// Run a GC sweep now
    pub async fn sweep(&self) -> EngineResult<SweepReport> {
        self.request(|reply| Command::Sweep { reply }).await
    }

    /// Write the snapshot now
    pub async fn dump(&self) -> EngineResult<usize> {
        self.request(|reply| Command::Dump { reply }).await?
    }

    pub async fn stats(&self) -> EngineResult<RegistryStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the engine, dumping the snapshot first
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
