//! Registry of live client descriptors
//!
//! Three indices over one descriptor set: by queue id (owning), by user id
//! and by realm id (firehose descriptors only). Every insertion and removal
//! goes through this module so the indices never disagree.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::descriptor::{
    ClientDescriptor, Delivery, HeartbeatScheduler, QueueLimits, QueueOptions, Transport,
};
use super::error::{EngineError, EngineResult};
use super::event::{Event, QueueId, RealmId, UserId};
use super::gc::{self, GcHook};
use super::queue::EventQueue;

/// A long-poll request from a client
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub user_id: UserId,
    pub realm_id: RealmId,
    /// Existing queue to read; `None` asks for a new queue
    pub queue_id: Option<QueueId>,
    /// Highest event id the client has processed (`-1` for none)
    pub last_event_id: i64,
    /// Answer immediately even when there is nothing to deliver
    pub dont_block: bool,
    pub client_name: String,
    /// Registration options used when a queue is allocated
    pub new_queue_options: QueueOptions,
}

impl FetchRequest {
    /// Poll an existing queue
    pub fn poll(user_id: UserId, queue_id: impl Into<QueueId>, last_event_id: i64) -> Self {
        Self {
            user_id,
            realm_id: 0,
            queue_id: Some(queue_id.into()),
            last_event_id,
            dont_block: false,
            client_name: "unknown".to_string(),
            new_queue_options: QueueOptions::default(),
        }
    }

    /// Allocate a new queue and answer without blocking
    pub fn register(user_id: UserId, realm_id: RealmId, options: QueueOptions) -> Self {
        Self {
            user_id,
            realm_id,
            queue_id: None,
            last_event_id: -1,
            dont_block: true,
            client_name: options.client_name.clone(),
            new_queue_options: options,
        }
    }

    pub fn dont_block(mut self, dont_block: bool) -> Self {
        self.dont_block = dont_block;
        self
    }
}

/// Result of a fetch
#[derive(Debug)]
pub enum FetchOutcome {
    /// Events (possibly none) available right now
    Immediate {
        queue_id: QueueId,
        events: Vec<Event>,
        allocated: bool,
    },
    /// The request is parked; the receiver resolves on the next event.
    /// `token` names this connection for [`Registry::disconnect`].
    Parked {
        queue_id: QueueId,
        token: u64,
        receiver: tokio::sync::oneshot::Receiver<Delivery>,
    },
}

/// Counters describing the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub queues: usize,
    pub users: usize,
    pub connected: usize,
    pub firehose: usize,
}

/// Process-wide set of live descriptors
pub struct Registry {
    generation: i64,
    next_queue_id: u64,
    limits: QueueLimits,
    by_queue_id: HashMap<QueueId, ClientDescriptor>,
    by_user_id: HashMap<UserId, Vec<QueueId>>,
    by_realm_id: HashMap<RealmId, Vec<QueueId>>,
    gc_hooks: Vec<Box<dyn GcHook>>,
}

impl Registry {
    /// Create an empty registry. `generation` identifies this process
    /// incarnation and prefixes every allocated queue id.
    pub fn new(generation: i64, limits: QueueLimits) -> Self {
        Self {
            generation,
            next_queue_id: 0,
            limits,
            by_queue_id: HashMap::new(),
            by_user_id: HashMap::new(),
            by_realm_id: HashMap::new(),
            gc_hooks: Vec::new(),
        }
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.by_queue_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_queue_id.is_empty()
    }

    pub fn register_gc_hook(&mut self, hook: Box<dyn GcHook>) {
        self.gc_hooks.push(hook);
    }

    pub(crate) fn gc_hooks(&self) -> &[Box<dyn GcHook>] {
        &self.gc_hooks
    }

    /// Create a queue and descriptor for `user_id` and index it
    pub fn allocate(
        &mut self,
        user_id: UserId,
        realm_id: RealmId,
        options: QueueOptions,
        now: DateTime<Utc>,
    ) -> QueueId {
        let queue_id = format!("{}:{}", self.generation, self.next_queue_id);
        self.next_queue_id += 1;

        let descriptor = ClientDescriptor::new(
            user_id,
            realm_id,
            EventQueue::new(queue_id.clone()),
            options,
            &self.limits,
            now,
        );
        self.insert(descriptor);

        debug!(queue_id = %queue_id, user_id, realm_id, "Allocated event queue");
        queue_id
    }

    /// Index a descriptor under all three keys, replacing any descriptor
    /// with the same id
    pub fn insert(&mut self, descriptor: ClientDescriptor) {
        let queue_id = descriptor.id().to_string();
        if let Some(existing) = self.by_queue_id.get_mut(&queue_id) {
            existing.finish_current_transport();
            gc::retire(self, &[queue_id.clone()]);
            info!(queue_id = %queue_id, "Replaced event queue");
        }

        // Never hand out an id a restored queue of this generation already has
        if let Some((generation, counter)) = queue_id.split_once(':') {
            if generation.parse::<i64>().ok() == Some(self.generation) {
                if let Ok(counter) = counter.parse::<u64>() {
                    self.next_queue_id = self.next_queue_id.max(counter + 1);
                }
            }
        }

        self.by_user_id
            .entry(descriptor.user_id)
            .or_default()
            .push(queue_id.clone());
        if descriptor.is_firehose() {
            self.by_realm_id
                .entry(descriptor.realm_id)
                .or_default()
                .push(queue_id.clone());
        }
        self.by_queue_id.insert(queue_id, descriptor);
    }

    pub fn get(&self, queue_id: &str) -> Option<&ClientDescriptor> {
        self.by_queue_id.get(queue_id)
    }

    pub fn get_mut(&mut self, queue_id: &str) -> Option<&mut ClientDescriptor> {
        self.by_queue_id.get_mut(queue_id)
    }

    /// Ownership-checked lookup
    pub fn access(
        &mut self,
        user_id: UserId,
        queue_id: &str,
    ) -> EngineResult<&mut ClientDescriptor> {
        let descriptor = self
            .by_queue_id
            .get_mut(queue_id)
            .ok_or_else(|| EngineError::QueueNotFound(queue_id.to_string()))?;

        if descriptor.user_id != user_id {
            warn!(
                queue_id = %queue_id,
                user_id,
                owner = descriptor.user_id,
                "User is not authorized for queue"
            );
            return Err(EngineError::Unauthorized {
                user_id,
                queue_id: queue_id.to_string(),
            });
        }
        Ok(descriptor)
    }

    /// Queue ids owned by `user_id`
    pub fn queues_for_user(&self, user_id: UserId) -> &[QueueId] {
        self.by_user_id.get(&user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Firehose queue ids of `realm_id`
    pub fn firehose_queues(&self, realm_id: RealmId) -> &[QueueId] {
        self.by_realm_id.get(&realm_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ClientDescriptor> {
        self.by_queue_id.values()
    }

    /// Remove a batch of descriptors from every index. Heartbeat timers and
    /// any parked long-poll are dropped with them.
    pub fn remove_batch(&mut self, queue_ids: &[QueueId]) -> Vec<ClientDescriptor> {
        let mut removed = Vec::with_capacity(queue_ids.len());

        for queue_id in queue_ids {
            let Some(mut descriptor) = self.by_queue_id.remove(queue_id) else {
                continue;
            };
            descriptor.disconnect();

            remove_from_index(&mut self.by_user_id, descriptor.user_id, queue_id);
            remove_from_index(&mut self.by_realm_id, descriptor.realm_id, queue_id);
            removed.push(descriptor);
        }

        removed
    }

    /// Explicit client cleanup: answer any parked poll, then retire the queue
    /// through the same path as garbage collection.
    pub fn cleanup(&mut self, user_id: UserId, queue_id: &str) -> EngineResult<()> {
        let descriptor = self.access(user_id, queue_id)?;
        descriptor.finish_current_transport();

        gc::retire(self, &[queue_id.to_string()]);
        info!(queue_id = %queue_id, user_id, "Deleted event queue");
        Ok(())
    }

    /// Serve a long-poll request
    pub fn fetch(
        &mut self,
        request: FetchRequest,
        heartbeats: &dyn HeartbeatScheduler,
        now: DateTime<Utc>,
    ) -> EngineResult<FetchOutcome> {
        let (queue_id, allocated, was_connected) = match request.queue_id {
            None => {
                if !request.dont_block {
                    return Err(EngineError::MissingQueueId);
                }
                let queue_id = self.allocate(
                    request.user_id,
                    request.realm_id,
                    request.new_queue_options,
                    now,
                );
                (queue_id, true, false)
            }
            Some(queue_id) => {
                let descriptor = self.access(request.user_id, &queue_id)?;
                descriptor.event_queue.acknowledge(request.last_event_id)?;
                let was_connected = descriptor.finish_current_transport();
                descriptor.touch(now);
                (queue_id, false, was_connected)
            }
        };

        let descriptor = self
            .by_queue_id
            .get_mut(&queue_id)
            .ok_or_else(|| EngineError::QueueNotFound(queue_id.clone()))?;

        if !descriptor.event_queue.empty() || request.dont_block {
            let events = descriptor.event_queue.contents();
            debug!(queue_id = %queue_id, count = events.len(), "Returning events immediately");
            return Ok(FetchOutcome::Immediate {
                queue_id,
                events,
                allocated,
            });
        }

        if was_connected {
            info!(queue_id = %queue_id, "Superseded previous long-poll");
        }

        let (transport, receiver) = Transport::channel(request.client_name);
        let token = descriptor.connect(transport, heartbeats, now);
        Ok(FetchOutcome::Parked {
            queue_id,
            token,
            receiver,
        })
    }

    /// Detach a parked long-poll whose client went away. Only the connection
    /// named by `token` is detached; a newer poll on the same queue is kept.
    pub fn disconnect(&mut self, queue_id: &str, token: u64) -> bool {
        match self.by_queue_id.get_mut(queue_id) {
            Some(descriptor)
                if descriptor.is_connected() && descriptor.heartbeat_token() == Some(token) =>
            {
                descriptor.disconnect();
                debug!(queue_id = %queue_id, "Long-poll client went away");
                true
            }
            _ => false,
        }
    }

    /// Deliver a fired heartbeat timer. Tokens of cancelled timers are
    /// ignored, as are timers of queues that no longer exist.
    pub fn heartbeat(&mut self, queue_id: &str, token: u64) -> bool {
        match self.by_queue_id.get_mut(queue_id) {
            Some(descriptor) => descriptor.on_heartbeat(token),
            None => false,
        }
    }

    /// Tell every restored queue that wants it about the new generation
    pub fn send_restart_events(&mut self) -> usize {
        let restart = Event::restart(self.generation);
        let mut sent = 0;
        for descriptor in self.by_queue_id.values_mut() {
            if descriptor.accepts_event(&restart) {
                descriptor.add_event(restart.clone());
                sent += 1;
            }
        }
        sent
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            queues: self.by_queue_id.len(),
            users: self.by_user_id.len(),
            connected: self.by_queue_id.values().filter(|d| d.is_connected()).count(),
            firehose: self.by_realm_id.values().map(Vec::len).sum(),
        }
    }
}

fn remove_from_index<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, Vec<QueueId>>,
    key: K,
    queue_id: &str,
) {
    if let Some(ids) = index.get_mut(&key) {
        ids.retain(|id| id != queue_id);
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}
