//! Garbage collection of abandoned queues
//!
//! A sweep collects every idle descriptor, removes the whole batch from the
//! registry, and only then runs the registered [`GcHook`]s, so each hook sees
//! the post-removal registry when deciding whether a queue was the user's
//! last one.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{error, info, warn};

use super::descriptor::ClientDescriptor;
use super::event::{QueueId, UserId};
use super::registry::Registry;

/// Default sweep period (5 minutes)
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 300;

/// Callback run for every descriptor removed from the registry
pub trait GcHook: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Called once per removed queue. `last_for_user` is true when the user
    /// has no queues left.
    fn on_queue_removed(
        &self,
        user_id: UserId,
        descriptor: &ClientDescriptor,
        last_for_user: bool,
    ) -> anyhow::Result<()>;
}

/// Summary of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub users: usize,
    pub remaining: usize,
    pub elapsed_ms: u64,
}

/// Remove every idle descriptor
pub fn sweep(registry: &mut Registry, now: DateTime<Utc>) -> SweepReport {
    let start = Instant::now();

    let idle: Vec<QueueId> = registry
        .descriptors()
        .filter(|descriptor| descriptor.idle(now))
        .map(|descriptor| descriptor.id().to_string())
        .collect();

    let removed = retire(registry, &idle);
    let mut users: Vec<UserId> = removed.iter().map(|d| d.user_id).collect();
    users.sort_unstable();
    users.dedup();

    let report = SweepReport {
        removed: removed.len(),
        users: users.len(),
        remaining: registry.len(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    if report.removed > 0 {
        info!(
            removed = report.removed,
            users = report.users,
            remaining = report.remaining,
            elapsed_ms = report.elapsed_ms,
            "Garbage collected idle event queues"
        );
    }
    report
}

/// Remove a batch of queues and run the hooks for each. Hook failures are
/// logged and do not stop the remaining hooks.
pub(crate) fn retire(registry: &mut Registry, queue_ids: &[QueueId]) -> Vec<ClientDescriptor> {
    let removed = registry.remove_batch(queue_ids);

    for descriptor in &removed {
        let last_for_user = registry.queues_for_user(descriptor.user_id).is_empty();
        for hook in registry.gc_hooks() {
            if let Err(e) = hook.on_queue_removed(descriptor.user_id, descriptor, last_for_user) {
                error!(
                    hook = hook.name(),
                    queue_id = %descriptor.id(),
                    error = %e,
                    "GC hook failed"
                );
            }
        }
    }

    removed
}

/// Hint keys that ask for an offline notification
const NOTIFICATION_TRIGGERS: &[&str] = &[
    "dm_push_notify",
    "dm_email_notify",
    "mention_push_notify",
    "mention_email_notify",
    "wildcard_mention_push_notify",
    "wildcard_mention_email_notify",
    "stream_push_notify",
    "stream_email_notify",
];

/// A message the user missed because their last queue went away
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissedMessage {
    pub user_id: UserId,
    pub message_id: u64,
    pub sender_id: Option<u64>,
    /// Which notification kinds the hints asked for
    pub triggers: Vec<String>,
}

/// Delivers offline notifications (push, email) for missed messages
pub trait OfflineNotifier: Send {
    fn notify(&self, missed: MissedMessage) -> anyhow::Result<()>;
}

/// Notifier that only records the notification in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl OfflineNotifier for LoggingNotifier {
    fn notify(&self, missed: MissedMessage) -> anyhow::Result<()> {
        info!(
            user_id = missed.user_id,
            message_id = missed.message_id,
            triggers = ?missed.triggers,
            "Queued offline notification"
        );
        Ok(())
    }
}

/// When a user's last queue is collected, hand every still-pending message
/// that asked for an offline notification to an [`OfflineNotifier`].
pub struct MissedMessageHook<N> {
    notifier: N,
}

impl<N: OfflineNotifier> MissedMessageHook<N> {
    pub fn new(notifier: N) -> Self {
        Self { notifier }
    }

    fn missed_messages(
        &self,
        user_id: UserId,
        descriptor: &ClientDescriptor,
    ) -> Vec<MissedMessage> {
        descriptor
            .event_queue
            .peek()
            .into_iter()
            .filter(|event| event.kind == "message")
            .filter_map(|event| {
                let hints = event.internal_data()?;
                let flag = |key: &str| hints.get(key).and_then(Value::as_bool).unwrap_or(false);
                if flag("sender_is_muted") {
                    return None;
                }

                let triggers: Vec<String> = NOTIFICATION_TRIGGERS
                    .iter()
                    .filter(|trigger| flag(**trigger))
                    .filter(|trigger| {
                        let already = if trigger.contains("push") {
                            flag("push_notified")
                        } else {
                            flag("email_notified")
                        };
                        !already
                    })
                    .map(|trigger| trigger.to_string())
                    .collect();
                if triggers.is_empty() {
                    return None;
                }

                let message = event.get("message")?;
                Some(MissedMessage {
                    user_id,
                    message_id: message.get("id")?.as_u64()?,
                    sender_id: message.get("sender_id").and_then(Value::as_u64),
                    triggers,
                })
            })
            .collect()
    }
}

impl<N: OfflineNotifier> GcHook for MissedMessageHook<N> {
    fn name(&self) -> &str {
        "missed_messages"
    }

    fn on_queue_removed(
        &self,
        user_id: UserId,
        descriptor: &ClientDescriptor,
        last_for_user: bool,
    ) -> anyhow::Result<()> {
        if !last_for_user {
            return Ok(());
        }

        let mut failures = 0;
        for missed in self.missed_messages(user_id, descriptor) {
            let message_id = missed.message_id;
            if let Err(e) = self.notifier.notify(missed) {
                warn!(user_id, message_id, error = %e, "Offline notification failed");
                failures += 1;
            }
        }

        if failures > 0 {
            anyhow::bail!("{} offline notifications failed", failures);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::descriptor::tests::ManualHeartbeats;
    use crate::events::descriptor::{QueueLimits, QueueOptions, Transport};
    use crate::events::event::Event;
    use crate::events::queue::EventQueue;
    use crate::events::registry::{FetchOutcome, FetchRequest};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<(UserId, String, bool)>>>;

    struct RecordingHook {
        calls: Calls,
    }

    impl GcHook for RecordingHook {
        fn name(&self) -> &str {
            "recording"
        }

        fn on_queue_removed(
            &self,
            user_id: UserId,
            descriptor: &ClientDescriptor,
            last_for_user: bool,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((user_id, descriptor.id().to_string(), last_for_user));
            Ok(())
        }
    }

    struct FailingHook;

    impl GcHook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_queue_removed(&self, _: UserId, _: &ClientDescriptor, _: bool) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<MissedMessage>>>,
    }

    impl OfflineNotifier for RecordingNotifier {
        fn notify(&self, missed: MissedMessage) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(missed);
            Ok(())
        }
    }

    fn short_lived() -> QueueOptions {
        QueueOptions {
            lifespan_secs: 60,
            ..Default::default()
        }
    }

    #[test]
    fn test_replaced_descriptor_is_answered_and_retired() {
        let calls = Calls::default();
        let mut registry = Registry::new(1, QueueLimits::default());
        registry.register_gc_hook(Box::new(RecordingHook {
            calls: calls.clone(),
        }));
        let heartbeats = ManualHeartbeats::default();
        let queue_id = registry.allocate(4, 1, QueueOptions::default(), Utc::now());
        registry
            .get_mut(&queue_id)
            .unwrap()
            .add_event(Event::new("typing"));
        let FetchOutcome::Parked { mut receiver, .. } = registry
            .fetch(FetchRequest::poll(4, &queue_id, 0), &heartbeats, Utc::now())
            .unwrap()
        else {
            panic!("acknowledged queue should park");
        };

        registry.insert(ClientDescriptor::new(
            4,
            1,
            EventQueue::new(queue_id.clone()),
            QueueOptions::default(),
            &QueueLimits::default(),
            Utc::now(),
        ));

        assert_eq!(receiver.try_recv().unwrap(), Vec::<Event>::new());
        assert_eq!(*calls.lock().unwrap(), vec![(4, queue_id.clone(), true)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.queues_for_user(4), &[queue_id.clone()]);
        assert!(!registry.get(&queue_id).unwrap().is_connected());
    }

    #[test]
    fn test_sweep_removes_only_idle_descriptors() {
        let mut registry = Registry::new(1, QueueLimits::default());
        let start = Utc::now();
        let idle = registry.allocate(1, 1, short_lived(), start);
        let fresh = registry.allocate(2, 1, QueueOptions::default(), start);
        let parked = registry.allocate(3, 1, short_lived(), start);

        let heartbeats = ManualHeartbeats::default();
        let (transport, _rx) = Transport::channel("website");
        registry
            .get_mut(&parked)
            .unwrap()
            .connect(transport, &heartbeats, start);

        let report = sweep(&mut registry, start + ChronoDuration::seconds(120));

        assert_eq!(report.removed, 1);
        assert_eq!(report.remaining, 2);
        assert!(registry.get(&idle).is_none());
        assert!(registry.get(&fresh).is_some());
        assert!(registry.get(&parked).is_some());
    }

    #[test]
    fn test_hooks_see_post_removal_registry() {
        let calls = Calls::default();
        let mut registry = Registry::new(1, QueueLimits::default());
        registry.register_gc_hook(Box::new(FailingHook));
        registry.register_gc_hook(Box::new(RecordingHook {
            calls: calls.clone(),
        }));

        let start = Utc::now();
        let a = registry.allocate(1, 1, short_lived(), start);
        let b = registry.allocate(1, 1, short_lived(), start);
        let kept = registry.allocate(2, 1, QueueOptions::default(), start);
        let c = registry.allocate(2, 1, short_lived(), start);

        sweep(&mut registry, start + ChronoDuration::seconds(61));

        let mut calls = calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![(1, a, true), (1, b, true), (2, c, false)]);
        assert!(registry.get(&kept).is_some());
    }

    #[test]
    fn test_missed_message_hook() {
        let notifier = RecordingNotifier::default();
        let mut registry = Registry::new(1, QueueLimits::default());
        registry.register_gc_hook(Box::new(MissedMessageHook::new(notifier.clone())));

        let start = Utc::now();
        let queue_id = registry.allocate(5, 1, short_lived(), start);
        let descriptor = registry.get_mut(&queue_id).unwrap();
        descriptor.add_event(
            Event::new("message")
                .with("message", json!({"id": 40, "sender_id": 9}))
                .with("internal_data", json!({"mention_push_notify": true})),
        );
        descriptor.add_event(
            Event::new("message")
                .with("message", json!({"id": 41}))
                .with(
                    "internal_data",
                    json!({"dm_push_notify": true, "push_notified": true}),
                ),
        );
        descriptor.add_event(Event::new("message").with("message", json!({"id": 42})));

        sweep(&mut registry, start + ChronoDuration::seconds(61));

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![MissedMessage {
                user_id: 5,
                message_id: 40,
                sender_id: Some(9),
                triggers: vec!["mention_push_notify".to_string()],
            }]
        );
    }

    #[test]
    fn test_missed_message_hook_waits_for_last_queue() {
        let notifier = RecordingNotifier::default();
        let hook = MissedMessageHook::new(notifier.clone());
        let mut registry = Registry::new(1, QueueLimits::default());
        let queue_id = registry.allocate(5, 1, QueueOptions::default(), Utc::now());
        let descriptor = registry.get_mut(&queue_id).unwrap();
        descriptor.add_event(
            Event::new("message")
                .with("message", json!({"id": 40}))
                .with("internal_data", json!({"stream_email_notify": true})),
        );

        hook.on_queue_removed(5, descriptor, false).unwrap();
        assert!(notifier.sent.lock().unwrap().is_empty());

        hook.on_queue_removed(5, descriptor, true).unwrap();
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }
}
