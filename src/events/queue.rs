//! Per-client event queue
//!
//! An ordered, prunable log of events awaiting acknowledgement. Events whose
//! [`CollapseClass`] is collapsible are held out of the main sequence as
//! *virtual* events and merged with later occurrences of the same class until
//! the queue is read.
//!
//! ```text
//! push(pointer=1)  -> virtual{pointer@0}         main=[]
//! push(unknown)    -> virtual{pointer@0}         main=[unknown@1]
//! push(pointer=2)  -> virtual{pointer@2}         main=[unknown@1]
//! contents()       -> [unknown@1, pointer@2]     (virtual map drained)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::error::{EngineError, EngineResult};
use super::event::{CollapseClass, Event, QueueId};

/// Ordered event log for a single client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQueue {
    /// Globally unique queue id
    #[serde(default)]
    id: QueueId,
    /// Id the next pushed event receives
    #[serde(default)]
    next_event_id: u64,
    /// Id of the most recently pruned event
    #[serde(default)]
    newest_pruned_id: Option<u64>,
    /// Main sequence, ordered by id
    #[serde(default, rename = "queue")]
    events: VecDeque<Event>,
    /// Pending collapsed representatives, at most one per class
    #[serde(default)]
    virtual_events: BTreeMap<CollapseClass, Event>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new(id: impl Into<QueueId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn set_id(&mut self, id: QueueId) {
        self.id = id;
    }

    /// Id the next pushed event will receive
    pub fn next_event_id(&self) -> u64 {
        self.next_event_id
    }

    /// Id of the most recently pruned event, if anything was pruned
    pub fn newest_pruned_id(&self) -> Option<u64> {
        self.newest_pruned_id
    }

    /// Number of events in the main sequence
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Number of pending virtual events
    pub fn virtual_len(&self) -> usize {
        self.virtual_events.len()
    }

    /// True iff both the main sequence and the virtual map are empty
    pub fn empty(&self) -> bool {
        self.events.is_empty() && self.virtual_events.is_empty()
    }

    /// Push an event, assigning it the next id. Returns the assigned id.
    pub fn push(&mut self, mut event: Event) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        event.id = id;

        match CollapseClass::of(&event) {
            Some(class) => match self.virtual_events.get_mut(&class) {
                Some(pending) => pending.absorb(&class, &event),
                None => {
                    self.virtual_events.insert(class, event);
                }
            },
            None => self.events.push_back(event),
        }

        id
    }

    /// Remove events with id <= `through_id` from the head of the main
    /// sequence. Virtual events are not touched.
    pub fn prune(&mut self, through_id: u64) {
        while let Some(front) = self.events.front() {
            if front.id > through_id {
                break;
            }
            self.newest_pruned_id = Some(front.id);
            self.events.pop_front();
        }
    }

    /// Apply a client acknowledgement of everything up to `last_event_id`
    /// (`-1` for "nothing yet").
    ///
    /// Fails if the client claims an id older than one already pruned, or
    /// one that was never in this queue.
    pub fn acknowledge(&mut self, last_event_id: i64) -> EngineResult<()> {
        if let Some(newest) = self.newest_pruned_id {
            if last_event_id < newest as i64 {
                return Err(EngineError::AlreadyPruned(last_event_id));
            }
        }

        if last_event_id >= 0 {
            self.prune(last_event_id as u64);
        }

        let newest = self.newest_pruned_id.map(|id| id as i64).unwrap_or(-1);
        if last_event_id != newest {
            return Err(EngineError::EventNotInQueue(last_event_id));
        }

        Ok(())
    }

    /// Drain the virtual events into the main sequence and return the
    /// merged, id-ordered contents as delivered to a client.
    pub fn contents(&mut self) -> Vec<Event> {
        self.materialize();
        self.events.iter().map(Event::for_client).collect()
    }

    /// Like [`contents`](Self::contents) but keeps per-recipient
    /// notification hints.
    pub fn contents_with_internal(&mut self) -> Vec<Event> {
        self.materialize();
        self.events.iter().cloned().collect()
    }

    /// Merged view of the queue without draining the virtual events
    pub fn peek(&self) -> Vec<Event> {
        let mut pending: Vec<&Event> = self.virtual_events.values().collect();
        pending.sort_by_key(|event| event.id);
        let mut pending = pending.into_iter().peekable();

        let mut merged = Vec::with_capacity(self.events.len() + self.virtual_events.len());
        for event in &self.events {
            while let Some(virtual_event) = pending.next_if(|v| v.id < event.id) {
                merged.push(virtual_event.clone());
            }
            merged.push(event.clone());
        }
        merged.extend(pending.cloned());
        merged
    }

    fn materialize(&mut self) {
        if self.virtual_events.is_empty() {
            return;
        }
        self.events = self.peek().into();
        self.virtual_events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pointer(value: u64) -> Event {
        Event::new("pointer").with("pointer", value)
    }

    fn flags(op: &str, messages: serde_json::Value) -> Event {
        Event::new("update_message_flags")
            .with("op", op)
            .with("flag", "read")
            .with("all", false)
            .with("messages", messages)
    }

    fn ids(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_empty_lifecycle() {
        let mut queue = EventQueue::new("1:0");
        assert!(queue.empty());

        queue.push(Event::new("typing"));
        assert!(!queue.empty());

        queue.prune(0);
        assert!(queue.empty());
        assert_eq!(queue.newest_pruned_id(), Some(0));

        queue.push(pointer(4));
        assert!(!queue.empty());
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut queue = EventQueue::new("1:0");
        let assigned: Vec<u64> = (0..5)
            .map(|i| queue.push(if i % 2 == 0 { pointer(i) } else { Event::new("typing") }))
            .collect();
        assert_eq!(assigned, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.next_event_id(), 5);
    }

    #[test]
    fn test_pointer_resorts_after_bump() {
        let mut queue = EventQueue::new("1:0");
        queue.push(pointer(1));
        queue.push(Event::new("unknown"));

        let view = queue.peek();
        assert_eq!(ids(&view), vec![0, 1]);
        assert_eq!(view[0].get("pointer"), Some(&json!(1)));

        queue.push(pointer(2));
        let contents = queue.contents();
        assert_eq!(ids(&contents), vec![1, 2]);
        assert_eq!(contents[0].kind, "unknown");
        assert_eq!(contents[1].kind, "pointer");
        assert_eq!(contents[1].get("pointer"), Some(&json!(2)));
    }

    #[test]
    fn test_contents_is_draining() {
        let mut queue = EventQueue::new("1:0");
        queue.push(pointer(1));
        queue.push(Event::new("unknown"));

        assert_eq!(ids(&queue.contents()), vec![0, 1]);
        assert_eq!(queue.virtual_len(), 0);
        assert_eq!(queue.len(), 2);

        // The materialized pointer can no longer absorb newer ones
        queue.push(pointer(2));
        let contents = queue.contents();
        assert_eq!(ids(&contents), vec![0, 1, 2]);
        assert_eq!(contents[0].get("pointer"), Some(&json!(1)));
        assert_eq!(contents[2].get("pointer"), Some(&json!(2)));
    }

    #[test]
    fn test_flag_batches_collapse() {
        let mut queue = EventQueue::new("1:0");
        queue.push(flags("add", json!([1, 2, 3])));
        queue.push(flags("add", json!([4, 5])));

        let contents = queue.contents();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].id, 1);
        assert_eq!(contents[0].get("messages"), Some(&json!([1, 2, 3, 4, 5])));
    }

    #[test]
    fn test_many_pushes_of_one_class() {
        let mut queue = EventQueue::new("1:0");
        for i in 0..10u64 {
            queue.push(flags("remove", json!([i])));
        }

        let contents = queue.contents();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].id, 9);
        let expected: Vec<u64> = (0..10).collect();
        assert_eq!(contents[0].get("messages"), Some(&json!(expected)));
    }

    #[test]
    fn test_distinct_classes_stay_separate() {
        let mut queue = EventQueue::new("1:0");
        queue.push(flags("add", json!([1])));
        queue.push(flags("remove", json!([1])));
        queue.push(Event::restart(1));
        queue.push(Event::restart(2));

        let contents = queue.contents();
        assert_eq!(ids(&contents), vec![0, 1, 3]);
        assert_eq!(contents[2].get("server_generation"), Some(&json!(2)));
    }

    #[test]
    fn test_prune_never_leaves_old_ids() {
        let mut queue = EventQueue::new("1:0");
        for i in 0..20u64 {
            match i % 3 {
                0 => queue.push(pointer(i)),
                1 => queue.push(flags("add", json!([i]))),
                _ => queue.push(Event::new("typing")),
            };
            if i % 4 == 3 {
                let contents = queue.contents();
                let through = contents[contents.len() / 2].id;
                queue.prune(through);
                assert!(queue.contents().iter().all(|e| e.id > through));
            }
        }
    }

    #[test]
    fn test_prune_leaves_virtual_events() {
        let mut queue = EventQueue::new("1:0");
        queue.push(Event::new("typing"));
        queue.push(pointer(7));

        queue.prune(5);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.virtual_len(), 1);
        assert!(!queue.empty());
        assert_eq!(ids(&queue.contents()), vec![1]);
    }

    #[test]
    fn test_acknowledge() {
        let mut queue = EventQueue::new("1:0");
        assert!(queue.acknowledge(-1).is_ok());
        assert_eq!(queue.acknowledge(3), Err(EngineError::EventNotInQueue(3)));

        for _ in 0..4 {
            queue.push(Event::new("typing"));
        }
        assert!(queue.acknowledge(1).is_ok());
        assert_eq!(ids(&queue.contents()), vec![2, 3]);

        // Retrying the same acknowledgement is fine
        assert!(queue.acknowledge(1).is_ok());
        assert_eq!(queue.acknowledge(0), Err(EngineError::AlreadyPruned(0)));
        assert_eq!(queue.acknowledge(9), Err(EngineError::EventNotInQueue(9)));
    }

    #[test]
    fn test_contents_strips_internal_data() {
        let mut queue = EventQueue::new("1:0");
        queue.push(
            Event::new("message")
                .with("message", json!({"id": 10}))
                .with("internal_data", json!({"mentioned": true})),
        );

        assert!(queue.peek()[0].internal_data().is_some());
        assert!(queue.contents()[0].internal_data().is_none());
        assert!(queue.contents_with_internal()[0].internal_data().is_some());
    }

    #[test]
    fn test_serialization_is_lossless() {
        let mut queue = EventQueue::new("1700000000:3");
        queue.push(Event::new("typing"));
        queue.push(flags("add", json!([1, 2])));
        queue.push(Event::new("typing"));
        queue.prune(0);

        let json = serde_json::to_value(&queue).unwrap();
        assert!(json["virtual_events"]["flags/add/read"].is_object());

        let restored: EventQueue = serde_json::from_value(json).unwrap();
        assert_eq!(restored, queue);
        assert_eq!(restored.next_event_id(), 3);
        assert_eq!(restored.newest_pruned_id(), Some(0));
    }
}
