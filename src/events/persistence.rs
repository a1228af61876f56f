//! Snapshot persistence of client descriptors
//!
//! The snapshot is a JSON array of `[queue_id, descriptor]` pairs. Dumps go
//! to a temporary file that is renamed over the snapshot. Loads accept older
//! snapshots by rewriting renamed keys before decoding; a snapshot that fails
//! to decode is abandoned as a whole.

use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::descriptor::ClientDescriptor;
use super::event::QueueId;
use super::registry::Registry;

/// Errors that can occur while reading or writing snapshots
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

/// Result type alias for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Encode every descriptor of the registry
pub fn encode_snapshot(registry: &Registry) -> PersistenceResult<Vec<u8>> {
    let mut entries: Vec<(&str, &ClientDescriptor)> = registry
        .descriptors()
        .map(|descriptor| (descriptor.id(), descriptor))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    Ok(serde_json::to_vec(&entries)?)
}

/// Decode a snapshot, migrating legacy keys
pub fn decode_snapshot(bytes: &[u8]) -> PersistenceResult<Vec<ClientDescriptor>> {
    let entries: Vec<(QueueId, Value)> = serde_json::from_slice(bytes)?;

    entries
        .into_iter()
        .map(|(queue_id, mut state)| {
            migrate_descriptor(&mut state);
            let mut descriptor: ClientDescriptor = serde_json::from_value(state)
                .map_err(|e| PersistenceError::Serialization(format!("{}: {}", queue_id, e)))?;
            descriptor.event_queue.set_id(queue_id);
            Ok(descriptor)
        })
        .collect()
}

/// Rewrite keys written by older versions into their current names
pub fn migrate_descriptor(state: &mut Value) {
    let Some(fields) = state.as_object_mut() else {
        return;
    };

    for (old, new) in [
        ("user_profile_id", "user_id"),
        ("client_type", "client_name"),
        ("client_type_name", "client_name"),
        ("all_public_streams", "firehose"),
        ("queue_timeout", "timeout_secs"),
    ] {
        if let Some(value) = fields.remove(old) {
            fields.entry(new).or_insert(value);
        }
    }

    // Seconds as a float -> milliseconds as an integer
    if let Some(seconds) = fields.remove("last_connection_time") {
        if let Some(seconds) = seconds.as_f64() {
            fields
                .entry("last_activity")
                .or_insert(Value::from((seconds * 1000.0) as i64));
        }
    }

    if let Some(queue) = fields.get_mut("event_queue").and_then(Value::as_object_mut) {
        let pruned_nothing = queue
            .get("newest_pruned_id")
            .and_then(Value::as_i64)
            .map_or(false, |id| id < 0);
        if pruned_nothing {
            queue.insert("newest_pruned_id".to_string(), Value::Null);
        }
    }

    // Null means "default" for these; `event_types: null` is the wildcard
    for key in ["narrow", "client_name"] {
        if fields.get(key).map_or(false, Value::is_null) {
            fields.remove(key);
        }
    }
}

/// Snapshot file on disk
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a loaded snapshot is moved so it is not replayed twice
    pub fn last_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".last");
        PathBuf::from(name)
    }

    /// Write every descriptor of the registry. Returns how many were written.
    pub fn dump(&self, registry: &Registry) -> PersistenceResult<usize> {
        let bytes = encode_snapshot(registry)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;

        info!(
            path = %self.path.display(),
            queues = registry.len(),
            "Dumped event queues"
        );
        Ok(registry.len())
    }

    /// Read the snapshot. A missing file is an empty snapshot.
    pub fn load(&self) -> PersistenceResult<Vec<ClientDescriptor>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        decode_snapshot(&bytes)
    }

    /// Load the snapshot into `registry` and move the file aside.
    ///
    /// Any failure abandons the whole load; the registry is left untouched.
    /// Returns the number of restored descriptors.
    pub fn restore(&self, registry: &mut Registry) -> usize {
        let descriptors = match self.load() {
            Ok(descriptors) => descriptors,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Could not load event queue snapshot, starting empty"
                );
                return 0;
            }
        };

        let restored = descriptors.len();
        let limits = *registry.limits();
        for mut descriptor in descriptors {
            // Limits may have tightened since the snapshot was written
            descriptor.timeout_secs = limits.timeout_for(descriptor.timeout_secs);
            registry.insert(descriptor);
        }

        if self.path.exists() {
            if let Err(e) = fs::rename(&self.path, self.last_path()) {
                warn!(path = %self.path.display(), error = %e, "Could not move snapshot aside");
            }
            info!(path = %self.path.display(), queues = restored, "Loaded event queues");
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::descriptor::{QueueLimits, QueueOptions};
    use crate::events::event::Event;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn populated() -> Registry {
        let mut registry = Registry::new(1_700_000_000, QueueLimits::default());
        let a = registry.allocate(1, 2, QueueOptions::default(), Utc::now());
        registry.allocate(
            3,
            2,
            QueueOptions {
                firehose: true,
                client_name: "website".to_string(),
                ..Default::default()
            },
            Utc::now(),
        );
        let descriptor = registry.get_mut(&a).unwrap();
        descriptor.add_event(Event::new("typing"));
        descriptor.add_event(Event::new("pointer").with("pointer", 9));
        registry
    }

    #[test]
    fn test_dump_and_restore() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queues.json"));
        let original = populated();
        assert_eq!(store.dump(&original).unwrap(), 2);

        let mut restored = Registry::new(1_700_000_100, QueueLimits::default());
        assert_eq!(store.restore(&mut restored), 2);

        assert!(!store.path().exists());
        assert!(store.last_path().exists());
        assert_eq!(restored.queues_for_user(1), &["1700000000:0".to_string()]);
        assert_eq!(restored.firehose_queues(2), &["1700000000:1".to_string()]);

        let before = original.get("1700000000:0").unwrap();
        let after = restored.get("1700000000:0").unwrap();
        assert_eq!(after.event_queue, before.event_queue);
        assert_eq!(after.options, before.options);
        assert!(!after.is_connected());
    }

    #[test]
    fn test_restore_clamps_timeouts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queues.json");
        let snapshot = json!([
            ["1:0", {"user_id": 1, "timeout_secs": u64::MAX}],
            ["1:1", {"user_id": 2, "queue_timeout": 120}]
        ]);
        fs::write(&path, snapshot.to_string()).unwrap();

        let mut registry = Registry::new(
            1,
            QueueLimits {
                idle_timeout_secs: 600,
                max_lifespan_secs: 3600,
            },
        );
        assert_eq!(SnapshotStore::new(&path).restore(&mut registry), 2);

        assert_eq!(registry.get("1:0").unwrap().timeout_secs, 3600);
        assert_eq!(registry.get("1:1").unwrap().timeout_secs, 120);
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());

        let mut registry = Registry::new(1, QueueLimits::default());
        assert_eq!(store.restore(&mut registry), 0);
        assert!(!store.last_path().exists());
    }

    #[test]
    fn test_corrupt_snapshot_abandons_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queues.json");
        fs::write(&path, b"[[\"1:0\", {\"user_id\": 1}], [\"1:1\", 17]]").unwrap();
        let store = SnapshotStore::new(&path);

        assert!(matches!(
            store.load(),
            Err(PersistenceError::Serialization(_))
        ));

        let mut registry = Registry::new(1, QueueLimits::default());
        assert_eq!(store.restore(&mut registry), 0);
        assert!(registry.is_empty());

        fs::write(&path, b"not json").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_legacy_snapshot_is_migrated() {
        let legacy = json!([[
            "1500000000:7",
            {
                "user_profile_id": 12,
                "realm_id": 4,
                "event_types": null,
                "apply_markdown": true,
                "client_type_name": "ZulipMobile",
                "all_public_streams": true,
                "narrow": [],
                "last_connection_time": 1500000123.5,
                "queue_timeout": 1800,
                "event_queue": {
                    "id": "1500000000:7",
                    "queue": [{"type": "typing", "id": 3}],
                    "next_event_id": 4,
                    "newest_pruned_id": -1,
                    "virtual_events": {
                        "pointer": {"type": "pointer", "id": 2, "pointer": 8}
                    }
                }
            }
        ]]);

        let descriptors = decode_snapshot(legacy.to_string().as_bytes()).unwrap();
        assert_eq!(descriptors.len(), 1);
        let descriptor = &descriptors[0];

        assert_eq!(descriptor.id(), "1500000000:7");
        assert_eq!(descriptor.user_id, 12);
        assert_eq!(descriptor.options.client_name, "ZulipMobile");
        assert!(descriptor.options.firehose);
        assert!(descriptor.options.apply_markdown);
        assert_eq!(descriptor.timeout_secs, 1800);
        assert_eq!(descriptor.last_activity.timestamp_millis(), 1_500_000_123_500);
        assert_eq!(descriptor.event_queue.newest_pruned_id(), None);
        assert_eq!(descriptor.event_queue.next_event_id(), 4);
        assert_eq!(descriptor.event_queue.virtual_len(), 1);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let snapshot = json!([["9:1", {"user_id": 5}]]);
        let descriptors = decode_snapshot(snapshot.to_string().as_bytes()).unwrap();
        let descriptor = &descriptors[0];

        assert_eq!(descriptor.id(), "9:1");
        assert_eq!(descriptor.options, QueueOptions::default());
        assert!(descriptor.event_queue.empty());
    }
}
