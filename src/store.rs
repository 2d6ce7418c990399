//! The event-store adapter interface and the in-memory adapter.
//!
//! The engine never talks to storage directly; it pulls ordered envelope
//! sequences and snapshots through [`EventStore`]. Appending *events* is
//! the write path's business and not part of the interface; both bundled
//! adapters expose an inherent `append` for that side, also used by tests
//! to populate streams.

use std::collections::HashMap;
use std::sync::RwLock;
use std::{fmt, io};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evt::{StoredEnvelope, TypeTag};
use crate::handle::Handle;

//------------ Storable ------------------------------------------------------

/// Anything that can be stored and retrieved as JSON.
pub trait Storable: Clone + Serialize + DeserializeOwned + Sized + 'static {}

impl<T: Clone + Serialize + DeserializeOwned + Sized + 'static> Storable for T {}

//------------ Stream naming -------------------------------------------------

/// The stream holding the events of one aggregate instance.
pub fn stream_name(category: &str, handle: &Handle) -> String {
    format!("{category}:{handle}")
}

/// The dedicated stream holding the snapshots of one aggregate instance.
pub fn snapshot_stream_name(category: &str, handle: &Handle) -> String {
    format!("{category}:snapshot-{handle}")
}

//------------ Snapshot ------------------------------------------------------

/// A full-state capture of an aggregate at a known version.
///
/// Consumed only as a replay starting point, never mutated. Besides the
/// version, a snapshot records the stream position of the last envelope
/// folded into it: fact events occupy stream positions without advancing
/// the version, so the version alone does not identify where replay must
/// resume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Snapshot {
    handle: Handle,
    version: i64,
    stream_position: u64,
    state: Value,
    written_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        handle: Handle,
        version: i64,
        stream_position: u64,
        state: Value,
        written_at: DateTime<Utc>,
    ) -> Self {
        Snapshot {
            handle,
            version,
            stream_position,
            state,
            written_at,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn written_at(&self) -> DateTime<Utc> {
        self.written_at
    }
}

//------------ EventStore ----------------------------------------------------

/// The narrow interface the engine consumes from the underlying log.
pub trait EventStore: Send + Sync {
    /// Returns the envelopes of a stream from the given position on, in
    /// stream order.
    fn read_events(
        &self,
        stream: &str,
        from_position: u64,
    ) -> Result<Vec<StoredEnvelope>, StoreError>;

    /// Returns the latest snapshot on a snapshot stream, if any.
    fn read_snapshot(&self, stream: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Writes a snapshot, superseding any previous one.
    ///
    /// Concurrent writers are last-writer-wins; the operation is
    /// idempotent.
    fn append_snapshot(&self, stream: &str, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Lists the instance handles that have an event stream in the given
    /// category.
    fn list_streams(&self, category: &str) -> Result<Vec<Handle>, StoreError>;
}

//------------ StoreError ----------------------------------------------------

/// A failure in the storage adapter.
#[derive(Debug)]
pub enum StoreError {
    Io { context: String, source: io::Error },
    Json(serde_json::Error),
}

impl StoreError {
    pub fn io(context: impl fmt::Display, source: io::Error) -> Self {
        StoreError::Io {
            context: context.to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(e)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Io { context, source } => {
                write!(f, "{context}: {source}")
            }
            StoreError::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Json(e) => Some(e),
        }
    }
}

//------------ MemoryEventStore ----------------------------------------------

/// An adapter keeping all streams in process memory.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    streams: HashMap<String, Vec<StoredEnvelope>>,
    snapshots: HashMap<String, Snapshot>,
    global_position: u64,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event to a stream, assigning its stream and global
    /// positions, write timestamp and checksum.
    pub fn append(&self, stream: &str, type_tag: TypeTag, payload: Value) -> StoredEnvelope {
        let mut inner = self.inner.write().unwrap();
        let global_position = inner.global_position;
        inner.global_position += 1;
        let events = inner.streams.entry(stream.to_string()).or_default();
        let envelope = StoredEnvelope::new(
            type_tag,
            payload,
            events.len() as u64,
            global_position,
            Utc::now(),
        );
        events.push(envelope.clone());
        envelope
    }

    /// Appends a pre-built envelope as-is.
    ///
    /// For migration tooling and tests; positions and checksum are the
    /// caller's responsibility.
    pub fn append_envelope(&self, stream: &str, envelope: StoredEnvelope) {
        let mut inner = self.inner.write().unwrap();
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(envelope);
    }

    /// Deletes the snapshot on a snapshot stream, if any.
    pub fn drop_snapshot(&self, stream: &str) {
        self.inner.write().unwrap().snapshots.remove(stream);
    }
}

impl EventStore for MemoryEventStore {
    fn read_events(
        &self,
        stream: &str,
        from_position: u64,
    ) -> Result<Vec<StoredEnvelope>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .streams
            .get(stream)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.stream_position() >= from_position)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read_snapshot(&self, stream: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.inner.read().unwrap().snapshots.get(stream).cloned())
    }

    fn append_snapshot(&self, stream: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        self.inner
            .write()
            .unwrap()
            .snapshots
            .insert(stream.to_string(), snapshot);
        Ok(())
    }

    fn list_streams(&self, category: &str) -> Result<Vec<Handle>, StoreError> {
        let prefix = format!("{category}:");
        let inner = self.inner.read().unwrap();
        let mut handles: Vec<Handle> = inner
            .streams
            .keys()
            .filter_map(|stream| stream.strip_prefix(&prefix))
            .filter(|rest| !rest.starts_with("snapshot-"))
            .filter_map(|rest| rest.parse().ok())
            .collect();
        handles.sort();
        Ok(handles)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn append_assigns_positions() {
        let store = MemoryEventStore::new();
        let tag = TypeTag::new("Order.Placed", 2);
        store.append("order:a", tag.clone(), serde_json::json!({}));
        store.append("order:b", tag.clone(), serde_json::json!({}));
        store.append("order:a", tag, serde_json::json!({}));

        let events = store.read_events("order:a", 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stream_position(), 0);
        assert_eq!(events[1].stream_position(), 1);
        assert_eq!(events[1].global_position(), 2);

        assert_eq!(store.read_events("order:a", 1).unwrap().len(), 1);
        assert!(store.read_events("order:missing", 0).unwrap().is_empty());
    }

    #[test]
    fn snapshot_overwrites() {
        let store = MemoryEventStore::new();
        let handle = Handle::from_str("a").unwrap();
        let stream = snapshot_stream_name("order", &handle);

        assert!(store.read_snapshot(&stream).unwrap().is_none());
        for version in [0, 1] {
            let snapshot = Snapshot::new(
                handle.clone(),
                version,
                version as u64,
                serde_json::json!({}),
                Utc::now(),
            );
            store.append_snapshot(&stream, snapshot).unwrap();
        }
        let latest = store.read_snapshot(&stream).unwrap().unwrap();
        assert_eq!(latest.version(), 1);
    }

    #[test]
    fn lists_instance_streams_only() {
        let store = MemoryEventStore::new();
        let tag = TypeTag::new("Order.Placed", 2);
        store.append("order:b", tag.clone(), serde_json::json!({}));
        store.append("order:a", tag.clone(), serde_json::json!({}));
        store.append("cart:c", tag, serde_json::json!({}));
        let handle = Handle::from_str("a").unwrap();
        store
            .append_snapshot(
                &snapshot_stream_name("order", &handle),
                Snapshot::new(handle, 0, 0, serde_json::json!({}), Utc::now()),
            )
            .unwrap();

        let listed = store.list_streams("order").unwrap();
        let names: Vec<_> = listed.iter().map(|h| h.as_str().to_string()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
