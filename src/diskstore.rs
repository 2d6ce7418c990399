//! A filesystem-backed event store adapter.
//!
//! One directory per aggregate instance under
//! `{root}/{category}/{identifier}/`, holding the instance's envelopes
//! as `delta-{position}.json` and its latest snapshot as
//! `snapshot.json`. Everything is stored as pretty-printed JSON.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::evt::{StoredEnvelope, TypeTag};
use crate::handle::Handle;
use crate::store::{EventStore, Snapshot, StoreError};

const SNAPSHOT_FILE: &str = "snapshot.json";
const GLOBAL_POSITION_FILE: &str = "global-position.json";

//------------ FsEventStore --------------------------------------------------

pub struct FsEventStore {
    dir: PathBuf,
}

impl FsEventStore {
    /// Opens a store rooted at the given directory, creating it if
    /// needed.
    pub fn create(dir: &Path) -> Result<Self, StoreError> {
        if !dir.is_dir() {
            fs::create_dir_all(dir)
                .map_err(|e| StoreError::io(format!("cannot create {}", dir.display()), e))?;
        }
        Ok(FsEventStore {
            dir: dir.to_path_buf(),
        })
    }

    /// Appends an event to a stream, assigning its stream and global
    /// positions, write timestamp and checksum.
    pub fn append(
        &self,
        stream: &str,
        type_tag: TypeTag,
        payload: Value,
    ) -> Result<StoredEnvelope, StoreError> {
        let dir = self.stream_dir(stream)?;
        if !dir.is_dir() {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io(format!("cannot create {}", dir.display()), e))?;
        }

        let mut position = 0;
        while dir.join(delta_file(position)).exists() {
            position += 1;
        }

        let envelope = StoredEnvelope::new(
            type_tag,
            payload,
            position,
            self.next_global_position()?,
            Utc::now(),
        );
        self.write_json(&dir.join(delta_file(position)), &envelope)?;
        Ok(envelope)
    }

    fn next_global_position(&self) -> Result<u64, StoreError> {
        let path = self.dir.join(GLOBAL_POSITION_FILE);
        let next = match self.read_json::<u64>(&path)? {
            Some(last) => last + 1,
            None => 0,
        };
        self.write_json(&path, &next)?;
        Ok(next)
    }

    /// The directory holding a stream's files.
    ///
    /// The snapshot stream of an instance maps to the same directory as
    /// its event stream; only the file name differs.
    fn stream_dir(&self, stream: &str) -> Result<PathBuf, StoreError> {
        let (category, rest) = stream.split_once(':').ok_or_else(|| {
            StoreError::io(
                format!("malformed stream name '{stream}'"),
                io::Error::from(io::ErrorKind::InvalidInput),
            )
        })?;
        let instance = rest.strip_prefix("snapshot-").unwrap_or(rest);
        Ok(self.dir.join(category).join(instance))
    }

    fn write_json<V: Serialize>(&self, path: &Path, value: &V) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(value)?;
        fs::write(path, json)
            .map_err(|e| StoreError::io(format!("cannot write {}", path.display()), e))
    }

    fn read_json<V: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<V>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)
            .map_err(|e| StoreError::io(format!("cannot read {}", path.display()), e))?;
        Ok(Some(serde_json::from_slice(&data)?))
    }
}

fn delta_file(position: u64) -> String {
    format!("delta-{position}.json")
}

impl EventStore for FsEventStore {
    fn read_events(
        &self,
        stream: &str,
        from_position: u64,
    ) -> Result<Vec<StoredEnvelope>, StoreError> {
        let dir = self.stream_dir(stream)?;
        let mut events = Vec::new();
        let mut position = from_position;
        // Positions are contiguous from 0, so probe until the first gap.
        while let Some(envelope) =
            self.read_json::<StoredEnvelope>(&dir.join(delta_file(position)))?
        {
            events.push(envelope);
            position += 1;
        }
        Ok(events)
    }

    fn read_snapshot(&self, stream: &str) -> Result<Option<Snapshot>, StoreError> {
        let dir = self.stream_dir(stream)?;
        self.read_json(&dir.join(SNAPSHOT_FILE))
    }

    fn append_snapshot(&self, stream: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        let dir = self.stream_dir(stream)?;
        if !dir.is_dir() {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io(format!("cannot create {}", dir.display()), e))?;
        }
        self.write_json(&dir.join(SNAPSHOT_FILE), &snapshot)
    }

    fn list_streams(&self, category: &str) -> Result<Vec<Handle>, StoreError> {
        let dir = self.dir.join(category);
        let mut handles = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(handles),
            Err(e) => {
                return Err(StoreError::io(format!("cannot read {}", dir.display()), e));
            }
        };
        for entry in entries {
            let entry =
                entry.map_err(|e| StoreError::io(format!("cannot read {}", dir.display()), e))?;
            if entry.path().is_dir() {
                if let Ok(handle) = entry.file_name().to_string_lossy().parse() {
                    handles.push(handle);
                }
            }
        }
        handles.sort();
        Ok(handles)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::store::{snapshot_stream_name, stream_name};

    fn placed_tag() -> TypeTag {
        TypeTag::new("Order.Placed", 2)
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsEventStore::create(dir.path()).unwrap();
        let handle = Handle::from_str("alice").unwrap();
        let stream = stream_name("order", &handle);

        // Two-digit positions verify the probing order.
        for i in 0..12 {
            store
                .append(&stream, placed_tag(), serde_json::json!({ "i": i }))
                .unwrap();
        }

        let events = store.read_events(&stream, 0).unwrap();
        assert_eq!(events.len(), 12);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.stream_position(), i as u64);
            assert_eq!(event.payload()["i"], i);
            assert!(event.checksum_matches());
        }

        let tail = store.read_events(&stream, 10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].stream_position(), 10);
    }

    #[test]
    fn global_positions_span_streams() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsEventStore::create(dir.path()).unwrap();
        let a = store
            .append("order:a", placed_tag(), serde_json::json!({}))
            .unwrap();
        let b = store
            .append("order:b", placed_tag(), serde_json::json!({}))
            .unwrap();
        assert_eq!(a.global_position(), 0);
        assert_eq!(b.global_position(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsEventStore::create(dir.path()).unwrap();
        let handle = Handle::from_str("alice").unwrap();
        let stream = snapshot_stream_name("order", &handle);

        assert!(store.read_snapshot(&stream).unwrap().is_none());
        let snapshot = Snapshot::new(
            handle.clone(),
            3,
            4,
            serde_json::json!({ "full_name": "Alice" }),
            Utc::now(),
        );
        store.append_snapshot(&stream, snapshot.clone()).unwrap();
        assert_eq!(store.read_snapshot(&stream).unwrap(), Some(snapshot));

        // Re-opening the store sees the same data.
        let store = FsEventStore::create(dir.path()).unwrap();
        assert!(store.read_snapshot(&stream).unwrap().is_some());
    }

    #[test]
    fn lists_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsEventStore::create(dir.path()).unwrap();
        store
            .append("order:bob", placed_tag(), serde_json::json!({}))
            .unwrap();
        store
            .append("order:alice", placed_tag(), serde_json::json!({}))
            .unwrap();
        store
            .append("cart:carol", placed_tag(), serde_json::json!({}))
            .unwrap();

        let names: Vec<_> = store
            .list_streams("order")
            .unwrap()
            .iter()
            .map(|h| h.as_str().to_string())
            .collect();
        assert_eq!(names, ["alice", "bob"]);
    }
}
