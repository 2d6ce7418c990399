//! Snapshot-aware aggregate reconstruction and temporal queries.
//!
//! An [`AggregateStore`] decides the cheapest valid starting point for
//! rebuilding an instance (latest snapshot, cached copy, or a blank
//! shell at genesis), pulls the remaining envelopes from the event
//! store, pushes each through the upcaster runtime and hands the typed
//! events to the apply engine. Temporal reconstructions (`at version` /
//! `as of`) produce read-only instances and never touch the identity
//! map, so a historical view can never be served as current state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use log::{error, trace, warn};

use crate::agg::{Aggregate, AggregateState};
use crate::apply::AggregateType;
use crate::config::StoreConfig;
use crate::error::Error;
use crate::evt::Envelope;
use crate::handle::Handle;
use crate::store::{
    EventStore, Snapshot, StoreError, snapshot_stream_name, stream_name,
};

//------------ AggregateStore ------------------------------------------------

/// Reconstruction engine for one aggregate type.
///
/// Holds no mutable state beyond the identity-map cache; the schema and
/// handler tables inside the [`AggregateType`] are frozen at build time.
/// Every load hands the caller an independent instance.
pub struct AggregateStore<S: AggregateState> {
    ty: AggregateType<S>,
    store: Arc<dyn EventStore>,
    config: StoreConfig,
    cache: RwLock<HashMap<Handle, CachedInstance<S>>>,
}

struct CachedInstance<S: AggregateState> {
    agg: Arc<Aggregate<S>>,
    /// Version of the latest known snapshot, `-1` if none exists.
    snapshot_version: i64,
}

/// Outcome counters of a best-effort replay.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    pub delivered: u64,
    pub skipped: u64,
}

impl<S: AggregateState> AggregateStore<S> {
    pub fn create(ty: AggregateType<S>, store: Arc<dyn EventStore>, config: StoreConfig) -> Self {
        AggregateStore {
            ty,
            store,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn aggregate_type(&self) -> &AggregateType<S> {
        &self.ty
    }

    fn stream(&self, handle: &Handle) -> String {
        stream_name(self.ty.category(), handle)
    }

    fn snapshot_stream(&self, handle: &Handle) -> String {
        snapshot_stream_name(self.ty.category(), handle)
    }

    //--- Standard loads

    /// Reconstructs the current state of an instance.
    ///
    /// Starts from the cached copy or the latest snapshot when one is
    /// available and replays only the tail of the stream. As a side
    /// effect, writes a fresh snapshot when more events were replayed
    /// past the last one than the configured threshold allows; a failed
    /// snapshot write is logged and never fails the read it piggybacks
    /// on.
    pub fn load(&self, handle: &Handle) -> Result<Aggregate<S>, Error> {
        let stream = self.stream(handle);

        let (mut agg, snapshot_version) = match self.cache_get(handle) {
            Some(cached) => {
                trace!(
                    "loading '{handle}' from cached copy at version {}",
                    cached.agg.version()
                );
                ((*cached.agg).clone(), cached.snapshot_version)
            }
            None => match self.store.read_snapshot(&self.snapshot_stream(handle))? {
                Some(snapshot) => {
                    trace!(
                        "loading '{handle}' from snapshot at version {}",
                        snapshot.version()
                    );
                    let version = snapshot.version();
                    (self.from_snapshot(handle, snapshot)?, version)
                }
                None => {
                    trace!("loading '{handle}' from genesis");
                    (Aggregate::reconstitution_shell(handle.clone()), -1)
                }
            },
        };

        let seen = self.replay_tail(&mut agg, &stream, None, None)?;
        if agg.version() == -1 && seen == 0 {
            error!("could not load aggregate '{handle}': no stream");
            return Err(Error::UnknownAggregate(handle.clone()));
        }
        agg.finish_reconstitution();

        let snapshot_version = self.maybe_snapshot(&agg, snapshot_version);
        self.cache_update(handle, &agg, snapshot_version);
        Ok(agg)
    }

    /// Whether an instance exists for the handle.
    pub fn has(&self, handle: &Handle) -> Result<bool, Error> {
        Ok(self.list()?.contains(handle))
    }

    /// Lists all known instances of this aggregate type.
    pub fn list(&self) -> Result<Vec<Handle>, Error> {
        Ok(self.store.list_streams(self.ty.category())?)
    }

    /// Loads every known instance into the cache.
    ///
    /// Call once after startup so the first real loads only replay
    /// stream tails.
    pub fn warm(&self) -> Result<(), Error> {
        for handle in self.list()? {
            if let Err(e) = self.load(&handle) {
                error!("warm-up failed for '{handle}': {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    //--- Temporal loads

    /// Reconstructs the state an instance had at the given version.
    ///
    /// Uses a snapshot only if the snapshot does not already lie past
    /// the requested version; otherwise replay starts from genesis. The
    /// result is read-only and bypasses the identity map.
    pub fn load_at_version(&self, handle: &Handle, version: i64) -> Result<Aggregate<S>, Error> {
        let stream = self.stream(handle);

        let mut agg = match self.store.read_snapshot(&self.snapshot_stream(handle))? {
            Some(snapshot) if snapshot.version() <= version => {
                self.from_snapshot(handle, snapshot)?
            }
            _ => Aggregate::reconstitution_shell(handle.clone()),
        };

        let seen = self.replay_tail(&mut agg, &stream, Some(version), None)?;
        if agg.version() == -1 && seen == 0 {
            return Err(Error::UnknownAggregate(handle.clone()));
        }
        if agg.version() < version {
            return Err(Error::VersionNotReached {
                handle: handle.clone(),
                requested: version,
                reached: agg.version(),
            });
        }
        agg.finish_reconstitution();
        agg.mark_temporal();
        Ok(agg)
    }

    /// Reconstructs the state an instance had at the given time.
    ///
    /// Replays, in stream order, only the events written at or before
    /// the given timestamp. Never uses a snapshot: a snapshot's write
    /// time does not correspond to a meaningful aggregate-state
    /// timestamp. The result is read-only and bypasses the identity
    /// map.
    pub fn load_as_of(
        &self,
        handle: &Handle,
        timestamp: DateTime<Utc>,
    ) -> Result<Aggregate<S>, Error> {
        let stream = self.stream(handle);
        let mut agg = Aggregate::reconstitution_shell(handle.clone());

        let seen = self.replay_tail(&mut agg, &stream, None, Some(timestamp))?;
        if seen == 0 {
            return Err(Error::UnknownAggregate(handle.clone()));
        }
        agg.finish_reconstitution();
        agg.mark_temporal();
        Ok(agg)
    }

    //--- Snapshots

    /// Writes a snapshot of the instance's current state.
    ///
    /// Always replays the entire stream from genesis first, bypassing
    /// any existing snapshot and the cache.
    pub fn create_snapshot(&self, handle: &Handle) -> Result<(), Error> {
        let stream = self.stream(handle);
        let mut agg = Aggregate::reconstitution_shell(handle.clone());
        let seen = self.replay_tail(&mut agg, &stream, None, None)?;
        if agg.version() == -1 && seen == 0 {
            return Err(Error::UnknownAggregate(handle.clone()));
        }
        agg.finish_reconstitution();
        self.write_snapshot(&agg)?;
        Ok(())
    }

    /// Writes snapshots for all instances of this aggregate type.
    pub fn create_snapshots(&self) -> Result<usize, Error> {
        let handles = self.list()?;
        for handle in &handles {
            self.create_snapshot(handle)?;
        }
        Ok(handles.len())
    }

    fn maybe_snapshot(&self, agg: &Aggregate<S>, snapshot_version: i64) -> i64 {
        if agg.version() - snapshot_version <= self.config.snapshot_threshold as i64 {
            return snapshot_version;
        }
        match self.write_snapshot(agg) {
            Ok(()) => {
                trace!(
                    "snapshotted '{}' at version {}",
                    agg.handle(),
                    agg.version()
                );
                agg.version()
            }
            Err(e) => {
                // A read must never fail because its piggybacked
                // snapshot write did.
                warn!(
                    "failed to snapshot '{}' at version {}: {e}",
                    agg.handle(),
                    agg.version()
                );
                snapshot_version
            }
        }
    }

    fn write_snapshot(&self, agg: &Aggregate<S>) -> Result<(), Error> {
        let state = serde_json::to_value(agg.state()).map_err(StoreError::Json)?;
        let snapshot = Snapshot::new(
            agg.handle().clone(),
            agg.version(),
            agg.stream_position() as u64,
            state,
            Utc::now(),
        );
        self.store
            .append_snapshot(&self.snapshot_stream(agg.handle()), snapshot)?;
        Ok(())
    }

    fn from_snapshot(&self, handle: &Handle, snapshot: Snapshot) -> Result<Aggregate<S>, Error> {
        let state: S =
            serde_json::from_value(snapshot.state().clone()).map_err(|source| {
                Error::SnapshotDecode {
                    handle: handle.clone(),
                    source,
                }
            })?;
        Ok(Aggregate::from_snapshot_parts(
            handle.clone(),
            snapshot.version(),
            snapshot.stream_position() as i64,
            state,
        ))
    }

    //--- Replay

    /// Strict replay of a stream tail onto an instance.
    ///
    /// Reads everything past the instance's stream position and applies
    /// it in order, optionally stopping at a target version or skipping
    /// envelopes written after a cutoff time. Returns the number of
    /// envelopes read. Any checksum, schema-resolution or apply failure
    /// aborts the whole reconstruction.
    fn replay_tail(
        &self,
        agg: &mut Aggregate<S>,
        stream: &str,
        up_to_version: Option<i64>,
        up_to_time: Option<DateTime<Utc>>,
    ) -> Result<usize, Error> {
        let from = (agg.stream_position() + 1) as u64;
        let envelopes = self.store.read_events(stream, from)?;
        let seen = envelopes.len();

        for stored in envelopes {
            if let Some(version) = up_to_version {
                if agg.version() >= version {
                    break;
                }
            }
            if let Some(cutoff) = up_to_time {
                if stored.written_at() > cutoff {
                    continue;
                }
            }
            if !stored.checksum_matches() {
                return Err(Error::ChecksumMismatch {
                    stream: stream.to_string(),
                    position: stored.stream_position(),
                });
            }
            let position = stored.stream_position();
            let envelope = self.ty.schema().decode(&stored)?;
            self.ty.apply_replay(agg, envelope.into_event())?;
            agg.set_stream_position(position as i64);
        }
        Ok(seen)
    }

    /// Best-effort replay of a full stream for projection rebuilds.
    ///
    /// Decodes every envelope from genesis and feeds the typed
    /// envelopes, fact events included, to the sink. Envelopes that
    /// fail their checksum or cannot be resolved to the current schema
    /// are logged, counted as skipped and do not abort the rebuild.
    pub fn replay_lenient(
        &self,
        handle: &Handle,
        mut sink: impl FnMut(Envelope<S::Event>),
    ) -> Result<ReplayStats, Error> {
        let stream = self.stream(handle);
        let mut stats = ReplayStats::default();

        for stored in self.store.read_events(&stream, 0)? {
            if !stored.checksum_matches() {
                warn!(
                    "rebuild: skipping corrupt envelope at position {} of \
                     '{stream}'",
                    stored.stream_position()
                );
                stats.skipped += 1;
                continue;
            }
            match self.ty.schema().decode(&stored) {
                Ok(envelope) => {
                    sink(envelope);
                    stats.delivered += 1;
                }
                Err(e) => {
                    warn!(
                        "rebuild: skipping envelope at position {} of \
                         '{stream}': {e}",
                        stored.stream_position()
                    );
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    //--- Cache

    fn cache_get(&self, handle: &Handle) -> Option<CachedInstance<S>> {
        if !self.config.use_cache {
            return None;
        }
        let cache = self.cache.read().unwrap();
        cache.get(handle).map(|cached| CachedInstance {
            agg: cached.agg.clone(),
            snapshot_version: cached.snapshot_version,
        })
    }

    fn cache_update(&self, handle: &Handle, agg: &Aggregate<S>, snapshot_version: i64) {
        if !self.config.use_cache {
            return;
        }
        self.cache.write().unwrap().insert(
            handle.clone(),
            CachedInstance {
                agg: Arc::new(agg.clone()),
                snapshot_version,
            },
        );
    }
}

//------------ SnapshotSource ------------------------------------------------

/// One aggregate type's store, as seen by system-wide snapshot fan-out.
pub trait SnapshotSource: Send + Sync {
    fn category(&self) -> &'static str;

    /// Writes snapshots for all instances of the type.
    fn create_snapshots(&self) -> Result<usize, Error>;
}

impl<S: AggregateState> SnapshotSource for AggregateStore<S> {
    fn category(&self) -> &'static str {
        self.ty.category()
    }

    fn create_snapshots(&self) -> Result<usize, Error> {
        AggregateStore::create_snapshots(self)
    }
}

/// Writes snapshots for every instance of every registered aggregate
/// type. Returns the number of snapshots written.
pub fn create_all_snapshots(sources: &[Arc<dyn SnapshotSource>]) -> Result<usize, Error> {
    let mut written = 0;
    for source in sources {
        let count = source.create_snapshots()?;
        trace!("snapshotted {count} instance(s) of '{}'", source.category());
        written += count;
    }
    Ok(written)
}
