//! Event-sourced aggregate reconstruction.
//!
//! This crate derives an aggregate's current state from an append-only
//! log of events. It supports point-in-time snapshots as replay
//! accelerators, temporal ("as of version/time") queries, and
//! transparent rewriting of historical event payloads whose schema has
//! since evolved (upcasting). Live mutation and historical replay share
//! one set of per-event-type mutation handlers, so both paths produce
//! identical state.
//!
//! The pieces, bottom up:
//!
//! * [`evt`]: events, type tags and the envelopes events are stored in.
//! * [`upcast`]: schema migration chains, compiled and validated once at
//!   startup, applied on the read path.
//! * [`agg`] and [`apply`]: aggregate instances and the apply engine
//!   that mutates them.
//! * [`store`] and [`diskstore`]: the event-store adapter interface with
//!   an in-memory and a filesystem implementation.
//! * [`recon`]: the reconstructor tying it all together, with snapshot
//!   policy and the identity-map cache.

pub mod agg;
pub mod apply;
pub mod config;
pub mod diskstore;
pub mod error;
pub mod evt;
pub mod handle;
pub mod recon;
pub mod store;
pub mod upcast;


pub use self::agg::{Aggregate, AggregateState};
pub use self::apply::{AggregateType, AggregateTypeBuilder};
pub use self::config::StoreConfig;
pub use self::diskstore::FsEventStore;
pub use self::error::{Error, InvariantViolation};
pub use self::evt::{Envelope, Event, StoredEnvelope, TypeTag};
pub use self::handle::Handle;
pub use self::recon::{AggregateStore, ReplayStats, SnapshotSource, create_all_snapshots};
pub use self::store::{EventStore, MemoryEventStore, Snapshot, StoreError};
