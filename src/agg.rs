//! Aggregates and their in-process instances.

use crate::error::InvariantViolation;
use crate::evt::Event;
use crate::handle::Handle;
use crate::store::Storable;

//------------ AggregateState ------------------------------------------------

/// The domain state of an aggregate.
///
/// An aggregate is the unit of consistency whose state is derived from
/// its event stream. Implementations hold the domain fields; all
/// mutation goes through the handlers registered on the aggregate's
/// [`AggregateType`], never through methods on the state itself.
///
/// [`AggregateType`]: crate::apply::AggregateType
pub trait AggregateState: Storable + Send + Sync + 'static {
    type Event: Event;

    /// Produces the blank shell used as the starting point of a replay.
    ///
    /// The shell is valid but incomplete; the engine marks it as under
    /// construction and suppresses invariant checks until replay has
    /// finished.
    fn reconstitute() -> Self;

    /// Checks the aggregate's domain invariants.
    ///
    /// Called by the live apply path before and after every mutation.
    /// Never called during replay: an aggregate mid-replay may
    /// transiently violate invariants that only hold once all events are
    /// applied.
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        Ok(())
    }
}

//------------ Aggregate -----------------------------------------------------

/// One in-process instance of an aggregate.
///
/// Owned exclusively by the caller that loaded or created it; the engine
/// never shares an instance across threads. The version starts at `-1`
/// for a blank shell and reaches `0` when the first non-fact event is
/// applied, so `version == count of non-fact events - 1` on every path.
#[derive(Clone)]
pub struct Aggregate<S: AggregateState> {
    handle: Handle,
    version: i64,
    stream_position: i64,
    state: S,
    pending: Vec<S::Event>,
    invariant_checks_suppressed: bool,
    temporal: bool,
}

impl<S: AggregateState> std::fmt::Debug for Aggregate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregate")
            .field("handle", &self.handle)
            .field("version", &self.version)
            .field("stream_position", &self.stream_position)
            .field("pending", &self.pending.len())
            .field("invariant_checks_suppressed", &self.invariant_checks_suppressed)
            .field("temporal", &self.temporal)
            .finish_non_exhaustive()
    }
}

impl<S: AggregateState> Aggregate<S> {
    /// Produces an under-construction shell for reconstitution.
    ///
    /// Invariant checks are suppressed until the reconstructor marks the
    /// replay complete.
    pub(crate) fn reconstitution_shell(handle: Handle) -> Self {
        Aggregate {
            handle,
            version: -1,
            stream_position: -1,
            state: S::reconstitute(),
            pending: Vec::new(),
            invariant_checks_suppressed: true,
            temporal: false,
        }
    }

    /// Restores an instance from snapshot data.
    pub(crate) fn from_snapshot_parts(
        handle: Handle,
        version: i64,
        stream_position: i64,
        state: S,
    ) -> Self {
        Aggregate {
            handle,
            version,
            stream_position,
            state,
            pending: Vec::new(),
            invariant_checks_suppressed: false,
            temporal: false,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The current version: `-1` before any event, `0` after the first.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The stream position of the last envelope replayed into this
    /// instance, or `-1` if none was.
    pub fn stream_position(&self) -> i64 {
        self.stream_position
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Events raised live on this instance and not yet persisted.
    pub fn pending_events(&self) -> &[S::Event] {
        &self.pending
    }

    /// Hands the pending events to the persistence boundary.
    pub fn take_pending_events(&mut self) -> Vec<S::Event> {
        std::mem::take(&mut self.pending)
    }

    /// Whether this instance is a read-only temporal reconstruction.
    pub fn is_temporal(&self) -> bool {
        self.temporal
    }

    pub(crate) fn version_mut(&mut self) -> &mut i64 {
        &mut self.version
    }

    pub(crate) fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub(crate) fn push_pending(&mut self, event: S::Event) {
        self.pending.push(event);
    }

    pub(crate) fn invariant_checks_suppressed(&self) -> bool {
        self.invariant_checks_suppressed
    }

    pub(crate) fn set_stream_position(&mut self, position: i64) {
        self.stream_position = position;
    }

    /// Marks reconstitution as finished; invariant checks apply again.
    pub(crate) fn finish_reconstitution(&mut self) {
        self.invariant_checks_suppressed = false;
    }

    /// Marks this instance as a read-only temporal reconstruction.
    pub(crate) fn mark_temporal(&mut self) {
        self.temporal = true;
    }

    /// Restores state and version after a failed live mutation.
    pub(crate) fn restore(&mut self, state: S, version: i64) {
        self.state = state;
        self.version = version;
    }
}
