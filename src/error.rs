//! Errors raised by the reconstruction engine.

use std::fmt;

use crate::evt::TypeTag;
use crate::handle::Handle;
use crate::store::StoreError;

//------------ InvariantViolation --------------------------------------------

/// A domain invariant did not hold after a live mutation.
///
/// Produced by [`AggregateState::check_invariants`] implementations. The
/// engine rolls the offending mutation back before surfacing this to the
/// caller.
///
/// [`AggregateState::check_invariants`]: crate::agg::AggregateState::check_invariants
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvariantViolation(String);

impl InvariantViolation {
    pub fn new(msg: impl fmt::Display) -> Self {
        InvariantViolation(msg.to_string())
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invariant violated: {}", self.0)
    }
}

impl std::error::Error for InvariantViolation {}

//------------ Error ---------------------------------------------------------

/// All errors the engine can raise.
///
/// The configuration variants can only occur while building an
/// [`AggregateType`]; once a build succeeds they are ruled out for the
/// lifetime of the process. The remaining variants surface synchronously
/// from the read and live-mutation paths. Nothing is retried internally.
///
/// [`AggregateType`]: crate::apply::AggregateType
#[derive(Debug)]
pub enum Error {
    // Configuration errors, fatal at startup.
    /// Two migration edges share the same source version within a family.
    AmbiguousMigration { family: String, from: u32 },

    /// A family's migration edges contain a version cycle.
    MigrationCycle { family: String },

    /// A family's migration edges converge on more than one terminal.
    NonConvergentSchema { family: String, terminals: Vec<u32> },

    /// A chain walk stalled before reaching the terminal version.
    MigrationGap {
        family: String,
        from: u32,
        stalled_at: u32,
    },

    /// The terminal version of a family is not a registered current type.
    MissingTerminal { family: String, terminal: u32 },

    /// An event family was registered twice.
    DuplicateEvent { family: String },

    /// A handler was registered for an unknown or fact event family.
    HandlerUnknownEvent { family: String },

    /// No mutation handler is registered for the event family.
    ///
    /// Raising an event without a handler is a programming defect; the
    /// builder rejects registrations that would allow it, so seeing this
    /// at apply time means the aggregate type was assembled by hand.
    HandlerMissing { family: String },

    // Schema resolution errors, raised at read time.
    /// A stored type tag could not be parsed.
    MalformedTypeTag(String),

    /// A type tag has neither a current-schema match nor an upcaster
    /// chain.
    UnmappedTypeTag(TypeTag),

    /// The (possibly upcast) payload did not decode into the current
    /// event type.
    EventDecode {
        tag: TypeTag,
        source: serde_json::Error,
    },

    /// A stored envelope's checksum does not match its payload.
    ChecksumMismatch { stream: String, position: u64 },

    // Apply errors.
    /// A live mutation violated a domain invariant and was rolled back.
    Invariant(InvariantViolation),

    /// An attempt was made to raise events against a temporal
    /// (read-only) aggregate.
    TemporalReadOnly(Handle),

    // Reconstruction errors.
    /// No stream exists for the handle.
    UnknownAggregate(Handle),

    /// The stream ended before the requested version was reached.
    VersionNotReached {
        handle: Handle,
        requested: i64,
        reached: i64,
    },

    /// A stored snapshot's state did not decode.
    SnapshotDecode {
        handle: Handle,
        source: serde_json::Error,
    },

    /// The storage adapter failed.
    Store(StoreError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AmbiguousMigration { family, from } => write!(
                f,
                "ambiguous migration: family '{family}' has two upcasters \
                 from version {from}"
            ),
            Error::MigrationCycle { family } => write!(
                f,
                "migration cycle in upcasters for family '{family}'"
            ),
            Error::NonConvergentSchema { family, terminals } => write!(
                f,
                "upcasters for family '{family}' do not converge on one \
                 terminal version (candidates: {terminals:?})"
            ),
            Error::MigrationGap {
                family,
                from,
                stalled_at,
            } => write!(
                f,
                "gap in upcaster chain for family '{family}': walk from \
                 version {from} stalled at version {stalled_at}"
            ),
            Error::MissingTerminal { family, terminal } => write!(
                f,
                "upcasters for family '{family}' target version {terminal} \
                 but no current event type '{family}.v{terminal}' is \
                 registered"
            ),
            Error::DuplicateEvent { family } => {
                write!(f, "event family '{family}' registered twice")
            }
            Error::HandlerUnknownEvent { family } => write!(
                f,
                "handler registered for '{family}' which is not a \
                 registered non-fact event family"
            ),
            Error::HandlerMissing { family } => write!(
                f,
                "no mutation handler registered for event family '{family}'"
            ),
            Error::MalformedTypeTag(s) => {
                write!(f, "malformed type tag: '{s}'")
            }
            Error::UnmappedTypeTag(tag) => write!(
                f,
                "type tag '{tag}' matches no current schema and no \
                 upcaster chain"
            ),
            Error::EventDecode { tag, source } => write!(
                f,
                "cannot decode event tagged '{tag}': {source}"
            ),
            Error::ChecksumMismatch { stream, position } => write!(
                f,
                "checksum mismatch for envelope at position {position} of \
                 stream '{stream}'"
            ),
            Error::Invariant(e) => e.fmt(f),
            Error::TemporalReadOnly(handle) => write!(
                f,
                "aggregate '{handle}' was loaded for a temporal query and \
                 is read-only"
            ),
            Error::UnknownAggregate(handle) => {
                write!(f, "unknown aggregate: '{handle}'")
            }
            Error::VersionNotReached {
                handle,
                requested,
                reached,
            } => write!(
                f,
                "stream for '{handle}' ends at version {reached}, before \
                 requested version {requested}"
            ),
            Error::SnapshotDecode { handle, source } => write!(
                f,
                "cannot decode snapshot state for '{handle}': {source}"
            ),
            Error::Store(e) => e.fmt(f),
        }
    }
}

impl From<InvariantViolation> for Error {
    fn from(e: InvariantViolation) -> Self {
        Error::Invariant(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::EventDecode { source, .. } => Some(source),
            Error::SnapshotDecode { source, .. } => Some(source),
            Error::Invariant(e) => Some(e),
            Error::Store(e) => Some(e),
            _ => None,
        }
    }
}
