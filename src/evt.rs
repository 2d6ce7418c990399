//! Events and the envelopes they are stored in.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::Error;
use crate::store::Storable;

//------------ Event ---------------------------------------------------------

/// A state change of an aggregate.
///
/// Events cannot have side effects. If they did, replaying them would
/// become problematic. The `Display` impl is used for logging and
/// history rendering.
pub trait Event: Storable + fmt::Display + Eq + PartialEq + Send + Sync + 'static {
    /// The event family, e.g. `"Order.Placed"`.
    ///
    /// The family is the type tag without its version segment and is the
    /// key used for mutation-handler dispatch and upcaster-chain
    /// resolution.
    fn family(&self) -> &'static str;

    /// Whether this is a fact event.
    ///
    /// Fact events are auto-generated full-state copies embedded in the
    /// stream for external consumers. They carry no incremental mutation
    /// semantics: they never have a mutation handler and never advance
    /// the aggregate version.
    fn is_fact(&self) -> bool {
        false
    }
}

//------------ TypeTag -------------------------------------------------------

/// The schema-version tag stored with every envelope.
///
/// Rendered as `{family}.v{version}`, e.g. `Order.Placed.v2`. The version
/// is parsed by splitting on the *last* dot, so family names may contain
/// dots but no segment of the form `v<number>` at the end.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TypeTag {
    family: String,
    version: u32,
}

impl TypeTag {
    pub fn new(family: impl Into<String>, version: u32) -> Self {
        TypeTag {
            family: family.into(),
            version,
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl FromStr for TypeTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, version) = s
            .rsplit_once('.')
            .ok_or_else(|| Error::MalformedTypeTag(s.to_string()))?;
        let version = version
            .strip_prefix('v')
            .and_then(|v| u32::from_str(v).ok())
            .ok_or_else(|| Error::MalformedTypeTag(s.to_string()))?;
        if family.is_empty() {
            return Err(Error::MalformedTypeTag(s.to_string()));
        }
        Ok(TypeTag::new(family, version))
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.v{}", self.family, self.version)
    }
}

impl Serialize for TypeTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TypeTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TypeTag::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//------------ StoredEnvelope ------------------------------------------------

/// An event as it sits in the log: raw payload plus tracking metadata.
///
/// Envelopes are immutable once written. The payload is kept as a JSON
/// dict so that envelopes whose schema has since evolved can still be
/// read and rewritten by the upcaster chain before construction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StoredEnvelope {
    type_tag: TypeTag,
    payload: Value,
    stream_position: u64,
    global_position: u64,
    written_at: DateTime<Utc>,
    checksum: String,
}

impl StoredEnvelope {
    /// Creates an envelope, computing the payload checksum.
    pub fn new(
        type_tag: TypeTag,
        payload: Value,
        stream_position: u64,
        global_position: u64,
        written_at: DateTime<Utc>,
    ) -> Self {
        let checksum = payload_checksum(&payload);
        StoredEnvelope {
            type_tag,
            payload,
            stream_position,
            global_position,
            written_at,
            checksum,
        }
    }

    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn global_position(&self) -> u64 {
        self.global_position
    }

    pub fn written_at(&self) -> DateTime<Utc> {
        self.written_at
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Whether the stored checksum still matches the payload.
    pub fn checksum_matches(&self) -> bool {
        payload_checksum(&self.payload) == self.checksum
    }
}

impl fmt::Display for StoredEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "envelope '{}' at stream position {}",
            self.type_tag, self.stream_position
        )
    }
}

/// The hex BLAKE3 digest of the canonical JSON encoding of a payload.
pub fn payload_checksum(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(blake3::hash(&bytes).as_bytes())
}

//------------ Envelope ------------------------------------------------------

/// A decoded envelope: the typed event in its current schema, paired
/// with the metadata of what was actually stored.
///
/// When the stored payload went through an upcaster chain, `stored_tag`
/// keeps the original old-schema tag so audit information is preserved
/// even though the event itself is the current shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope<E> {
    event: E,
    stored_tag: TypeTag,
    stream_position: u64,
    global_position: u64,
    written_at: DateTime<Utc>,
}

impl<E> Envelope<E> {
    pub(crate) fn new(event: E, stored: &StoredEnvelope) -> Self {
        Envelope {
            event,
            stored_tag: stored.type_tag.clone(),
            stream_position: stored.stream_position,
            global_position: stored.global_position,
            written_at: stored.written_at,
        }
    }

    pub fn event(&self) -> &E {
        &self.event
    }

    pub fn into_event(self) -> E {
        self.event
    }

    pub fn stored_tag(&self) -> &TypeTag {
        &self.stored_tag
    }

    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn global_position(&self) -> u64 {
        self.global_position
    }

    pub fn written_at(&self) -> DateTime<Utc> {
        self.written_at
    }
}

//------------ Tests ---------------------------------------------------------
