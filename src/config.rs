//! Configuration for the reconstruction engine.

use serde::Deserialize;

//------------ StoreConfig ---------------------------------------------------

/// Tunables for an aggregate store.
///
/// Deserializable from a TOML fragment; every field has a default so an
/// empty document is a valid configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StoreConfig {
    /// Write a fresh snapshot when a standard load replayed more than
    /// this many events past the last snapshot (or past genesis).
    #[serde(default = "StoreConfig::dflt_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Keep loaded instances in the in-process identity map so later
    /// loads only replay the tail of the stream.
    #[serde(default = "StoreConfig::dflt_use_cache")]
    pub use_cache: bool,
}

impl StoreConfig {
    fn dflt_snapshot_threshold() -> u64 {
        5
    }

    fn dflt_use_cache() -> bool {
        true
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            snapshot_threshold: Self::dflt_snapshot_threshold(),
            use_cache: Self::dflt_use_cache(),
        }
    }
}

//------------ Tests ---------------------------------------------------------
