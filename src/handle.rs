//! Identities for aggregate instances.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

//------------ Handle --------------------------------------------------------

/// The identity of one aggregate instance.
///
/// A handle is a non-empty string of at most 255 bytes using only
/// alphanumeric characters, `-` and `_`. The restriction keeps handles
/// safe for use in stream names and directory names without escaping.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Handle {
    name: Arc<str>,
}

impl Handle {
    pub const MAX_LEN: usize = 255;

    fn verify(s: &str) -> Result<(), InvalidHandle> {
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(InvalidHandle(s.to_string()));
        }
        if s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            Ok(())
        } else {
            Err(InvalidHandle(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl FromStr for Handle {
    type Err = InvalidHandle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::verify(s)?;
        Ok(Handle { name: s.into() })
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.name.fmt(f)
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.name.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Handle::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//------------ InvalidHandle -------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidHandle(String);

impl fmt::Display for InvalidHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid handle: '{}'", self.0)
    }
}

impl std::error::Error for InvalidHandle {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn accepts_safe_names() {
        assert!(Handle::from_str("order-42_a").is_ok());
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(Handle::from_str("").is_err());
        assert!(Handle::from_str("a/b").is_err());
        assert!(Handle::from_str("a b").is_err());
        assert!(Handle::from_str(&"x".repeat(256)).is_err());
    }
}
