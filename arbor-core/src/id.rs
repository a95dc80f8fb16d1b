//! Node and command identifiers.
//!
//! Every node in a signal tree and every command is addressed by an [`Id`].
//! Ids are random 64-bit values, so independently created commands (for
//! example on two different clients) do not need coordination to stay unique.
//!
//! # Text Encoding
//!
//! Ids are written as the big-endian bytes of the value with leading zero
//! bytes removed, encoded as unpadded URL-safe base64. This keeps the common
//! ids short and makes the root id ([`Id::ZERO`]) encode to the empty string.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SignalError};

/// Identifier of a node or a command.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(u64);

impl Id {
    /// The id of the root node of every tree.
    pub const ZERO: Id = Id(0);

    /// Marker for the start or end of a list in a
    /// [`ListPosition`](crate::tree::ListPosition).
    pub const EDGE: Id = Id(u64::MAX);

    /// Generate a random id.
    ///
    /// Never returns [`Id::ZERO`] or [`Id::EDGE`].
    pub fn random() -> Self {
        loop {
            let value: u64 = rand::random();
            if value != 0 && value != u64::MAX {
                return Self(value);
            }
        }
    }

    /// Create an id from its raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Encode the id in its short text form.
    pub fn to_base64(&self) -> String {
        let bytes = self.0.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        URL_SAFE_NO_PAD.encode(&bytes[first..])
    }

    /// Parse the text form produced by [`to_base64`](Self::to_base64).
    pub fn parse(text: &str) -> Result<Self> {
        let decoded = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| SignalError::InvalidId(format!("{text:?}: {e}")))?;
        if decoded.len() > 8 {
            return Err(SignalError::InvalidId(format!("{text:?}: too long")));
        }

        let mut bytes = [0u8; 8];
        bytes[8 - decoded.len()..].copy_from_slice(&decoded);
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Id::ZERO => f.write_str("Id(ZERO)"),
            Id::EDGE => f.write_str("Id(EDGE)"),
            _ => write!(f, "Id({})", self.to_base64()),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Id::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_encodes_to_empty_string() {
        assert_eq!(Id::ZERO.to_base64(), "");
        assert_eq!(Id::parse("").unwrap(), Id::ZERO);
        assert_eq!(serde_json::to_string(&Id::ZERO).unwrap(), "\"\"");
    }

    #[test]
    fn small_ids_have_short_encoding() {
        assert_eq!(Id::from_raw(1).to_base64().len(), 2);
        assert_eq!(Id::from_raw(u64::MAX - 1).to_base64().len(), 11);
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = Id::random();
        let b = Id::random();

        assert_ne!(a, b);
        assert_ne!(a, Id::ZERO);
        assert_ne!(a, Id::EDGE);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(Id::parse("!!"), Err(SignalError::InvalidId(_))));
        assert!(matches!(
            Id::parse("AAAAAAAAAAAAAAAA"),
            Err(SignalError::InvalidId(_))
        ));
    }

    #[test]
    fn ids_work_as_json_map_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert(Id::from_raw(42), 1);
        map.insert(Id::ZERO, 2);

        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::HashMap<Id, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    proptest! {
        #[test]
        fn text_form_is_reversible(raw in any::<u64>()) {
            let id = Id::from_raw(raw);
            prop_assert_eq!(Id::parse(&id.to_base64()).unwrap(), id);
        }

        #[test]
        fn ordering_follows_raw_value(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(Id::from_raw(a).cmp(&Id::from_raw(b)), a.cmp(&b));
        }
    }
}
