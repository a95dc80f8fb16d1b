//! Wire codecs for command batches.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SignalError};

/// Encoding used when commands leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Human readable JSON.
    #[default]
    Json,

    /// Compact MessagePack with named fields.
    MessagePack,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Json => serde_json::to_vec(value).map_err(|e| SignalError::Codec(e.to_string())),
            Codec::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| SignalError::Codec(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| SignalError::Codec(e.to_string()))
            }
            Codec::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| SignalError::Codec(e.to_string()))
            }
        }
    }
}
