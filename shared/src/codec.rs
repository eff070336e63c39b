//! Conversion between typed payloads and the store's byte representation.

use crate::Event;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode codec error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("invalid integer field {0:?}")]
    InvalidInteger(String),
    #[error("unknown wire format {0:?}")]
    UnknownFormat(String),
}

/// Serialization used for states, player lists and events.
///
/// Every process sharing a store must agree on the format. Timestamps are
/// always written as decimal text regardless of format so the schedule and
/// heartbeat keys stay readable by other tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WireFormat {
    #[default]
    Json,
    Bincode,
}

impl FromStr for WireFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "bincode" => Ok(WireFormat::Bincode),
            other => Err(CodecError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Json => write!(f, "json"),
            WireFormat::Bincode => write!(f, "bincode"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventCodec {
    format: WireFormat,
}

impl EventCodec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self.format {
            WireFormat::Json => Ok(serde_json::to_vec(value)?),
            WireFormat::Bincode => Ok(bincode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self.format {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::Bincode => Ok(bincode::deserialize(bytes)?),
        }
    }

    /// Decodes one raw entry of an instance's pending queue.
    pub fn decode_event<M: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Event<M>, CodecError> {
        self.decode(bytes)
    }

    pub fn encode_event<M: Serialize>(&self, event: &Event<M>) -> Result<Vec<u8>, CodecError> {
        self.encode(event)
    }

    pub fn encode_timestamp(&self, millis: i64) -> Vec<u8> {
        millis.to_string().into_bytes()
    }

    pub fn decode_timestamp(&self, bytes: &[u8]) -> Result<i64, CodecError> {
        let text = String::from_utf8_lossy(bytes);
        text.trim()
            .parse::<i64>()
            .map_err(|_| CodecError::InvalidInteger(text.into_owned()))
    }
}
