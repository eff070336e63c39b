//! Data model shared by tick workers, provisioning tools and player-facing
//! services: instance records, pending input events, outbound events, the
//! store key layout and the payload codec.

pub mod codec;
pub mod keys;

pub use codec::{CodecError, EventCodec, WireFormat};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Opaque unique identifier of one game instance.
pub type InstanceId = String;

/// Type tag given to every outbound event published to a player.
pub const GENERIC_MESSAGE_TYPE: &str = "generic-message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerData<P> {
    pub id: String,
    pub data: P,
}

/// Durable snapshot of one instance as stored in its record hash.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord<S, P> {
    pub id: InstanceId,
    pub state: S,
    pub players: Vec<PlayerData<P>>,
    /// Epoch milliseconds of the last successful tick.
    pub updated_at: i64,
}

impl<S: Default, P> InstanceRecord<S, P> {
    pub fn new(id: impl Into<InstanceId>) -> Self {
        Self {
            id: id.into(),
            state: S::default(),
            players: Vec::new(),
            updated_at: 0,
        }
    }
}

impl<S, P> InstanceRecord<S, P> {
    pub fn player_ids(&self) -> impl Iterator<Item = &str> {
        self.players.iter().map(|p| p.id.as_str())
    }
}

/// One unit of player input waiting in an instance's pending queue.
///
/// Ids strictly increase within an instance. The JSON field names match the
/// layout written by existing clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<M> {
    pub id: u64,
    #[serde(rename = "gameInstanceId", default)]
    pub instance_id: InstanceId,
    #[serde(rename = "playerId", default)]
    pub player_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub message: Option<M>,
}

/// Untyped envelope for messages whose shape is only known to the game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Carried as JSON text in binary formats, which cannot hold a
    /// self-describing value.
    #[serde(default, with = "json_data")]
    pub data: serde_json::Value,
}

mod json_data {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            value.serialize(serializer)
        } else {
            value.to_string().serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        if deserializer.is_human_readable() {
            Value::deserialize(deserializer)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text).map_err(D::Error::custom)
        }
    }
}

impl GenericMessage {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Interprets the envelope's data as a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Event published on a player's outbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent<M> {
    #[serde(rename = "gameInstanceId")]
    pub instance_id: InstanceId,
    #[serde(rename = "playerId")]
    pub player_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: u64,
    pub message: M,
}
