//! Outbound events published to players' channels.
//!
//! Delivery is fire-and-forget: a publish that reaches no subscriber is not
//! retried and nothing is acknowledged.

use crate::store::{Store, StoreError};
use log::debug;
use serde::Serialize;
use shared::{keys, CodecError, EventCodec, OutboundEvent, GENERIC_MESSAGE_TYPE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode outbound event: {0}")]
    Codec(#[from] CodecError),
}

pub struct Messenger {
    store: Arc<dyn Store>,
    codec: EventCodec,
    next_event_id: AtomicU64,
}

impl Messenger {
    pub fn new(store: Arc<dyn Store>, codec: EventCodec) -> Self {
        Self {
            store,
            codec,
            next_event_id: AtomicU64::new(0),
        }
    }

    /// Publishes one message to a player and returns how many subscribers
    /// received it.
    pub async fn send<M: Serialize>(
        &self,
        instance_id: &str,
        player_id: &str,
        message: M,
    ) -> Result<usize, MessagingError> {
        let event = OutboundEvent {
            instance_id: instance_id.to_string(),
            player_id: player_id.to_string(),
            kind: GENERIC_MESSAGE_TYPE.to_string(),
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            message,
        };
        let payload = self.codec.encode(&event)?;
        let receivers = self
            .store
            .publish(&keys::player_channel_key(player_id), &payload)
            .await?;

        debug!(
            "Event {} for player {} of {} reached {} subscriber(s)",
            event.id, player_id, instance_id, receivers
        );
        Ok(receivers)
    }
}
