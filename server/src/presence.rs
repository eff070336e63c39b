//! Player presence derived from heartbeat keys written by connection services.

use crate::store::{Store, StoreError};
use shared::keys;

/// Last heartbeat (epoch ms) for each player, in the order given.
///
/// `None` means no heartbeat is recorded or it is not a valid timestamp.
/// No staleness filtering happens here; see [`connected_within`].
pub async fn read_heartbeats(
    store: &dyn Store,
    player_ids: &[String],
) -> Result<Vec<Option<u64>>, StoreError> {
    if player_ids.is_empty() {
        return Ok(Vec::new());
    }

    let heartbeat_keys: Vec<String> = player_ids
        .iter()
        .map(|id| keys::player_heartbeat_key(id))
        .collect();
    let values = store.get_many(&heartbeat_keys).await?;

    Ok(values
        .into_iter()
        .map(|value| {
            value.and_then(|bytes| String::from_utf8_lossy(&bytes).trim().parse::<u64>().ok())
        })
        .collect())
}

/// Caller-side staleness filter over heartbeats returned by [`read_heartbeats`].
pub fn connected_within(heartbeats: &[Option<u64>], now: u64, threshold_ms: u64) -> Vec<bool> {
    heartbeats
        .iter()
        .map(|heartbeat| heartbeat.is_some_and(|seen| now.saturating_sub(seen) <= threshold_ms))
        .collect()
}
