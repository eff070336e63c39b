//! Store key layout shared by workers, provisioning tools and clients.
//!
//! Every function here is a pure string builder. The exact strings are part
//! of the wire contract: any process touching the same store must agree on
//! them.

/// Sorted set of instance ids scored by their last update time (ms).
pub const SCHEDULE_KEY: &str = "updated_game_instances";

/// Prefix prepended to an instance id to form its lease marker.
pub const LEASE_PREFIX: &str = "lock:";

/// Hash holding `id`, `state`, `updated` and `players` for one instance.
pub fn instance_key(instance_id: &str) -> String {
    instance_id.to_string()
}

/// List of pending input events for one instance, appended at the tail.
pub fn instance_messages_key(instance_id: &str) -> String {
    format!("{}:messages", instance_key(instance_id))
}

/// List of raw messages that failed to decode and were set aside.
pub fn instance_quarantine_key(instance_id: &str) -> String {
    format!("{}:quarantine", instance_messages_key(instance_id))
}

/// List of raw record fields that failed to decode, one list per field.
pub fn record_quarantine_key(instance_id: &str, field: &str) -> String {
    format!("{}:{}:quarantine", instance_key(instance_id), field)
}

/// Lease marker guarding exclusive processing of one instance.
pub fn lease_key(instance_id: &str) -> String {
    format!("{}{}", LEASE_PREFIX, instance_id)
}

/// Last heartbeat timestamp written by a connected player.
pub fn player_heartbeat_key(player_id: &str) -> String {
    format!("{}:heartbeat", player_id)
}

/// Pub/sub channel carrying outbound events to one player.
pub fn player_channel_key(player_id: &str) -> String {
    format!("{}:output_to_player", player_id)
}

/// The global schedule.
pub fn schedule_key() -> &'static str {
    SCHEDULE_KEY
}
