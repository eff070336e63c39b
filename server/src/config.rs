use shared::{EventCodec, WireFormat};
use std::time::Duration;

/// Settings for one game server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `redis://host[:port][/db]` or `host[:port]`
    pub store_url: String,
    /// Ticks per second for each instance; the lease period derives from it
    pub tick_rate: u32,
    /// Upper bound on any single store round trip
    pub store_timeout: Duration,
    pub idle_backoff_floor: Duration,
    pub idle_backoff_ceiling: Duration,
    pub error_backoff_floor: Duration,
    pub error_backoff_ceiling: Duration,
    /// How many schedule entries a claim may look at; 1 only considers the head
    pub claim_window: usize,
    pub wire_format: WireFormat,
    /// Buffered scheduler events per subscriber before old ones are dropped
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            store_url: "redis://127.0.0.1:6379".to_string(),
            tick_rate: 30,
            store_timeout: Duration::from_secs(2),
            idle_backoff_floor: Duration::from_millis(1),
            idle_backoff_ceiling: Duration::from_millis(50),
            error_backoff_floor: Duration::from_millis(50),
            error_backoff_ceiling: Duration::from_secs(5),
            claim_window: 1,
            wire_format: WireFormat::Json,
            event_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Lease period: one tick interval, never below one millisecond.
    ///
    /// The lease outlives the reschedule, so an instance is ticked at most
    /// once per period no matter how many workers are polling.
    pub fn lease_ttl(&self) -> Duration {
        let millis = 1000 / u64::from(self.tick_rate.max(1));
        Duration::from_millis(millis.max(1))
    }

    pub fn codec(&self) -> EventCodec {
        EventCodec::new(self.wire_format)
    }
}
