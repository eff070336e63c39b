use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

/// Exponential delay between a floor and a ceiling with a little jitter
///
/// Each call to `next_delay` doubles the base delay until the ceiling is
/// reached. Up to a quarter of the base is added as random jitter so that
/// many idle workers do not poll the store in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.ceiling);

        let jitter_cap = base.as_micros() as u64 / 4;
        let jitter = if jitter_cap > 0 {
            Duration::from_micros(rand::thread_rng().gen_range(0..=jitter_cap))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.ceiling)
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}
