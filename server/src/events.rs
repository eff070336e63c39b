//! Observable stream of what the tick workers are doing.

use shared::InstanceId;
use std::time::Duration;

/// Counters accumulated by one scheduler over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub orphans_removed: u64,
    pub tick_failures: u64,
    pub decode_failures: u64,
    pub quarantined: u64,
    pub store_failures: u64,
    pub idle_polls: u64,
}

/// Published on the server's broadcast channel as the scheduler runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Claimed {
        instance_id: InstanceId,
    },
    /// Sent once when a worker starts finding nothing to claim.
    /// `leased` names the head of the schedule when it was held by someone else.
    NothingToClaim {
        leased: Option<InstanceId>,
    },
    Orphaned {
        instance_id: InstanceId,
    },
    EventQuarantined {
        instance_id: InstanceId,
        reason: String,
    },
    /// A record field could not be decoded. The raw field was copied to its
    /// quarantine list and the instance left the schedule.
    RecordQuarantined {
        instance_id: InstanceId,
        field: String,
        reason: String,
    },
    TickFailed {
        instance_id: InstanceId,
        reason: String,
    },
    Committed {
        instance_id: InstanceId,
        updated_at: i64,
        events: usize,
    },
    CommitFailed {
        instance_id: InstanceId,
        reason: String,
    },
    RescheduleFailed {
        instance_id: InstanceId,
        reason: String,
    },
    StoreUnavailable {
        reason: String,
        retry_in: Duration,
    },
    Stopped {
        stats: SchedulerStats,
    },
}
