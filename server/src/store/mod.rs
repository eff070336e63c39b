//! Access to the shared key-value store.
//!
//! Every coordination guarantee of the tick workers is mediated by the
//! store: there is no in-process state shared between schedulers. The
//! [`Store`] trait exposes exactly the primitives the workers need, each
//! method being one round trip. Two backends implement it:
//!
//! - [`RedisStore`] speaks RESP over TCP to a Redis-compatible server and
//!   bounds every round trip with a timeout.
//! - [`MemoryStore`] keeps everything in process with the same semantics
//!   and is used for tests and single-process embedding.

pub mod memory;
pub mod redis;
pub mod resp;

pub use memory::MemoryStore;
pub use redis::{RedisConfig, RedisStore};

use async_trait::async_trait;
use shared::InstanceId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store round trip exceeded {0:?}")]
    Timeout(Duration),
    #[error("store protocol error: {0}")]
    Protocol(String),
    #[error("store replied with error: {0}")]
    Redis(String),
    #[error("invalid store url {0:?}")]
    InvalidUrl(String),
}

impl StoreError {
    /// Connectivity failures that are expected to heal on their own.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Timeout(_))
    }
}

/// Result of one atomic claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The lease was acquired for this instance.
    Claimed(InstanceId),
    /// Every candidate examined already holds a live lease; carries the head.
    Leased(InstanceId),
    /// The schedule has no entries.
    Empty,
}

impl ClaimOutcome {
    pub fn claimed(self) -> Option<InstanceId> {
        match self {
            ClaimOutcome::Claimed(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Writes applied atomically at the end of a successful tick.
#[derive(Debug, Clone, Default)]
pub struct TickCommit {
    pub record_key: String,
    pub fields: Vec<(String, Vec<u8>)>,
    pub queue_key: String,
    /// Number of entries to drop from the head of `queue_key`.
    pub consumed: usize,
    pub quarantine_key: String,
    pub quarantined: Vec<Vec<u8>>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Looks at the first `window` entries of the schedule, lowest score
    /// first, and sets the lease key of the first one without a live lease.
    /// Reading candidates and acquiring the lease is a single atomic step.
    async fn claim_oldest(
        &self,
        schedule_key: &str,
        lease_prefix: &str,
        ttl: Duration,
        window: usize,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Upserts `member` with `score`.
    async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError>;

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError>;

    /// All fields of a hash; empty when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<(), StoreError>;

    /// Whole list, head first.
    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Appends at the tail and returns the new length.
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize, StoreError>;

    /// Applies the commit atomically if the record still exists.
    ///
    /// Returns `false`, having written nothing, when the record is gone;
    /// a commit never recreates a record removed by provisioning.
    async fn commit(&self, commit: &TickCommit) -> Result<bool, StoreError>;

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    async fn set_value(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Returns the number of subscribers that received the payload.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError>;
}
