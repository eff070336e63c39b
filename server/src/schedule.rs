//! Fair work queue of instances ordered by last update time.

use crate::store::{ClaimOutcome, Store, StoreError};
use log::debug;
use shared::keys;
use std::sync::Arc;
use std::time::Duration;

/// The global schedule plus its claim-with-lease primitive
///
/// Entries are scored by the instance's last update (epoch ms) so the
/// instance that waited longest is always offered first. Claiming is a
/// single atomic store operation; no two workers can hold a lease on the
/// same instance at once.
#[derive(Clone)]
pub struct ScheduleQueue {
    store: Arc<dyn Store>,
    window: usize,
}

impl ScheduleQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, window: 1 }
    }

    /// Lets a claim look past a leased head at the next `window - 1` entries.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Atomically picks the oldest entry and leases it for `lease_ttl`.
    pub async fn claim_next(&self, lease_ttl: Duration) -> Result<ClaimOutcome, StoreError> {
        let outcome = self
            .store
            .claim_oldest(keys::schedule_key(), keys::LEASE_PREFIX, lease_ttl, self.window)
            .await?;
        if let ClaimOutcome::Claimed(id) = &outcome {
            debug!("Claimed instance {} for {:?}", id, lease_ttl);
        }
        Ok(outcome)
    }

    /// Sets the entry's score, inserting it if needed.
    pub async fn reschedule(&self, instance_id: &str, timestamp: i64) -> Result<(), StoreError> {
        self.store
            .sorted_set_add(keys::schedule_key(), instance_id, timestamp)
            .await
    }

    /// Drops an orphaned entry; returns whether it was present.
    pub async fn remove(&self, instance_id: &str) -> Result<bool, StoreError> {
        self.store
            .sorted_set_remove(keys::schedule_key(), instance_id)
            .await
    }

    pub async fn score(&self, instance_id: &str) -> Result<Option<i64>, StoreError> {
        self.store
            .sorted_set_score(keys::schedule_key(), instance_id)
            .await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.sorted_set_len(keys::schedule_key()).await
    }
}
