//! The per-worker tick loop.
//!
//! Each iteration runs one cycle: claim the oldest instance, hydrate its
//! record, snapshot its pending events, hand both to the game's tick
//! function, commit the new state together with the consumed events, and
//! finally move the instance to the back of the schedule.
//!
//! A worker keeps exactly one store round trip in flight. Many workers,
//! in this process or others, may run against the same store; the claim
//! lease is the only thing keeping them apart.

use crate::config::ServerConfig;
use crate::events::{SchedulerEvent, SchedulerStats};
use crate::instance::{InstanceError, InstanceStore};
use crate::messaging::Messenger;
use crate::schedule::ScheduleQueue;
use crate::store::{ClaimOutcome, Store, StoreError};
use crate::utils::{get_timestamp, Backoff};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{Event, InstanceId, InstanceRecord};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;

/// Error type returned by game tick functions.
pub type TickError = Box<dyn std::error::Error + Send + Sync>;

/// Everything a tick function gets to see for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance<S, P, M> {
    pub record: InstanceRecord<S, P>,
    /// Pending events in ascending id order.
    pub events: Vec<Event<M>>,
}

/// The tick function's view of the server.
///
/// Messages sent through the handle are published only after the tick's
/// new state has been committed, so players never hear about state that
/// was thrown away.
#[derive(Debug)]
pub struct ServerHandle<M> {
    instance_id: InstanceId,
    player_ids: Vec<String>,
    outbox: Vec<(String, M)>,
}

impl<M> ServerHandle<M> {
    pub fn new(instance_id: impl Into<InstanceId>, player_ids: Vec<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            player_ids,
            outbox: Vec::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn send_message(&mut self, player_id: impl Into<String>, message: M) {
        self.outbox.push((player_id.into(), message));
    }

    /// Queues the message for every player listed on the instance.
    pub fn send_message_to_all(&mut self, message: M)
    where
        M: Clone,
    {
        for player_id in &self.player_ids {
            self.outbox.push((player_id.clone(), message.clone()));
        }
    }

    pub fn pending_messages(&self) -> usize {
        self.outbox.len()
    }

    pub fn into_outbox(self) -> Vec<(String, M)> {
        self.outbox
    }
}

/// Game logic advancing one instance by one step.
///
/// Must be pure with respect to the given instance: the returned state is
/// the only effect that is persisted.
pub trait TickHandler<S, P, M>: Send + Sync + 'static {
    fn tick(&self, instance: Instance<S, P, M>, server: &mut ServerHandle<M>)
        -> Result<S, TickError>;
}

impl<S, P, M, F> TickHandler<S, P, M> for F
where
    F: Fn(Instance<S, P, M>, &mut ServerHandle<M>) -> Result<S, TickError> + Send + Sync + 'static,
{
    fn tick(
        &self,
        instance: Instance<S, P, M>,
        server: &mut ServerHandle<M>,
    ) -> Result<S, TickError> {
        self(instance, server)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error("tick for instance {instance_id} failed: {reason}")]
    TickFailed {
        instance_id: InstanceId,
        reason: String,
    },
}

impl SchedulerError {
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            SchedulerError::Store(err) | SchedulerError::Instance(InstanceError::Store(err)) => {
                Some(err)
            }
            _ => None,
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Claiming,
    Hydrating,
    Ticking,
    Persisting,
    Rescheduling,
    Stopped,
}

/// How a single cycle ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NothingToClaim(ClaimOutcome),
    Orphaned(InstanceId),
    /// A record field was unreadable; the instance left the schedule.
    Quarantined {
        instance_id: InstanceId,
        field: &'static str,
    },
    Ticked {
        instance_id: InstanceId,
        updated_at: i64,
        events: usize,
    },
}

pub struct TickScheduler<S, P, M> {
    queue: ScheduleQueue,
    instances: InstanceStore,
    messenger: Arc<Messenger>,
    handler: Arc<dyn TickHandler<S, P, M>>,
    lease_ttl: Duration,
    idle_backoff: Backoff,
    error_backoff: Backoff,
    events: broadcast::Sender<SchedulerEvent>,
    stats: SchedulerStats,
    state: SchedulerState,
    idle: bool,
}

impl<S, P, M> TickScheduler<S, P, M>
where
    S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn Store>,
        config: &ServerConfig,
        handler: Arc<dyn TickHandler<S, P, M>>,
        messenger: Arc<Messenger>,
        events: broadcast::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            queue: ScheduleQueue::new(Arc::clone(&store)).with_window(config.claim_window),
            instances: InstanceStore::new(store, config.codec()),
            messenger,
            handler,
            lease_ttl: config.lease_ttl(),
            idle_backoff: Backoff::new(config.idle_backoff_floor, config.idle_backoff_ceiling),
            error_backoff: Backoff::new(config.error_backoff_floor, config.error_backoff_ceiling),
            events,
            stats: SchedulerStats::default(),
            state: SchedulerState::Idle,
            idle: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Runs cycles until `stop` turns true or its sender goes away.
    ///
    /// The flag is checked once per cycle, so stopping waits for at most
    /// one cycle in progress. Store failures are retried with backoff and
    /// never end the loop.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> SchedulerStats {
        info!("Tick scheduler started with a {:?} lease", self.lease_ttl);

        loop {
            if *stop.borrow() || stop.has_changed().is_err() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(CycleOutcome::NothingToClaim(_)) => {
                    self.error_backoff.reset();
                    Some(self.idle_backoff.next_delay())
                }
                Ok(_) => {
                    self.idle_backoff.reset();
                    self.error_backoff.reset();
                    None
                }
                Err(err) => match err.store_error() {
                    Some(store_err) => {
                        let retry_in = self.error_backoff.next_delay();
                        error!("Store call failed, retrying in {:?}: {}", retry_in, store_err);
                        self.stats.store_failures += 1;
                        self.emit(SchedulerEvent::StoreUnavailable {
                            reason: store_err.to_string(),
                            retry_in,
                        });
                        Some(retry_in)
                    }
                    None => {
                        warn!("Cycle aborted: {}", err);
                        None
                    }
                },
            };
            self.state = SchedulerState::Idle;

            if let Some(delay) = delay {
                tokio::select! {
                    _ = sleep(delay) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.state = SchedulerState::Stopped;
        info!("Tick scheduler stopped: {:?}", self.stats);
        self.emit(SchedulerEvent::Stopped { stats: self.stats });
        self.stats
    }

    /// One claim, hydrate, tick, commit and reschedule pass.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, SchedulerError> {
        self.state = SchedulerState::Claiming;
        let instance_id = match self.queue.claim_next(self.lease_ttl).await? {
            ClaimOutcome::Claimed(id) => id,
            outcome => {
                self.state = SchedulerState::Idle;
                self.stats.idle_polls += 1;
                if !self.idle {
                    self.idle = true;
                    let leased = match &outcome {
                        ClaimOutcome::Leased(head) => Some(head.clone()),
                        _ => None,
                    };
                    self.emit(SchedulerEvent::NothingToClaim { leased });
                }
                return Ok(CycleOutcome::NothingToClaim(outcome));
            }
        };
        self.idle = false;
        self.emit(SchedulerEvent::Claimed {
            instance_id: instance_id.clone(),
        });

        self.state = SchedulerState::Hydrating;
        let hydrated = self.instances.hydrate::<S, P>(&instance_id).await;
        let record = match hydrated {
            Ok(Some(record)) => record,
            Ok(None) => return self.remove_orphan(instance_id).await,
            Err(InstanceError::Decode {
                field, raw, source, ..
            }) => {
                return self
                    .quarantine_record(instance_id, field, &raw, source.to_string())
                    .await
            }
            Err(err) => return Err(err.into()),
        };

        let batch = self.instances.drain_events::<M>(&instance_id).await?;
        for message in &batch.receipt.quarantined {
            warn!(
                "Quarantining undecodable event for instance {}: {}",
                instance_id, message.reason
            );
            self.stats.quarantined += 1;
            self.emit(SchedulerEvent::EventQuarantined {
                instance_id: instance_id.clone(),
                reason: message.reason.clone(),
            });
        }

        self.state = SchedulerState::Ticking;
        let previous_update = record.updated_at;
        let event_count = batch.events.len();
        let handle = ServerHandle::new(
            instance_id.clone(),
            record.players.iter().map(|p| p.id.clone()).collect(),
        );
        let instance = Instance {
            record,
            events: batch.events,
        };
        let handler = Arc::clone(&self.handler);

        let joined = tokio::task::spawn_blocking(move || {
            let mut handle = handle;
            let result = handler.tick(instance, &mut handle);
            (result, handle)
        })
        .await;

        let (new_state, handle) = match joined {
            Ok((Ok(state), handle)) => (state, handle),
            Ok((Err(err), _)) => {
                return Err(self
                    .fail_tick(instance_id, previous_update, err.to_string())
                    .await)
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    format!("tick panicked: {}", panic_reason(join_err.into_panic()))
                } else {
                    "tick task was cancelled".to_string()
                };
                return Err(self.fail_tick(instance_id, previous_update, reason).await);
            }
        };

        // Commit must land before the schedule moves; a commit lost to the
        // store leaves the old score so the instance is picked up again first.
        self.state = SchedulerState::Persisting;
        let updated_at = get_timestamp().max(previous_update);
        let committed = self
            .instances
            .commit_tick(&instance_id, &new_state, updated_at, &batch.receipt)
            .await;
        match committed {
            Ok(()) => {}
            // Deleted while ticking; the outbox goes with it.
            Err(InstanceError::MissingRecord(_)) => return self.remove_orphan(instance_id).await,
            Err(err) => {
                self.emit(SchedulerEvent::CommitFailed {
                    instance_id: instance_id.clone(),
                    reason: err.to_string(),
                });
                if matches!(err, InstanceError::Encode { .. }) {
                    error!("Skipping instance {}: {}", instance_id, err);
                    self.stats.decode_failures += 1;
                    self.demote(&instance_id, previous_update).await;
                }
                return Err(err.into());
            }
        }

        self.state = SchedulerState::Rescheduling;
        if let Err(err) = self.queue.reschedule(&instance_id, updated_at).await {
            self.emit(SchedulerEvent::RescheduleFailed {
                instance_id: instance_id.clone(),
                reason: err.to_string(),
            });
            return Err(err.into());
        }

        self.stats.ticks += 1;
        debug!(
            "Ticked instance {} with {} event(s) at {}",
            instance_id, event_count, updated_at
        );
        self.emit(SchedulerEvent::Committed {
            instance_id: instance_id.clone(),
            updated_at,
            events: event_count,
        });

        self.flush_outbox(&instance_id, handle).await;
        self.state = SchedulerState::Idle;

        Ok(CycleOutcome::Ticked {
            instance_id,
            updated_at,
            events: event_count,
        })
    }

    /// Drops a schedule entry whose record no longer exists.
    async fn remove_orphan(
        &mut self,
        instance_id: InstanceId,
    ) -> Result<CycleOutcome, SchedulerError> {
        warn!(
            "No record for scheduled instance {}, removing it from the schedule",
            instance_id
        );
        self.queue.remove(&instance_id).await?;
        self.stats.orphans_removed += 1;
        self.emit(SchedulerEvent::Orphaned {
            instance_id: instance_id.clone(),
        });
        self.state = SchedulerState::Idle;
        Ok(CycleOutcome::Orphaned(instance_id))
    }

    /// Copies an unreadable record field aside and unschedules the instance.
    ///
    /// The record itself is left in place for inspection. Provisioning puts
    /// the instance back on the schedule once the record is repaired.
    async fn quarantine_record(
        &mut self,
        instance_id: InstanceId,
        field: &'static str,
        raw: &[u8],
        reason: String,
    ) -> Result<CycleOutcome, SchedulerError> {
        error!(
            "Instance {} has an unreadable {} field, unscheduling it: {}",
            instance_id, field, reason
        );
        self.stats.decode_failures += 1;
        self.instances
            .quarantine_field(&instance_id, field, raw)
            .await?;
        self.queue.remove(&instance_id).await?;
        self.emit(SchedulerEvent::RecordQuarantined {
            instance_id: instance_id.clone(),
            field: field.to_string(),
            reason,
        });
        self.state = SchedulerState::Idle;
        Ok(CycleOutcome::Quarantined { instance_id, field })
    }

    /// Records a tick that produced no state and demotes the instance.
    /// Its record and pending events are untouched; the lease is left to
    /// expire on its own.
    async fn fail_tick(
        &mut self,
        instance_id: InstanceId,
        previous_update: i64,
        reason: String,
    ) -> SchedulerError {
        self.stats.tick_failures += 1;
        error!("Tick for instance {} failed: {}", instance_id, reason);
        self.emit(SchedulerEvent::TickFailed {
            instance_id: instance_id.clone(),
            reason: reason.clone(),
        });
        self.demote(&instance_id, previous_update).await;
        SchedulerError::TickFailed {
            instance_id,
            reason,
        }
    }

    /// Moves an instance behind everything scheduled up to now without
    /// touching its `updated` field, so a failing instance cannot hold the
    /// head of the schedule.
    async fn demote(&self, instance_id: &str, previous_update: i64) {
        let score = get_timestamp().max(previous_update);
        if let Err(err) = self.queue.reschedule(instance_id, score).await {
            warn!(
                "Could not move failed instance {} back in the schedule: {}",
                instance_id, err
            );
        }
    }

    async fn flush_outbox(&self, instance_id: &str, handle: ServerHandle<M>) {
        for (player_id, message) in handle.into_outbox() {
            if let Err(err) = self.messenger.send(instance_id, &player_id, message).await {
                warn!(
                    "Dropping message for player {} of instance {}: {}",
                    player_id, instance_id, err
                );
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use shared::{keys, GenericMessage, PlayerData};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        score: i64,
    }

    type TestScheduler = TickScheduler<Counter, String, GenericMessage>;

    struct Fixture {
        store: Arc<MemoryStore>,
        instances: InstanceStore,
        queue: ScheduleQueue,
        events: broadcast::Receiver<SchedulerEvent>,
        scheduler: TestScheduler,
    }

    fn fixture<H>(handler: H) -> Fixture
    where
        H: TickHandler<Counter, String, GenericMessage>,
    {
        fixture_on(Arc::new(MemoryStore::new()), handler)
    }

    fn fixture_on<H>(store: Arc<MemoryStore>, handler: H) -> Fixture
    where
        H: TickHandler<Counter, String, GenericMessage>,
    {
        let config = ServerConfig {
            tick_rate: 1,
            ..ServerConfig::default()
        };
        let (sender, events) = broadcast::channel(64);
        let messenger = Arc::new(Messenger::new(store.clone(), config.codec()));
        let scheduler =
            TickScheduler::new(store.clone(), &config, Arc::new(handler), messenger, sender);

        Fixture {
            instances: InstanceStore::new(store.clone(), config.codec()),
            queue: ScheduleQueue::new(store.clone()),
            store,
            events,
            scheduler,
        }
    }

    fn counting_tick(
        instance: Instance<Counter, String, GenericMessage>,
        server: &mut ServerHandle<GenericMessage>,
    ) -> Result<Counter, TickError> {
        let mut state = instance.record.state;
        for event in &instance.events {
            match event.kind.as_str() {
                "inc" => state.score += 1,
                "dec" => state.score -= 1,
                other => return Err(format!("unknown event {}", other).into()),
            }
        }
        server.send_message_to_all(GenericMessage::new("score", serde_json::json!(state.score)));
        Ok(state)
    }

    async fn seed(fixture: &Fixture, id: &str, score: i64, updated_at: i64) {
        let mut record = InstanceRecord::new(id);
        record.state = Counter { score };
        record.updated_at = updated_at;
        record.players = vec![PlayerData {
            id: "p1".to_string(),
            data: "red".to_string(),
        }];
        assert_ok!(fixture.instances.provision(&record).await);
        assert_ok!(fixture.queue.reschedule(id, updated_at).await);
    }

    async fn push(fixture: &Fixture, instance_id: &str, id: u64, kind: &str) {
        let event: Event<GenericMessage> = Event {
            id,
            instance_id: instance_id.to_string(),
            player_id: "p1".to_string(),
            kind: kind.to_string(),
            message: None,
        };
        assert_ok!(fixture.instances.enqueue(&event).await);
    }

    #[tokio::test]
    async fn test_cycle_ticks_and_reschedules() {
        let mut fixture = fixture(counting_tick);
        seed(&fixture, "g1", 0, 1000).await;
        push(&fixture, "g1", 2, "inc").await;
        push(&fixture, "g1", 1, "inc").await;
        let mut channel = fixture.store.subscribe(&keys::player_channel_key("p1"));

        let outcome = assert_ok!(fixture.scheduler.run_cycle().await);
        let CycleOutcome::Ticked { updated_at, events, .. } = outcome else {
            panic!("expected a tick, got {:?}", outcome);
        };
        assert_eq!(events, 2);
        assert!(updated_at > 1000);

        let record = assert_ok!(fixture.instances.hydrate::<Counter, String>("g1").await)
            .expect("record present");
        assert_eq!(record.state, Counter { score: 2 });
        assert_eq!(record.updated_at, updated_at);
        assert_eq!(fixture.store.list_len("g1:messages"), 0);
        assert_eq!(assert_ok!(fixture.queue.score("g1").await), Some(updated_at));
        assert!(channel.try_recv().is_ok());
        assert_eq!(fixture.scheduler.stats().ticks, 1);
        assert_eq!(fixture.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_events_reach_tick_in_id_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let mut fixture = fixture(
            move |instance: Instance<Counter, String, GenericMessage>,
                  _: &mut ServerHandle<GenericMessage>|
                  -> Result<Counter, TickError> {
                let ids: Vec<u64> = instance.events.iter().map(|e| e.id).collect();
                recorder.lock().unwrap().push(ids);
                Ok(instance.record.state)
            },
        );
        seed(&fixture, "g1", 0, 1).await;
        for id in [5, 3, 9, 1] {
            push(&fixture, "g1", id, "inc").await;
        }

        assert_ok!(fixture.scheduler.run_cycle().await);
        assert_eq!(*seen.lock().unwrap(), vec![vec![1, 3, 5, 9]]);
    }

    #[tokio::test]
    async fn test_orphan_is_removed_without_ticking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut fixture = fixture(
            move |instance: Instance<Counter, String, GenericMessage>,
                  _: &mut ServerHandle<GenericMessage>|
                  -> Result<Counter, TickError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(instance.record.state)
            },
        );
        assert_ok!(fixture.queue.reschedule("ghost", 10).await);

        let outcome = assert_ok!(fixture.scheduler.run_cycle().await);
        assert_eq!(outcome, CycleOutcome::Orphaned("ghost".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(assert_ok!(fixture.queue.len().await), 0);
        assert_eq!(fixture.scheduler.stats().orphans_removed, 1);
        assert_eq!(
            assert_ok!(fixture.events.try_recv()),
            SchedulerEvent::Claimed {
                instance_id: "ghost".to_string()
            }
        );
        assert_eq!(
            assert_ok!(fixture.events.try_recv()),
            SchedulerEvent::Orphaned {
                instance_id: "ghost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_tick_keeps_events_and_demotes() {
        let mut fixture = fixture(counting_tick);
        seed(&fixture, "g1", 4, 1000).await;
        push(&fixture, "g1", 1, "explode").await;

        let err = assert_err!(fixture.scheduler.run_cycle().await);
        assert!(matches!(err, SchedulerError::TickFailed { .. }));
        assert!(!err.is_store_unavailable());

        assert_eq!(fixture.store.list_len("g1:messages"), 1);
        let score = assert_ok!(fixture.queue.score("g1").await).expect("still scheduled");
        assert!(score > 1000);
        let record = assert_ok!(fixture.instances.hydrate::<Counter, String>("g1").await)
            .expect("record present");
        assert_eq!(record.state, Counter { score: 4 });
        assert_eq!(record.updated_at, 1000);
        assert!(fixture.store.contains_value("lock:g1"));
        assert_eq!(fixture.scheduler.stats().tick_failures, 1);
    }

    #[tokio::test]
    async fn test_failing_instance_does_not_hold_the_head() {
        let mut fixture = fixture(counting_tick);
        seed(&fixture, "bad", 0, 1000).await;
        seed(&fixture, "good", 0, 2000).await;
        push(&fixture, "bad", 1, "explode").await;
        push(&fixture, "good", 1, "inc").await;

        assert_err!(fixture.scheduler.run_cycle().await);

        let outcome = assert_ok!(fixture.scheduler.run_cycle().await);
        assert!(matches!(
            outcome,
            CycleOutcome::Ticked { ref instance_id, events: 1, .. } if instance_id == "good"
        ));
        let good = assert_ok!(fixture.instances.hydrate::<Counter, String>("good").await)
            .expect("record present");
        assert_eq!(good.state, Counter { score: 1 });
    }

    #[tokio::test]
    async fn test_corrupt_record_is_quarantined_and_others_still_tick() {
        let mut fixture = fixture(counting_tick);
        seed(&fixture, "bad", 0, 1).await;
        seed(&fixture, "good", 0, 2).await;
        push(&fixture, "good", 1, "inc").await;
        assert_ok!(
            fixture
                .store
                .hash_set("bad", &[("state".to_string(), b"{oops".to_vec())])
                .await
        );

        let outcome = assert_ok!(fixture.scheduler.run_cycle().await);
        assert_eq!(
            outcome,
            CycleOutcome::Quarantined {
                instance_id: "bad".to_string(),
                field: "state",
            }
        );
        assert_eq!(assert_ok!(fixture.queue.score("bad").await), None);
        assert_eq!(
            assert_ok!(fixture.store.list_range("bad:state:quarantine").await),
            vec![b"{oops".to_vec()]
        );
        assert_eq!(fixture.scheduler.stats().decode_failures, 1);

        let outcome = assert_ok!(fixture.scheduler.run_cycle().await);
        assert!(matches!(
            outcome,
            CycleOutcome::Ticked { ref instance_id, .. } if instance_id == "good"
        ));

        let quarantined = std::iter::from_fn(|| fixture.events.try_recv().ok())
            .any(|event| matches!(event, SchedulerEvent::RecordQuarantined { ref field, .. } if field == "state"));
        assert!(quarantined);
    }

    #[tokio::test]
    async fn test_record_deleted_during_tick_is_not_recreated() {
        let store = Arc::new(MemoryStore::new());
        let deleter = Arc::clone(&store);
        let mut fixture = fixture_on(
            store,
            move |instance: Instance<Counter, String, GenericMessage>,
                  server: &mut ServerHandle<GenericMessage>|
                  -> Result<Counter, TickError> {
                deleter.delete_hash(&instance.record.id);
                server.send_message("p1", GenericMessage::new("bye", serde_json::Value::Null));
                Ok(instance.record.state)
            },
        );
        seed(&fixture, "g1", 0, 1).await;
        let mut channel = fixture.store.subscribe(&keys::player_channel_key("p1"));

        let outcome = assert_ok!(fixture.scheduler.run_cycle().await);
        assert_eq!(outcome, CycleOutcome::Orphaned("g1".to_string()));
        assert!(assert_ok!(fixture.instances.hydrate::<Counter, String>("g1").await).is_none());
        assert_eq!(assert_ok!(fixture.queue.score("g1").await), None);
        assert_eq!(fixture.scheduler.stats().orphans_removed, 1);
        assert!(channel.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_tick_is_contained() {
        let mut fixture = fixture(
            |_: Instance<Counter, String, GenericMessage>,
             _: &mut ServerHandle<GenericMessage>|
             -> Result<Counter, TickError> { panic!("rules exploded") },
        );
        seed(&fixture, "g1", 0, 1).await;

        let err = assert_err!(fixture.scheduler.run_cycle().await);
        match err {
            SchedulerError::TickFailed { reason, .. } => assert!(reason.contains("rules exploded")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_event_is_quarantined_and_rest_delivered() {
        let mut fixture = fixture(counting_tick);
        seed(&fixture, "g1", 0, 1).await;
        push(&fixture, "g1", 1, "inc").await;
        assert_ok!(fixture.store.list_push("g1:messages", b"\x00garbage").await);
        push(&fixture, "g1", 2, "inc").await;

        assert_ok!(fixture.scheduler.run_cycle().await);

        let record = assert_ok!(fixture.instances.hydrate::<Counter, String>("g1").await)
            .expect("record present");
        assert_eq!(record.state, Counter { score: 2 });
        assert_eq!(fixture.store.list_len("g1:messages"), 0);
        assert_eq!(fixture.store.list_len("g1:messages:quarantine"), 1);
        assert_eq!(fixture.scheduler.stats().quarantined, 1);
    }

    #[tokio::test]
    async fn test_nothing_to_claim_reports_leased_head_once() {
        let mut fixture = fixture(counting_tick);
        seed(&fixture, "g1", 0, 1).await;
        assert_ok!(fixture.scheduler.run_cycle().await);

        let first = assert_ok!(fixture.scheduler.run_cycle().await);
        let second = assert_ok!(fixture.scheduler.run_cycle().await);
        assert_eq!(first, CycleOutcome::NothingToClaim(ClaimOutcome::Leased("g1".to_string())));
        assert_eq!(second, first);

        let idle_events = std::iter::from_fn(|| fixture.events.try_recv().ok())
            .filter(|event| matches!(event, SchedulerEvent::NothingToClaim { .. }))
            .count();
        assert_eq!(idle_events, 1);
        assert_eq!(fixture.scheduler.stats().idle_polls, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let fixture = fixture(counting_tick);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut events = fixture.events;
        let task = tokio::spawn(fixture.scheduler.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(stop_tx.send(true));
        let stats = assert_ok!(task.await);

        assert!(stats.idle_polls > 0);
        let stopped = std::iter::from_fn(|| events.try_recv().ok())
            .any(|event| matches!(event, SchedulerEvent::Stopped { .. }));
        assert!(stopped);
    }

    fn assert_send<T: Send>(_: &T) {}

    /// Compiles only if the loop can be spawned for any state type the
    /// scheduler accepts, not just `Counter`.
    fn assert_run_is_send<S, P, M>(scheduler: TickScheduler<S, P, M>, stop: watch::Receiver<bool>)
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        P: DeserializeOwned + Send + 'static,
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let run = scheduler.run(stop);
        assert_send(&run);
    }

    #[test]
    fn test_run_future_is_send() {
        let fixture = fixture(counting_tick);
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert_run_is_send(fixture.scheduler, stop_rx);
    }

    #[test]
    fn test_server_handle_outbox() {
        let mut handle: ServerHandle<u8> =
            ServerHandle::new("g1", vec!["a".to_string(), "b".to_string()]);
        handle.send_message("c", 1);
        handle.send_message_to_all(2);

        assert_eq!(handle.instance_id(), "g1");
        assert_eq!(handle.pending_messages(), 3);
        assert_eq!(
            handle.into_outbox(),
            vec![
                ("c".to_string(), 1),
                ("a".to_string(), 2),
                ("b".to_string(), 2)
            ]
        );
    }
}
