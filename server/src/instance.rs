//! Reading and writing one instance's record and its pending input queue.
//!
//! Records are created and deleted by provisioning code outside the tick
//! workers. A worker only reads a record, rewrites its `state` and
//! `updated` fields, and consumes the pending queue.
//!
//! Consumption is acknowledgment based. [`InstanceStore::drain_events`]
//! takes a snapshot of the queue and remembers how many entries it saw.
//! [`InstanceStore::commit_tick`] later removes exactly that many entries
//! from the head in the same atomic write as the new state. Producers only
//! append at the tail, so anything pushed after the snapshot is kept for
//! the next tick. If the tick never commits, nothing is removed.

use crate::store::{Store, StoreError, TickCommit};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{keys, CodecError, Event, EventCodec, InstanceRecord, PlayerData};
use std::sync::Arc;
use thiserror::Error;

const FIELD_ID: &str = "id";
const FIELD_STATE: &str = "state";
const FIELD_UPDATED: &str = "updated";
const FIELD_PLAYERS: &str = "players";

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("instance {instance_id} has an unreadable {field} field: {source}")]
    Decode {
        instance_id: String,
        field: &'static str,
        /// The stored bytes, kept so the field can be set aside.
        raw: Vec<u8>,
        source: CodecError,
    },
    #[error("failed to encode {field} for instance {instance_id}: {source}")]
    Encode {
        instance_id: String,
        field: &'static str,
        source: CodecError,
    },
    #[error("instance {0} was removed before its tick could be committed")]
    MissingRecord(String),
}

/// A pending message that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedMessage {
    pub raw: Vec<u8>,
    pub reason: String,
}

/// What a commit has to acknowledge for one drained snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReceipt {
    /// Number of queue entries covered by the snapshot.
    pub consumed: usize,
    pub quarantined: Vec<QuarantinedMessage>,
}

/// Snapshot of an instance's pending queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch<M> {
    /// Decoded events in ascending id order.
    pub events: Vec<Event<M>>,
    pub receipt: DrainReceipt,
}

#[derive(Clone)]
pub struct InstanceStore {
    store: Arc<dyn Store>,
    codec: EventCodec,
}

impl InstanceStore {
    pub fn new(store: Arc<dyn Store>, codec: EventCodec) -> Self {
        Self { store, codec }
    }

    /// Reads the full record.
    ///
    /// Returns `Ok(None)` only when the record is entirely absent. Missing
    /// fields on a present record fall back to defaults: the claimed id, a
    /// default state, no players and an update time of zero.
    pub async fn hydrate<S, P>(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord<S, P>>, InstanceError>
    where
        S: DeserializeOwned + Default,
        P: DeserializeOwned,
    {
        let fields = self
            .store
            .hash_get_all(&keys::instance_key(instance_id))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut record = InstanceRecord::new(instance_id);
        for (field, value) in fields {
            match field.as_str() {
                FIELD_ID => record.id = String::from_utf8_lossy(&value).into_owned(),
                FIELD_STATE => {
                    record.state = self
                        .codec
                        .decode(&value)
                        .map_err(|source| decode_error(instance_id, FIELD_STATE, &value, source))?;
                }
                FIELD_UPDATED => match self.codec.decode_timestamp(&value) {
                    Ok(updated_at) => record.updated_at = updated_at,
                    Err(err) => warn!("Instance {} has an invalid update time: {}", instance_id, err),
                },
                FIELD_PLAYERS => {
                    record.players = self
                        .codec
                        .decode::<Vec<PlayerData<P>>>(&value)
                        .map_err(|source| decode_error(instance_id, FIELD_PLAYERS, &value, source))?;
                }
                _ => {}
            }
        }

        Ok(Some(record))
    }

    /// Snapshots the pending queue without removing anything.
    ///
    /// Entries that fail to decode are set aside in the receipt; the rest
    /// are returned sorted by id whatever order they were appended in.
    pub async fn drain_events<M>(&self, instance_id: &str) -> Result<EventBatch<M>, InstanceError>
    where
        M: DeserializeOwned,
    {
        let raw = self
            .store
            .list_range(&keys::instance_messages_key(instance_id))
            .await?;

        let mut receipt = DrainReceipt {
            consumed: raw.len(),
            quarantined: Vec::new(),
        };
        let mut events = Vec::with_capacity(raw.len());

        for message in raw {
            match self.codec.decode_event::<M>(&message) {
                Ok(event) => events.push(event),
                Err(err) => receipt.quarantined.push(QuarantinedMessage {
                    raw: message,
                    reason: err.to_string(),
                }),
            }
        }
        events.sort_by_key(|event| event.id);

        Ok(EventBatch { events, receipt })
    }

    /// Writes the new state and update time, acknowledges the drained
    /// snapshot and moves quarantined messages aside, all atomically.
    ///
    /// Fails with [`InstanceError::MissingRecord`], writing nothing, when
    /// the record was deleted after it was hydrated.
    pub async fn commit_tick<S>(
        &self,
        instance_id: &str,
        state: &S,
        timestamp: i64,
        receipt: &DrainReceipt,
    ) -> Result<(), InstanceError>
    where
        S: Serialize,
    {
        let state = self
            .codec
            .encode(state)
            .map_err(|source| encode_error(instance_id, FIELD_STATE, source))?;

        let commit = TickCommit {
            record_key: keys::instance_key(instance_id),
            fields: vec![
                (FIELD_STATE.to_string(), state),
                (
                    FIELD_UPDATED.to_string(),
                    self.codec.encode_timestamp(timestamp),
                ),
            ],
            queue_key: keys::instance_messages_key(instance_id),
            consumed: receipt.consumed,
            quarantine_key: keys::instance_quarantine_key(instance_id),
            quarantined: receipt
                .quarantined
                .iter()
                .map(|message| message.raw.clone())
                .collect(),
        };

        if !self.store.commit(&commit).await? {
            return Err(InstanceError::MissingRecord(instance_id.to_string()));
        }
        Ok(())
    }

    /// Copies an unreadable record field to its quarantine list.
    pub async fn quarantine_field(
        &self,
        instance_id: &str,
        field: &str,
        raw: &[u8],
    ) -> Result<(), InstanceError> {
        self.store
            .list_push(&keys::record_quarantine_key(instance_id, field), raw)
            .await?;
        Ok(())
    }

    /// Overwrites only `state` and `updated`; `players` is never touched.
    pub async fn persist<S>(
        &self,
        instance_id: &str,
        state: &S,
        timestamp: i64,
    ) -> Result<(), InstanceError>
    where
        S: Serialize,
    {
        self.commit_tick(instance_id, state, timestamp, &DrainReceipt::default())
            .await
    }

    /// Player ids of an instance in their stored order.
    pub async fn player_ids<P>(&self, instance_id: &str) -> Result<Vec<String>, InstanceError>
    where
        P: DeserializeOwned,
    {
        let fields = self
            .store
            .hash_get_all(&keys::instance_key(instance_id))
            .await?;

        match fields.into_iter().find(|(field, _)| field == FIELD_PLAYERS) {
            Some((_, value)) => {
                let players = self
                    .codec
                    .decode::<Vec<PlayerData<P>>>(&value)
                    .map_err(|source| decode_error(instance_id, FIELD_PLAYERS, &value, source))?;
                Ok(players.into_iter().map(|player| player.id).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Writes a complete record. Used by provisioning tools and tests.
    pub async fn provision<S, P>(&self, record: &InstanceRecord<S, P>) -> Result<(), InstanceError>
    where
        S: Serialize,
        P: Serialize,
    {
        let state = self
            .codec
            .encode(&record.state)
            .map_err(|source| encode_error(&record.id, FIELD_STATE, source))?;
        let players = self
            .codec
            .encode(&record.players)
            .map_err(|source| encode_error(&record.id, FIELD_PLAYERS, source))?;

        let fields = vec![
            (FIELD_ID.to_string(), record.id.clone().into_bytes()),
            (FIELD_STATE.to_string(), state),
            (
                FIELD_UPDATED.to_string(),
                self.codec.encode_timestamp(record.updated_at),
            ),
            (FIELD_PLAYERS.to_string(), players),
        ];
        self.store
            .hash_set(&keys::instance_key(&record.id), &fields)
            .await?;
        Ok(())
    }

    /// Appends one event at the tail of the instance's pending queue.
    pub async fn enqueue<M>(&self, event: &Event<M>) -> Result<usize, InstanceError>
    where
        M: Serialize,
    {
        let bytes = self
            .codec
            .encode_event(event)
            .map_err(|source| encode_error(&event.instance_id, "event", source))?;
        Ok(self
            .store
            .list_push(&keys::instance_messages_key(&event.instance_id), &bytes)
            .await?)
    }
}

fn decode_error(
    instance_id: &str,
    field: &'static str,
    raw: &[u8],
    source: CodecError,
) -> InstanceError {
    InstanceError::Decode {
        instance_id: instance_id.to_string(),
        field,
        raw: raw.to_vec(),
        source,
    }
}

fn encode_error(instance_id: &str, field: &'static str, source: CodecError) -> InstanceError {
    InstanceError::Encode {
        instance_id: instance_id.to_string(),
        field,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use shared::{GenericMessage, WireFormat};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Score {
        score: i64,
    }

    fn instances(format: WireFormat) -> (Arc<MemoryStore>, InstanceStore) {
        let store = Arc::new(MemoryStore::new());
        let instances = InstanceStore::new(store.clone(), EventCodec::new(format));
        (store, instances)
    }

    async fn provisioned(format: WireFormat) -> (Arc<MemoryStore>, InstanceStore) {
        let (store, instances) = instances(format);
        let record: InstanceRecord<Score, ()> = InstanceRecord::new("g1");
        assert_ok!(instances.provision(&record).await);
        (store, instances)
    }

    fn event(id: u64, kind: &str) -> Event<GenericMessage> {
        Event {
            id,
            instance_id: "g1".to_string(),
            player_id: "p1".to_string(),
            kind: kind.to_string(),
            message: None,
        }
    }

    #[tokio::test]
    async fn test_hydrate_absent_record() {
        let (_, instances) = instances(WireFormat::Json);
        let record = assert_ok!(instances.hydrate::<Score, ()>("missing").await);
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_hydrate_fills_defaults_for_missing_fields() {
        let (store, instances) = instances(WireFormat::Json);
        assert_ok!(
            store
                .hash_set("g1", &[("updated".to_string(), b"1000".to_vec())])
                .await
        );

        let record = assert_ok!(instances.hydrate::<Score, String>("g1").await).expect("present");
        assert_eq!(record.id, "g1");
        assert_eq!(record.state, Score::default());
        assert!(record.players.is_empty());
        assert_eq!(record.updated_at, 1000);
    }

    #[tokio::test]
    async fn test_hydrate_rejects_corrupt_state() {
        let (store, instances) = instances(WireFormat::Json);
        assert_ok!(
            store
                .hash_set("g1", &[("state".to_string(), b"{oops".to_vec())])
                .await
        );

        let err = assert_err!(instances.hydrate::<Score, ()>("g1").await);
        match err {
            InstanceError::Decode { field, raw, .. } => {
                assert_eq!(field, "state");
                assert_eq!(raw, b"{oops".to_vec());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_quarantine_field_keeps_raw_bytes() {
        let (store, instances) = instances(WireFormat::Json);
        assert_ok!(instances.quarantine_field("g1", "players", b"[oops").await);
        assert_eq!(
            assert_ok!(store.list_range("g1:players:quarantine").await),
            vec![b"[oops".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_persist_then_hydrate_round_trip() {
        for format in [WireFormat::Json, WireFormat::Bincode] {
            let (_, instances) = instances(format);
            let mut record: InstanceRecord<Score, String> = InstanceRecord::new("g1");
            record.players = vec![PlayerData {
                id: "p1".to_string(),
                data: "red".to_string(),
            }];
            assert_ok!(instances.provision(&record).await);

            assert_ok!(instances.persist("g1", &Score { score: 7 }, 4242).await);

            let stored = assert_ok!(instances.hydrate::<Score, String>("g1").await).expect("present");
            assert_eq!(stored.state, Score { score: 7 });
            assert_eq!(stored.updated_at, 4242);
            assert_eq!(stored.players, record.players);
        }
    }

    #[tokio::test]
    async fn test_drain_sorts_by_id() {
        let (_, instances) = instances(WireFormat::Json);
        for id in [3, 1, 2] {
            assert_ok!(instances.enqueue(&event(id, "inc")).await);
        }

        let batch = assert_ok!(instances.drain_events::<GenericMessage>("g1").await);
        let ids: Vec<u64> = batch.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(batch.receipt.consumed, 3);
        assert!(batch.receipt.quarantined.is_empty());
    }

    #[tokio::test]
    async fn test_drain_quarantines_undecodable_messages() {
        let (store, instances) = provisioned(WireFormat::Json).await;
        assert_ok!(instances.enqueue(&event(1, "inc")).await);
        assert_ok!(store.list_push("g1:messages", b"not an event").await);
        assert_ok!(instances.enqueue(&event(2, "inc")).await);

        let batch = assert_ok!(instances.drain_events::<GenericMessage>("g1").await);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.receipt.consumed, 3);
        assert_eq!(batch.receipt.quarantined.len(), 1);
        assert_eq!(batch.receipt.quarantined[0].raw, b"not an event".to_vec());

        assert_ok!(instances.commit_tick("g1", &Score::default(), 1, &batch.receipt).await);
        assert_eq!(store.list_len("g1:messages"), 0);
        assert_eq!(store.list_len("g1:messages:quarantine"), 1);
    }

    #[tokio::test]
    async fn test_commit_keeps_events_appended_after_snapshot() {
        let (store, instances) = provisioned(WireFormat::Json).await;
        assert_ok!(instances.enqueue(&event(1, "inc")).await);
        assert_ok!(instances.enqueue(&event(2, "inc")).await);

        let batch = assert_ok!(instances.drain_events::<GenericMessage>("g1").await);
        assert_ok!(instances.enqueue(&event(3, "late")).await);

        assert_ok!(instances.commit_tick("g1", &Score { score: 2 }, 10, &batch.receipt).await);

        let remaining = assert_ok!(instances.drain_events::<GenericMessage>("g1").await);
        assert_eq!(remaining.events, vec![event(3, "late")]);
        assert_eq!(store.list_len("g1:messages"), 1);
    }

    #[tokio::test]
    async fn test_commit_after_delete_reports_missing_record() {
        let (store, instances) = provisioned(WireFormat::Json).await;
        assert_ok!(instances.enqueue(&event(1, "inc")).await);
        let batch = assert_ok!(instances.drain_events::<GenericMessage>("g1").await);

        assert!(store.delete_hash("g1"));

        let err = assert_err!(instances.commit_tick("g1", &Score { score: 1 }, 10, &batch.receipt).await);
        assert!(matches!(err, InstanceError::MissingRecord(id) if id == "g1"));
        assert!(assert_ok!(instances.hydrate::<Score, ()>("g1").await).is_none());
        assert_eq!(store.list_len("g1:messages"), 1);
    }

    #[tokio::test]
    async fn test_persist_never_touches_players() {
        let (store, instances) = instances(WireFormat::Json);
        assert_ok!(
            store
                .hash_set("g1", &[("players".to_string(), br#"[{"id":"p1","data":1}]"#.to_vec())])
                .await
        );

        assert_ok!(instances.persist("g1", &Score { score: 1 }, 5).await);

        let ids = assert_ok!(instances.player_ids::<i32>("g1").await);
        assert_eq!(ids, vec!["p1".to_string()]);
    }
}
