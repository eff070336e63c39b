//! Facade owned by the embedding application.
//!
//! A `GameServer` holds the store connection, runs one [`TickScheduler`]
//! bound to the game's tick function, and exposes outbound messaging and
//! presence lookups. Run several `GameServer`s, in one process or many,
//! to get more workers.

use crate::config::ServerConfig;
use crate::events::{SchedulerEvent, SchedulerStats};
use crate::instance::{InstanceError, InstanceStore};
use crate::messaging::{Messenger, MessagingError};
use crate::presence;
use crate::scheduler::{TickHandler, TickScheduler};
use crate::store::{RedisStore, Store, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("scheduler task ended abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
}

struct RunningScheduler {
    stop: watch::Sender<bool>,
    task: JoinHandle<SchedulerStats>,
}

pub struct GameServer<S, P, M> {
    config: ServerConfig,
    store: Arc<dyn Store>,
    instances: InstanceStore,
    messenger: Arc<Messenger>,
    handler: Arc<dyn TickHandler<S, P, M>>,
    events: broadcast::Sender<SchedulerEvent>,
    running: Option<RunningScheduler>,
}

impl<S, P, M> GameServer<S, P, M>
where
    S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Connects to the store named by `config.store_url`.
    pub async fn connect<H>(config: ServerConfig, handler: H) -> Result<Self, ServerError>
    where
        H: TickHandler<S, P, M>,
    {
        let store = RedisStore::connect(&config.store_url, config.store_timeout).await?;
        Ok(Self::with_store(config, Arc::new(store), handler))
    }

    /// Uses an already built store, such as a shared [`crate::store::MemoryStore`].
    pub fn with_store<H>(config: ServerConfig, store: Arc<dyn Store>, handler: H) -> Self
    where
        H: TickHandler<S, P, M>,
    {
        let codec = config.codec();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            instances: InstanceStore::new(Arc::clone(&store), codec),
            messenger: Arc::new(Messenger::new(Arc::clone(&store), codec)),
            handler: Arc::new(handler),
            store,
            config,
            events,
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Receives scheduler events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Spawns the scheduler loop on the current runtime.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let scheduler = TickScheduler::new(
            Arc::clone(&self.store),
            &self.config,
            Arc::clone(&self.handler),
            Arc::clone(&self.messenger),
            self.events.clone(),
        );
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(stop_rx));

        self.running = Some(RunningScheduler { stop, task });
        Ok(())
    }

    /// Signals the scheduler and waits for its current cycle to finish.
    pub async fn stop(&mut self) -> Result<SchedulerStats, ServerError> {
        let running = self.running.take().ok_or(ServerError::NotRunning)?;
        // The loop also exits when the sender is gone, so a failed send is fine.
        let _ = running.stop.send(true);
        Ok(running.task.await?)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Publishes one message to one player. Returns how many subscribers got it.
    pub async fn send_message(
        &self,
        instance_id: &str,
        player_id: &str,
        message: M,
    ) -> Result<usize, ServerError> {
        Ok(self.messenger.send(instance_id, player_id, message).await?)
    }

    /// Publishes the same message to each listed player.
    ///
    /// Stops at the first failed publish; earlier players have already
    /// received theirs.
    pub async fn send_message_to_all(
        &self,
        instance_id: &str,
        player_ids: &[String],
        message: &M,
    ) -> Result<usize, ServerError> {
        let mut receivers = 0;
        for player_id in player_ids {
            receivers += self.messenger.send(instance_id, player_id, message).await?;
        }
        Ok(receivers)
    }

    /// Like [`Self::send_message_to_all`] for the players stored on the instance.
    pub async fn send_message_to_instance(
        &self,
        instance_id: &str,
        message: &M,
    ) -> Result<usize, ServerError> {
        let player_ids = self.instances.player_ids::<P>(instance_id).await?;
        self.send_message_to_all(instance_id, &player_ids, message)
            .await
    }

    /// Last heartbeat of each player in one round trip; `None` when unknown.
    pub async fn get_connected_players(
        &self,
        player_ids: &[String],
    ) -> Result<Vec<Option<u64>>, ServerError> {
        Ok(presence::read_heartbeats(self.store.as_ref(), player_ids).await?)
    }
}
