//! # Tick Lease Server Library
//!
//! This library runs the server-side simulation loop for many concurrent game
//! instances whose state lives in a shared key-value store. Any number of
//! worker processes can point at the same store; together they tick every
//! instance at a steady rate without two workers ever ticking the same
//! instance at once.
//!
//! ## Core Responsibilities
//!
//! ### Fair Scheduling
//! Instances sit in a schedule ordered by the time of their last successful
//! tick. Workers always claim the instance that has waited longest, so no
//! instance starves while others are ticked repeatedly.
//!
//! ### Exclusive Ticking
//! Claiming an instance takes a lease in the store with a time-to-live of one
//! tick period. Reading the candidate and taking its lease happen in one
//! atomic step, which keeps concurrent workers apart. When a worker dies
//! mid-tick the lease simply expires and another worker picks the instance
//! up again.
//!
//! ### Input Delivery
//! Players append input events to a per-instance queue. Each tick receives
//! the pending events in ascending id order and consumes exactly those
//! events when its new state is committed. Events appended during a tick
//! wait for the next one.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! The [`store::Store`] trait with a RESP-speaking Redis backend and an
//! in-memory backend with identical semantics.
//!
//! ### Schedule Module (`schedule`)
//! The ordered work queue and its atomic claim-with-lease primitive.
//!
//! ### Instance Module (`instance`)
//! Hydrating instance records, snapshotting and acknowledging pending events,
//! and persisting new state.
//!
//! ### Scheduler Module (`scheduler`)
//! The claim, hydrate, tick, commit and reschedule loop run by each worker.
//!
//! ### Game Server Module (`game_server`)
//! The facade an application embeds: it starts and stops a scheduler and
//! exposes outbound messaging and presence lookups.
//!
//! ## Failure Handling
//!
//! A failing tick function, an undecodable state or a missing record only
//! aborts the current cycle. Store outages are retried with exponential
//! backoff and never stop a worker. Every round trip to the store is bounded
//! by a timeout. What happens is reported through the `log` facade and
//! through [`events::SchedulerEvent`]s broadcast by each server.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::demo::counter_tick;
//! use server::game_server::GameServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = GameServer::connect(ServerConfig::default(), counter_tick).await?;
//!
//!     // Runs the tick loop in the background until stopped
//!     server.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     let stats = server.stop().await?;
//!     println!("ticked {} instances", stats.ticks);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod demo;
pub mod events;
pub mod game_server;
pub mod instance;
pub mod messaging;
pub mod presence;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod utils;

pub use config::ServerConfig;
pub use game_server::{GameServer, ServerError};
pub use scheduler::{Instance, ServerHandle, TickError, TickHandler};
