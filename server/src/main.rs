use clap::Parser;
use log::{error, info, warn};
use server::config::ServerConfig;
use server::demo::counter_tick;
use server::events::SchedulerEvent;
use server::game_server::GameServer;
use shared::WireFormat;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, starts the requested number of tick workers
/// against the store and runs them until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Store to coordinate through, `redis://host[:port][/db]`
        #[clap(short = 'u', long, default_value = "redis://127.0.0.1:6379")]
        store_url: String,
        /// Tick rate (ticks per second per instance)
        #[clap(short, long, default_value = "30")]
        tick_rate: u32,
        /// Number of tick workers to run in this process
        #[clap(short, long, default_value = "4")]
        workers: usize,
        /// Payload encoding, `json` or `bincode`
        #[clap(short, long, default_value = "json")]
        format: WireFormat,
        /// Upper bound on a single store round trip in milliseconds
        #[clap(long, default_value = "2000")]
        store_timeout_ms: u64,
        /// Schedule entries a claim may look past a leased head
        #[clap(long, default_value = "1")]
        claim_window: usize,
    }

    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        store_url: args.store_url,
        tick_rate: args.tick_rate,
        store_timeout: Duration::from_millis(args.store_timeout_ms),
        claim_window: args.claim_window.max(1),
        wire_format: args.format,
        ..ServerConfig::default()
    };
    info!(
        "Starting {} worker(s) at {} ticks/s with a {:?} lease",
        args.workers,
        config.tick_rate,
        config.lease_ttl()
    );

    let mut servers = Vec::with_capacity(args.workers);
    for worker in 0..args.workers.max(1) {
        let mut server = GameServer::connect(config.clone(), counter_tick).await?;
        spawn_event_logger(worker, server.subscribe());
        server.start()?;
        servers.push(server);
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    for (worker, server) in servers.iter_mut().enumerate() {
        match server.stop().await {
            Ok(stats) => info!("Worker {} stopped: {:?}", worker, stats),
            Err(e) => error!("Worker {} did not stop cleanly: {}", worker, e),
        }
    }

    Ok(())
}

/// Logs the events that operators care about; routine ones stay at debug level
/// inside the scheduler.
fn spawn_event_logger(
    worker: usize,
    mut events: tokio::sync::broadcast::Receiver<SchedulerEvent>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::Orphaned { instance_id }) => {
                    info!("Worker {} removed orphaned instance {}", worker, instance_id)
                }
                Ok(SchedulerEvent::RecordQuarantined {
                    instance_id,
                    field,
                    reason,
                }) => error!(
                    "Worker {} unscheduled instance {} with an unreadable {} field: {}",
                    worker, instance_id, field, reason
                ),
                Ok(SchedulerEvent::CommitFailed {
                    instance_id,
                    reason,
                }) => warn!(
                    "Worker {} could not commit instance {}: {}",
                    worker, instance_id, reason
                ),
                Ok(SchedulerEvent::Stopped { .. }) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Worker {} event logger skipped {} events", worker, skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
