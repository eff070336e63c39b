use clap::Parser;
use server::demo::{CounterPlayer, CounterState};
use server::instance::InstanceStore;
use server::schedule::ScheduleQueue;
use server::store::{RedisStore, Store};
use server::utils::get_timestamp;
use shared::{keys, EventCodec, Event, GenericMessage, InstanceRecord, PlayerData, WireFormat};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Provisions counter instances in the store and feeds them input, so a
/// running `server` has something to tick.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(short = 'u', long, default_value = "redis://127.0.0.1:6379")]
    store_url: String,
    /// Number of instances to provision, named `game-0`, `game-1`, ...
    #[clap(short, long, default_value = "3")]
    instances: usize,
    /// `inc` events to send to every instance
    #[clap(short, long, default_value = "10")]
    events: u64,
    /// Delay between rounds of events in milliseconds
    #[clap(short, long, default_value = "100")]
    delay_ms: u64,
    #[clap(short, long, default_value = "json")]
    format: WireFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let store: Arc<dyn Store> =
        Arc::new(RedisStore::connect(&args.store_url, Duration::from_secs(2)).await?);
    let instances = InstanceStore::new(Arc::clone(&store), EventCodec::new(args.format));
    let queue = ScheduleQueue::new(Arc::clone(&store));

    let ids: Vec<String> = (0..args.instances).map(|i| format!("game-{}", i)).collect();
    for id in &ids {
        let mut record: InstanceRecord<CounterState, CounterPlayer> = InstanceRecord::new(id.as_str());
        record.players = vec![PlayerData {
            id: format!("{}-player", id),
            data: CounterPlayer {
                name: "tester".to_string(),
            },
        }];
        record.updated_at = get_timestamp();

        instances.provision(&record).await?;
        queue.reschedule(id, record.updated_at).await?;
        println!("Provisioned {} (schedule key {})", id, keys::schedule_key());
    }

    for round in 1..=args.events {
        for id in &ids {
            let event: Event<GenericMessage> = Event {
                id: round,
                instance_id: id.clone(),
                player_id: format!("{}-player", id),
                kind: "inc".to_string(),
                message: None,
            };
            let pending = instances.enqueue(&event).await?;
            println!("Sent inc #{} to {} ({} pending)", round, id, pending);
        }
        sleep(Duration::from_millis(args.delay_ms)).await;
    }

    Ok(())
}
