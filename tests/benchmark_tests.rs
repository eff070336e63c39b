//! Performance benchmarks for the hot paths of a tick cycle

use server::instance::InstanceStore;
use server::schedule::ScheduleQueue;
use server::store::MemoryStore;
use shared::{Event, EventCodec, GenericMessage, WireFormat};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sample_event(id: u64) -> Event<GenericMessage> {
    Event {
        id,
        instance_id: "bench".to_string(),
        player_id: "player".to_string(),
        kind: "move".to_string(),
        message: Some(GenericMessage::new(
            "move",
            serde_json::json!({ "x": 1.5, "y": -2.0 }),
        )),
    }
}

/// Benchmarks event decoding in both wire formats
#[test]
fn benchmark_event_decoding() {
    for format in [WireFormat::Json, WireFormat::Bincode] {
        let codec = EventCodec::new(format);
        let bytes = codec.encode_event(&sample_event(7)).unwrap();

        let iterations = 50_000;
        let start = Instant::now();

        for _ in 0..iterations {
            let event: Event<GenericMessage> = codec.decode_event(&bytes).unwrap();
            assert_eq!(event.id, 7);
        }

        let duration = start.elapsed();
        println!(
            "Event decoding ({}): {} iterations in {:?} ({:.2} μs/iter)",
            format,
            iterations,
            duration,
            duration.as_micros() as f64 / iterations as f64
        );

        // Should complete in under 2 seconds even in debug builds
        assert!(duration.as_millis() < 2000);
    }
}

/// Benchmarks claim and reschedule against the in-memory store
#[tokio::test]
async fn benchmark_claim_and_reschedule() {
    let store = Arc::new(MemoryStore::new());
    let queue = ScheduleQueue::new(store);
    for i in 0..100 {
        queue.reschedule(&format!("g{}", i), i).await.unwrap();
    }

    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let id = queue
            .claim_next(Duration::from_millis(1))
            .await
            .unwrap()
            .claimed();
        if let Some(id) = id {
            queue.reschedule(&id, 1_000 + i).await.unwrap();
        }
    }

    let duration = start.elapsed();
    println!(
        "Claim and reschedule: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(queue.len().await.unwrap(), 100);
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks draining a large pending queue
#[tokio::test]
async fn benchmark_drain_large_queue() {
    let store = Arc::new(MemoryStore::new());
    let instances = InstanceStore::new(store, EventCodec::default());
    // Appended in reverse so the drain has to sort
    for id in (0..5_000).rev() {
        instances.enqueue(&sample_event(id)).await.unwrap();
    }

    let start = Instant::now();
    let batch = instances
        .drain_events::<GenericMessage>("bench")
        .await
        .unwrap();
    let duration = start.elapsed();

    println!("Drained {} events in {:?}", batch.events.len(), duration);
    assert_eq!(batch.events.len(), 5_000);
    assert!(batch.events.windows(2).all(|pair| pair[0].id < pair[1].id));
    assert!(duration.as_millis() < 1000);
}
