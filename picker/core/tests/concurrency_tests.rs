//! Concurrency tests for the datastore and routing path
//!
//! Writers rewrite pools, models, backends and telemetry while readers
//! route requests. Nothing may panic, deadlock, or observe a record that
//! mixes two writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use picker_core::datalayer::plugins::QUEUED_REQUESTS;
use picker_core::reconcile::{BucketRateLimiter, WorkQueue};
use picker_core::{
    Backend, Datastore, Model, Pool, ResourceId, RoutingError, RoutingQuery, TelemetrySnapshot,
    TelemetryValue,
};

const WRITERS: usize = 8;
const READERS: usize = 16;
const ROUNDS: usize = 500;

fn source() -> ResourceId {
    ResourceId::new("default", "svc")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_and_readers_never_see_torn_records() {
    let datastore = Arc::new(Datastore::new());
    datastore
        .pool()
        .replace(Pool::new(ResourceId::new("default", "pool"), 8000));
    let query = RoutingQuery::new(Arc::clone(&datastore));
    let routed = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();

    for writer in 0..WRITERS {
        let datastore = Arc::clone(&datastore);
        tasks.spawn(async move {
            for round in 0..ROUNDS {
                let address = format!("10.0.{}.{}", writer, round % 4);
                datastore.backends().upsert(
                    address.clone(),
                    Backend::new(address.clone(), format!("writer-{writer}"), source()),
                );
                datastore.backends().update_telemetry(
                    &address,
                    TelemetrySnapshot::new()
                        .with(QUEUED_REQUESTS, TelemetryValue::integer(round as i64)),
                );

                // weight encodes the writer, so a torn model would show up
                // as a variant name that disagrees with its weight
                let weight = writer as u32 + 1;
                datastore.models().upsert(
                    "shared",
                    Model::new("shared", "pool").with_target(format!("w{weight}"), weight),
                );

                if round % 7 == 0 {
                    datastore.backends().delete(&address);
                }
                if round % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }

    for reader in 0..READERS {
        let query = query.clone();
        let datastore = Arc::clone(&datastore);
        let routed = Arc::clone(&routed);
        tasks.spawn(async move {
            for round in 0..ROUNDS {
                match query.route_with_seed("shared", (reader * ROUNDS + round) as u64) {
                    Ok(decision) => {
                        routed.fetch_add(1, Ordering::Relaxed);
                        assert_eq!(decision.port, 8000);
                        assert!(decision.variant.starts_with('w'));
                    }
                    Err(RoutingError::UnknownModel(_)) | Err(RoutingError::NoAvailableBackend(_)) => {}
                    Err(other) => panic!("unexpected routing error: {other}"),
                }

                if let Some(model) = datastore.models().get("shared") {
                    let target = &model.targets[0];
                    assert_eq!(target.name, format!("w{}", target.weight));
                }
                for backend in datastore.backends().list() {
                    let writer = backend.address.split('.').nth(2).unwrap_or_default();
                    assert_eq!(backend.name, format!("writer-{writer}"));
                }
                if round % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }

    let outcome = tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(result) = tasks.join_next().await {
            result.expect("task panicked");
        }
    })
    .await;
    assert!(outcome.is_ok(), "datastore operations deadlocked");
    assert!(routed.load(Ordering::Relaxed) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_replace_is_atomic_for_readers() {
    let datastore = Arc::new(Datastore::new());
    datastore.pool().replace(
        Pool::new(ResourceId::new("default", "pool"), 1).with_selector("port", "1"),
    );

    let mut tasks = JoinSet::new();
    for port in 1..=4u16 {
        let datastore = Arc::clone(&datastore);
        tasks.spawn(async move {
            for _ in 0..ROUNDS {
                datastore.pool().replace(
                    Pool::new(ResourceId::new("default", "pool"), port)
                        .with_selector("port", port.to_string()),
                );
                tokio::task::yield_now().await;
            }
        });
    }
    for _ in 0..4 {
        let datastore = Arc::clone(&datastore);
        tasks.spawn(async move {
            for _ in 0..ROUNDS {
                let pool = datastore.pool().get().expect("pool stays initialized");
                assert_eq!(pool.selector["port"], pool.target_port.to_string());
                tokio::task::yield_now().await;
            }
        });
    }

    while let Some(result) = tasks.join_next().await {
        result.expect("task panicked");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn work_queue_never_hands_one_item_to_two_workers() {
    let queue = Arc::new(WorkQueue::new(BucketRateLimiter::new(1000.0, 1000)));
    let in_flight: Arc<dashmap::DashSet<u32>> = Arc::new(dashmap::DashSet::new());
    let processed = Arc::new(AtomicUsize::new(0));

    let mut workers = JoinSet::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        let in_flight = Arc::clone(&in_flight);
        let processed = Arc::clone(&processed);
        workers.spawn(async move {
            while let Some(item) = queue.get().await {
                assert!(in_flight.insert(item), "item {item} handed out twice");
                tokio::task::yield_now().await;
                in_flight.remove(&item);
                processed.fetch_add(1, Ordering::Relaxed);
                queue.done(&item);
            }
        });
    }

    for round in 0..2_000u32 {
        queue.add(round % 16);
        if round % 100 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !queue.is_empty() || !in_flight.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue did not drain");
        tokio::task::yield_now().await;
    }

    queue.shut_down();
    while let Some(result) = workers.join_next().await {
        result.expect("worker panicked");
    }
    assert!(processed.load(Ordering::Relaxed) >= 16);
}
