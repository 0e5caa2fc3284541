use kvlock::{
    test_utils::{LatencySimulator, LatencyStorage},
    InMemoryStorage, LockConfig, LockManager, Sequencing, Storage,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Barrier;

/// Independent managers stand in for separate processes: they share the
/// store and nothing else.
fn instances(count: usize, storage: Arc<dyn Storage>, config: &LockConfig) -> Vec<Arc<LockManager>> {
    (0..count)
        .map(|_| Arc::new(LockManager::with_config(storage.clone(), config.clone())))
        .collect()
}

fn slow_store() -> Arc<dyn Storage> {
    Arc::new(LatencyStorage::new(
        Arc::new(InMemoryStorage::new()),
        LatencySimulator {
            base: Duration::from_millis(1),
            jitter: Duration::from_millis(3),
        },
    ))
}

#[derive(Default)]
struct Exclusion {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl Exclusion {
    async fn critical_section(&self, hold: Duration) -> kvlock::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_simultaneous_try_acquire_runs_at_most_one() {
    let config = LockConfig::new().with_times(Duration::from_millis(20));

    for _ in 0..10 {
        let managers = instances(2, slow_store(), &config);
        let exclusion = Arc::new(Exclusion::default());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = managers
            .iter()
            .cloned()
            .map(|manager| {
                let exclusion = exclusion.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    manager
                        .try_acquire("r", || async move {
                            exclusion.critical_section(Duration::from_millis(30)).await
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(exclusion.runs.load(Ordering::SeqCst) <= 1);
        assert!(exclusion.peak.load(Ordering::SeqCst) <= 1);
    }
}

#[tokio::test]
async fn test_racing_acquirers_all_get_a_turn() {
    let config = LockConfig::new().with_times(Duration::from_millis(20));
    let managers = instances(2, slow_store(), &config);
    let exclusion = Arc::new(Exclusion::default());
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = managers
        .iter()
        .cloned()
        .map(|manager| {
            let exclusion = exclusion.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                manager
                    .acquire("r", || async move {
                        exclusion.critical_section(Duration::from_millis(10)).await
                    })
                    .await
            })
        })
        .collect();

    let all = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(handles)).await;
    for joined in all.expect("racing acquirers livelocked") {
        joined.unwrap().unwrap();
    }
    assert_eq!(exclusion.runs.load(Ordering::SeqCst), 2);
    assert_eq!(exclusion.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_many_instances_serialize_a_shared_counter() {
    let config = LockConfig::new().with_times(Duration::from_millis(20));
    let storage = slow_store();
    let managers = instances(4, storage.clone(), &config);
    let counter = Arc::new(AtomicUsize::new(0));
    let exclusion = Arc::new(Exclusion::default());

    let handles: Vec<_> = managers
        .into_iter()
        .map(|manager| {
            let counter = counter.clone();
            let exclusion = exclusion.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    let counter = counter.clone();
                    let exclusion = exclusion.clone();
                    manager
                        .acquire("counter", || async move {
                            // Read-modify-write with a gap: lost updates show up
                            // immediately if two sections overlap.
                            let seen = counter.load(Ordering::SeqCst);
                            exclusion.critical_section(Duration::from_millis(3)).await?;
                            counter.store(seen + 1, Ordering::SeqCst);
                            Ok::<_, kvlock::Error>(())
                        })
                        .await?;
                }
                Ok::<_, kvlock::Error>(())
            })
        })
        .collect();

    let all = tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(handles)).await;
    for joined in all.expect("instances livelocked") {
        joined.unwrap().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 20);
    assert_eq!(exclusion.peak.load(Ordering::SeqCst), 1);
    assert!(storage.get("counter__MUTEX_x").await.unwrap().is_none());
    assert!(storage.get("counter__MUTEX_y").await.unwrap().is_none());
}

#[tokio::test]
async fn test_global_sequencing_still_serves_every_name() {
    let config = LockConfig::new()
        .with_times(Duration::from_millis(10))
        .with_sequencing(Sequencing::Global);
    let manager = Arc::new(LockManager::with_config(slow_store(), config));

    let handles: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire(name, || async move { Ok::<_, kvlock::Error>(name) })
                    .await
            })
        })
        .collect();

    let mut served: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    served.sort_unstable();
    assert_eq!(served, vec!["a", "b", "c", "d"]);
}
