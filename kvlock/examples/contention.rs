use kvlock::{
    test_utils::{LatencyMeasurement, LatencySimulator, LatencyStorage},
    InMemoryStorage, LockConfig, LockManager, Storage,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const WORKERS: usize = 6;
const ROUNDS: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("kvlock contention demo");
    println!("======================\n");

    // One shared store with a few milliseconds of latency per operation,
    // and one manager per worker as if each lived in its own process.
    let storage: Arc<dyn Storage> = Arc::new(LatencyStorage::new(
        Arc::new(InMemoryStorage::new()),
        LatencySimulator::default(),
    ));
    let config = LockConfig::new().with_times(Duration::from_millis(25));
    let ledger = Arc::new(AtomicU64::new(0));

    let mut measurement = LatencyMeasurement::start("all workers");
    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let manager = LockManager::with_config(storage.clone(), config.clone());
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut waited = Duration::ZERO;
            for _ in 0..ROUNDS {
                let mut wait = LatencyMeasurement::start("acquire");
                let ledger = ledger.clone();
                manager
                    .acquire("ledger", || async move {
                        let balance = ledger.load(Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        ledger.store(balance + 1, Ordering::SeqCst);
                        Ok::<_, kvlock::Error>(())
                    })
                    .await?;
                wait.stop();
                waited += wait.elapsed();
            }
            println!("  worker {worker}: {ROUNDS} sections, {}ms acquiring and holding", waited.as_millis());
            Ok::<_, kvlock::Error>(())
        }));
    }

    for handle in handles {
        handle.await??;
    }
    measurement.stop();

    let expected = (WORKERS * ROUNDS) as u64;
    let balance = ledger.load(Ordering::SeqCst);
    println!("\nledger = {balance} (expected {expected}) in {}ms", measurement.elapsed().as_millis());
    if balance == expected {
        println!("no lost updates");
    } else {
        println!("lost {} updates: critical sections overlapped", expected - balance);
    }

    Ok(())
}
