use crate::{
    storage::{InMemoryStorage, Storage},
    time::{Clock, EpochMillis},
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: EpochMillis) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> EpochMillis {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct LatencySimulator {
    pub base: Duration,
    pub jitter: Duration,
}

impl Default for LatencySimulator {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2),
            jitter: Duration::from_millis(3),
        }
    }
}

impl LatencySimulator {
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            jitter: Duration::ZERO,
        }
    }

    pub fn next_delay(&self) -> Duration {
        let jitter_us = u64::try_from(self.jitter.as_micros()).unwrap_or(u64::MAX);
        if jitter_us == 0 {
            return self.base;
        }
        self.base + Duration::from_micros(rand::rng().random_range(0..jitter_us))
    }

    pub async fn simulate(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

/// Adds a simulated round trip before every operation of the wrapped store,
/// widening the windows in which concurrent passes interleave.
#[derive(Debug, Clone)]
pub struct LatencyStorage {
    inner: Arc<dyn Storage>,
    latency: LatencySimulator,
}

impl LatencyStorage {
    pub fn new(inner: Arc<dyn Storage>, latency: LatencySimulator) -> Self {
        Self { inner, latency }
    }
}

#[async_trait]
impl Storage for LatencyStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.latency.simulate().await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.latency.simulate().await;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.latency.simulate().await;
        self.inner.delete(key).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Get,
    Set,
    Delete,
}

#[derive(Debug, Clone)]
struct Fault {
    op: StorageOp,
    key_suffix: Option<String>,
    remaining: Option<usize>,
}

impl Fault {
    fn matches(&self, op: StorageOp, key: &str) -> bool {
        self.op == op
            && self
                .key_suffix
                .as_deref()
                .map_or(true, |suffix| key.ends_with(suffix))
    }
}

/// In-memory store that logs every operation and fails the ones it is told
/// to.
#[derive(Debug, Default)]
pub struct FaultyStorage {
    inner: InMemoryStorage,
    faults: Mutex<Vec<Fault>>,
    log: Mutex<Vec<(StorageOp, String)>>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryStorage {
        &self.inner
    }

    /// Fails every `op` on keys ending with `key_suffix` (any key if `None`)
    /// until [`FaultyStorage::clear_faults`].
    pub fn fail(&self, op: StorageOp, key_suffix: Option<&str>) {
        self.push_fault(op, key_suffix, None);
    }

    pub fn fail_once(&self, op: StorageOp, key_suffix: Option<&str>) {
        self.push_fault(op, key_suffix, Some(1));
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn operations(&self) -> Vec<(StorageOp, String)> {
        self.log.lock().clone()
    }

    pub fn count(&self, op: StorageOp) -> usize {
        self.log.lock().iter().filter(|(o, _)| *o == op).count()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn push_fault(&self, op: StorageOp, key_suffix: Option<&str>, remaining: Option<usize>) {
        self.faults.lock().push(Fault {
            op,
            key_suffix: key_suffix.map(str::to_string),
            remaining,
        });
    }

    fn record(&self, op: StorageOp, key: &str) -> Result<()> {
        self.log.lock().push((op, key.to_string()));

        let mut faults = self.faults.lock();
        let Some(index) = faults.iter().position(|f| f.matches(op, key)) else {
            return Ok(());
        };
        if let Some(remaining) = faults[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(index);
            }
        }
        Err(Error::storage(format!("injected {op:?} failure on {key}")))
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.record(StorageOp::Get, key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.record(StorageOp::Set, key)?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.record(StorageOp::Delete, key)?;
        self.inner.delete(key).await
    }
}

#[derive(Debug)]
pub struct LatencyMeasurement {
    pub operation: String,
    pub start_time: std::time::Instant,
    pub end_time: std::time::Instant,
    pub latency_us: u64,
}

impl LatencyMeasurement {
    pub fn start(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start_time: std::time::Instant::now(),
            end_time: std::time::Instant::now(),
            latency_us: 0,
        }
    }

    pub fn stop(&mut self) {
        self.end_time = std::time::Instant::now();
        self.latency_us = self.end_time.duration_since(self.start_time).as_micros() as u64;
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.latency_us)
    }

    pub fn assert_at_least_milliseconds(&self, min_ms: u64) {
        let ms = self.latency_us / 1000;
        assert!(
            ms >= min_ms,
            "{} took {}ms, expected >= {}ms",
            self.operation,
            ms,
            min_ms
        );
    }

    pub fn assert_milliseconds(&self, max_ms: u64) {
        let ms = self.latency_us / 1000;
        assert!(
            ms <= max_ms,
            "{} took {}ms, expected <= {}ms",
            self.operation,
            ms,
            max_ms
        );
    }
}
