//! Parallel Batch Generation Pool
//!
//! High-throughput variant of the source scheduler. Template selection and
//! rendering run on a fixed set of worker threads; the coordinator task
//! owns everything order-sensitive.
//!
//! ```text
//!   tick ──► reserve N timestamps ──► chunk ──► crossbeam (work-in)
//!                  (one lock)                       │
//!                                          worker threads render
//!                                                   │
//!   buffer ◄── append in dispatch order ◄── oneshot (batch-out)
//!     │
//!     └── high-water mark ──► swap out ──► sink, sub-batch + yield
//! ```
//!
//! Backpressure: the coordinator awaits its own flush before taking the
//! next tick and skips missed ticks, so a slow sink pauses generation
//! instead of growing the buffer. The buffer never holds more than
//! `high_water_mark + events_per_tick - 1` events.

use crate::core::Event;
use crate::error::{Result, SimError};
use crate::generator::{EventFactory, SourceProfile};
use crate::metrics;
use crate::sink::{Sink, deliver_batch};
use crate::timestamp::TimestampAssigner;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_HIGH_WATER_MARK: usize = 10_000;
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 1_000;

/// Pool sizing and buffering
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Worker threads; 0 picks the available parallelism
    #[serde(default)]
    pub workers: usize,
    /// Buffer occupancy that triggers a flush
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    /// Events handed to the sink per sub-batch
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_flush_batch_size() -> usize {
    DEFAULT_FLUSH_BATCH_SIZE
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark == 0 {
            return Err(SimError::InvalidConfig("high_water_mark must be > 0".into()));
        }
        if self.flush_batch_size == 0 {
            return Err(SimError::InvalidConfig("flush_batch_size must be > 0".into()));
        }
        Ok(())
    }

    fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        }
    }
}

// ============================================================================
// Batch planning
// ============================================================================

/// Tick interval and events per tick for a target rate
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BatchPlan {
    pub interval: Duration,
    pub events_per_tick: usize,
}

impl BatchPlan {
    /// Effective rate of this plan
    pub fn events_per_second(&self) -> f64 {
        self.events_per_tick as f64 / self.interval.as_secs_f64()
    }
}

/// Derive a plan for `target_per_minute`.
///
/// Up to 10 events/s the pool ticks once per event. Above that the base
/// interval shrinks with the rate (100, 50, 20, then 10 ms) and the
/// interval is recomputed from the rounded per-tick count so the effective
/// rate matches the target.
pub fn plan_batch(target_per_minute: f64) -> Result<BatchPlan> {
    if !target_per_minute.is_finite() || target_per_minute <= 0.0 {
        return Err(SimError::InvalidConfig(format!(
            "target rate must be > 0 events/minute (got {target_per_minute})"
        )));
    }
    let interval = |secs: f64| {
        Duration::try_from_secs_f64(secs).map_err(|_| {
            SimError::InvalidConfig(format!(
                "target rate {target_per_minute} events/minute gives no usable tick interval"
            ))
        })
    };
    let eps = target_per_minute / 60.0;
    if eps <= 10.0 {
        return Ok(BatchPlan {
            interval: interval(1.0 / eps)?,
            events_per_tick: 1,
        });
    }

    let base_ms = if eps <= 100.0 {
        100.0
    } else if eps <= 1_000.0 {
        50.0
    } else if eps <= 10_000.0 {
        20.0
    } else {
        10.0
    };
    let events_per_tick = ((eps * base_ms / 1_000.0).round() as usize).max(1);
    Ok(BatchPlan {
        interval: interval(events_per_tick as f64 / eps)?,
        events_per_tick,
    })
}

// ============================================================================
// Buffer
// ============================================================================

/// Buffer occupancy for observability
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[allow(non_snake_case)]
pub struct BufferStats {
    pub bufferSize: usize,
    pub maxBufferSize: usize,
    pub utilizationPercent: f64,
}

impl BufferStats {
    fn new(size: usize, max: usize) -> Self {
        Self {
            bufferSize: size,
            maxBufferSize: max,
            utilizationPercent: if max == 0 {
                0.0
            } else {
                size as f64 * 100.0 / max as f64
            },
        }
    }
}

struct EventBuffer {
    events: Vec<Event>,
    high_water_mark: usize,
}

impl EventBuffer {
    fn new(high_water_mark: usize) -> Self {
        Self {
            events: Vec::with_capacity(high_water_mark.min(DEFAULT_HIGH_WATER_MARK)),
            high_water_mark,
        }
    }

    /// Append; returns the swapped-out contents once the high-water mark is hit
    fn append(&mut self, events: Vec<Event>) -> Option<Vec<Event>> {
        metrics::BUFFERED_EVENTS.add(events.len() as i64);
        self.events.extend(events);
        if self.events.len() >= self.high_water_mark {
            Some(self.take())
        } else {
            None
        }
    }

    fn take(&mut self) -> Vec<Event> {
        let taken = std::mem::take(&mut self.events);
        metrics::BUFFERED_EVENTS.sub(taken.len() as i64);
        taken
    }
}

// ============================================================================
// Workers
// ============================================================================

struct WorkItem {
    batch_id: u64,
    timestamps: Vec<DateTime<Utc>>,
    reply: oneshot::Sender<Result<Vec<Event>>>,
}

struct Worker {
    id: usize,
    rx: Receiver<WorkItem>,
    profile: Arc<SourceProfile>,
    factory: Arc<EventFactory>,
    rng: fastrand::Rng,
}

impl Worker {
    fn spawn(
        id: usize,
        rx: Receiver<WorkItem>,
        profile: Arc<SourceProfile>,
        factory: Arc<EventFactory>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let seed = xxhash_rust::xxh3::xxh3_64(profile.name().as_bytes())
            ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let name = format!("synthstream-{}-{}", profile.name(), id);
        thread::Builder::new().name(name).spawn(move || {
            let mut worker = Worker {
                id,
                rx,
                profile,
                factory,
                rng: fastrand::Rng::with_seed(seed),
            };
            worker.run();
        })
    }

    fn run(&mut self) {
        debug!(source = %self.profile.name(), worker = self.id, "Worker active");
        while let Ok(item) = self.rx.recv() {
            let result = self.render(&item.timestamps);
            if item.reply.send(result).is_err() {
                debug!(worker = self.id, batch_id = item.batch_id, "Coordinator went away");
            }
        }
        debug!(source = %self.profile.name(), worker = self.id, "Worker stopped");
    }

    fn render(&mut self, timestamps: &[DateTime<Utc>]) -> Result<Vec<Event>> {
        let rng = &mut self.rng;
        let mut draw = || rng.f64();
        timestamps
            .iter()
            .map(|ts| {
                self.factory
                    .compose(&self.profile, &mut draw)
                    .map(|draft| draft.stamp(*ts))
            })
            .collect()
    }
}

struct Dispatcher {
    tx: Sender<WorkItem>,
    workers: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    generated: AtomicU64,
    flushed: AtomicU64,
    flushes: AtomicU64,
    failed_batches: AtomicU64,
}

/// Point-in-time pool counters
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub generated: u64,
    pub flushed: u64,
    pub flushes: u64,
    pub failed_batches: u64,
}

struct PoolShared {
    profile: Arc<SourceProfile>,
    factory: Arc<EventFactory>,
    assigner: Arc<TimestampAssigner>,
    sink: Arc<dyn Sink>,
    config: PoolConfig,
    buffer: Mutex<EventBuffer>,
    dispatcher: Mutex<Option<Dispatcher>>,
    failure: Mutex<Option<String>>,
    counters: PoolCounters,
    next_batch: AtomicU64,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolShared {
    fn name(&self) -> &str {
        self.profile.name()
    }

    fn dispatcher(&self) -> Result<(Sender<WorkItem>, usize)> {
        relock(&self.dispatcher)
            .as_ref()
            .map(|d| (d.tx.clone(), d.workers))
            .ok_or_else(|| SimError::PoolNotConfigured(self.name().to_string()))
    }

    fn record_failure(&self, reason: String) {
        warn!(source = %self.name(), reason = %reason, "Worker pool failure");
        *relock(&self.failure) = Some(reason);
    }

    fn take_failure(&self) -> Option<String> {
        relock(&self.failure).take()
    }

    fn buffer_stats(&self) -> BufferStats {
        let buffer = relock(&self.buffer);
        BufferStats::new(buffer.events.len(), buffer.high_water_mark)
    }

    /// Generate `count` events across the workers and buffer them
    async fn generate(&self, count: usize) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }
        let (tx, workers) = self.dispatcher()?;

        // Single serialization point: the whole tick's range is reserved
        // before any worker sees it.
        let stamps = self.assigner.reserve(count);
        let chunk = count.div_ceil(workers.max(1));

        let mut replies = Vec::with_capacity(workers);
        let mut failed = 0u64;
        for slice in stamps.chunks(chunk) {
            let (reply, rx) = oneshot::channel();
            let batch_id = self.next_batch.fetch_add(1, Ordering::Relaxed);
            let item = WorkItem {
                batch_id,
                timestamps: slice.to_vec(),
                reply,
            };
            match tx.try_send(item) {
                Ok(()) => replies.push((batch_id, rx)),
                Err(TrySendError::Full(_)) => {
                    failed += 1;
                    warn!(source = %self.name(), batch_id, "Worker queue full, batch dropped");
                }
                Err(TrySendError::Disconnected(_)) => {
                    let reason = "all workers have exited".to_string();
                    self.record_failure(reason.clone());
                    return Err(SimError::PoolFailed(reason));
                }
            }
        }
        let dispatched = failed + replies.len() as u64;

        let mut produced = Vec::with_capacity(count);
        for (batch_id, rx) in replies {
            match rx.await {
                Ok(Ok(events)) => produced.extend(events),
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(source = %self.name(), batch_id, error = %e, "Batch dropped");
                }
                Err(_) => {
                    failed += 1;
                    warn!(source = %self.name(), batch_id, "Worker exited before replying, batch dropped");
                }
            }
        }

        if failed > 0 {
            self.counters.failed_batches.fetch_add(failed, Ordering::Relaxed);
            metrics::BATCH_FAILURES.inc_by(failed);
            if failed == dispatched {
                self.record_failure(format!("all {dispatched} batches of a tick failed"));
            }
        }

        let generated = produced.len();
        self.counters.generated.fetch_add(generated as u64, Ordering::Relaxed);
        metrics::EVENTS_GENERATED.inc_by(generated as u64);

        let full = relock(&self.buffer).append(produced);
        if let Some(events) = full {
            self.deliver(events).await;
        }
        Ok(generated)
    }

    /// Hand swapped-out events to the sink in sub-batches, yielding between them
    async fn deliver(&self, events: Vec<Event>) -> usize {
        let total = events.len();
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::BUFFER_FLUSHES.inc();

        let mut delivered = 0;
        let mut remaining = events.into_iter();
        loop {
            let chunk: Vec<Event> = remaining
                .by_ref()
                .take(self.config.flush_batch_size)
                .collect();
            if chunk.is_empty() {
                break;
            }
            delivered += deliver_batch(self.sink.as_ref(), chunk);
            tokio::task::yield_now().await;
        }

        self.counters.flushed.fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(source = %self.name(), total, delivered, "Buffer flushed");
        delivered
    }

    async fn flush(&self) -> Result<usize> {
        let events = relock(&self.buffer).take();
        let delivered = if events.is_empty() {
            0
        } else {
            self.deliver(events).await
        };
        match self.take_failure() {
            Some(reason) => Err(SimError::PoolFailed(reason)),
            None => Ok(delivered),
        }
    }
}

/// Read-only handle for buffer observability
#[derive(Clone)]
pub struct BufferProbe {
    shared: Arc<PoolShared>,
}

impl BufferProbe {
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn stats(&self) -> BufferStats {
        self.shared.buffer_stats()
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Parallel generator for one high-throughput source
pub struct BatchWorkerPool {
    shared: Arc<PoolShared>,
    target_per_minute: f64,
    handles: Vec<thread::JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl BatchWorkerPool {
    pub fn new(
        profile: SourceProfile,
        target_per_minute: f64,
        config: PoolConfig,
        factory: Arc<EventFactory>,
        assigner: Arc<TimestampAssigner>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let buffer = EventBuffer::new(config.high_water_mark);
        Self {
            shared: Arc::new(PoolShared {
                profile: Arc::new(profile),
                factory,
                assigner,
                sink,
                config,
                buffer: Mutex::new(buffer),
                dispatcher: Mutex::new(None),
                failure: Mutex::new(None),
                counters: PoolCounters::default(),
                next_batch: AtomicU64::new(0),
            }),
            target_per_minute,
            handles: Vec::new(),
            cancel: None,
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn target_per_minute(&self) -> f64 {
        self.target_per_minute
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn `worker_count` worker threads, replacing any existing set
    pub fn configure(&mut self, worker_count: usize) -> Result<()> {
        if worker_count == 0 {
            return Err(SimError::InvalidConfig("worker count must be > 0".into()));
        }
        if self.is_running() {
            return Err(SimError::AlreadyRunning(self.name().to_string()));
        }
        self.release_workers_blocking();

        let (tx, rx) = bounded::<WorkItem>(worker_count * 2);
        for id in 0..worker_count {
            let handle = Worker::spawn(
                id,
                rx.clone(),
                self.shared.profile.clone(),
                self.shared.factory.clone(),
            )?;
            self.handles.push(handle);
        }
        *relock(&self.shared.dispatcher) = Some(Dispatcher {
            tx,
            workers: worker_count,
        });
        info!(source = %self.name(), workers = worker_count, "Worker pool configured");
        Ok(())
    }

    /// Plan for the configured target rate
    pub fn plan(&self) -> Result<BatchPlan> {
        plan_batch(self.target_per_minute)
    }

    /// Start the tick timer. Spawns workers first if `configure` was not called.
    pub fn start(&mut self) -> Result<()> {
        let plan = self.plan()?;
        self.shared.profile.validate()?;
        self.shared.config.validate()?;
        if self.is_running() {
            return Err(SimError::AlreadyRunning(self.name().to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SimError::NoRuntime(self.name().to_string()))?;
        if self.handles.is_empty() {
            self.configure(self.shared.config.resolved_workers())?;
        }

        let cancel = CancellationToken::new();
        info!(
            source = %self.name(),
            interval_ms = plan.interval.as_millis() as u64,
            events_per_tick = plan.events_per_tick,
            "Batch pool started"
        );
        self.task = Some(runtime.spawn(coordinate(self.shared.clone(), plan, cancel.clone())));
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Generate `count` events immediately, outside the tick timer.
    ///
    /// Refused with `AlreadyRunning` while the timer is active: two
    /// concurrent generations could append to the buffer out of timestamp
    /// order.
    pub async fn generate(&self, count: usize) -> Result<usize> {
        if self.is_running() {
            return Err(SimError::AlreadyRunning(self.name().to_string()));
        }
        self.shared.generate(count).await
    }

    /// Flush whatever is buffered. Reports a pending pool failure.
    pub async fn flush(&self) -> Result<usize> {
        self.shared.flush().await
    }

    /// Cancel the timer, flush the remainder, release the workers.
    ///
    /// Returns the number of events delivered by the final flush, or the
    /// pool failure recorded since the last flush.
    pub async fn stop(&mut self) -> Result<usize> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        let remaining = relock(&self.shared.buffer).take();
        let flushed = if remaining.is_empty() {
            0
        } else {
            self.shared.deliver(remaining).await
        };

        drop(relock(&self.shared.dispatcher).take());
        let handles = std::mem::take(&mut self.handles);
        if !handles.is_empty() {
            let _ = tokio::task::spawn_blocking(move || join_workers(handles)).await;
        }

        info!(source = %self.name(), flushed, "Batch pool stopped");
        match self.shared.take_failure() {
            Some(reason) => Err(SimError::PoolFailed(reason)),
            None => Ok(flushed),
        }
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.shared.buffer_stats()
    }

    pub fn probe(&self) -> BufferProbe {
        BufferProbe {
            shared: self.shared.clone(),
        }
    }

    pub fn stats(&self) -> PoolSnapshot {
        let c = &self.shared.counters;
        PoolSnapshot {
            generated: c.generated.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
        }
    }

    fn release_workers_blocking(&mut self) {
        drop(relock(&self.shared.dispatcher).take());
        join_workers(std::mem::take(&mut self.handles));
    }
}

impl Drop for BatchWorkerPool {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        // Closing the work channel lets detached workers exit on their own.
        drop(relock(&self.shared.dispatcher).take());
    }
}

fn join_workers(handles: Vec<thread::JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            warn!("Worker thread panicked");
        }
    }
}

async fn coordinate(shared: Arc<PoolShared>, plan: BatchPlan, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + plan.interval, plan.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match shared.generate(plan.events_per_tick).await {
                    Ok(_) => {}
                    Err(SimError::PoolFailed(reason)) => {
                        warn!(source = %shared.name(), reason = %reason, "Coordinator stopping");
                        break;
                    }
                    Err(e) => warn!(source = %shared.name(), error = %e, "Tick failed"),
                }
            }
        }
    }
    debug!(source = %shared.name(), "Coordinator exited");
}
