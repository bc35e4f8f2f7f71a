//! Historical Replay Engine
//!
//! Re-emits a recorded event sequence with its original relative timing,
//! optionally compressed or stretched by a speed factor.
//!
//! State machine per run:
//!
//! ```text
//!   Idle -> Loading -> Replaying -> Completed
//!                          |
//!                          +------> Stopped   (stop_replay / abort / superseded)
//! ```
//!
//! Every `start_replay` creates a fresh run with its own progress
//! counters, so a superseded run that is still winding down can never
//! touch the progress of its successor.

use crate::core::{Event, Level};
use crate::error::{Result, SimError};
use crate::metrics;
use crate::sink::{Sink, deliver};
use crate::timestamp::TimestampAssigner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Sources
// ============================================================================

/// Events produced by a `ReplaySource`
#[derive(Debug, Clone, Default)]
pub struct LoadedEvents {
    pub events: Vec<Event>,
    /// Records that could not be parsed
    pub skipped: usize,
}

/// Provider of historical events
#[async_trait]
pub trait ReplaySource: Send + Sync {
    async fn load(&self) -> Result<LoadedEvents>;
}

#[async_trait]
impl ReplaySource for Vec<Event> {
    async fn load(&self) -> Result<LoadedEvents> {
        Ok(LoadedEvents {
            events: self.clone(),
            skipped: 0,
        })
    }
}

/// Newline-delimited JSON file, one `Event` per line
#[derive(Debug, Clone)]
pub struct NdjsonSource {
    path: PathBuf,
}

impl NdjsonSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ReplaySource for NdjsonSource {
    async fn load(&self) -> Result<LoadedEvents> {
        let data = tokio::fs::read(&self.path).await?;
        let loaded = parse_ndjson(&data);
        info!(
            path = %self.path.display(),
            events = loaded.events.len(),
            skipped = loaded.skipped,
            "Replay input loaded"
        );
        Ok(loaded)
    }
}

/// Parse NDJSON, skipping blank and malformed lines
pub fn parse_ndjson(data: &[u8]) -> LoadedEvents {
    let mut loaded = LoadedEvents::default();
    for (idx, raw) in data.split(|b| *b == b'\n').enumerate() {
        let line = raw.trim_ascii();
        if line.is_empty() {
            continue;
        }
        // simd-json parses in place
        let mut bytes = line.to_vec();
        match simd_json::from_slice::<Event>(&mut bytes) {
            Ok(event) => loaded.events.push(event),
            Err(e) => {
                loaded.skipped += 1;
                warn!(line = idx + 1, error = %e, "Skipping unparsable replay record");
            }
        }
    }
    loaded
}

// ============================================================================
// Options
// ============================================================================

/// Selection applied after sorting. Every set criterion must match.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub to: Option<DateTime<Utc>>,
    pub source_types: Option<HashSet<String>>,
    pub levels: Option<HashSet<Level>>,
}

impl ReplayFilter {
    pub fn levels(mut self, levels: impl IntoIterator<Item = Level>) -> Self {
        self.levels = Some(levels.into_iter().collect());
        self
    }

    pub fn source_types<S: Into<String>>(mut self, types: impl IntoIterator<Item = S>) -> Self {
        self.source_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.from.is_some_and(|from| event.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| event.timestamp > to) {
            return false;
        }
        if let Some(types) = &self.source_types {
            if !types.contains(event.source_type()) {
                return false;
            }
        }
        if let Some(levels) = &self.levels {
            if !levels.contains(&event.level) {
                return false;
            }
        }
        true
    }

    /// Keep matching events, preserving order
    pub fn apply(&self, events: Vec<Event>) -> Vec<Event> {
        events.into_iter().filter(|e| self.matches(e)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub filter: ReplayFilter,
    /// Time compression factor; 2.0 replays twice as fast
    pub speed: f64,
    pub looping: bool,
    /// Pause between the last event of a pass and the first of the next
    pub loop_delay: Duration,
    /// Replace original timestamps with freshly issued ones
    pub restamp: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            filter: ReplayFilter::default(),
            speed: 1.0,
            looping: false,
            loop_delay: Duration::ZERO,
            restamp: false,
        }
    }
}

impl ReplayOptions {
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn filter(mut self, filter: ReplayFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(SimError::InvalidSpeed(self.speed));
        }
        if let (Some(from), Some(to)) = (self.filter.from, self.filter.to) {
            if from > to {
                return Err(SimError::InvalidConfig(format!(
                    "replay range is empty: {from} is after {to}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplayState {
    Idle,
    Loading,
    Replaying,
    Completed,
    Stopped,
}

impl ReplayState {
    pub fn is_finished(self) -> bool {
        matches!(self, ReplayState::Completed | ReplayState::Stopped)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[allow(non_snake_case)]
pub struct ReplayProgress {
    pub isReplaying: bool,
    pub currentIndex: usize,
    pub totalLogs: usize,
    pub progressPercent: f64,
    pub state: ReplayState,
    pub loops: u64,
}

/// Reported to the completion callback
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub emitted: u64,
    pub total: usize,
    pub loops: u64,
}

pub type CompletionCallback = Arc<dyn Fn(ReplaySummary) + Send + Sync>;

/// Progress and lifecycle of a single replay run
struct RunState {
    id: u64,
    state: watch::Sender<ReplayState>,
    index: AtomicUsize,
    total: AtomicUsize,
    emitted: AtomicU64,
    loops: AtomicU64,
    cancel: CancellationToken,
}

impl RunState {
    fn new(id: u64) -> Self {
        let (state, _) = watch::channel(ReplayState::Idle);
        Self {
            id,
            state,
            index: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            emitted: AtomicU64::new(0),
            loops: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn current(&self) -> ReplayState {
        *self.state.borrow()
    }

    fn set(&self, next: ReplayState) {
        self.state.send_replace(next);
    }

    /// Move to `next` only from one of the `from` states
    fn transition(&self, from: &[ReplayState], next: ReplayState) -> bool {
        self.state.send_if_modified(|s| {
            if from.contains(s) {
                *s = next;
                true
            } else {
                false
            }
        })
    }

    /// Cancel the run. Returns false if it had already finished.
    fn stop(&self) -> bool {
        self.cancel.cancel();
        self.transition(
            &[ReplayState::Loading, ReplayState::Replaying],
            ReplayState::Stopped,
        )
    }

    fn summary(&self) -> ReplaySummary {
        ReplaySummary {
            emitted: self.emitted.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            loops: self.loops.load(Ordering::Relaxed),
        }
    }

    fn progress(&self) -> ReplayProgress {
        let state = self.current();
        let index = self.index.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        ReplayProgress {
            isReplaying: state == ReplayState::Replaying,
            currentIndex: index,
            totalLogs: total,
            progressPercent: if total == 0 {
                0.0
            } else {
                index as f64 * 100.0 / total as f64
            },
            state,
            loops: self.loops.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Replays one historical sequence at a time
pub struct ReplayEngine {
    assigner: Arc<TimestampAssigner>,
    run: Mutex<Arc<RunState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::with_assigner(TimestampAssigner::shared())
    }

    /// Share an assigner with live generation so re-stamped replays
    /// interleave with generated events without collisions
    pub fn with_assigner(assigner: Arc<TimestampAssigner>) -> Self {
        Self {
            assigner,
            run: Mutex::new(Arc::new(RunState::new(0))),
            task: Mutex::new(None),
            next_id: AtomicU64::new(1),
            on_complete: Mutex::new(None),
        }
    }

    /// Invoked when a non-looping replay emits its last event
    pub fn on_complete(&self, callback: impl Fn(ReplaySummary) + Send + Sync + 'static) {
        *relock(&self.on_complete) = Some(Arc::new(callback));
    }

    fn current_run(&self) -> Arc<RunState> {
        relock(&self.run).clone()
    }

    pub fn state(&self) -> ReplayState {
        self.current_run().current()
    }

    pub fn progress(&self) -> ReplayProgress {
        self.current_run().progress()
    }

    /// Load, sort, filter and start replaying into `sink`.
    ///
    /// Returns the number of events scheduled per pass. Any replay already
    /// in progress is stopped first.
    pub async fn start_replay(
        &self,
        source: &dyn ReplaySource,
        options: ReplayOptions,
        sink: Arc<dyn Sink>,
    ) -> Result<usize> {
        options.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SimError::NoRuntime("replay".into()))?;

        let run = Arc::new(RunState::new(self.next_id.fetch_add(1, Ordering::Relaxed)));
        let previous = std::mem::replace(&mut *relock(&self.run), run.clone());
        if previous.stop() {
            info!(run = previous.id, "Previous replay superseded");
        }
        drop(relock(&self.task).take());

        run.set(ReplayState::Loading);
        let loaded = source.load().await;
        if run.cancel.is_cancelled() {
            return Err(SimError::ReplaySuperseded);
        }
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                run.set(ReplayState::Idle);
                return Err(e);
            }
        };
        if loaded.events.is_empty() {
            run.set(ReplayState::Idle);
            return Err(SimError::NothingToReplay {
                skipped: loaded.skipped,
            });
        }
        if loaded.skipped > 0 {
            warn!(skipped = loaded.skipped, "Some replay records were skipped");
        }

        let mut events = loaded.events;
        events.sort_by_key(|e| e.timestamp);
        let events = options.filter.apply(events);
        let total = events.len();
        run.total.store(total, Ordering::Relaxed);

        let on_complete = relock(&self.on_complete).clone();
        if events.is_empty() {
            run.set(ReplayState::Completed);
            info!(run = run.id, "Replay filter matched nothing, completed");
            if let Some(callback) = on_complete {
                callback(run.summary());
            }
            return Ok(0);
        }

        let delays = match scaled_delays(&events, options.speed) {
            Ok(delays) => delays,
            Err(e) => {
                run.set(ReplayState::Idle);
                return Err(e);
            }
        };
        let replay = ReplayRun {
            run: run.clone(),
            events,
            delays,
            looping: options.looping,
            loop_delay: options.loop_delay,
            restamp: options.restamp.then(|| self.assigner.clone()),
            sink,
            on_complete,
        };

        let mut task = relock(&self.task);
        if run.cancel.is_cancelled() {
            return Err(SimError::ReplaySuperseded);
        }
        run.set(ReplayState::Replaying);
        info!(run = run.id, total, speed = options.speed, looping = options.looping, "Replay started");
        *task = Some(runtime.spawn(replay.run()));
        Ok(total)
    }

    /// Cancel the next scheduled emission. Safe to call at any time.
    pub fn stop_replay(&self) {
        let run = self.current_run();
        if run.stop() {
            info!(run = run.id, emitted = run.emitted.load(Ordering::Relaxed), "Replay stopped");
        }
    }

    /// Stop and tear the replay task down without waiting for it to notice
    pub fn abort(&self) {
        self.stop_replay();
        if let Some(task) = relock(&self.task).take() {
            task.abort();
        }
    }

    /// Resolve once the current run is completed or stopped
    pub async fn wait_for_finish(&self) -> ReplayState {
        let run = self.current_run();
        let mut rx = run.state.subscribe();
        let finished = rx
            .wait_for(|s| s.is_finished() || *s == ReplayState::Idle)
            .await
            .map(|state| *state);
        finished.unwrap_or_else(|_| run.current())
    }
}

impl Default for ReplayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.current_run().cancel.cancel();
    }
}

/// Delay before each event relative to its predecessor, divided by `speed`.
/// The first event has no delay.
fn scaled_delays(events: &[Event], speed: f64) -> Result<Vec<Duration>> {
    let mut delays = Vec::with_capacity(events.len());
    let mut prev: Option<DateTime<Utc>> = None;
    for event in events {
        let gap = prev
            .map(|p| (event.timestamp - p).to_std().unwrap_or_default())
            .unwrap_or_default();
        let delay = Duration::try_from_secs_f64(gap.as_secs_f64() / speed)
            .map_err(|_| SimError::InvalidSpeed(speed))?;
        delays.push(delay);
        prev = Some(event.timestamp);
    }
    Ok(delays)
}

struct ReplayRun {
    run: Arc<RunState>,
    events: Vec<Event>,
    delays: Vec<Duration>,
    looping: bool,
    loop_delay: Duration,
    restamp: Option<Arc<TimestampAssigner>>,
    sink: Arc<dyn Sink>,
    on_complete: Option<CompletionCallback>,
}

impl ReplayRun {
    async fn run(self) {
        let cancel = self.run.cancel.clone();
        // Deadlines accumulate from the start so sink latency does not drift the schedule.
        let mut deadline = Instant::now();

        loop {
            for (i, event) in self.events.iter().enumerate() {
                deadline += self.delays[i];
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(run = self.run.id, index = i, "Replay cancelled");
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                let mut event = event.clone();
                if let Some(assigner) = &self.restamp {
                    event.timestamp = assigner.issue();
                }
                deliver(self.sink.as_ref(), event);
                self.run.emitted.fetch_add(1, Ordering::Relaxed);
                self.run.index.store(i + 1, Ordering::Relaxed);
                metrics::REPLAYED_EVENTS.inc();
            }

            if !self.looping {
                break;
            }
            let loops = self.run.loops.fetch_add(1, Ordering::Relaxed) + 1;
            self.run.index.store(0, Ordering::Relaxed);
            debug!(run = self.run.id, loops, "Replay looping");
            deadline = Instant::now() + self.loop_delay;
            if self.loop_delay.is_zero() {
                tokio::task::yield_now().await;
            }
        }

        if self
            .run
            .transition(&[ReplayState::Replaying], ReplayState::Completed)
        {
            let summary = self.run.summary();
            info!(run = self.run.id, emitted = summary.emitted, "Replay completed");
            if let Some(callback) = &self.on_complete {
                callback(summary);
            }
        }
    }
}
