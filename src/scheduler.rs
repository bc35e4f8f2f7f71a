//! Per-Source Rate Scheduler
//!
//! Converts a configured frequency (events per minute) into a periodic
//! tokio task that emits one event per tick. Each tick is synchronous:
//! select a template, render it, take a timestamp, hand the event to the
//! sink. A failing tick is logged and skipped; the loop keeps going until
//! its cancellation token fires.

use crate::error::{Result, SimError};
use crate::generator::{EventFactory, SourceProfile};
use crate::metrics;
use crate::sink::{Sink, deliver};
use crate::timestamp::TimestampAssigner;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rate configuration for a scheduled source
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Events per minute
    pub frequency: f64,
    /// Fixed RNG seed for reproducible template selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    pub fn per_minute(frequency: f64) -> Self {
        Self {
            enabled: true,
            frequency,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Tick interval = 60000 / frequency milliseconds
    pub fn tick_interval(&self, source_name: &str) -> Result<Duration> {
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(SimError::InvalidFrequency {
                source_name: source_name.to_string(),
                frequency: self.frequency,
            });
        }
        Duration::try_from_secs_f64(60.0 / self.frequency).map_err(|_| {
            SimError::InvalidFrequency {
                source_name: source_name.to_string(),
                frequency: self.frequency,
            }
        })
    }
}

/// Counters for one scheduler
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub ticks: AtomicU64,
    pub emitted: AtomicU64,
    pub failed: AtomicU64,
}

/// Point-in-time copy of `SchedulerStats`
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub ticks: u64,
    pub emitted: u64,
    pub failed: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Periodic generator for one source
pub struct SourceScheduler {
    profile: Arc<SourceProfile>,
    schedule: ScheduleConfig,
    factory: Arc<EventFactory>,
    assigner: Arc<TimestampAssigner>,
    stats: Arc<SchedulerStats>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl SourceScheduler {
    pub fn new(
        profile: SourceProfile,
        schedule: ScheduleConfig,
        factory: Arc<EventFactory>,
        assigner: Arc<TimestampAssigner>,
    ) -> Self {
        Self {
            profile: Arc::new(profile),
            schedule,
            factory,
            assigner,
            stats: Arc::new(SchedulerStats::default()),
            cancel: None,
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        self.profile.name()
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    pub fn stats(&self) -> SchedulerSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start ticking into `sink`.
    ///
    /// Configuration is validated here, not at the first tick. A disabled
    /// source is accepted without validation and simply never ticks.
    pub fn start(&mut self, sink: Arc<dyn Sink>) -> Result<()> {
        let name = self.profile.name().to_string();
        if !self.schedule.enabled {
            info!(source = %name, "Source disabled, not scheduling");
            return Ok(());
        }
        let interval = self.schedule.tick_interval(&name)?;
        self.profile.validate()?;

        if self.is_running() {
            return Err(SimError::AlreadyRunning(name));
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SimError::NoRuntime(name.clone()))?;

        let cancel = CancellationToken::new();
        let ticker = TickLoop {
            profile: self.profile.clone(),
            factory: self.factory.clone(),
            assigner: self.assigner.clone(),
            stats: self.stats.clone(),
            sink,
            rng: match self.schedule.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
        };

        info!(
            source = %name,
            frequency = self.schedule.frequency,
            interval_ms = interval.as_millis() as u64,
            "Source scheduler started"
        );
        self.task = Some(runtime.spawn(ticker.run(interval, cancel.clone())));
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Cancel future ticks and detach the tick task. A tick already
    /// executing may still emit. The scheduler can be started again
    /// right away.
    pub fn stop(&mut self) {
        self.cancel_ticks();
        self.task = None;
    }

    /// Stop and wait for the tick task to exit
    pub async fn shutdown(&mut self) {
        self.cancel_ticks();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn cancel_ticks(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            info!(source = %self.profile.name(), "Source scheduler stopped");
        }
    }
}

impl Drop for SourceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TickLoop {
    profile: Arc<SourceProfile>,
    factory: Arc<EventFactory>,
    assigner: Arc<TimestampAssigner>,
    stats: Arc<SchedulerStats>,
    sink: Arc<dyn Sink>,
    rng: StdRng,
}

impl TickLoop {
    async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        // First event lands one interval after start, so N intervals yield N events.
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(),
            }
        }
        debug!(source = %self.profile.name(), "Tick loop exited");
    }

    fn tick(&mut self) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let rng = &mut self.rng;
        let draft = match self.factory.compose(&self.profile, &mut || rng.random::<f64>()) {
            Ok(draft) => draft,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::TICK_FAILURES.inc();
                warn!(source = %self.profile.name(), error = %e, "Tick skipped");
                return;
            }
        };

        let event = draft.stamp(self.assigner.issue());
        metrics::EVENTS_GENERATED.inc();
        if deliver(self.sink.as_ref(), event) {
            self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
