//! Generation Manager
//!
//! Owns the shared timestamp assigner and event factory, and the set of
//! emitters built from a `GeneratorConfig`: one `SourceScheduler` per
//! regular source and one `BatchWorkerPool` per batch source. Pools are
//! created at `start` because they hold the sink.

use crate::config::GeneratorConfig;
use crate::core::Metadata;
use crate::error::{Result, SimError};
use crate::generator::{EventFactory, SourceProfile};
use crate::pool::{BatchWorkerPool, BufferProbe, BufferStats, PoolConfig};
use crate::scheduler::{ScheduleConfig, SchedulerSnapshot, SourceScheduler};
use crate::sink::Sink;
use crate::template::{KeywordTechniques, NoTechniques, TechniqueLookup};
use crate::timestamp::TimestampAssigner;
use std::sync::Arc;
use tracing::{info, warn};

struct BatchSpec {
    profile: SourceProfile,
    target_per_minute: f64,
    config: PoolConfig,
}

pub struct GenerationManager {
    assigner: Arc<TimestampAssigner>,
    factory: Arc<EventFactory>,
    schedulers: Vec<SourceScheduler>,
    batch_specs: Vec<BatchSpec>,
    pools: Vec<BatchWorkerPool>,
    running: bool,
}

impl GenerationManager {
    pub fn new(metadata: Metadata, techniques: Arc<dyn TechniqueLookup>) -> Self {
        Self::with_assigner(metadata, techniques, TimestampAssigner::shared())
    }

    pub fn with_assigner(
        metadata: Metadata,
        techniques: Arc<dyn TechniqueLookup>,
        assigner: Arc<TimestampAssigner>,
    ) -> Self {
        Self {
            assigner,
            factory: Arc::new(EventFactory::new(metadata, techniques)),
            schedulers: Vec::new(),
            batch_specs: Vec::new(),
            pools: Vec::new(),
            running: false,
        }
    }

    /// Validate the configuration and build every emitter it describes
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let techniques: Arc<dyn TechniqueLookup> = if config.techniques.is_empty() {
            Arc::new(NoTechniques)
        } else {
            Arc::new(KeywordTechniques::new(config.techniques.iter().cloned()))
        };

        let mut manager = Self::new(config.metadata.clone(), techniques);
        for source in &config.sources {
            match &source.batch {
                Some(_) if !source.enabled => {
                    info!(source = %source.name, "Batch source disabled, skipping");
                }
                Some(batch) => manager.add_batch(source.profile(), source.frequency, batch.clone()),
                None => manager.add_scheduled(source.profile(), source.schedule()),
            }
        }
        info!(
            scheduled = manager.schedulers.len(),
            batch = manager.batch_specs.len(),
            "Generation manager configured"
        );
        Ok(manager)
    }

    pub fn add_scheduled(&mut self, profile: SourceProfile, schedule: ScheduleConfig) {
        self.schedulers.push(SourceScheduler::new(
            profile,
            schedule,
            self.factory.clone(),
            self.assigner.clone(),
        ));
    }

    pub fn add_batch(&mut self, profile: SourceProfile, target_per_minute: f64, config: PoolConfig) {
        self.batch_specs.push(BatchSpec {
            profile,
            target_per_minute,
            config,
        });
    }

    pub fn assigner(&self) -> Arc<TimestampAssigner> {
        self.assigner.clone()
    }

    pub fn factory(&self) -> Arc<EventFactory> {
        self.factory.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start every emitter. If any of them rejects its configuration, the
    /// ones already started are stopped again before the error is returned.
    pub async fn start(&mut self, sink: Arc<dyn Sink>) -> Result<()> {
        if self.running {
            return Err(SimError::AlreadyRunning("generation manager".into()));
        }
        if let Err(e) = self.start_all(sink) {
            warn!(error = %e, "Start aborted, rolling back");
            if let Err(rollback) = self.stop_all().await {
                warn!(error = %rollback, "Rollback reported an error");
            }
            return Err(e);
        }
        self.running = true;
        Ok(())
    }

    fn start_all(&mut self, sink: Arc<dyn Sink>) -> Result<()> {
        for scheduler in &mut self.schedulers {
            scheduler.start(sink.clone())?;
        }
        for spec in &self.batch_specs {
            let mut pool = BatchWorkerPool::new(
                spec.profile.clone(),
                spec.target_per_minute,
                spec.config.clone(),
                self.factory.clone(),
                self.assigner.clone(),
                sink.clone(),
            );
            pool.start()?;
            self.pools.push(pool);
        }
        Ok(())
    }

    /// Stop every emitter. Returns the events delivered by the pools' final
    /// flushes, or the first pool failure once everything is stopped.
    pub async fn stop(&mut self) -> Result<usize> {
        self.running = false;
        let result = self.stop_all().await;
        info!("Generation manager stopped");
        result
    }

    async fn stop_all(&mut self) -> Result<usize> {
        for scheduler in &mut self.schedulers {
            scheduler.shutdown().await;
        }

        let mut flushed = 0;
        let mut failure = None;
        for mut pool in self.pools.drain(..) {
            match pool.stop().await {
                Ok(n) => flushed += n,
                Err(e) => {
                    warn!(source = %pool.name(), error = %e, "Pool stopped with failure");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    pub fn scheduler_stats(&self) -> Vec<(String, SchedulerSnapshot)> {
        self.schedulers
            .iter()
            .map(|s| (s.name().to_string(), s.stats()))
            .collect()
    }

    pub fn buffer_stats(&self) -> Vec<(String, BufferStats)> {
        self.pools
            .iter()
            .map(|p| (p.name().to_string(), p.buffer_stats()))
            .collect()
    }

    /// Buffer handles for the status API, valid once started
    pub fn buffer_probes(&self) -> Vec<BufferProbe> {
        self.pools.iter().map(|p| p.probe()).collect()
    }
}
