//! HTTP Forwarding Sink
//!
//! Ships events to a collector over HTTP. Bounded async forwarding with
//! batching, retry and drop counting: `emit` never blocks the emitter, a
//! full queue drops the event and counts it.

use crate::core::Event;
use crate::error::{Result, SimError};
use crate::sink::{BatchRejected, Sink, SinkError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_COLLECTOR_URL: &str = "http://localhost:3000/ingest";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub url: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub channel_capacity: usize,
    pub timeout_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_COLLECTOR_URL.to_string(),
            batch_size: 500,
            flush_interval_ms: 1000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            channel_capacity: 10_000,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub batches: AtomicU64,
}

#[derive(Serialize)]
struct EventBatch<'a> {
    events: &'a [Event],
}

/// Sink that batches events and POSTs them as JSON
pub struct ForwardingSink {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ForwarderStats>,
}

impl ForwardingSink {
    /// Spawn the forwarding task on the current runtime
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        if config.batch_size == 0 || config.channel_capacity == 0 {
            return Err(SimError::InvalidConfig(
                "forwarder batch_size and channel_capacity must be > 0".into(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SimError::NoRuntime("forwarder".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(10)
            .build()?;

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let stats = Arc::new(ForwarderStats::default());
        let worker = runtime.spawn(forward_loop(client, rx, config, stats.clone()));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            stats,
        })
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }

    /// Stop accepting events and wait for the queue to drain
    pub async fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Sink for ForwardingSink {
    fn emit(&self, event: Event) -> std::result::Result<(), SinkError> {
        let Some(tx) = self.sender() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err("forwarder closed".into());
        };
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err("forwarder queue full".into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err("forwarder closed".into())
            }
        }
    }

    /// Queues what fits and drops the rest, so later events still get a
    /// chance when the queue frees up mid-batch.
    fn emit_batch(&self, events: Vec<Event>) -> std::result::Result<(), BatchRejected> {
        let total = events.len();
        let mut dropped = 0;
        for event in events {
            if self.emit(event).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            return Err(BatchRejected::new(
                total - dropped,
                format!("forwarder dropped {dropped} of {total} events"),
            ));
        }
        Ok(())
    }
}

async fn forward_loop(
    client: reqwest::Client,
    mut rx: mpsc::Receiver<Event>,
    config: ForwarderConfig,
    stats: Arc<ForwarderStats>,
) {
    let mut batch: Vec<Event> = Vec::with_capacity(config.batch_size);
    let mut interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));

    info!(url = %config.url, "Forwarder started");

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(event) = received else { break };
                batch.push(event);
                if batch.len() >= config.batch_size {
                    flush_batch(&client, &mut batch, &config, &stats).await;
                }
            }
            _ = interval.tick() => {
                if !batch.is_empty() {
                    flush_batch(&client, &mut batch, &config, &stats).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        flush_batch(&client, &mut batch, &config, &stats).await;
    }

    info!(sent = stats.sent.load(Ordering::Relaxed), "Forwarder stopped");
}

async fn flush_batch(
    client: &reqwest::Client,
    batch: &mut Vec<Event>,
    config: &ForwarderConfig,
    stats: &ForwarderStats,
) {
    let events = std::mem::take(batch);
    let count = events.len();
    let payload = EventBatch { events: &events };

    for attempt in 0..=config.max_retries {
        match client.post(&config.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                stats.sent.fetch_add(count as u64, Ordering::Relaxed);
                stats.batches.fetch_add(1, Ordering::Relaxed);
                debug!(count, "Forwarded events");
                return;
            }
            Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                warn!(attempt, status = %response.status(), "Collector rate limited");
            }
            Ok(response) => {
                warn!(attempt, status = %response.status(), "Collector returned error");
            }
            Err(e) => {
                warn!(attempt, error = %e, "Failed to forward events");
            }
        }

        if attempt < config.max_retries {
            stats.retried.fetch_add(1, Ordering::Relaxed);
            let delay = config.retry_base_delay_ms * (1 << attempt);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    stats.failed.fetch_add(count as u64, Ordering::Relaxed);
    error!(count, "Dropped events after max retries");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Level, SourceIdentity};
    use crate::sink::deliver_batch;
    use chrono::Utc;

    fn event() -> Event {
        Event {
            timestamp: Utc::now(),
            level: Level::Info,
            source: SourceIdentity::new("app", "api", "h1"),
            message: "hello".into(),
            metadata: Default::default(),
            technique: None,
            trace_id: String::new(),
        }
    }

    fn unreachable_config() -> ForwarderConfig {
        ForwarderConfig {
            // Discard port; nothing listens there in CI
            url: "http://127.0.0.1:9/ingest".into(),
            batch_size: 10,
            flush_interval_ms: 10,
            max_retries: 0,
            retry_base_delay_ms: 1,
            channel_capacity: 2,
            timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let sink = ForwardingSink::new(unreachable_config()).unwrap();
        // The worker has not been polled yet on this single-threaded runtime.
        assert!(sink.emit(event()).is_ok());
        assert!(sink.emit(event()).is_ok());
        assert!(sink.emit(event()).is_err());
        assert_eq!(sink.stats().dropped.load(Ordering::Relaxed), 1);
        sink.close().await;
    }

    #[tokio::test]
    async fn test_overflowing_batch_reports_queued_count() {
        let sink = ForwardingSink::new(unreachable_config()).unwrap();
        let err = sink.emit_batch(vec![event(), event(), event()]).unwrap_err();
        assert_eq!(err.accepted, 2);
        assert_eq!(sink.stats().dropped.load(Ordering::Relaxed), 1);
        // Queue is still full, nothing more fits
        assert_eq!(deliver_batch(&sink, vec![event()]), 0);
        sink.close().await;
    }

    #[tokio::test]
    async fn test_failed_delivery_is_counted_after_retries() {
        let sink = ForwardingSink::new(unreachable_config()).unwrap();
        sink.emit_batch(vec![event(), event()]).unwrap();
        sink.close().await;

        assert_eq!(sink.stats().failed.load(Ordering::Relaxed), 2);
        assert_eq!(sink.stats().sent.load(Ordering::Relaxed), 0);
        assert!(sink.emit(event()).is_err());
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            ForwardingSink::new(ForwarderConfig::default()),
            Err(SimError::NoRuntime(_))
        ));
    }
}
