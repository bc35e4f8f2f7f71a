//! Event Sinks
//!
//! A sink is the downstream consumer of emitted events. Schedulers, pools
//! and the replay engine all deliver through `deliver`/`deliver_batch`,
//! which contain sink errors and panics so they never reach a timer task.

use crate::core::Event;
use crate::metrics;
use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// A batch the sink took only part of
#[derive(Debug, thiserror::Error)]
#[error("sink accepted {accepted} events of the batch, then failed: {source}")]
pub struct BatchRejected {
    /// Events delivered before the failure
    pub accepted: usize,
    pub source: SinkError,
}

impl BatchRejected {
    pub fn new(accepted: usize, source: impl Into<SinkError>) -> Self {
        Self {
            accepted,
            source: source.into(),
        }
    }
}

/// Downstream consumer of events
pub trait Sink: Send + Sync {
    fn emit(&self, event: Event) -> Result<(), SinkError>;

    /// Deliver a sub-batch. Defaults to one `emit` per event, stopping at
    /// the first failure.
    fn emit_batch(&self, events: Vec<Event>) -> Result<(), BatchRejected> {
        for (accepted, event) in events.into_iter().enumerate() {
            self.emit(event).map_err(|e| BatchRejected::new(accepted, e))?;
        }
        Ok(())
    }
}

impl<F> Sink for F
where
    F: Fn(Event) -> Result<(), SinkError> + Send + Sync,
{
    fn emit(&self, event: Event) -> Result<(), SinkError> {
        self(event)
    }
}

/// Hand one event to a sink, containing errors and panics. Returns whether
/// the sink accepted it.
pub fn deliver(sink: &dyn Sink, event: Event) -> bool {
    match catch_unwind(AssertUnwindSafe(|| sink.emit(event))) {
        Ok(Ok(())) => {
            metrics::EVENTS_DELIVERED.inc();
            true
        }
        Ok(Err(e)) => {
            metrics::SINK_FAILURES.inc();
            warn!(error = %e, "Sink rejected event");
            false
        }
        Err(_) => {
            metrics::SINK_FAILURES.inc();
            warn!("Sink panicked while handling event");
            false
        }
    }
}

/// Hand a sub-batch to a sink. Returns the number of events accepted,
/// including those taken before a partial failure.
pub fn deliver_batch(sink: &dyn Sink, events: Vec<Event>) -> usize {
    let count = events.len();
    match catch_unwind(AssertUnwindSafe(|| sink.emit_batch(events))) {
        Ok(Ok(())) => {
            metrics::EVENTS_DELIVERED.inc_by(count as u64);
            count
        }
        Ok(Err(rejected)) => {
            metrics::EVENTS_DELIVERED.inc_by(rejected.accepted as u64);
            metrics::SINK_FAILURES.inc();
            warn!(count, accepted = rejected.accepted, error = %rejected.source, "Sink rejected batch");
            rejected.accepted
        }
        Err(_) => {
            metrics::SINK_FAILURES.inc();
            warn!(count, "Sink panicked while handling batch");
            0
        }
    }
}

// ============================================================================
// Built-in sinks
// ============================================================================

/// Keeps every event in memory
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<Event>>>,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sizes of the batches received through `emit_batch`
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
        if let Ok(mut batches) = self.batches.lock() {
            batches.clear();
        }
    }
}

impl Sink for CollectingSink {
    fn emit(&self, event: Event) -> Result<(), SinkError> {
        self.events
            .lock()
            .map_err(|_| "collecting sink poisoned")?
            .push(event);
        Ok(())
    }

    fn emit_batch(&self, events: Vec<Event>) -> Result<(), BatchRejected> {
        let count = events.len();
        self.events
            .lock()
            .map_err(|_| BatchRejected::new(0, "collecting sink poisoned"))?
            .extend(events);
        self.batches
            .lock()
            .map_err(|_| BatchRejected::new(count, "collecting sink poisoned"))?
            .push(count);
        Ok(())
    }
}

/// Writes one JSON document per line
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::BufWriter::with_capacity(128 * 1024, io::stdout()))
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.writer.lock() {
            Ok(mut w) => w.flush(),
            Err(_) => Err(io::Error::other("json lines writer poisoned")),
        }
    }
}

impl Sink for JsonLinesSink {
    fn emit(&self, event: Event) -> Result<(), SinkError> {
        let line = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().map_err(|_| "json lines writer poisoned")?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn emit_batch(&self, events: Vec<Event>) -> Result<(), BatchRejected> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| BatchRejected::new(0, "json lines writer poisoned"))?;
        for (written, event) in events.iter().enumerate() {
            let mut line = serde_json::to_vec(event).map_err(|e| BatchRejected::new(written, e))?;
            line.push(b'\n');
            writer.write_all(&line).map_err(|e| BatchRejected::new(written, e))?;
        }
        Ok(())
    }
}
