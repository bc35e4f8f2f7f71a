//! Prometheus Metrics
//!
//! Process-wide counters registered with the default registry on first use.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid metric definition");
    // A second registration only happens if another crate claimed the name.
    let _ = prometheus::register(Box::new(c.clone()));
    c
}

pub static EVENTS_GENERATED: Lazy<IntCounter> =
    Lazy::new(|| counter("synthstream_events_generated_total", "Events generated by schedulers and pools"));

pub static EVENTS_DELIVERED: Lazy<IntCounter> =
    Lazy::new(|| counter("synthstream_events_delivered_total", "Events accepted by a sink"));

pub static SINK_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("synthstream_sink_failures_total", "Sink calls that returned an error or panicked"));

pub static TICK_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("synthstream_tick_failures_total", "Scheduler ticks skipped due to render errors"));

pub static BATCH_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("synthstream_batch_failures_total", "Worker batches dropped"));

pub static BUFFER_FLUSHES: Lazy<IntCounter> =
    Lazy::new(|| counter("synthstream_buffer_flushes_total", "Buffer flushes performed by worker pools"));

pub static REPLAYED_EVENTS: Lazy<IntCounter> =
    Lazy::new(|| counter("synthstream_replayed_events_total", "Events emitted by the replay engine"));

pub static BUFFERED_EVENTS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("synthstream_buffered_events", "Events currently held in pool buffers")
        .expect("valid metric definition");
    let _ = prometheus::register(Box::new(g.clone()));
    g
});

/// Text exposition of everything in the default registry
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
