//! # synthstream - Synthetic Event Stream Engine
//!
//! Generates realistic, continuously timestamped event streams from weighted
//! message templates, and replays recorded streams with their original
//! relative timing. Built for exercising monitoring and detection pipelines.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        GenerationManager                         │
//! │                                                                  │
//! │   ┌──────────────────┐        ┌─────────────────────────────┐    │
//! │   │ SourceScheduler  │  ...   │      BatchWorkerPool        │    │
//! │   │ (1 event / tick) │        │ (N events / tick, threads)  │    │
//! │   └────────┬─────────┘        └──────────────┬──────────────┘    │
//! │            │                                 │                   │
//! │            ▼                                 ▼                   │
//! │   ┌─────────────────┐            ┌────────────────────────┐      │
//! │   │  EventFactory   │            │  TimestampAssigner     │      │
//! │   │ templates +     │            │  (one per manager,     │      │
//! │   │ metadata layers │            │   unique timestamps)   │      │
//! │   └─────────────────┘            └────────────────────────┘      │
//! │                                                                  │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 ▼
//!                         Sink (stdout, HTTP, ...)
//!                                 ▲
//!                         ┌───────┴────────┐
//!                         │  ReplayEngine  │ ◄── NDJSON / Vec<Event>
//!                         └────────────────┘
//! ```
//!
//! ## Key Design Principles
//!
//! 1. **Explicit timeline** - every emitter shares one `Arc<TimestampAssigner>`;
//!    no two events ever carry the same timestamp.
//!
//! 2. **Fail open at runtime, fail fast at start** - bad configuration is
//!    rejected by `start`; a failing tick, batch or sink call is logged and
//!    skipped.
//!
//! 3. **Bounded memory** - batch pools flush at a high-water mark and pause
//!    generation while the sink catches up.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod forward;
pub mod generator;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod replay;
pub mod scheduler;
pub mod sink;
pub mod template;
pub mod timestamp;

pub use config::{GeneratorConfig, SourceConfig};
pub use core::{Event, Level, Metadata, SourceIdentity, Technique};
pub use error::{Result, SimError};
pub use generator::{EventFactory, SourceProfile};
pub use manager::GenerationManager;
pub use pool::{BatchPlan, BatchWorkerPool, BufferStats, PoolConfig, plan_batch};
pub use replay::{
    NdjsonSource, ReplayEngine, ReplayFilter, ReplayOptions, ReplayProgress, ReplaySource,
    ReplayState, ReplaySummary,
};
pub use scheduler::{ScheduleConfig, SourceScheduler};
pub use sink::{BatchRejected, CollectingSink, JsonLinesSink, Sink, SinkError};
pub use template::{KeywordTechniques, Template, TechniqueLookup, TechniqueRule};
pub use timestamp::TimestampAssigner;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
