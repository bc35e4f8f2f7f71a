//! synthstream - synthetic event stream generator
//!
//! Usage:
//!   synthstream generate --config sources.json --duration 5m
//!   synthstream generate --config sources.json --listen 127.0.0.1:9100
//!   synthstream replay --input capture.ndjson --speed 10 --level ERROR,WARN
//!   synthstream replay --input capture.ndjson --loop --restamp

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use synthstream::api::{self, ApiState};
use synthstream::forward::{ForwarderConfig, ForwardingSink};
use synthstream::{
    GenerationManager, GeneratorConfig, JsonLinesSink, Level, NdjsonSource, ReplayEngine,
    ReplayFilter, ReplayOptions, Sink,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "synthstream")]
#[command(about = "Synthetic event stream generation and historical replay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate events from a source configuration
    Generate {
        /// JSON generator configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Run time (e.g. 30s, 5m, 1h); runs until Ctrl+C when omitted
        #[arg(short, long, value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Serve the status API on this address
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Replay a recorded NDJSON event stream
    Replay {
        /// Newline-delimited JSON events
        #[arg(short, long)]
        input: PathBuf,

        /// Time compression factor
        #[arg(short, long, default_value = "1.0")]
        speed: f64,

        /// Start over after the last event
        #[arg(long = "loop")]
        looping: bool,

        /// Pause between passes when looping (e.g. 500ms, 2s)
        #[arg(long, value_parser = parse_duration, default_value = "0s")]
        loop_delay: Duration,

        /// Only replay these levels (comma-separated)
        #[arg(long, value_delimiter = ',', value_parser = parse_level)]
        level: Vec<Level>,

        /// Only replay these source types (comma-separated)
        #[arg(long, value_delimiter = ',')]
        source_type: Vec<String>,

        /// Inclusive RFC 3339 lower bound
        #[arg(long, value_parser = parse_time)]
        from: Option<DateTime<Utc>>,

        /// Inclusive RFC 3339 upper bound
        #[arg(long, value_parser = parse_time)]
        to: Option<DateTime<Utc>>,

        /// Replace recorded timestamps with fresh ones
        #[arg(long)]
        restamp: bool,

        /// Serve the status API on this address
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries events; diagnostics go to stderr
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Generate {
            config,
            duration,
            listen,
        } => run_generate(config, duration, listen).await,
        Commands::Replay {
            input,
            speed,
            looping,
            loop_delay,
            level,
            source_type,
            from,
            to,
            restamp,
            listen,
        } => {
            let mut filter = ReplayFilter::default().between(from, to);
            if !level.is_empty() {
                filter = filter.levels(level);
            }
            if !source_type.is_empty() {
                filter = filter.source_types(source_type);
            }
            let options = ReplayOptions {
                filter,
                speed,
                looping,
                loop_delay,
                restamp,
            };
            run_replay(input, options, listen).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "synthstream failed");
            ExitCode::FAILURE
        }
    }
}

/// Where events go
enum Output {
    Stdout(Arc<JsonLinesSink>),
    Forward(Arc<ForwardingSink>),
}

impl Output {
    fn from_config(forward: Option<ForwarderConfig>) -> synthstream::Result<Self> {
        Ok(match forward {
            Some(config) => {
                info!(url = %config.url, "Forwarding events over HTTP");
                Output::Forward(Arc::new(ForwardingSink::new(config)?))
            }
            None => Output::Stdout(Arc::new(JsonLinesSink::stdout())),
        })
    }

    fn sink(&self) -> Arc<dyn Sink> {
        match self {
            Output::Stdout(sink) => sink.clone(),
            Output::Forward(sink) => sink.clone(),
        }
    }

    async fn finish(&self) {
        match self {
            Output::Stdout(sink) => {
                if let Err(e) = sink.flush() {
                    warn!(error = %e, "Failed to flush stdout");
                }
            }
            Output::Forward(sink) => {
                sink.close().await;
                let stats = sink.stats();
                info!(
                    sent = stats.sent.load(std::sync::atomic::Ordering::Relaxed),
                    dropped = stats.dropped.load(std::sync::atomic::Ordering::Relaxed),
                    failed = stats.failed.load(std::sync::atomic::Ordering::Relaxed),
                    "Forwarder drained"
                );
            }
        }
    }
}

fn spawn_api(listen: Option<SocketAddr>, state: ApiState, shutdown: &CancellationToken) {
    if let Some(addr) = listen {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, shutdown).await {
                error!(error = %e, "Status API failed");
            }
        });
    }
}

async fn wait_for(duration: Option<Duration>) {
    match duration {
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Failed to listen for Ctrl+C");
            }
        }
    }
}

async fn run_generate(
    config: PathBuf,
    duration: Option<Duration>,
    listen: Option<SocketAddr>,
) -> synthstream::Result<()> {
    let config = GeneratorConfig::from_path(&config)?;
    let output = Output::from_config(config.forward.clone())?;
    let mut manager = GenerationManager::from_config(&config)?;

    manager.start(output.sink()).await?;
    let shutdown = CancellationToken::new();
    spawn_api(
        listen,
        ApiState {
            buffers: manager.buffer_probes(),
            replay: None,
        },
        &shutdown,
    );
    info!(sources = config.sources.len(), "Generation running");

    wait_for(duration).await;

    let stopped = manager.stop().await;
    shutdown.cancel();
    for (name, stats) in manager.scheduler_stats() {
        info!(source = %name, ticks = stats.ticks, emitted = stats.emitted, failed = stats.failed, "Source summary");
    }
    output.finish().await;
    let flushed = stopped?;
    info!(flushed, "Generation complete");
    Ok(())
}

async fn run_replay(
    input: PathBuf,
    options: ReplayOptions,
    listen: Option<SocketAddr>,
) -> synthstream::Result<()> {
    let output = Output::Stdout(Arc::new(JsonLinesSink::stdout()));
    let engine = Arc::new(ReplayEngine::new());
    let shutdown = CancellationToken::new();
    spawn_api(
        listen,
        ApiState {
            buffers: Vec::new(),
            replay: Some(engine.clone()),
        },
        &shutdown,
    );

    let scheduled = engine
        .start_replay(&NdjsonSource::new(&input), options, output.sink())
        .await?;
    info!(input = %input.display(), scheduled, "Replay running");

    tokio::select! {
        state = engine.wait_for_finish() => info!(?state, "Replay finished"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            engine.stop_replay();
        }
    }

    let progress = engine.progress();
    info!(index = progress.currentIndex, total = progress.totalLogs, loops = progress.loops, "Replay summary");
    shutdown.cancel();
    output.finish().await;
    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        (s, 1_000)
    };
    let n = digits
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid duration `{s}` (expected e.g. 500ms, 30s, 5m, 1h)"))?;
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration `{s}` is too large"))
}

fn parse_level(s: &str) -> Result<Level, String> {
    Level::parse(s).ok_or_else(|| format!("unknown level `{s}`"))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp `{s}`: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert_eq!(
            parse_duration("99999999999999999h"),
            Err("duration `99999999999999999h` is too large".to_string())
        );
        assert!(parse_duration("18446744073709551615s").is_err());
        assert_eq!(
            parse_duration("18446744073709551615ms"),
            Ok(Duration::from_millis(u64::MAX))
        );
    }

    #[test]
    fn test_replay_args() {
        let cli = Cli::try_parse_from([
            "synthstream",
            "replay",
            "--input",
            "capture.ndjson",
            "--speed",
            "4",
            "--loop",
            "--level",
            "error,WARN",
            "--from",
            "2024-01-01T00:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Replay {
                speed,
                looping,
                level,
                from,
                ..
            } => {
                assert_eq!(speed, 4.0);
                assert!(looping);
                assert_eq!(level, vec![Level::Error, Level::Warn]);
                assert!(from.is_some());
            }
            Commands::Generate { .. } => panic!("expected replay"),
        }
    }
}
