use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use synthstream::replay::LoadedEvents;
use synthstream::{
    CollectingSink, Event, Level, NdjsonSource, ReplayEngine, ReplayFilter, ReplayOptions,
    ReplaySource, ReplayState, SimError, Sink, SinkError, SourceIdentity,
};
use tokio::time::Instant;

fn event(offset_ms: i64, level: Level, message: &str) -> Event {
    Event {
        timestamp: Utc.timestamp_millis_opt(1_714_564_800_000 + offset_ms).unwrap(),
        level,
        source: SourceIdentity::new("ids", "suricata", "sensor-2"),
        message: message.to_string(),
        metadata: Default::default(),
        technique: None,
        trace_id: String::new(),
    }
}

/// Source that takes a while to produce its events, like a large capture
struct SlowSource {
    delay: Duration,
    events: Vec<Event>,
}

#[async_trait]
impl ReplaySource for SlowSource {
    async fn load(&self) -> synthstream::Result<LoadedEvents> {
        tokio::time::sleep(self.delay).await;
        Ok(LoadedEvents {
            events: self.events.clone(),
            skipped: 0,
        })
    }
}

type Timeline = Arc<Mutex<Vec<(u128, String)>>>;

/// Records virtual milliseconds since creation along with each message
fn timeline_sink() -> (Arc<dyn Sink>, Timeline) {
    let origin = Instant::now();
    let timeline: Timeline = Arc::new(Mutex::new(Vec::new()));
    let out = timeline.clone();
    let sink = move |e: Event| -> Result<(), SinkError> {
        out.lock().unwrap().push((origin.elapsed().as_millis(), e.message));
        Ok(())
    };
    (Arc::new(sink), timeline)
}

#[tokio::test(start_paused = true)]
async fn test_original_spacing_at_normal_speed() {
    let engine = ReplayEngine::new();
    let (sink, timeline) = timeline_sink();
    let input = vec![
        event(0, Level::Info, "a"),
        event(500, Level::Warn, "b"),
        event(1_500, Level::Error, "c"),
    ];

    assert_eq!(engine.start_replay(&input, ReplayOptions::default(), sink).await.unwrap(), 3);
    assert_eq!(engine.wait_for_finish().await, ReplayState::Completed);

    let timeline = timeline.lock().unwrap().clone();
    let at: Vec<u128> = timeline.iter().map(|(t, _)| *t).collect();
    let order: Vec<&str> = timeline.iter().map(|(_, m)| m.as_str()).collect();
    assert_eq!(order, ["a", "b", "c"]);
    assert!(at[0] <= 5);
    assert!((495..=505).contains(&(at[1] - at[0])));
    assert!((1_495..=1_505).contains(&(at[2] - at[0])));
}

#[tokio::test(start_paused = true)]
async fn test_loop_stopped_after_five_emissions() {
    let engine = ReplayEngine::new();
    let sink = CollectingSink::new();
    let input = vec![event(0, Level::Info, "ping"), event(100, Level::Info, "pong")];

    engine
        .start_replay(&input, ReplayOptions::default().looping(true), Arc::new(sink.clone()))
        .await
        .unwrap();

    // Emissions at 0, 100, 100, 200, 200, 300, ... ms
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(sink.len(), 5);
    engine.stop_replay();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(sink.len(), 5);
    assert_eq!(engine.state(), ReplayState::Stopped);
    let msgs: Vec<_> = sink.events().into_iter().map(|e| e.message).collect();
    assert_eq!(msgs, ["ping", "pong", "ping", "pong", "ping"]);
    assert_eq!(engine.progress().loops, 2);
}

#[tokio::test(start_paused = true)]
async fn test_replay_is_deterministic() {
    let input: Vec<Event> = (0..20)
        .map(|i| event(i * 37 % 400 + i * 50, Level::Info, &format!("e{i}")))
        .collect();

    let mut runs = Vec::new();
    for _ in 0..2 {
        let engine = ReplayEngine::new();
        let (sink, timeline) = timeline_sink();
        engine
            .start_replay(&input, ReplayOptions::default().speed(3.0), sink)
            .await
            .unwrap();
        engine.wait_for_finish().await;
        let timeline = timeline.lock().unwrap().clone();
        runs.push(timeline);
    }
    assert_eq!(runs[0].len(), 20);
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test(start_paused = true)]
async fn test_level_filter_keeps_order() {
    let levels = [Level::Info, Level::Error, Level::Warn, Level::Error, Level::Debug];
    let input: Vec<Event> = (0..100)
        .map(|i| event(i * 10, levels[i as usize % levels.len()], &format!("m{i}")))
        .collect();

    let engine = ReplayEngine::new();
    let sink = CollectingSink::new();
    let options = ReplayOptions::default()
        .speed(100.0)
        .filter(ReplayFilter::default().levels([Level::Error]));
    let scheduled = engine
        .start_replay(&input, options, Arc::new(sink.clone()))
        .await
        .unwrap();
    engine.wait_for_finish().await;

    let expected: Vec<String> = input
        .iter()
        .filter(|e| e.level == Level::Error)
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(scheduled, 40);
    let got: Vec<String> = sink.events().into_iter().map(|e| e.message).collect();
    assert_eq!(got, expected);
}

#[tokio::test(start_paused = true)]
async fn test_completion_callback_fires_once() {
    let engine = ReplayEngine::new();
    let completions = Arc::new(AtomicU64::new(0));
    let counter = completions.clone();
    engine.on_complete(move |summary| {
        assert_eq!(summary.emitted, 2);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let input = vec![event(0, Level::Info, "a"), event(10, Level::Info, "b")];
    engine
        .start_replay(&input, ReplayOptions::default(), Arc::new(CollectingSink::new()))
        .await
        .unwrap();
    engine.wait_for_finish().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(completions.load(Ordering::SeqCst), 1);
    let progress = engine.progress();
    assert!(!progress.isReplaying);
    assert_eq!(progress.currentIndex, 2);
}

#[tokio::test]
async fn test_ndjson_file_source() {
    let path = std::env::temp_dir().join(format!("synthstream-replay-{}.ndjson", std::process::id()));
    let mut body = String::new();
    for e in [event(200, Level::Error, "second"), event(0, Level::Info, "first")] {
        body.push_str(&serde_json::to_string(&e).unwrap());
        body.push('\n');
    }
    body.push_str("{\"truncated\": \n");
    std::fs::write(&path, body).unwrap();

    let engine = ReplayEngine::new();
    let sink = CollectingSink::new();
    let scheduled = engine
        .start_replay(
            &NdjsonSource::new(&path),
            ReplayOptions::default().speed(50.0),
            Arc::new(sink.clone()),
        )
        .await
        .unwrap();
    engine.wait_for_finish().await;
    std::fs::remove_file(&path).ok();

    assert_eq!(scheduled, 2);
    let msgs: Vec<_> = sink.events().into_iter().map(|e| e.message).collect();
    assert_eq!(msgs, ["first", "second"]);
}

#[tokio::test]
async fn test_missing_or_unusable_input() {
    let engine = ReplayEngine::new();
    let sink: Arc<dyn Sink> = Arc::new(CollectingSink::new());

    let missing = engine
        .start_replay(&NdjsonSource::new("/nonexistent/replay.ndjson"), ReplayOptions::default(), sink.clone())
        .await;
    assert!(matches!(missing, Err(SimError::Io(_))));

    let path = std::env::temp_dir().join(format!("synthstream-garbage-{}.ndjson", std::process::id()));
    std::fs::write(&path, "not json\nalso not json\n").unwrap();
    let garbage = engine
        .start_replay(&NdjsonSource::new(&path), ReplayOptions::default(), sink)
        .await;
    std::fs::remove_file(&path).ok();
    assert!(matches!(garbage, Err(SimError::NothingToReplay { skipped: 2 })));
    assert_eq!(engine.state(), ReplayState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_start_during_load_supersedes_it() {
    let engine = Arc::new(ReplayEngine::new());
    let stale = CollectingSink::new();
    let first = {
        let engine = engine.clone();
        let sink = stale.clone();
        tokio::spawn(async move {
            let source = SlowSource {
                delay: Duration::from_secs(5),
                events: vec![event(0, Level::Info, "old")],
            };
            engine
                .start_replay(&source, ReplayOptions::default(), Arc::new(sink))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.state(), ReplayState::Loading);

    let fresh = CollectingSink::new();
    let input = vec![event(0, Level::Info, "new"), event(100, Level::Info, "newer")];
    let scheduled = engine
        .start_replay(&input, ReplayOptions::default(), Arc::new(fresh.clone()))
        .await
        .unwrap();
    assert_eq!(scheduled, 2);

    assert!(matches!(first.await.unwrap(), Err(SimError::ReplaySuperseded)));
    assert_eq!(engine.wait_for_finish().await, ReplayState::Completed);
    assert!(stale.is_empty());
    let msgs: Vec<_> = fresh.events().into_iter().map(|e| e.message).collect();
    assert_eq!(msgs, ["new", "newer"]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_load_never_replays() {
    let engine = Arc::new(ReplayEngine::new());
    let sink = CollectingSink::new();
    let pending = {
        let engine = engine.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let source = SlowSource {
                delay: Duration::from_secs(5),
                events: vec![event(0, Level::Info, "late")],
            };
            engine
                .start_replay(&source, ReplayOptions::default(), Arc::new(sink))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.stop_replay();
    assert_eq!(engine.state(), ReplayState::Stopped);

    assert!(matches!(pending.await.unwrap(), Err(SimError::ReplaySuperseded)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(sink.is_empty());
    assert_eq!(engine.state(), ReplayState::Stopped);
}
