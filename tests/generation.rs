use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use synthstream::{
    BatchWorkerPool, CollectingSink, EventFactory, GenerationManager, GeneratorConfig, Level,
    Metadata, PoolConfig, ScheduleConfig, SourceIdentity, SourceProfile, SourceScheduler,
    Template, TimestampAssigner,
};
use synthstream::template::NoTechniques;

fn firewall_profile() -> SourceProfile {
    SourceProfile::new(
        SourceIdentity::new("firewall", "edge-fw", "fw01"),
        vec![
            Template::new(Level::Info, "ACCEPT {proto} from {src_ip}", 0.8)
                .with_metadata("proto", serde_json::json!(["tcp", "udp"]))
                .with_metadata("src_ip", "10.0.0.7"),
            Template::new(Level::Warn, "DROP {proto} from {src_ip}", 0.2)
                .with_metadata("proto", "tcp")
                .with_metadata("src_ip", "203.0.113.9"),
        ],
    )
}

#[tokio::test(start_paused = true)]
async fn test_twenty_per_minute_for_thirty_seconds() {
    let sink = CollectingSink::new();
    let mut scheduler = SourceScheduler::new(
        firewall_profile(),
        ScheduleConfig::per_minute(20.0),
        Arc::new(EventFactory::default()),
        TimestampAssigner::shared(),
    );
    scheduler.start(Arc::new(sink.clone())).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    scheduler.shutdown().await;

    let events = sink.events();
    assert!((9..=11).contains(&events.len()), "got {}", events.len());
    for event in &events {
        assert_eq!(event.source.name, "edge-fw");
        assert!(event.message.starts_with("ACCEPT") || event.message.starts_with("DROP"));
        assert!(!event.message.contains('{'));
    }
    for pair in events.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timestamps_unique_across_all_emitters() {
    let assigner = TimestampAssigner::shared();
    let factory = Arc::new(EventFactory::default());
    let sink = CollectingSink::new();

    let mut pools: Vec<BatchWorkerPool> = (0..2)
        .map(|_| {
            BatchWorkerPool::new(
                firewall_profile(),
                60_000.0,
                PoolConfig {
                    workers: 2,
                    high_water_mark: 100_000,
                    flush_batch_size: 500,
                },
                factory.clone(),
                assigner.clone(),
                Arc::new(sink.clone()),
            )
        })
        .collect();
    for pool in &mut pools {
        pool.configure(2).unwrap();
    }

    // Direct issuers on plain threads race the pools for the same assigner.
    let issuers: Vec<_> = (0..4)
        .map(|_| {
            let assigner = assigner.clone();
            thread::spawn(move || (0..2_500).map(|_| assigner.issue()).collect::<Vec<_>>())
        })
        .collect();

    let (a, b) = tokio::join!(pools[0].generate(5_000), pools[1].generate(5_000));
    assert_eq!(a.unwrap() + b.unwrap(), 10_000);

    let mut seen = HashSet::new();
    for issuer in issuers {
        for ts in issuer.join().unwrap() {
            assert!(seen.insert(ts));
        }
    }
    for mut pool in pools {
        pool.stop().await.unwrap();
    }
    for event in sink.events() {
        assert!(seen.insert(event.timestamp), "duplicate {}", event.timestamp);
    }
    assert_eq!(seen.len(), 20_000);
}

#[tokio::test(start_paused = true)]
async fn test_manager_from_json_config() {
    let raw = r#"{
        "metadata": {"env": "staging"},
        "techniques": [{"keyword": "failed password", "id": "T1110", "name": "Brute Force"}],
        "sources": [
            {
                "type": "auth", "name": "sshd", "host": "bastion-1", "frequency": 120,
                "seed": 42,
                "templates": [
                    {"level": "WARN", "message": "Failed password for {user} on {host} ({env})",
                     "probability": 1.0, "metadata": {"user": ["root", "admin", "oracle"]}}
                ]
            },
            {
                "type": "web", "name": "nginx", "frequency": 0, "enabled": false,
                "templates": []
            }
        ]
    }"#;
    let config = GeneratorConfig::from_json_str(raw).unwrap();
    let mut manager = GenerationManager::from_config(&config).unwrap();

    let sink = CollectingSink::new();
    manager.start(Arc::new(sink.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5_250)).await;
    manager.stop().await.unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 10);
    for event in &events {
        assert_eq!(event.source.source_type, "auth");
        assert_eq!(event.metadata["env"], "staging");
        let user = event.metadata["user"].as_str().unwrap();
        assert!(["root", "admin", "oracle"].contains(&user));
        assert_eq!(event.message, format!("Failed password for {user} on bastion-1 (staging)"));
        assert_eq!(event.technique.as_ref().unwrap().id, "T1110");
    }

    let stats = manager.scheduler_stats();
    assert_eq!(stats.iter().find(|(n, _)| n == "nginx").unwrap().1.ticks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_source_does_not_block_start() {
    let mut manager = GenerationManager::new(Metadata::new(), Arc::new(NoTechniques));
    manager.add_scheduled(firewall_profile(), ScheduleConfig::per_minute(600.0));
    let mut paused = ScheduleConfig::per_minute(0.0);
    paused.enabled = false;
    manager.add_scheduled(
        SourceProfile::new(SourceIdentity::new("web", "nginx", "web01"), vec![]),
        paused,
    );

    let sink = CollectingSink::new();
    manager.start(Arc::new(sink.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_050)).await;
    manager.stop().await.unwrap();

    let n = sink.len();
    assert!((9..=11).contains(&n), "got {n}");
    assert!(sink.events().iter().all(|e| e.source.name == "edge-fw"));
}
