//! End-to-end tests wiring the engine against mock transports.

use fieldsync_engine::{
    ChangeStreamSource, Connectivity, Engine, EngineConfig, EngineEvent, LinkKind, LinkQuality,
    MockBackend, MockStreamSource, RemoteBackend, Resolution,
};
use fieldsync_protocol::{
    ChangeStreamEvent, Collection, EntityId, Payload, Priority, ProjectDoc, SyncStatus,
    VersionMarker,
};
use fieldsync_store::{FileBackend, InMemoryBackend, StorageBackend};
use std::sync::Arc;
use std::time::Duration;

fn project(name: &str) -> Payload {
    Payload::Projects(ProjectDoc {
        schema_version: 1,
        name: name.to_string(),
        status: "active".to_string(),
        site: None,
        notes: None,
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_engine(
    storage: Arc<dyn StorageBackend>,
) -> (Engine, Arc<MockBackend>, Arc<MockStreamSource>) {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let streams = Arc::new(MockStreamSource::new());
    let engine = Engine::open(
        EngineConfig::new().with_retry_base(Duration::ZERO),
        storage,
        Arc::clone(&backend) as Arc<dyn RemoteBackend>,
        Arc::clone(&streams) as Arc<dyn ChangeStreamSource>,
    )
    .unwrap();
    (engine, backend, streams)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn offline_writes_sync_on_reconnect() {
    let (engine, backend, _streams) = open_engine(Arc::new(InMemoryBackend::new()));

    // Three writes while offline; nothing reaches the backend.
    for i in 1..=3 {
        engine
            .save(
                EntityId::new(format!("p-{i}")),
                project(&format!("site {i}")),
                Priority::Normal,
            )
            .await
            .unwrap();
    }
    assert_eq!(engine.pending_mutations().unwrap(), 3);
    assert!(backend.executed().is_empty());

    // Going online triggers exactly one run that drains the queue.
    let mut events = engine.subscribe_events();
    engine.set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));
    wait_for(|| backend.executed().len() == 3).await;

    let mut started = 0;
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::SyncStarted { .. } => started += 1,
            EngineEvent::SyncCompleted { report } => completed = Some(report),
            _ => {}
        }
    }
    assert_eq!(started, 1);
    let report = completed.expect("run completed");
    assert_eq!(report.synced, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.remaining, 0);

    engine.shutdown();
}

#[tokio::test]
async fn conflict_roundtrip_server_wins() {
    let (engine, backend, streams) = open_engine(Arc::new(InMemoryBackend::new()));
    engine.set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));

    // Establish a synced entity at version 1.
    engine
        .save(EntityId::new("x"), project("synced"), Priority::Normal)
        .await
        .unwrap();
    engine.sync_now().await.unwrap();

    // A local edit goes pending, then a remote update for the same
    // entity arrives over the stream.
    engine
        .save(EntityId::new("x"), project("local edit"), Priority::Normal)
        .await
        .unwrap();

    let tx = streams.push_session(Collection::Projects);
    engine.start_realtime(Collection::Projects);
    tx.send(ChangeStreamEvent::update(
        EntityId::new("x"),
        project("remote edit"),
        VersionMarker::new(2),
    ))
    .unwrap();

    wait_for(|| !engine.open_conflicts().is_empty()).await;
    let conflicts = engine.open_conflicts();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.local_payload, Some(project("local edit")));
    assert_eq!(conflict.remote_payload, Some(project("remote edit")));

    // Server wins: remote payload lands, the local mutation dies.
    engine
        .resolve_conflict(conflict.id, Resolution::ServerWins)
        .await
        .unwrap();

    let record = engine
        .get(Collection::Projects, &EntityId::new("x"))
        .unwrap()
        .unwrap();
    assert_eq!(record.payload, project("remote edit"));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(engine.pending_mutations().unwrap(), 0);
    assert!(engine.open_conflicts().is_empty());

    // No further sync attempt carries the discarded local edit.
    let before = backend.executed().len();
    engine.sync_now().await.unwrap();
    assert_eq!(backend.executed().len(), before);

    engine.shutdown();
}

#[tokio::test]
async fn conflict_roundtrip_client_wins_resyncs() {
    let (engine, backend, streams) = open_engine(Arc::new(InMemoryBackend::new()));
    engine.set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));

    engine
        .save(EntityId::new("x"), project("synced"), Priority::Normal)
        .await
        .unwrap();
    engine.sync_now().await.unwrap();
    engine
        .save(EntityId::new("x"), project("local edit"), Priority::Normal)
        .await
        .unwrap();

    let tx = streams.push_session(Collection::Projects);
    engine.start_realtime(Collection::Projects);
    tx.send(ChangeStreamEvent::update(
        EntityId::new("x"),
        project("remote edit"),
        VersionMarker::new(2),
    ))
    .unwrap();
    wait_for(|| !engine.open_conflicts().is_empty()).await;

    let conflict_id = engine.open_conflicts()[0].id;
    engine
        .resolve_conflict(conflict_id, Resolution::ClientWins)
        .await
        .unwrap();

    // The pending local edit survives and syncs on the next run.
    assert_eq!(engine.pending_mutations().unwrap(), 1);
    let report = engine.sync_now().await.unwrap().unwrap();
    assert_eq!(report.synced, 1);

    let last = backend.executed().into_iter().last().unwrap();
    assert_eq!(last.payload, Some(project("local edit")));
    assert_eq!(
        backend.version_of(Collection::Projects, &EntityId::new("x")),
        Some(VersionMarker::new(2))
    );

    engine.shutdown();
}

#[tokio::test]
async fn realtime_events_apply_while_idle() {
    let (engine, _backend, streams) = open_engine(Arc::new(InMemoryBackend::new()));

    let tx = streams.push_session(Collection::Equipment);
    engine.start_realtime(Collection::Equipment);

    let payload = Payload::Equipment(fieldsync_protocol::EquipmentDoc {
        schema_version: 1,
        name: "Paver 3".to_string(),
        asset_tag: Some("EQ-3".to_string()),
        operational: true,
        engine_hours: Some(900.0),
    });
    tx.send(ChangeStreamEvent::insert(
        EntityId::new("eq-3"),
        payload.clone(),
        VersionMarker::new(1),
    ))
    .unwrap();

    wait_for(|| {
        engine
            .get(Collection::Equipment, &EntityId::new("eq-3"))
            .unwrap()
            .is_some()
    })
    .await;

    let record = engine
        .get(Collection::Equipment, &EntityId::new("eq-3"))
        .unwrap()
        .unwrap();
    assert_eq!(record.payload, payload);
    assert_eq!(record.sync_status, SyncStatus::Synced);

    // Catch-up sees the applied event.
    let caught_up = engine.events_since(Collection::Equipment, fieldsync_protocol::Timestamp::ZERO);
    assert_eq!(caught_up.len(), 1);

    engine.shutdown();
}

#[tokio::test]
async fn queue_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldsync.log");

    // First process: write offline, then "crash" (drop without sync).
    {
        let storage = Arc::new(FileBackend::open(&path).unwrap());
        let (engine, backend, _streams) = open_engine(storage);
        engine
            .save(EntityId::new("p-1"), project("offline work"), Priority::Critical)
            .await
            .unwrap();
        assert!(backend.executed().is_empty());
        engine.shutdown();
    }
    // Give the aborted background tasks a chance to drop their handles
    // (they hold the store, which holds the file lock).
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // Second process: the queue item and record are still there and the
    // write reaches the backend.
    {
        let storage = Arc::new(FileBackend::open(&path).unwrap());
        let (engine, backend, _streams) = open_engine(storage);
        assert_eq!(engine.pending_mutations().unwrap(), 1);

        engine.set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));
        let report = engine.sync_now().await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(backend.executed()[0].entity_id, EntityId::new("p-1"));

        engine.shutdown();
    }
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let (engine, backend, _streams) = open_engine(Arc::new(InMemoryBackend::new()));
    engine.set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));

    engine
        .save(EntityId::new("p-1"), project("flaky"), Priority::Normal)
        .await
        .unwrap();
    backend.fail_next(2);

    // Two runs fail transiently (zero retry base keeps items eligible),
    // the third delivers. max_retries = 3 is never reached.
    assert_eq!(engine.sync_now().await.unwrap().unwrap().failed, 1);
    assert_eq!(engine.sync_now().await.unwrap().unwrap().failed, 1);
    let report = engine.sync_now().await.unwrap().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.remaining, 0);

    engine.shutdown();
}

#[tokio::test]
async fn exhausted_retries_drop_with_one_event() {
    let (engine, backend, _streams) = open_engine(Arc::new(InMemoryBackend::new()));
    engine.set_connectivity(Connectivity::online(LinkKind::Wifi, LinkQuality::Good));
    let mut events = engine.subscribe_events();

    engine
        .save(EntityId::new("p-1"), project("doomed"), Priority::Normal)
        .await
        .unwrap();
    backend.fail_next(10);

    // Three failed attempts exhaust max_retries = 3.
    engine.sync_now().await.unwrap();
    engine.sync_now().await.unwrap();
    engine.sync_now().await.unwrap();
    assert_eq!(engine.pending_mutations().unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::MutationFailed { retry_count, .. } = event {
            assert_eq!(retry_count, 3);
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    engine.shutdown();
}
