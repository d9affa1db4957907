//! End-to-end tests of a run driven by the run controller with in-process components.

use rust_eudaq::collector::DataCollector;
use rust_eudaq::config::{CollectorConfig, RunControlConfig};
use rust_eudaq::event::Event;
use rust_eudaq::file::{FileReader, NativeReader};
use rust_eudaq::log_collector::{LogCollector, LogLevel, MemoryLogCollector};
use rust_eudaq::producer::{ProducerRuntime, RuntimeConfig};
use rust_eudaq::registry::{str2hash, Registry};
use rust_eudaq::run_control::{
    Command, ComponentHandle, LocalLink, RunControl, RunController, State,
};
use rust_eudaq::DaqError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn run_control_config() -> RunControlConfig {
    RunControlConfig {
        poll_interval: Duration::from_millis(1),
        command_timeout: Duration::from_secs(5),
        ..RunControlConfig::default()
    }
}

fn params(text: &str) -> toml::Table {
    toml::from_str(text).unwrap()
}

fn spawn_producer(
    registry: &Registry,
    name: &str,
    producer_type: &str,
    events: mpsc::Sender<Event>,
) -> ComponentHandle {
    let producer = registry.create_producer(producer_type, name).unwrap();
    let (handle, _task) = ProducerRuntime::spawn(
        name,
        producer_type,
        producer,
        str2hash(name),
        Box::new(events),
        RuntimeConfig::from(&run_control_config()),
    );
    handle
}

fn read_streams(path: &Path) -> BTreeMap<u32, Vec<Event>> {
    let mut reader = NativeReader::open(path).unwrap();
    let mut streams: BTreeMap<u32, Vec<Event>> = BTreeMap::new();
    while let Some(event) = reader.next_event().unwrap() {
        streams.entry(event.stream_number()).or_default().push(event);
    }
    streams
}

#[tokio::test]
async fn test_run_is_bracketed_by_bore_and_eore() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::builtin());
    let collector_config = CollectorConfig {
        data_dir: dir.path().to_path_buf(),
        eore_timeout: Duration::from_secs(2),
        ..CollectorConfig::default()
    };
    let (collector, events, _task) = DataCollector::spawn(collector_config, Arc::clone(&registry));

    let log = Arc::new(MemoryLogCollector::new(100));
    let mut controller = RunController::new(run_control_config(), log.clone());
    controller.add_component(Arc::new(LocalLink::new(collector)), toml::Table::new());
    controller.add_component(
        Arc::new(LocalLink::new(spawn_producer(
            &registry,
            "CMSREF",
            "CMSPixelProducer",
            events.clone(),
        ))),
        params(
            r#"
            event_type = "ref"
            planes = 2
            tlu_waiting_time = 20
            self_trigger_period = 2
            seed = 11
            "#,
        ),
    );
    controller.add_component(
        Arc::new(LocalLink::new(spawn_producer(
            &registry,
            "DRS4",
            "DRS4Producer",
            events.clone(),
        ))),
        params(
            r#"
            activated_channels = 3
            wave_depth = 32
            tlu_waiting_time = 20
            self_trigger_period = 3
            seed = 5
            "#,
        ),
    );

    controller.configure().await.unwrap();
    controller.start_run(42).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.stop_run().await.unwrap();

    for (name, status) in controller.status().await {
        let status = status.unwrap();
        assert_eq!(status.state, State::Stopped, "{name}");
        assert_eq!(status.run_number, 42);
    }
    controller.terminate().await.unwrap();

    let streams = read_streams(&dir.path().join("run000042.raw"));
    assert_eq!(
        streams.keys().copied().collect::<Vec<_>>(),
        {
            let mut expected = vec![str2hash("CMSREF"), str2hash("DRS4")];
            expected.sort_unstable();
            expected
        }
    );
    for (stream, events) in &streams {
        assert!(events.len() >= 3, "stream {stream:#x} too short");
        let first = &events[0];
        assert!(first.is_bore());
        assert_eq!(first.event_number(), 0);
        assert!(events.last().unwrap().is_eore());
        for pair in events.windows(2) {
            assert!(pair[1].event_number() > pair[0].event_number());
        }
        assert!(events[1..events.len() - 1]
            .iter()
            .all(|e| !e.is_bore() && !e.is_eore() && e.run_number() == 42));
    }
    assert!(log.records().iter().all(|r| r.level != LogLevel::Error));
}

#[tokio::test]
async fn test_reconfigure_after_stop_and_invalid_start() {
    let registry = Registry::builtin();
    let (events, mut sink) = mpsc::channel(1024);
    tokio::spawn(async move { while sink.recv().await.is_some() {} });
    let handle = spawn_producer(&registry, "DRS4", "DRS4Producer", events);

    let status = handle.request(Command::StartRun(1)).await.unwrap();
    assert_eq!(status.state, State::Unconfigured);
    assert!(status.last_error.unwrap().contains("Invalid transition"));

    let config = params("self_trigger_period = 2\ntlu_waiting_time = 1\nwave_depth = 16");
    let sequence = [
        (Command::Configure(config.clone()), State::Configured),
        (Command::StartRun(1), State::Running),
        (Command::StopRun, State::Stopped),
        (Command::Configure(config), State::Configured),
        (Command::StartRun(2), State::Running),
        (Command::StopRun, State::Stopped),
        (Command::Terminate, State::Terminated),
    ];
    for (command, expected) in sequence {
        let status = handle.request(command).await.unwrap();
        assert_eq!(status.state, expected);
        assert_eq!(status.last_error, None);
    }
}

#[tokio::test]
async fn test_failed_component_blocks_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::builtin());
    let (collector, events, _task) = DataCollector::spawn(
        CollectorConfig {
            data_dir: dir.path().to_path_buf(),
            ..CollectorConfig::default()
        },
        Arc::clone(&registry),
    );
    let log = Arc::new(MemoryLogCollector::new(100));
    let mut controller = RunController::new(run_control_config(), log.clone());
    controller.add_component(Arc::new(LocalLink::new(collector)), toml::Table::new());
    let producer = spawn_producer(&registry, "CMSDUT", "CMSPixelProducer", events);
    controller.add_component(
        Arc::new(LocalLink::new(producer.clone())),
        params(r#"event_type = "telescope""#),
    );

    match controller.configure().await {
        Err(DaqError::RunBlocked { failures, .. }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].name, "CMSDUT");
            assert!(failures[0].message.contains("event_type"));
        }
        other => panic!("expected RunBlocked, got {other:?}"),
    }
    assert_eq!(producer.state(), State::Error);
    assert!(controller.start_run(1).await.is_err());
    assert!(log.records().iter().any(|r| r.level == LogLevel::Error && r.sender == "CMSDUT"));

    // Terminate is accepted from Error
    controller.terminate().await.unwrap();
    assert_eq!(producer.state(), State::Terminated);
}
