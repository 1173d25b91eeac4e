use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use modem_poller::export::ExportError;
use modem_poller::parser::SERVING_CELL_COMMAND;
use modem_poller::query::QueryEngine;
use modem_poller::scheduler::*;
use modem_poller::store::TelemetryStore;
use modem_poller::telemetry::{Sample, TechnologyTag};
use modem_poller::transport::{LineTransport, ReadOutcome, ScriptedTransport, TransportError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NR_LINE: &str = "+QENG: \"NR5G-NSA\",302,720,0,-60,30,-11,638016,78,8,1";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn settings(snapshot_path: PathBuf, every: u64) -> ScheduleSettings {
    ScheduleSettings::new(Duration::from_millis(10), every, snapshot_path, SERVING_CELL_COMMAND)
        .expect("valid settings")
}

fn scheduler(
    transport: ScriptedTransport,
    snapshot_path: PathBuf,
    every: u64,
) -> PollScheduler<ScriptedTransport> {
    let engine = QueryEngine::new(transport, Duration::from_millis(10));
    let store = TelemetryStore::new(ChronoDuration::days(14));
    PollScheduler::new(engine, store, settings(snapshot_path, every))
}

fn push_nr_reply(transport: &mut ScriptedTransport) {
    transport.push_line(NR_LINE);
    transport.push_line("OK");
}

/// Transport that panics on every write.
struct PanickingTransport;

impl LineTransport for PanickingTransport {
    fn write_command(&mut self, _command: &str) -> Result<(), TransportError> {
        panic!("modem driver fault");
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<ReadOutcome, TransportError> {
        Ok(ReadOutcome::Timeout)
    }
}

#[test]
fn test_settings_reject_zero_cadence() {
    let result = ScheduleSettings::new(
        Duration::from_millis(10),
        0,
        "status.json",
        SERVING_CELL_COMMAND,
    );
    assert_eq!(result.unwrap_err(), SettingsError::ZeroMaintenanceCadence);
}

#[test]
fn test_settings_reject_zero_interval_and_empty_command() {
    assert_eq!(
        ScheduleSettings::new(Duration::ZERO, 300, "status.json", SERVING_CELL_COMMAND).unwrap_err(),
        SettingsError::ZeroTickInterval
    );
    assert_eq!(
        ScheduleSettings::new(Duration::from_millis(10), 300, "status.json", "  ").unwrap_err(),
        SettingsError::EmptyCommand
    );
}

#[test]
fn test_cadence_of_one_maintains_every_tick() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut poller = scheduler(ScriptedTransport::new(), dir.path().join("status.json"), 1);
    assert_eq!(poller.settings().maintenance_every_ticks().get(), 1);

    for i in 0..3 {
        assert!(poller.tick(at(i)).maintenance.is_some());
    }
    assert_eq!(poller.stats().snapshots_written, 3);
}

#[test]
fn test_successful_tick_appends_parsed_sample() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut transport = ScriptedTransport::new();
    push_nr_reply(&mut transport);
    let mut poller = scheduler(transport, dir.path().join("status.json"), 300);

    let outcome = poller.tick(at(0));

    assert_eq!(outcome.tick, 0);
    assert_eq!(outcome.technologies, vec![TechnologyTag::Nr]);
    assert!(!outcome.query_failed);
    assert_eq!(poller.store().len(), 1);
    let sample = poller.store().latest().unwrap();
    assert_eq!(sample.timestamp, at(0));
    assert_eq!(sample.reading(TechnologyTag::Nr).unwrap().get("arfcn"), Some("638016"));
    assert_eq!(poller.engine().transport().written(), &[SERVING_CELL_COMMAND.to_string()]);
}

#[test]
fn test_failed_query_still_appends_empty_sample() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut poller = scheduler(ScriptedTransport::new(), dir.path().join("status.json"), 300);

    let outcome = poller.tick(at(0));
    assert!(outcome.query_failed);
    assert!(outcome.technologies.is_empty());

    let outcome = poller.tick(at(1));
    assert!(outcome.query_failed);

    assert_eq!(poller.store().len(), 2);
    assert!(poller.store().samples().iter().all(Sample::is_empty));
    assert_eq!(poller.stats().failed_queries, 2);
    assert_eq!(poller.stats().total_ticks, 2);
}

#[test]
fn test_write_failure_is_isolated_to_the_tick() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut transport = ScriptedTransport::new();
    transport.set_fail_writes(true);
    let mut poller = scheduler(transport, dir.path().join("status.json"), 300);

    let outcome = poller.tick(at(0));
    assert!(outcome.query_failed);
    assert_eq!(poller.store().len(), 1);
}

#[test]
fn test_maintenance_runs_on_first_and_every_nth_tick() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("status.json");
    let mut poller = scheduler(ScriptedTransport::new(), path.clone(), 3);

    let ran: Vec<bool> = (0..7).map(|i| poller.tick(at(i)).maintenance.is_some()).collect();
    assert_eq!(ran, vec![true, false, false, true, false, false, true]);
    assert_eq!(poller.stats().snapshots_written, 3);

    // Last snapshot taken at tick 6 holds all seven samples
    assert_eq!(TelemetryStore::load(&path).unwrap().len(), 7);
}

#[test]
fn test_maintenance_trims_before_snapshot() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("status.json");
    let engine = QueryEngine::new(ScriptedTransport::new(), Duration::from_millis(10));
    let mut store = TelemetryStore::new(ChronoDuration::seconds(60));
    store.append(Sample::new(at(-1000)));
    store.append(Sample::new(at(-30)));
    let mut poller = PollScheduler::new(engine, store, settings(path.clone(), 1));

    let outcome = poller.tick(at(0));
    let maintenance = outcome.maintenance.unwrap();
    assert_eq!(maintenance.trimmed, 1);
    assert!(maintenance.snapshot_written);
    assert!(!maintenance.exported);

    let persisted = TelemetryStore::load(&path).unwrap();
    assert_eq!(persisted.len(), 2);
    assert!(persisted.iter().all(|s| at(0) - s.timestamp <= ChronoDuration::seconds(60)));
}

#[test]
fn test_export_receives_snapshot_path() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("status.json");
    let seen: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);

    let mut poller = scheduler(ScriptedTransport::new(), path.clone(), 2).with_exporter(Box::new(
        move |snapshot: &Path| -> Result<(), ExportError> {
            assert!(snapshot.exists());
            recorder.lock().unwrap().push(snapshot.to_path_buf());
            Ok(())
        },
    ));

    for i in 0..4 {
        poller.tick(at(i));
    }

    assert_eq!(*seen.lock().unwrap(), vec![path.clone(), path]);
    assert_eq!(poller.stats().export_failures, 0);
}

#[test]
fn test_export_failure_is_logged_only() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut transport = ScriptedTransport::new();
    push_nr_reply(&mut transport);
    push_nr_reply(&mut transport);
    let mut poller = scheduler(transport, dir.path().join("status.json"), 1).with_exporter(Box::new(
        |_: &Path| -> Result<(), ExportError> { Err(ExportError::EmptyCommand) },
    ));

    let first = poller.tick(at(0));
    let second = poller.tick(at(1));

    assert!(!first.maintenance.unwrap().exported);
    assert_eq!(second.technologies, vec![TechnologyTag::Nr]);
    assert_eq!(poller.stats().export_failures, 2);
    assert_eq!(poller.stats().snapshots_written, 2);
}

#[test]
fn test_snapshot_failure_keeps_series_and_skips_export() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    // Parent directory does not exist, so every snapshot fails
    let path = dir.path().join("missing").join("status.json");
    let exports = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&exports);

    let mut poller = scheduler(ScriptedTransport::new(), path, 1).with_exporter(Box::new(
        move |_: &Path| -> Result<(), ExportError> {
            *counter.lock().unwrap() += 1;
            Ok(())
        },
    ));

    for i in 0..3 {
        let maintenance = poller.tick(at(i)).maintenance.unwrap();
        assert!(!maintenance.snapshot_written);
    }

    assert_eq!(poller.store().len(), 3);
    assert_eq!(poller.stats().snapshot_failures, 3);
    assert_eq!(*exports.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_run_stops_on_shutdown_and_writes_final_snapshot() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("status.json");
    let mut transport = ScriptedTransport::new();
    for _ in 0..100 {
        push_nr_reply(&mut transport);
    }
    let poller = scheduler(transport, path.clone(), 1000);

    let shutdown = tokio::time::sleep(Duration::from_millis(100));
    let poller = poller.run(shutdown).await.unwrap();

    let ticks = poller.stats().total_ticks;
    assert!(ticks >= 1, "expected at least one tick");
    assert_eq!(poller.store().len() as u64, ticks);
    // Tick 0 snapshot plus the shutdown snapshot
    assert_eq!(poller.stats().snapshots_written, 2);

    let persisted = TelemetryStore::load(&path).unwrap();
    assert_eq!(persisted.len() as u64, ticks);
    assert!(persisted.iter().all(|s| s.reading(TechnologyTag::Nr).is_some()));
}

#[tokio::test]
async fn test_run_survives_silent_modem() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let poller = scheduler(ScriptedTransport::new(), dir.path().join("status.json"), 1000);

    let poller = poller
        .run(tokio::time::sleep(Duration::from_millis(60)))
        .await
        .unwrap();

    assert!(poller.stats().total_ticks >= 1);
    assert_eq!(poller.stats().failed_queries, poller.stats().total_ticks);
    assert!(poller.into_store().samples().iter().all(Sample::is_empty));
}

#[tokio::test]
async fn test_run_survives_panicking_tick_and_keeps_series() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("status.json");
    let mut store = TelemetryStore::new(ChronoDuration::days(14));
    store.append(Sample::new(Utc::now()));

    let engine = QueryEngine::new(PanickingTransport, Duration::from_millis(10));
    let poller = PollScheduler::new(engine, store, settings(path.clone(), 1000));

    let poller = poller
        .run(tokio::time::sleep(Duration::from_millis(60)))
        .await
        .unwrap();

    assert!(poller.stats().tick_panics >= 1);
    assert_eq!(poller.stats().total_ticks, 0);
    assert_eq!(poller.store().len(), 1);
    // Only the shutdown snapshot, since no tick ever completed
    assert_eq!(poller.stats().snapshots_written, 1);
    assert_eq!(TelemetryStore::load(&path).unwrap().len(), 1);
}
