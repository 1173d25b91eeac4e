use crate::export::ExportHook;
use crate::parser::ServingCellParser;
use crate::query::QueryEngine;
use crate::store::TelemetryStore;
use crate::telemetry::{Sample, TechnologyTag};
use crate::transport::LineTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroU64;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("poll worker stopped unexpectedly: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("tick interval must be greater than zero")]
    ZeroTickInterval,
    #[error("maintenance must run every one or more ticks")]
    ZeroMaintenanceCadence,
    #[error("poll command must not be empty")]
    EmptyCommand,
}

/// Loop cadence and targets. Only constructed through [`ScheduleSettings::new`],
/// so the interval and the maintenance cadence are never zero.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    tick_interval: Duration,
    maintenance_every_ticks: NonZeroU64,
    snapshot_path: PathBuf,
    command: String,
}

impl ScheduleSettings {
    pub fn new(
        tick_interval: Duration,
        maintenance_every_ticks: u64,
        snapshot_path: impl Into<PathBuf>,
        command: impl Into<String>,
    ) -> Result<Self, SettingsError> {
        if tick_interval.is_zero() {
            return Err(SettingsError::ZeroTickInterval);
        }
        let maintenance_every_ticks =
            NonZeroU64::new(maintenance_every_ticks).ok_or(SettingsError::ZeroMaintenanceCadence)?;
        let command = command.into();
        if command.trim().is_empty() {
            return Err(SettingsError::EmptyCommand);
        }

        Ok(Self {
            tick_interval,
            maintenance_every_ticks,
            snapshot_path: snapshot_path.into(),
            command,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn maintenance_every_ticks(&self) -> NonZeroU64 {
        self.maintenance_every_ticks
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_ticks: u64,
    pub failed_queries: u64,
    pub samples_trimmed: u64,
    pub snapshots_written: u64,
    pub snapshot_failures: u64,
    pub export_failures: u64,
    pub tick_panics: u64,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub tick: u64,
    pub technologies: Vec<TechnologyTag>,
    pub query_failed: bool,
    pub maintenance: Option<MaintenanceOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceOutcome {
    pub trimmed: usize,
    pub snapshot_written: bool,
    pub exported: bool,
}

/// The poll loop: query, parse, append, and periodically trim and persist.
///
/// The scheduler owns the store while it runs; [`PollScheduler::into_store`]
/// hands it back.
pub struct PollScheduler<T> {
    engine: QueryEngine<T>,
    parser: ServingCellParser,
    store: TelemetryStore,
    exporter: Option<Box<dyn ExportHook + Send>>,
    settings: ScheduleSettings,
    stats: SchedulerStats,
}

impl<T: LineTransport> PollScheduler<T> {
    pub fn new(engine: QueryEngine<T>, store: TelemetryStore, settings: ScheduleSettings) -> Self {
        let parser = ServingCellParser::new().with_echo(settings.command.clone());
        Self {
            engine,
            parser,
            store,
            exporter: None,
            settings,
            stats: SchedulerStats::default(),
        }
    }

    pub fn with_exporter(mut self, exporter: Box<dyn ExportHook + Send>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_parser(mut self, parser: ServingCellParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn into_store(self) -> TelemetryStore {
        self.store
    }

    pub fn engine(&self) -> &QueryEngine<T> {
        &self.engine
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    /// Run one poll iteration stamped `now`. Every failure is logged here.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let mut sample = Sample::new(now);
        let mut query_failed = false;

        match self.engine.query(&self.settings.command) {
            Ok(lines) => sample.merge(self.parser.parse_serving_cell(&lines)),
            Err(e) => {
                warn!(error = %e, "serving cell query failed");
                query_failed = true;
                self.stats.failed_queries += 1;
            }
        }

        let technologies: Vec<TechnologyTag> = sample.readings.keys().copied().collect();
        debug!(timestamp = %sample.timestamp, ?technologies, "sample collected");
        self.store.append(sample);

        let tick = self.store.advance_tick();
        self.stats.total_ticks += 1;

        let maintenance = if tick % self.settings.maintenance_every_ticks.get() == 0 {
            Some(self.maintain(now))
        } else {
            None
        };

        TickOutcome {
            tick,
            technologies,
            query_failed,
            maintenance,
        }
    }

    /// Trim, snapshot, then export. Export only sees a snapshot that was just written.
    pub fn maintain(&mut self, now: DateTime<Utc>) -> MaintenanceOutcome {
        let trimmed = self.store.trim(now);
        self.stats.samples_trimmed += trimmed as u64;

        let snapshot_written = self.persist();

        let mut exported = false;
        if snapshot_written {
            if let Some(exporter) = self.exporter.as_mut() {
                match exporter.export(&self.settings.snapshot_path) {
                    Ok(()) => exported = true,
                    Err(e) => {
                        warn!(error = %e, "export failed");
                        self.stats.export_failures += 1;
                    }
                }
            }
        }

        info!(
            samples = self.store.len(),
            trimmed,
            ticks = self.stats.total_ticks,
            failed_queries = self.stats.failed_queries,
            snapshot_failures = self.stats.snapshot_failures,
            "maintenance cycle"
        );

        MaintenanceOutcome {
            trimmed,
            snapshot_written,
            exported,
        }
    }

    /// Snapshot the store; on failure the in-memory series is kept for the next cycle.
    pub fn persist(&mut self) -> bool {
        match self.store.snapshot(&self.settings.snapshot_path) {
            Ok(()) => {
                self.stats.snapshots_written += 1;
                true
            }
            Err(e) => {
                error!(error = %e, "snapshot failed, keeping series in memory");
                self.stats.snapshot_failures += 1;
                false
            }
        }
    }
}

impl<T: LineTransport + Send + 'static> PollScheduler<T> {
    /// Tick on a fixed interval until `shutdown` resolves, then write a final snapshot.
    ///
    /// Each tick runs on the blocking pool since transport reads block. A
    /// shutdown request is honoured between ticks, never in the middle of one.
    /// A panicking tick is caught and counted; the series it had built so far
    /// stays in memory and still reaches the final snapshot.
    pub async fn run<F>(self, shutdown: F) -> Result<Self, RunError>
    where
        F: Future<Output = ()>,
    {
        let mut interval = time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            interval_ms = self.settings.tick_interval.as_millis() as u64,
            every = self.settings.maintenance_every_ticks.get(),
            snapshot = %self.settings.snapshot_path.display(),
            "poll loop started"
        );

        let mut scheduler = self;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            scheduler = tokio::task::spawn_blocking(move || {
                let now = Utc::now();
                let ticked = panic::catch_unwind(AssertUnwindSafe(|| {
                    scheduler.tick(now);
                }));
                if ticked.is_err() {
                    error!(%now, "poll tick panicked, keeping series");
                    scheduler.stats.tick_panics += 1;
                }
                scheduler
            })
            .await?;
        }

        info!(samples = scheduler.store.len(), "poll loop stopping, writing final snapshot");
        let scheduler = tokio::task::spawn_blocking(move || {
            scheduler.persist();
            scheduler
        })
        .await?;
        Ok(scheduler)
    }
}
