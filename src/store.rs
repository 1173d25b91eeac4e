use crate::telemetry::Sample;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const DEFAULT_RETENTION_DAYS: i64 = 14;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {path} is not valid: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot {path} has unsupported version {version}")]
    Version { path: PathBuf, version: u32 },
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    samples: &'a [Sample],
}

#[derive(Deserialize)]
struct SnapshotFile {
    version: u32,
    samples: Vec<Sample>,
}

/// Append-only sample history with an age-based retention window.
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    series: Vec<Sample>,
    retention: Duration,
    tick_counter: u64,
}

impl TelemetryStore {
    pub fn new(retention: Duration) -> Self {
        Self::from_series(Vec::new(), retention)
    }

    pub fn from_series(series: Vec<Sample>, retention: Duration) -> Self {
        Self {
            series,
            retention,
            tick_counter: 0,
        }
    }

    /// Start from the snapshot at `path`, or empty if it cannot be read.
    pub fn restore(path: &Path, retention: Duration) -> Self {
        let series = match Self::load(path) {
            Ok(series) => {
                info!(path = %path.display(), samples = series.len(), "restored snapshot");
                series
            }
            Err(PersistenceError::Io { ref source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no snapshot yet, starting empty");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "could not load snapshot, starting empty");
                Vec::new()
            }
        };
        Self::from_series(series, retention)
    }

    pub fn load(path: &Path) -> Result<Vec<Sample>, PersistenceError> {
        let file = File::open(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: SnapshotFile =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| PersistenceError::Format {
                path: path.to_path_buf(),
                source,
            })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::Version {
                path: path.to_path_buf(),
                version: snapshot.version,
            });
        }
        Ok(snapshot.samples)
    }

    pub fn append(&mut self, sample: Sample) {
        self.series.push(sample);
    }

    /// Drop samples older than the retention window, returning how many went.
    ///
    /// Samples stamped after `now` (clock stepped back) are kept.
    pub fn trim(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.series.len();
        let retention = self.retention;
        self.series.retain(|sample| now - sample.timestamp <= retention);
        let removed = before - self.series.len();
        if removed > 0 {
            debug!(removed, remaining = self.series.len(), "trimmed telemetry series");
        }
        removed
    }

    /// Replace the snapshot at `path` with the current series.
    ///
    /// The data is written and synced to a sibling temp file first and then
    /// renamed over `path`, so readers only ever see a complete snapshot.
    pub fn snapshot(&self, path: &Path) -> Result<(), PersistenceError> {
        let tmp_path = temp_path_for(path);
        let io_err = |source: io::Error| PersistenceError::Io {
            path: tmp_path.clone(),
            source,
        };

        let file = File::create(&tmp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            samples: &self.series,
        };
        serde_json::to_writer(&mut writer, &snapshot).map_err(|source| PersistenceError::Format {
            path: tmp_path.clone(),
            source,
        })?;
        writer.flush().map_err(io_err)?;
        let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        sync_parent_dir(path);

        debug!(path = %path.display(), samples = self.series.len(), "snapshot written");
        Ok(())
    }

    pub fn samples(&self) -> &[Sample] {
        &self.series
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.series
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.series.last()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn tick_counter(&self) -> u64 {
        self.tick_counter
    }

    /// Advance the tick counter, returning the tick that just ran.
    pub fn advance_tick(&mut self) -> u64 {
        let tick = self.tick_counter;
        self.tick_counter = self.tick_counter.wrapping_add(1);
        tick
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// Makes the rename itself durable. Not every platform can open a directory,
// so failure is only logged.
fn sync_parent_dir(path: &Path) {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "could not sync snapshot directory");
    }
}
