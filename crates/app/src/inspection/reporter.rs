//! Periodic JSON snapshot of the status store for external dashboards, and
//! the operator control file read back into it.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::inspection::{
    status::{FaultOnPanic, StatusStore},
    telemetry,
};

/// Write the snapshot next to `path` and rename it into place, so readers
/// never see a partial file.
pub fn write_snapshot(store: &StatusStore, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(&store.snapshot()).context("failed to encode status")?;
    let tmp = tmp_path(path);
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Controls {
    archive_all: Option<bool>,
}

/// Apply the control file to the store. A missing file or a missing key
/// leaves the current setting alone. Returns whether anything changed.
pub fn apply_controls(store: &StatusStore, path: &Path) -> Result<bool> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let controls: Controls =
        toml::from_str(&text).with_context(|| format!("invalid control file {}", path.display()))?;
    let Some(enabled) = controls.archive_all else {
        return Ok(false);
    };
    let previous = store.set_archive_all(enabled);
    if previous != enabled {
        info!(archive_all = enabled, "archive mode switched");
    }
    Ok(previous != enabled)
}

#[derive(Debug, Clone, Default)]
pub struct ReporterPaths {
    pub status_file: Option<PathBuf>,
    pub control_file: Option<PathBuf>,
}

impl ReporterPaths {
    pub fn is_empty(&self) -> bool {
        self.status_file.is_none() && self.control_file.is_none()
    }
}

fn tick(store: &StatusStore, paths: &ReporterPaths) {
    if let Some(path) = &paths.control_file {
        if let Err(err) = apply_controls(store, path) {
            warn!("control file ignored: {err:#}");
        }
    }
    if let Some(path) = &paths.status_file {
        if let Err(err) = write_snapshot(store, path) {
            warn!("status snapshot failed: {err:#}");
        }
    }
}

/// Keeps the status file current and the controls applied until stop, then
/// writes the snapshot one last time so the final counters and any fault
/// reason are visible.
pub fn spawn_reporter(
    store: Arc<StatusStore>,
    paths: ReporterPaths,
    interval: Duration,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("status-reporter", move || {
        let _guard = FaultOnPanic::new(store.clone(), "status-reporter");
        while !store.should_stop() {
            tick(&store, &paths);
            thread::sleep(interval);
        }
        if let Some(path) = &paths.status_file {
            if let Err(err) = write_snapshot(&store, path) {
                warn!("final status snapshot failed: {err:#}");
            }
        }
    })
}
