use crate::{
    config::{ElapsedConfig, Layout},
    executors::Executor,
    monitor::daemon::pause,
};
use chrono::{DateTime, Local};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ELAPSED_FILE: &str = "elapsed_time.txt";

#[derive(Error, Debug)]
pub enum ElapsedError {
    #[error("Failed to record the elapsed time in {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// `ctime(3)` style timestamps
fn timestamp(time: &DateTime<Local>) -> String {
    time.format("%a %b %e %H:%M:%S %Y").to_string()
}

pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let seconds = elapsed.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Records how long it takes until the submitter's queue drains
#[derive(Debug, Clone)]
pub struct ElapsedTracker {
    pub record: PathBuf,
    pub interval: Duration,
}

impl ElapsedTracker {
    pub fn new(layout: &Layout, config: &ElapsedConfig) -> Self {
        Self {
            record: layout.work_dir.join(ELAPSED_FILE),
            interval: Duration::from_secs(config.interval),
        }
    }

    fn append(&self, line: &str) -> Result<(), ElapsedError> {
        let io_error = |source| ElapsedError::Io {
            path: self.record.clone(),
            source,
        };

        if let Some(parent) = self.record.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.record)
            .map_err(io_error)?;
        writeln!(file, "{line}").map_err(io_error)
    }

    pub fn record(&self) -> &Path {
        &self.record
    }

    /// Block until `queue(mine_only)` is empty, `None` when stopped early
    pub fn run(&self, executor: &dyn Executor, stop: &AtomicBool) -> Result<Option<chrono::Duration>, ElapsedError> {
        let started = Local::now();
        self.append(&format!("start datetime: {}", timestamp(&started)))?;
        info!(record = ?self.record, "Timer has started");

        loop {
            match executor.queue(true) {
                Ok(jobs) if jobs.is_empty() => break,
                Ok(jobs) => debug!(jobs = jobs.len(), "Jobs still queued"),
                Err(error) => warn!(error = ?error, "Failed to poll the queue, retrying"),
            }

            pause(self.interval, stop);
            if stop.load(Ordering::SeqCst) {
                warn!("Timer was stopped before the queue drained");
                return Ok(None);
            }
        }

        let finished = Local::now();
        let elapsed = finished - started;
        self.append(&format!("end datetime: {}", timestamp(&finished)))?;
        self.append(&format!("elapsed: {}", format_elapsed(elapsed)))?;
        info!(elapsed = %format_elapsed(elapsed), record = ?self.record, "The timer has stopped");

        Ok(Some(elapsed))
    }
}
