pub mod daemon;
pub mod instances;
pub mod preemption;
pub mod resubmit;

use crate::{
    config::{ConfigErrors, Layout, RunnerConfig},
    executors::{Executor, ExecutorError},
    process::ProcessError,
};
use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use self::{
    instances::{GcloudInstances, InstanceWatcher},
    preemption::PreemptionTracker,
    resubmit::ResubmissionTracker,
};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Scheduler interaction failed")]
    Executor(#[from] ExecutorError),
    #[error("External command failed")]
    Process(#[from] ProcessError),
    #[error("Failed to parse the instance listing")]
    InstanceList(#[from] serde_json::Error),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to spawn the background worker")]
    Spawn(#[source] std::io::Error),
    #[error("Signal handling failed")]
    Signal(#[from] nix::Error),
    #[error("Another worker is already running with PID {0}")]
    AlreadyRunning(i32),
    #[error("Another start is in progress, {0} names no worker yet")]
    StartInProgress(PathBuf),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
}

/// One health check performed on every poll
pub enum Strategy {
    Preemption(PreemptionTracker),
    LogPattern(ResubmissionTracker),
    Instances(InstanceWatcher),
}

impl Strategy {
    /// Build strategies from their configured names
    pub fn from_config(config: &RunnerConfig, layout: &Layout, names: &[String]) -> Result<Vec<Self>, MonitorError> {
        names
            .iter()
            .map(|name| match name.as_str() {
                "preemption" => Ok(Self::Preemption(PreemptionTracker::new(&config.executor))),
                "log-pattern" => Ok(Self::LogPattern(ResubmissionTracker::new(
                    &layout.batch_root,
                    &config.monitor,
                ))),
                "instances" => Ok(Self::Instances(InstanceWatcher::new(
                    Box::new(GcloudInstances::new(&config.monitor.instances)),
                    &config.monitor.instances,
                    &layout.batch_root,
                ))),
                other => Err(ConfigErrors::UnsupportedStrategy(other.to_string()).into()),
            })
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Preemption(_) => "preemption",
            Self::LogPattern(_) => "log-pattern",
            Self::Instances(_) => "instances",
        }
    }

    pub fn sweep(&mut self, executor: &dyn Executor) -> Result<(), MonitorError> {
        match self {
            Self::Preemption(tracker) => {
                let summary = tracker.sweep(executor)?;
                debug!(summary = ?summary, "Preemption sweep");
            }
            Self::LogPattern(tracker) => {
                let summary = tracker.sweep(executor)?;
                debug!(summary = ?summary, "Log pattern sweep");
            }
            Self::Instances(watcher) => {
                let removed = watcher.sweep(executor)?;
                if !removed.is_empty() {
                    info!(batches = ?removed, "Removed output of batches on terminated instances");
                }
            }
        }

        Ok(())
    }
}

/// Single threaded poll loop over a set of strategies
pub struct Monitor {
    strategies: Vec<Strategy>,
    interval: Duration,
}

impl Monitor {
    pub fn new(strategies: Vec<Strategy>, interval: Duration) -> Self {
        Self {
            strategies,
            interval,
        }
    }

    /// Run every strategy once, a failing strategy does not stop the others
    pub fn sweep(&mut self, executor: &dyn Executor) -> usize {
        let mut failures = 0;

        for strategy in self.strategies.iter_mut() {
            if let Err(error) = strategy.sweep(executor) {
                error!(error = ?error, strategy = strategy.name(), "Health check failed");
                failures += 1;
            }
        }

        failures
    }

    #[instrument(skip_all, fields(interval = ?self.interval))]
    pub fn run(&mut self, executor: &dyn Executor, stop: &AtomicBool) {
        info!(
            strategies = ?self.strategies.iter().map(Strategy::name).collect::<Vec<_>>(),
            "Starting the monitoring loop"
        );

        while !stop.load(Ordering::SeqCst) {
            self.sweep(executor);
            daemon::pause(self.interval, stop);
        }

        info!("Received shutdown signal, stopping the monitor");
    }
}
