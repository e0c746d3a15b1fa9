use super::MonitorError;
use crate::{
    batch::{parse_batch_index, BatchPaths},
    collector::BatchTree,
    config::MonitorConfig,
    executors::Executor,
};
use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, error, info, instrument, warn};

/// What a log looked like when it was last acted upon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn of(path: &Path) -> Result<Self, MonitorError> {
        let metadata = fs::metadata(path).map_err(|source| MonitorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResubmitSummary {
    pub scanned: usize,
    pub resubmitted: usize,
    pub exhausted: usize,
    pub failed: usize,
}

/// Resubmits batches whose scheduler log mentions one of the failure keywords
#[derive(Debug)]
pub struct ResubmissionTracker {
    tree: BatchTree,
    keywords: Vec<String>,
    budget: u32,
    remaining: BTreeMap<String, u32>,
    handled: HashMap<PathBuf, Fingerprint>,
}

fn batch_name(log: &Path) -> Option<String> {
    log.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

impl ResubmissionTracker {
    pub fn new(batch_root: &Path, config: &MonitorConfig) -> Self {
        let tree = BatchTree::new(batch_root);
        let remaining: BTreeMap<String, u32> = tree
            .log_files()
            .iter()
            .filter_map(|log| batch_name(log))
            .map(|name| (name, config.resubmission_budget))
            .collect();

        info!(
            logs = remaining.len(),
            budget = config.resubmission_budget,
            "Initialized resubmission budgets"
        );

        Self {
            tree,
            keywords: config.keywords.clone(),
            budget: config.resubmission_budget,
            remaining,
            handled: HashMap::new(),
        }
    }

    pub fn remaining(&self, batch: &str) -> Option<u32> {
        self.remaining.get(batch).copied()
    }

    pub fn contains_keyword(&self, log: &Path) -> Result<bool, MonitorError> {
        let content = fs::read(log).map_err(|source| MonitorError::Io {
            path: log.to_path_buf(),
            source,
        })?;
        let content = String::from_utf8_lossy(&content);

        Ok(self
            .keywords
            .iter()
            .any(|keyword| content.contains(keyword.as_str())))
    }

    fn remove_output(batch: &BatchPaths) -> Result<(), MonitorError> {
        let output = batch.output_dir();
        warn!(batch = %batch.name(), path = ?output, "Removing output before resubmission");

        match fs::remove_dir_all(&output) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(batch = %batch.name(), "No output folder, nothing to remove");
                Ok(())
            }
            Err(source) => Err(MonitorError::Io {
                path: output,
                source,
            }),
        }
    }

    #[instrument(skip(self, executor), level = "debug")]
    pub fn sweep(&mut self, executor: &dyn Executor) -> Result<ResubmitSummary, MonitorError> {
        let logs = self.tree.log_files();
        let mut summary = ResubmitSummary {
            scanned: logs.len(),
            ..Default::default()
        };

        for log in logs {
            let Some(name) = batch_name(&log) else {
                continue;
            };

            let fingerprint = match Fingerprint::of(&log) {
                Ok(fingerprint) => fingerprint,
                Err(error) => {
                    warn!(error = ?error, "Log vanished while scanning");
                    continue;
                }
            };
            if self.handled.get(&log) == Some(&fingerprint) {
                continue;
            }

            match self.contains_keyword(&log) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    warn!(error = ?error, "Failed to read log");
                    continue;
                }
            }

            debug!(batch = %name, "Found something wrong with the batch");
            let Some(index) = parse_batch_index(&name) else {
                warn!(log = ?log, "Log does not belong to a batch, ignoring it");
                self.handled.insert(log, fingerprint);
                continue;
            };

            let remaining = *self.remaining.entry(name.clone()).or_insert(self.budget);
            if remaining == 0 {
                info!(
                    batch = %name,
                    "Already resubmitted {} times, not resubmitting again",
                    self.budget
                );
                self.handled.insert(log, fingerprint);
                summary.exhausted += 1;
                continue;
            }

            let batch = BatchPaths::new(&self.tree.root, index);
            if let Err(error) = Self::remove_output(&batch) {
                error!(error = ?error, batch = %name, "Failed to remove output, skipping resubmission");
                summary.failed += 1;
                continue;
            }

            match executor.submit(&batch.script()) {
                Ok(submission) => {
                    self.remaining.insert(name.clone(), remaining - 1);
                    self.handled.insert(log, fingerprint);
                    summary.resubmitted += 1;
                    info!(
                        batch = %name,
                        job_id = %submission.job_id,
                        "Resubmitted, {} attempts left",
                        remaining - 1
                    );
                }
                Err(error) => {
                    error!(error = ?error, batch = %name, "Failed to resubmit");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
