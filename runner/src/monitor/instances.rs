use super::MonitorError;
use crate::{
    batch::{index_from_job_name, BatchPaths},
    config::InstanceConfig,
    executors::Executor,
    process::{capture, command},
};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, error, warn};

pub const TERMINATED: &str = "TERMINATED";

/// Source of virtual machine states keyed by instance name
pub trait InstanceProvider {
    fn statuses(&self, names: &BTreeSet<String>) -> Result<BTreeMap<String, String>, MonitorError>;
}

#[derive(Deserialize, Debug)]
struct InstanceRecord {
    name: String,
    status: String,
}

/// `gcloud compute instances list`
#[derive(Clone, Debug)]
pub struct GcloudInstances {
    pub gcloud: String,
    pub project: Option<String>,
    pub zone: String,
}

impl GcloudInstances {
    pub fn new(config: &InstanceConfig) -> Self {
        Self {
            gcloud: "gcloud".to_string(),
            project: config.project.clone(),
            zone: config.zone.clone(),
        }
    }
}

pub fn parse_instance_list(
    json: &str,
    names: &BTreeSet<String>,
) -> Result<BTreeMap<String, String>, MonitorError> {
    let records: Vec<InstanceRecord> = serde_json::from_str(json)?;

    Ok(records
        .into_iter()
        .filter(|record| names.contains(&record.name))
        .map(|record| (record.name, record.status))
        .collect())
}

impl InstanceProvider for GcloudInstances {
    fn statuses(&self, names: &BTreeSet<String>) -> Result<BTreeMap<String, String>, MonitorError> {
        let mut gcloud = command(&self.gcloud, ["compute", "instances", "list", "--format=json"]);
        gcloud.arg(format!("--zones={}", self.zone));
        if let Some(ref project) = self.project {
            gcloud.arg(format!("--project={project}"));
        }

        let captured = capture(&mut gcloud)?;
        let statuses = parse_instance_list(&captured.stdout, names)?;
        debug!(instances = ?statuses, "Latest instance states");

        Ok(statuses)
    }
}

/// Deletes the output of batches whose spot instance was terminated
pub struct InstanceWatcher {
    provider: Box<dyn InstanceProvider>,
    names: BTreeSet<String>,
    batch_root: PathBuf,
    // (instance, job id) pairs whose output was already removed
    handled: BTreeSet<(String, String)>,
}

impl InstanceWatcher {
    pub fn new(provider: Box<dyn InstanceProvider>, config: &InstanceConfig, batch_root: &Path) -> Self {
        Self {
            provider,
            names: (0..config.count)
                .map(|index| format!("{}{index}", config.name_prefix))
                .collect(),
            batch_root: batch_root.to_path_buf(),
            handled: BTreeSet::new(),
        }
    }

    /// Returns the indices of the batches whose output was removed
    pub fn sweep(&mut self, executor: &dyn Executor) -> Result<Vec<usize>, MonitorError> {
        let statuses = self.provider.statuses(&self.names)?;
        let terminated: BTreeSet<&String> = statuses
            .iter()
            .filter(|(_, status)| status.as_str() == TERMINATED)
            .map(|(name, _)| name)
            .collect();

        self.handled
            .retain(|(instance, _)| terminated.contains(instance));
        if terminated.is_empty() {
            return Ok(Vec::new());
        }

        let queue = executor.queue(false)?;
        let mut removed = Vec::new();

        for instance in terminated {
            debug!(instance = %instance, "Instance is terminated");

            for job in queue.iter().filter(|job| &job.nodes == instance) {
                let key = (instance.clone(), job.job_id.clone());
                if self.handled.contains(&key) {
                    continue;
                }

                let Some(index) = index_from_job_name(&job.name) else {
                    warn!(job = %job.name, "Job on a terminated instance does not belong to a batch");
                    continue;
                };

                let output = BatchPaths::new(&self.batch_root, index).output_dir();
                warn!(instance = %instance, batch = index, path = ?output, "Deleting output of a batch on a terminated instance");

                match fs::remove_dir_all(&output) {
                    Ok(()) => removed.push(index),
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {
                        debug!(batch = index, "Output already gone");
                    }
                    Err(error) => {
                        error!(error = ?error, batch = index, "Failed to delete output");
                        continue;
                    }
                }

                self.handled.insert(key);
            }
        }

        Ok(removed)
    }
}
