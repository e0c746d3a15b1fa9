use super::MonitorError;
use crate::{
    config::ExecutorConfig,
    executors::{Executor, JobState, JobStatus},
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error, info};

/// Scheduler reasons reported when the node under a job disappeared
pub const PREEMPTION_REASONS: [&str; 4] = ["NodeFail", "NodeDown", "NodeNotAvail", "NodeTerminated"];

/// A job went from RUNNING on a volatile partition back to PENDING because its node vanished
pub fn validate_preemption(old: &JobState, new: &JobState, volatile: &BTreeSet<String>) -> bool {
    if old.status != JobStatus::Running || new.status != JobStatus::Pending {
        return false;
    }

    if !volatile.contains(&old.partition) {
        return false;
    }

    if !PREEMPTION_REASONS.contains(&new.reason.as_str()) {
        debug!(
            job_id = %new.job_id,
            reason = %new.reason,
            "Status change is not caused by a preemption"
        );
        return false;
    }

    info!(
        job_id = %new.job_id,
        "Validated preemption {} -> {}, reason: {}",
        old.status,
        new.status,
        new.reason
    );
    true
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub observed: usize,
    pub rolled_back: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Moves preempted spot jobs onto the fallback partition
#[derive(Debug)]
pub struct PreemptionTracker {
    volatile: BTreeSet<String>,
    fallback: String,
    jobs: HashMap<String, JobState>,
    preemptions: BTreeMap<String, u32>,
}

impl PreemptionTracker {
    pub fn new(config: &ExecutorConfig) -> Self {
        info!(
            volatile = ?config.volatile_partitions,
            fallback = %config.fallback_partition,
            "Initialized preemption tracking"
        );

        Self {
            volatile: config.volatile_partitions.clone(),
            fallback: config.fallback_partition.clone(),
            jobs: HashMap::new(),
            preemptions: BTreeMap::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.jobs.len()
    }

    pub fn preemption_count(&self, job_id: &str) -> u32 {
        self.preemptions.get(job_id).copied().unwrap_or(0)
    }

    pub fn total_preemptions(&self) -> u32 {
        self.preemptions.values().sum()
    }

    /// Compare a queue snapshot against the last one, roll back validated preemptions
    pub fn observe(&mut self, snapshot: Vec<JobState>, executor: &dyn Executor) -> SweepSummary {
        let mut summary = SweepSummary {
            observed: snapshot.len(),
            ..Default::default()
        };
        let mut current = HashMap::with_capacity(snapshot.len());

        for state in snapshot {
            match self.jobs.get(&state.job_id) {
                Some(old) if validate_preemption(old, &state, &self.volatile) => {
                    match executor.update_partition(&state.job_id, &self.fallback) {
                        Ok(()) => {
                            let count = self.preemptions.entry(state.job_id.clone()).or_default();
                            *count += 1;
                            info!(
                                job_id = %state.job_id,
                                "Rolled back to partition '{}' (preemption #{})",
                                self.fallback,
                                count
                            );
                            summary.rolled_back += 1;
                        }
                        Err(error) => {
                            error!(error = ?error, job_id = %state.job_id, "Failed to roll back job");
                            summary.failed += 1;
                        }
                    }
                }
                Some(_) => {}
                None => debug!(
                    job_id = %state.job_id,
                    status = %state.status,
                    partition = %state.partition,
                    "Tracking job"
                ),
            }

            current.insert(state.job_id.clone(), state);
        }

        // counters survive pruning, they are only used for reporting
        summary.pruned = self
            .jobs
            .keys()
            .filter(|job_id| !current.contains_key(*job_id))
            .count();
        self.jobs = current;

        if summary.rolled_back > 0 {
            info!(
                "Cycle complete: {} new preemptions, {} handled in total",
                summary.rolled_back,
                self.total_preemptions()
            );
        }

        summary
    }

    pub fn sweep(&mut self, executor: &dyn Executor) -> Result<SweepSummary, MonitorError> {
        let snapshot = executor.queue(true)?;
        Ok(self.observe(snapshot, executor))
    }
}
