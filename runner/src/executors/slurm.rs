use super::{parse_job_id, Executor, ExecutorError, JobState, Submission, QUEUE_FORMAT};
use crate::process::{capture, command};
use std::path::Path;
use tracing::{debug, info, warn};

/// Executor backed by the Slurm command line tools
#[derive(Clone, Debug)]
pub struct SlurmExecutor {
    pub sbatch: String,
    pub squeue: String,
    pub scontrol: String,
}

impl Default for SlurmExecutor {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            scontrol: "scontrol".to_string(),
        }
    }
}

impl Executor for SlurmExecutor {
    fn submit(&self, script: &Path) -> Result<Submission, ExecutorError> {
        let captured = capture(command(&self.sbatch, [script]).current_dir(
            script.parent().unwrap_or_else(|| Path::new(".")),
        ))?;

        let job_id = parse_job_id(&captured.stdout)
            .ok_or_else(|| ExecutorError::UnexpectedOutput(captured.stdout.clone()))?;
        info!(job_id = %job_id, script = ?script, "Submitted job");

        Ok(Submission {
            job_id,
            stdout: captured.stdout,
            stderr: captured.stderr,
        })
    }

    fn queue(&self, mine_only: bool) -> Result<Vec<JobState>, ExecutorError> {
        let mut squeue = command(&self.squeue, ["--noheader"]);
        squeue.arg(format!("--format={QUEUE_FORMAT}"));
        if mine_only {
            squeue.arg("--me");
        }

        let captured = capture(&mut squeue)?;

        Ok(captured
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let state = JobState::parse(line);
                if state.is_none() {
                    warn!(line = line, "Skipping unparsable squeue line");
                }
                state
            })
            .collect())
    }

    fn update_partition(&self, job_id: &str, partition: &str) -> Result<(), ExecutorError> {
        debug!(job_id = job_id, partition = partition, "Moving job");
        capture(
            command(&self.scontrol, ["update"])
                .arg(format!("JobID={job_id}"))
                .arg(format!("Partition={partition}")),
        )?;

        Ok(())
    }
}
