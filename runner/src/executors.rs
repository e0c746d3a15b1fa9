pub mod local;
pub mod slurm;

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    process::ProcessError,
};
use std::{fmt, path::Path, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("{command} failed: {stderr}")]
    CommandFailed {
        command: String,
        stdout: String,
        stderr: String,
    },
    #[error("Failed to start {program}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Unexpected scheduler output: {0}")]
    UnexpectedOutput(String),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl From<ProcessError> for ExecutorError {
    fn from(error: ProcessError) -> Self {
        match error {
            ProcessError::Spawn { program, source } => Self::Spawn { program, source },
            ProcessError::Failed {
                program,
                stdout,
                stderr,
                ..
            } => Self::CommandFailed {
                command: program,
                stdout,
                stderr,
            },
        }
    }
}

/// Job states as reported by `squeue --format=%T`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Completing,
    Completed,
    Configuring,
    Suspended,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    Preempted,
    OutOfMemory,
    Other(String),
}

impl FromStr for JobStatus {
    type Err = std::convert::Infallible;

    fn from_str(status: &str) -> Result<Self, Self::Err> {
        Ok(match status.trim().to_uppercase().as_str() {
            "PENDING" | "PD" => Self::Pending,
            "RUNNING" | "R" => Self::Running,
            "COMPLETING" | "CG" => Self::Completing,
            "COMPLETED" | "CD" => Self::Completed,
            "CONFIGURING" | "CF" => Self::Configuring,
            "SUSPENDED" | "S" => Self::Suspended,
            "FAILED" | "F" => Self::Failed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "TIMEOUT" | "TO" => Self::Timeout,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "PREEMPTED" | "PR" => Self::Preempted,
            "OUT_OF_MEMORY" | "OOM" => Self::OutOfMemory,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completing => "COMPLETING",
            Self::Completed => "COMPLETED",
            Self::Configuring => "CONFIGURING",
            Self::Suspended => "SUSPENDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::NodeFail => "NODE_FAIL",
            Self::Preempted => "PREEMPTED",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Other(other) => other.as_str(),
        };

        f.write_str(name)
    }
}

/// Snapshot of one scheduler entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub reason: String,
    pub partition: String,
    pub nodes: String,
    pub name: String,
}

/// Format string handed to `squeue`, parsed by [`JobState::parse`]
pub const QUEUE_FORMAT: &str = "%i|%T|%r|%P|%N|%j";

impl JobState {
    pub fn parse(line: &str) -> Option<Self> {
        // the job name comes last since it may contain the separator
        let mut fields = line.trim().splitn(6, '|');
        let job_id = fields.next()?.trim();

        if job_id.is_empty() {
            return None;
        }

        Some(Self {
            job_id: job_id.to_string(),
            status: fields.next()?.parse().ok()?,
            reason: fields.next()?.trim().to_string(),
            partition: fields.next()?.trim().to_string(),
            nodes: fields.next()?.trim().to_string(),
            name: fields.next()?.trim().to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    pub stdout: String,
    pub stderr: String,
}

/// Parse the id out of `Submitted batch job <id>`
pub fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Submitted batch job "))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && id.bytes().all(|byte| byte.is_ascii_digit()))
}

/// A job scheduler the batch engine can submit to and observe
pub trait Executor {
    fn submit(&self, script: &Path) -> Result<Submission, ExecutorError>;

    /// entries of the queue, optionally limited to the current user
    fn queue(&self, mine_only: bool) -> Result<Vec<JobState>, ExecutorError>;

    fn update_partition(&self, job_id: &str, partition: &str) -> Result<(), ExecutorError>;
}

#[derive(Debug)]
pub enum Executors {
    Slurm(slurm::SlurmExecutor),
    Local(local::LocalExecutor),
}

impl Executors {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        match config.name.as_str() {
            "slurm" => Ok(Self::Slurm(slurm::SlurmExecutor::default())),
            "local" => Ok(Self::Local(local::LocalExecutor::default())),
            _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
        }
    }

    fn inner(&self) -> &dyn Executor {
        match self {
            Self::Slurm(executor) => executor,
            Self::Local(executor) => executor,
        }
    }
}

impl Executor for Executors {
    fn submit(&self, script: &Path) -> Result<Submission, ExecutorError> {
        self.inner().submit(script)
    }

    fn queue(&self, mine_only: bool) -> Result<Vec<JobState>, ExecutorError> {
        self.inner().queue(mine_only)
    }

    fn update_partition(&self, job_id: &str, partition: &str) -> Result<(), ExecutorError> {
        self.inner().update_partition(job_id, partition)
    }
}

#[cfg(test)]
mod executors_test;
