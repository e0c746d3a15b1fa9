use super::{Executor, ExecutorError, JobState, JobStatus, Submission};
use parking_lot::FairMutex;
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Scheduler directives the local executor honours
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Directives {
    pub job_name: Option<String>,
    pub output: Option<PathBuf>,
}

impl Directives {
    pub fn parse(script: &str) -> Self {
        let mut directives = Self::default();

        for line in script.lines() {
            let Some(directive) = line.trim().strip_prefix("#SBATCH") else {
                continue;
            };
            let mut words = directive.split_whitespace();

            while let Some(word) = words.next() {
                let (key, inline) = match word.split_once('=') {
                    Some((key, value)) => (key, Some(value)),
                    None => (word, None),
                };

                match key {
                    "--job-name" | "-J" => {
                        directives.job_name = inline
                            .or_else(|| words.next())
                            .map(|name| name.trim_matches('"').to_string());
                    }
                    "--output" | "-o" => {
                        directives.output = inline
                            .or_else(|| words.next())
                            .map(|path| PathBuf::from(path.trim_matches('"')));
                    }
                    _ => {}
                }
            }
        }

        directives
    }
}

#[derive(Debug)]
struct LocalJob {
    name: String,
    child: Child,
    started: Instant,
}

/// Executor that runs job scripts with `bash` on this machine
#[derive(Debug)]
pub struct LocalExecutor {
    jobs: Arc<FairMutex<BTreeMap<u64, LocalJob>>>,
    next_id: AtomicU64,
    shell: String,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self {
            jobs: Arc::new(FairMutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
            shell: "bash".to_string(),
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn open_log(path: &Path) -> Result<File, ExecutorError> {
    let io_error = |source| ExecutorError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)
}

impl LocalExecutor {
    /// Wait for all running jobs, jobs still running after `timeout` are killed
    #[instrument(skip(self), level = "info")]
    pub fn wait(&self, timeout: Option<Duration>) -> Vec<(String, Option<ExitStatus>)> {
        let mut jobs = self.jobs.lock_arc();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let total = jobs.len();
        let mut finished = Vec::with_capacity(total);

        for (id, mut job) in std::mem::take(&mut *jobs) {
            let status = match deadline {
                None => job.child.wait().map(Some),
                Some(deadline) => job
                    .child
                    .wait_timeout(deadline.saturating_duration_since(Instant::now())),
            };

            let status = match status {
                Ok(Some(status)) => {
                    debug!(
                        "Job {id} ({}) finished after {} ms | status: {}",
                        job.name,
                        job.started.elapsed().as_millis(),
                        status.success()
                    );
                    Some(status)
                }
                Ok(None) => {
                    warn!(job = %job.name, "Job ran into timeout, killing it");
                    if let Err(error) = job.child.kill() {
                        error!(error = ?error, "Failed to kill job");
                    }
                    let _ = job.child.wait();
                    None
                }
                Err(error) => {
                    error!(error = ?error, job = %job.name, "Failed to wait for job");
                    None
                }
            };

            info!("Done with {}/{}", finished.len() + 1, total);
            finished.push((job.name, status));
        }

        finished
    }
}

impl Executor for LocalExecutor {
    fn submit(&self, script: &Path) -> Result<Submission, ExecutorError> {
        let content = fs::read_to_string(script).map_err(|source| ExecutorError::Io {
            path: script.to_path_buf(),
            source,
        })?;
        let directives = Directives::parse(&content);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = directives
            .job_name
            .unwrap_or_else(|| script.to_string_lossy().into_owned());

        let (stdout, stderr) = match directives.output {
            Some(ref output) => {
                let log = open_log(output)?;
                let log_err = log.try_clone().map_err(|source| ExecutorError::Io {
                    path: output.clone(),
                    source,
                })?;
                (Stdio::from(log), Stdio::from(log_err))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let child = Command::new(&self.shell)
            .arg(script)
            .current_dir(script.parent().unwrap_or_else(|| Path::new(".")))
            .env("SLURM_JOB_ID", id.to_string())
            .env("SLURM_JOB_NODELIST", hostname())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.shell.clone(),
                source,
            })?;

        debug!(job_id = id, job = %name, pid = child.id(), "Started local job");
        self.jobs.lock().insert(
            id,
            LocalJob {
                name,
                child,
                started: Instant::now(),
            },
        );

        Ok(Submission {
            job_id: id.to_string(),
            stdout: format!("Submitted batch job {id}"),
            stderr: String::new(),
        })
    }

    fn queue(&self, _mine_only: bool) -> Result<Vec<JobState>, ExecutorError> {
        let mut jobs = self.jobs.lock();
        let node = hostname();

        // finished jobs leave the queue the way they leave squeue
        jobs.retain(|id, job| match job.child.try_wait() {
            Ok(Some(status)) => {
                debug!(job_id = id, status = ?status, "Local job left the queue");
                false
            }
            Ok(None) => true,
            Err(error) => {
                warn!(error = ?error, job_id = id, "Failed to poll local job");
                true
            }
        });

        Ok(jobs
            .iter()
            .map(|(id, job)| JobState {
                job_id: id.to_string(),
                status: JobStatus::Running,
                reason: "None".to_string(),
                partition: "local".to_string(),
                nodes: node.clone(),
                name: job.name.clone(),
            })
            .collect())
    }

    fn update_partition(&self, job_id: &str, partition: &str) -> Result<(), ExecutorError> {
        warn!(
            job_id = job_id,
            partition = partition,
            "The local executor has no partitions, ignoring the update"
        );

        Ok(())
    }
}
