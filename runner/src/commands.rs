pub mod batch;
pub mod setup;
pub mod workers;

use crate::{
    arrays::{ArrayBackends, ArrayError},
    batch::ManifestError,
    config::{ConfigErrors, Environment, Layout, RunnerConfig},
    elapsed::ElapsedError,
    executors::{ExecutorError, Executors},
    merge::MergeError,
    model_config::ModelConfigError,
    monitor::MonitorError,
    runmask::RunMaskError,
    split::SplitError,
    status::StatusError,
};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    ModelConfig(#[from] ModelConfigError),
    #[error(transparent)]
    RunMask(#[from] RunMaskError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Elapsed(#[from] ElapsedError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("No batch directories found below {0}, run `bp batch split` first")]
    NoBatches(PathBuf),
    #[error("Split finished with {0} failed tasks")]
    SplitFailed(usize),
    #[error("Cell (X={x}, Y={y}) is outside of the {x_len}x{y_len} domain")]
    CellOutOfRange {
        x: usize,
        y: usize,
        x_len: usize,
        y_len: usize,
    },
    #[error("{failed} of {total} {what} failed")]
    Partial {
        what: &'static str,
        failed: usize,
        total: usize,
    },
    #[error("Run status check flagged {0} batches")]
    Flagged(usize),
    #[error(transparent)]
    Glob(#[from] globset::Error),
    #[error("The directories hold a different number of files: {left} and {right}")]
    FileCountMismatch { left: usize, right: usize },
    #[error("{0} file pairs are not the same")]
    Differs(usize),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CommandError + '_ {
    move |source| CommandError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Everything a command needs, resolved once at start up
#[derive(Debug)]
pub struct Context {
    pub environment: Environment,
    pub config: RunnerConfig,
    pub layout: Layout,
    pub executor: Executors,
    pub arrays: ArrayBackends,
    // global arguments handed to re-spawned background workers
    pub forwarded: Vec<OsString>,
}

impl Context {
    pub fn load(
        config_path: Option<&Path>,
        batches: Option<&Path>,
        forwarded: Vec<OsString>,
    ) -> Result<Self, CommandError> {
        let environment = Environment::capture()?;
        environment.ensure_not_root()?;

        let mut config = RunnerConfig::load(config_path, &environment)?;
        if config.preflight_checks() {
            error!("Please fix the runner configuration before continuing");
            return Err(ConfigErrors::PreflightFailed.into());
        }

        Self::new(environment, config, batches, forwarded)
    }

    pub fn new(
        environment: Environment,
        config: RunnerConfig,
        batches: Option<&Path>,
        forwarded: Vec<OsString>,
    ) -> Result<Self, CommandError> {
        let layout = Layout::new(&config, &environment).with_batch_root(batches);
        let executor = Executors::load(&config.executor)?;
        let arrays = ArrayBackends::load(&config.arrays)?;
        debug!(layout = ?layout, "Resolved paths");

        Ok(Self {
            environment,
            config,
            layout,
            executor,
            arrays,
            forwarded,
        })
    }

    /// arguments re-spawning this binary with the same global options and `args`
    pub fn worker_args<I, S>(&self, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.forwarded
            .iter()
            .cloned()
            .chain(args.into_iter().map(Into::into))
            .collect()
    }
}

/// A single `bp` subcommand
pub trait Command {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError>;
}
