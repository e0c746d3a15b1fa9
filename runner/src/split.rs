pub mod cells;
pub mod script;
pub mod slice;

use crate::{
    arrays::{ArrayBackends, ArrayError},
    batch::{
        batch_index_from_path, job_name, BatchEntry, BatchPaths, BatchSet, ManifestError,
        SplitAxis, SplitMode, MANIFEST_FILE,
    },
    collector::BatchTree,
    config::{Environment, Layout, RunnerConfig},
    executors::{Executor, ExecutorError, Submission},
    model_config::{ModelConfig, ModelConfigError},
    runmask::{Cell, RunMask, RunMaskError},
};
use ignore::WalkBuilder;
use parking_lot::FairMutex;
use rayon::{prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};
use script::{shell_quote, JobTemplate, TemplateError, SLURM_RUNNER, SPLIT_JOB};
use slice::{Domain, InputLayout, SliceTask, RUN_MASK_FILE};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Input directory {0} does not exist")]
    InputMissing(PathBuf),
    #[error("Input directory {0} mixes files and directories")]
    MixedInput(PathBuf),
    #[error("Chunk directory {0} is not named <start>_<end>")]
    ChunkName(PathBuf),
    #[error("Chunked inputs can only be split spatially")]
    ChunkedCellCount,
    #[error("Inconsistent domain: {0}")]
    DomainMismatch(String),
    #[error("Cells per batch must be at least 1")]
    InvalidCellsPerBatch,
    #[error("Batch {0} has no enabled cell")]
    EmptyBatch(usize),
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    RunMask(#[from] RunMaskError),
    #[error(transparent)]
    ModelConfig(#[from] ModelConfigError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Failed to submit the split job")]
    Executor(#[from] ExecutorError),
    #[error("Failed to start the split thread pools")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SplitError + '_ {
    move |source| SplitError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Arguments handed through to the model binary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelArguments {
    pub log_level: String,
    pub p: u32,
    pub e: u32,
    pub s: u32,
    pub t: u32,
    pub n: u32,
}

impl Default for ModelArguments {
    fn default() -> Self {
        Self {
            log_level: "disabled".to_string(),
            p: 100,
            e: 1000,
            s: 250,
            t: 115,
            n: 85,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SplitOptions {
    pub input: PathBuf,
    pub cells_per_batch: Option<usize>,
    pub partition: String,
    pub model: ModelArguments,
    // true when running inside the self submitted job
    pub in_job: bool,
    // command line used to re-run the split inside a job
    pub invocation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitFailure {
    pub batch: Option<usize>,
    pub target: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct SplitReport {
    pub batches: usize,
    pub failures: Vec<SplitFailure>,
}

impl SplitReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub enum SplitOutcome {
    Split(SplitReport),
    Dispatched(Submission),
}

/// Copy a directory tree, used for the per batch parameter folder
fn copy_tree(src: &Path, dst: &Path) -> Result<(), SplitError> {
    for entry in WalkBuilder::new(src).standard_filters(false).build() {
        let entry = entry.map_err(|error| SplitError::Io {
            path: src.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, error),
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().map_or(false, |kind| kind.is_dir()) {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_error(entry.path()))?;
        }
    }

    Ok(())
}

/// Splits an input domain into independently runnable batches
pub struct Partitioner<'a> {
    pub config: &'a RunnerConfig,
    pub layout: &'a Layout,
    pub environment: &'a Environment,
    pub arrays: &'a ArrayBackends,
}

impl<'a> Partitioner<'a> {
    pub fn new(
        config: &'a RunnerConfig,
        layout: &'a Layout,
        environment: &'a Environment,
        arrays: &'a ArrayBackends,
    ) -> Self {
        Self {
            config,
            layout,
            environment,
            arrays,
        }
    }

    fn job_prefix(&self) -> String {
        self.layout
            .batch_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bp".to_string())
    }

    #[instrument(skip(self, executor), level = "info")]
    pub fn run(
        &self,
        options: &SplitOptions,
        executor: &dyn Executor,
    ) -> Result<SplitOutcome, SplitError> {
        let input = InputLayout::discover(&options.input)?;
        let domain = Domain::discover(self.arrays, &input)?;
        info!(
            x = domain.x_len,
            y = domain.y_len,
            "Discovered a domain with {} cells",
            domain.cells()
        );

        if domain.cells() >= self.config.split.self_submit_cells && !options.in_job {
            return self.dispatch(options, executor).map(SplitOutcome::Dispatched);
        }

        // preconditions are checked before anything is removed
        match (options.cells_per_batch, &input) {
            (Some(0), _) => return Err(SplitError::InvalidCellsPerBatch),
            (Some(_), InputLayout::Chunked(_)) => return Err(SplitError::ChunkedCellCount),
            _ => {}
        }

        let global = ModelConfig::load(&self.layout.config_path)?;

        self.clean()?;
        fs::create_dir_all(self.layout.log_dir()).map_err(io_error(&self.layout.batch_root))?;

        let report = match (options.cells_per_batch, &input) {
            (Some(per_batch), InputLayout::Flat(dir)) => {
                self.split_cells(options, dir, &domain, per_batch, global)?
            }
            _ => self.split_slices(options, &input, &domain, &global)?,
        };

        if report.is_success() {
            info!("Split the domain into {} batches", report.batches);
        } else {
            error!(
                "Split into {} batches with {} failed tasks",
                report.batches,
                report.failures.len()
            );
        }

        Ok(SplitOutcome::Split(report))
    }

    /// Re-run this split as a scheduled job on the split partition
    fn dispatch(&self, options: &SplitOptions, executor: &dyn Executor) -> Result<Submission, SplitError> {
        let mut command = options.invocation.iter().map(|word| shell_quote(word)).collect::<Vec<_>>();
        command.push("--in-job".to_string());

        let values = BTreeMap::from([
            ("job_name", "split-input-job".to_string()),
            ("partition", self.config.split.partition.clone()),
            (
                "log_path",
                self.layout.work_dir.join("split.log").to_string_lossy().into_owned(),
            ),
            ("user", self.environment.user.clone()),
            ("command", command.join(" ")),
        ]);
        let rendered = JobTemplate::new(SPLIT_JOB).render(&values)?;
        let script = self.layout.work_dir.join("split_job.sh");

        fs::create_dir_all(&self.layout.work_dir).map_err(io_error(&self.layout.work_dir))?;
        fs::write(&script, rendered).map_err(io_error(&script))?;

        info!(
            partition = %self.config.split.partition,
            "The domain is large, the split continues as a job"
        );
        Ok(executor.submit(&script)?)
    }

    /// Remove batches and scheduler logs of an earlier split
    fn clean(&self) -> Result<(), SplitError> {
        let tree = BatchTree::new(&self.layout.batch_root);

        for batch in tree.batches() {
            warn!(path = ?batch.dir, "Removing batch of an earlier split");
            fs::remove_dir_all(&batch.dir).map_err(io_error(&batch.dir))?;
        }

        for log in tree.log_files() {
            debug!(path = ?log, "Removing stale scheduler log");
            fs::remove_file(&log).map_err(io_error(&log))?;
        }

        let manifest = self.layout.batch_root.join(MANIFEST_FILE);
        if manifest.is_file() {
            fs::remove_file(&manifest).map_err(io_error(&manifest))?;
        }

        Ok(())
    }

    fn render_script(&self, batch: &BatchPaths, options: &SplitOptions) -> Result<(), SplitError> {
        let template = JobTemplate::load_or(self.config.split.template.as_deref(), SLURM_RUNNER)?;
        let values = BTreeMap::from([
            ("job_name", job_name(&self.job_prefix(), batch.index)),
            ("partition", options.partition.clone()),
            (
                "dvmdostem_binary",
                self.layout.dvmdostem_bin.to_string_lossy().into_owned(),
            ),
            (
                "log_file_path",
                self.layout
                    .log_dir()
                    .join(format!("{}.out", batch.name()))
                    .to_string_lossy()
                    .into_owned(),
            ),
            ("log_level", options.model.log_level.clone()),
            ("config_path", batch.config().to_string_lossy().into_owned()),
            ("p", options.model.p.to_string()),
            ("e", options.model.e.to_string()),
            ("s", options.model.s.to_string()),
            ("t", options.model.t.to_string()),
            ("n", options.model.n.to_string()),
            ("user", self.environment.user.clone()),
            ("batch_dir", batch.dir.to_string_lossy().into_owned()),
        ]);

        let script = batch.script();
        fs::write(&script, template.render(&values)?).map_err(io_error(&script))
    }

    fn split_cells(
        &self,
        options: &SplitOptions,
        input: &Path,
        domain: &Domain,
        per_batch: usize,
        mut global: ModelConfig,
    ) -> Result<SplitReport, SplitError> {
        let mask = RunMask::load(self.arrays, &input.join(RUN_MASK_FILE))?;
        let groups = cells::assign_cells(&mask.enabled_cells(), per_batch);
        let axis = SplitAxis::larger(domain.x_len, domain.y_len);
        info!(
            cells = mask.count(),
            batches = cells::batch_count(mask.count(), per_batch),
            "Splitting by cell count"
        );

        global.retarget_inputs(input)?;

        let failures = FairMutex::new(Vec::new());
        let processed = AtomicU64::new(0);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_cpus::get() * 2)
            .build()?;

        pool.install(|| {
            groups.par_iter().enumerate().for_each(|(index, cells)| {
                let batch = BatchPaths::new(&self.layout.batch_root, index);

                if let Err(failure) = self.setup_cell_batch(&batch, cells, &mask, &global, options) {
                    error!(batch = %batch.name(), error = %failure, "Failed to set up batch");
                    failures.lock().push(SplitFailure {
                        batch: Some(index),
                        target: batch.dir.clone(),
                        reason: failure.to_string(),
                    });
                }

                debug!(
                    "Done with {}/{}",
                    processed.fetch_add(1, Ordering::SeqCst) + 1,
                    groups.len()
                );
            })
        });

        BatchSet {
            mode: SplitMode::CellCount,
            axis,
            batches: groups
                .iter()
                .enumerate()
                .map(|(index, cells)| BatchEntry {
                    index,
                    extent: domain.axis_len(axis),
                    cells: cells.clone(),
                })
                .collect(),
        }
        .store(&self.layout.batch_root)?;

        Ok(SplitReport {
            batches: groups.len(),
            failures: failures.into_inner(),
        })
    }

    fn setup_cell_batch(
        &self,
        batch: &BatchPaths,
        cells: &[Cell],
        mask: &RunMask,
        global: &ModelConfig,
        options: &SplitOptions,
    ) -> Result<(), SplitError> {
        if cells.is_empty() {
            return Err(SplitError::EmptyBatch(batch.index));
        }

        fs::create_dir_all(batch.output_dir()).map_err(io_error(&batch.dir))?;

        let mut batch_mask = mask.zeroed();
        for cell in cells {
            batch_mask.enable(*cell)?;
        }
        batch_mask.write(self.arrays, &batch.runmask())?;

        let mut config = global.clone();
        config.localize_outputs(&batch.dir)?;
        config.write(&batch.config())?;

        self.render_script(batch, options)
    }

    fn split_slices(
        &self,
        options: &SplitOptions,
        input: &InputLayout,
        domain: &Domain,
        global: &ModelConfig,
    ) -> Result<SplitReport, SplitError> {
        let axis = SplitAxis::larger(domain.x_len, domain.y_len);
        let count = domain.axis_len(axis);
        let batches = (0..count)
            .map(|index| BatchPaths::new(&self.layout.batch_root, index))
            .collect::<Vec<_>>();
        info!(axis = %axis, batches = count, "Splitting spatially");

        // every task writes into an existing directory
        for batch in &batches {
            for dir in [batch.input_dir(), batch.output_dir(), batch.dir.join("config")] {
                fs::create_dir_all(&dir).map_err(io_error(&dir))?;
            }
        }

        let tasks = slice::plan(input, domain, axis, &self.layout.batch_root);
        let failures = FairMutex::new(Vec::new());
        let total = tasks.len() + batches.len();
        let processed = AtomicU64::new(0);

        let slice_pool = ThreadPoolBuilder::new().num_threads(num_cpus::get()).build()?;
        let io_pool = ThreadPoolBuilder::new()
            .num_threads(num_cpus::get() * 2)
            .build()?;

        let progress = || {
            debug!(
                "Done with {}/{}",
                processed.fetch_add(1, Ordering::SeqCst) + 1,
                total
            );
        };

        thread::scope(|scope| {
            scope.spawn(|| {
                slice_pool.install(|| {
                    tasks.par_iter().for_each(|task| {
                        if let Err(failure) = task.run(self.arrays) {
                            let target = task.destination().to_path_buf();
                            error!(target = ?target, error = %failure, "Slicing task failed");
                            failures.lock().push(SplitFailure {
                                batch: batch_index_from_path(&target),
                                target,
                                reason: failure.to_string(),
                            });
                        }
                        progress();
                    })
                })
            });

            scope.spawn(|| {
                io_pool.install(|| {
                    batches.par_iter().for_each(|batch| {
                        if let Err(failure) = self.setup_slice_batch(batch, global, options) {
                            error!(batch = %batch.name(), error = %failure, "Failed to configure batch");
                            failures.lock().push(SplitFailure {
                                batch: Some(batch.index),
                                target: batch.dir.clone(),
                                reason: failure.to_string(),
                            });
                        }
                        progress();
                    })
                })
            });
        });

        BatchSet {
            mode: SplitMode::SpatialSlice,
            axis,
            batches: batches
                .iter()
                .map(|batch| BatchEntry {
                    index: batch.index,
                    extent: 1,
                    cells: Vec::new(),
                })
                .collect(),
        }
        .store(&self.layout.batch_root)?;

        let mut failures = failures.into_inner();
        failures.sort_by_key(|failure| failure.batch);

        Ok(SplitReport {
            batches: count,
            failures,
        })
    }

    fn setup_slice_batch(
        &self,
        batch: &BatchPaths,
        global: &ModelConfig,
        options: &SplitOptions,
    ) -> Result<(), SplitError> {
        let mut config = global.clone();
        config.localize(&batch.dir)?;
        config.write(&batch.config())?;

        if self.layout.parameters_path.is_dir() {
            copy_tree(&self.layout.parameters_path, &batch.dir.join("parameters"))?;
        } else {
            warn!(path = ?self.layout.parameters_path, "Parameter directory not found, batch will lack it");
        }

        if self.layout.output_spec_path.is_file() {
            let target = batch.dir.join("config").join("output_spec.csv");
            fs::copy(&self.layout.output_spec_path, &target).map_err(io_error(&target))?;
        }

        self.render_script(batch, options)
    }
}
