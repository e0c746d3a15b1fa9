use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    env,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// folder name of the model installation below `basedir`
pub const DVMDOSTEM_FOLDER: &str = "dvm-dos-tem";
/// default location of the runner configuration below `$HOME`
pub const DEFAULT_CONFIG_FILE: &str = ".bpconfig.yaml";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Array backend not supported: {0}")]
    UnsupportedArrayBackend(String),
    #[error("Monitor strategy not supported: {0}")]
    UnsupportedStrategy(String),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to parse the runner configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("Environment variable {0} is not set")]
    MissingEnvironment(&'static str),
    #[error("Do not run as root or with sudo")]
    RunningAsRoot,
    #[error("The runner configuration contains errors, see the log above")]
    PreflightFailed,
}

/// Process environment, captured once at start up and passed around explicitly
#[derive(Clone, Debug)]
pub struct Environment {
    pub home: PathBuf,
    pub user: String,
    pub is_root: bool,
}

impl Environment {
    pub fn capture() -> Result<Self, ConfigErrors> {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or(ConfigErrors::MissingEnvironment("HOME"))?;
        let user = env::var("USER").map_err(|_| ConfigErrors::MissingEnvironment("USER"))?;

        Ok(Self {
            home,
            user,
            is_root: nix::unistd::getuid().is_root(),
        })
    }

    pub fn ensure_not_root(&self) -> Result<(), ConfigErrors> {
        if self.is_root || self.user == "root" {
            Err(ConfigErrors::RunningAsRoot)
        } else {
            Ok(())
        }
    }

    /// expand a leading `~` since the model binary can't interpret it
    pub fn expand(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("~") {
            Ok(rest) => self.home.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // installation root that contains the dvm-dos-tem folder
    #[serde(default = "default_basedir")]
    pub basedir: PathBuf,
    // shared file system directory of the user, defaults to /mnt/exacloud/$USER
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub arrays: ArrayConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub elapsed: ElapsedConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    #[serde(default = "default_executor")]
    pub name: String,
    // partitions whose nodes can be reclaimed by the cloud provider
    #[serde(default = "default_volatile_partitions")]
    pub volatile_partitions: BTreeSet<String>,
    // partition preempted jobs are moved to
    #[serde(default = "default_fallback_partition")]
    pub fallback_partition: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ArrayConfig {
    // `nco` for NetCDF files through the NCO tools, `native` for the in-process backend
    #[serde(default = "default_array_backend")]
    pub backend: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SplitConfig {
    // domains with at least this many cells are split inside a scheduled job
    #[serde(default = "default_self_submit_cells")]
    pub self_submit_cells: usize,
    // partition used for the self submitted split job
    #[serde(default = "default_split_partition")]
    pub partition: String,
    // alternative job script template
    #[serde(default)]
    pub template: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    // seconds between two sweeps
    #[serde(default = "default_monitor_interval")]
    pub interval: u64,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_budget")]
    pub resubmission_budget: u32,
    // strategies run by `bp monitor`, any of `preemption`, `instances`, `log-pattern`
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
    #[serde(default)]
    pub instances: InstanceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_instance_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_instance_count")]
    pub count: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ElapsedConfig {
    #[serde(default = "default_elapsed_interval")]
    pub interval: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    // total cell count above which concatenation is done in groups
    #[serde(default = "default_chunked_threshold")]
    pub chunked_threshold: usize,
    // value painted into the run_status canvas where no batch data exists
    #[serde(default = "default_status_sentinel")]
    pub status_sentinel: f64,
    #[serde(default = "default_success_code")]
    pub success_code: i64,
}

/// Paths derived from the configuration and the environment
#[derive(Clone, Debug)]
pub struct Layout {
    pub dvmdostem_path: PathBuf,
    pub dvmdostem_bin: PathBuf,
    pub parameters_path: PathBuf,
    pub config_path: PathBuf,
    pub output_spec_path: PathBuf,
    pub work_dir: PathBuf,
    pub batch_root: PathBuf,
    pub result_dir: PathBuf,
}

impl Layout {
    pub fn new(config: &RunnerConfig, environment: &Environment) -> Self {
        let dvmdostem_path = environment.expand(&config.basedir).join(DVMDOSTEM_FOLDER);
        let work_dir = config
            .work_dir
            .as_deref()
            .map(|dir| environment.expand(dir))
            .unwrap_or_else(|| PathBuf::from("/mnt/exacloud").join(&environment.user));

        Self {
            dvmdostem_bin: dvmdostem_path.join("dvmdostem"),
            parameters_path: dvmdostem_path.join("parameters"),
            config_path: dvmdostem_path.join("config").join("config.js"),
            output_spec_path: dvmdostem_path.join("config").join("output_spec.csv"),
            batch_root: work_dir.join("output"),
            result_dir: work_dir.join("all-merged"),
            dvmdostem_path,
            work_dir,
        }
    }

    /// point the layout at another batch directory, relative paths are taken from `work_dir`
    pub fn with_batch_root(mut self, batches: Option<&Path>) -> Self {
        if let Some(batches) = batches {
            self.batch_root = if batches.is_absolute() {
                batches.to_path_buf()
            } else {
                self.work_dir.join(batches)
            };
        }

        self
    }

    pub fn log_dir(&self) -> PathBuf {
        self.batch_root.join("logs")
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            basedir: default_basedir(),
            work_dir: None,
            executor: ExecutorConfig::default(),
            arrays: ArrayConfig::default(),
            split: SplitConfig::default(),
            monitor: MonitorConfig::default(),
            elapsed: ElapsedConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load the configuration from `path` or from `~/.bpconfig.yaml`, falling back to defaults
    pub fn load(path: Option<&Path>, environment: &Environment) -> Result<Self, ConfigErrors> {
        let (path, required) = match path {
            Some(path) => (environment.expand(path), true),
            None => (environment.home.join(DEFAULT_CONFIG_FILE), false),
        };

        if !path.is_file() {
            if required {
                return Err(ConfigErrors::FileNotFound(path));
            }

            debug!(path = ?path, "No runner configuration found, using defaults");
            return Ok(Self::default());
        }

        info!(path = ?path, "Loading runner configuration");
        Ok(serde_yaml::from_reader(File::open(&path)?)?)
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        self.executor.name = self.executor.name.to_lowercase();
        match self.executor.name.as_str() {
            "slurm" | "local" => {}
            name => {
                error!("executor.name ({name}) is not supported, please use `slurm` or `local`");
                contains_error = true;
            }
        }

        if self
            .executor
            .volatile_partitions
            .contains(&self.executor.fallback_partition)
        {
            error!(
                "executor.fallback_partition '{}' is listed as volatile, preempted jobs would be moved onto spot nodes again",
                self.executor.fallback_partition
            );
            contains_error = true;
        }

        self.arrays.backend = self.arrays.backend.to_lowercase();
        match self.arrays.backend.as_str() {
            "nco" | "native" => {}
            name => {
                error!("arrays.backend ({name}) is not supported, please use `nco` or `native`");
                contains_error = true;
            }
        }

        for strategy in self.monitor.strategies.iter_mut() {
            *strategy = strategy.to_lowercase();

            if !["preemption", "instances", "log-pattern"].contains(&strategy.as_str()) {
                error!("monitor.strategies contains '{strategy}' which is not supported");
                contains_error = true;
            }
        }

        if self.monitor.strategies.is_empty() {
            warn!("monitor.strategies is empty, falling back to preemption rollback");
            self.monitor.strategies = default_strategies();
        }

        if self.monitor.interval == 0 {
            error!("monitor.interval cannot be 0, the monitor would busy loop");
            contains_error = true;
        }

        if self.elapsed.interval == 0 {
            error!("elapsed.interval cannot be 0, the timer would busy loop");
            contains_error = true;
        }

        if self.monitor.keywords.is_empty() {
            warn!("monitor.keywords is empty, the log pattern check will never trigger");
        }

        if self.merge.chunked_threshold == 0 {
            error!("merge.chunked_threshold cannot be 0");
            contains_error = true;
        }

        if let Some(ref template) = self.split.template {
            if !template.is_file() {
                error!(
                    "split.template points to {} which is not a file",
                    template.to_string_lossy()
                );
                contains_error = true;
            }
        }

        contains_error
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_executor(),
            volatile_partitions: default_volatile_partitions(),
            fallback_partition: default_fallback_partition(),
        }
    }
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            backend: default_array_backend(),
        }
    }
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            self_submit_cells: default_self_submit_cells(),
            partition: default_split_partition(),
            template: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            keywords: default_keywords(),
            resubmission_budget: default_budget(),
            strategies: default_strategies(),
            instances: InstanceConfig::default(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            project: None,
            zone: default_zone(),
            name_prefix: default_instance_prefix(),
            count: default_instance_count(),
        }
    }
}

impl Default for ElapsedConfig {
    fn default() -> Self {
        Self {
            interval: default_elapsed_interval(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            chunked_threshold: default_chunked_threshold(),
            status_sentinel: default_status_sentinel(),
            success_code: default_success_code(),
        }
    }
}

fn default_basedir() -> PathBuf {
    PathBuf::from("/opt/apps")
}

fn default_executor() -> String {
    "slurm".to_string()
}

fn default_volatile_partitions() -> BTreeSet<String> {
    ["spot", "dask"].into_iter().map(String::from).collect()
}

fn default_fallback_partition() -> String {
    "compute".to_string()
}

fn default_array_backend() -> String {
    "nco".to_string()
}

fn default_self_submit_cells() -> usize {
    500_000
}

fn default_split_partition() -> String {
    "process".to_string()
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_keywords() -> Vec<String> {
    ["error", "non-exit", "aborted"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_budget() -> u32 {
    3
}

fn default_strategies() -> Vec<String> {
    vec!["preemption".to_string()]
}

fn default_zone() -> String {
    "us-central1-c".to_string()
}

fn default_instance_prefix() -> String {
    "slurmlustr-spot-ghpc-".to_string()
}

fn default_instance_count() -> usize {
    16
}

fn default_elapsed_interval() -> u64 {
    10
}

fn default_chunked_threshold() -> usize {
    40_000
}

fn default_status_sentinel() -> f64 {
    -99.0
}

fn default_success_code() -> i64 {
    100
}
