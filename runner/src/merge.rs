pub mod canvas;
pub mod concat;
pub mod legacy;
pub mod runtime;
pub mod validate;

use crate::{
    arrays::{ArrayBackends, ArrayError, ArrayTool, Dimension},
    batch::{expected_batch_count, BatchSet, ManifestError, SplitAxis, RUN_STATUS_FILE},
    collector::{BatchTree, OutputGroups},
    config::MergeConfig,
};
use runtime::RuntimeReport;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{BufRead, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use validate::{confirm, CodeSummary};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid file pattern")]
    Glob(#[from] globset::Error),
    #[error("Failed to ask for confirmation")]
    Prompt(#[source] std::io::Error),
    #[error("No batch directories found below {0}")]
    NoBatches(PathBuf),
    #[error("None of the batches produced output files")]
    NoOutputs,
    #[error("Merge was aborted")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    Canvas,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    // only merge files belonging to these variables
    pub vars: Vec<String>,
    pub auto_approve: bool,
}

impl MergeOptions {
    fn selects(&self, file_name: &str) -> bool {
        self.vars.is_empty()
            || self.vars.iter().any(|var| {
                file_name
                    .strip_prefix(var.as_str())
                    .map_or(false, |rest| rest.starts_with('_') || rest.starts_with('.'))
            })
    }
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub strategy: Strategy,
    pub expected: usize,
    pub merged: Vec<PathBuf>,
    pub failures: BTreeMap<String, String>,
    pub runtime: Option<RuntimeReport>,
}

impl MergeReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Direct concatenation needs every expected batch with the same set of output files
pub fn select_strategy(groups: &OutputGroups, present: &[usize], expected: usize) -> Strategy {
    let complete = present.len() == expected && present.iter().copied().eq(0..expected);
    let consistent = groups
        .values()
        .all(|instances| instances.len() == present.len());

    if complete && consistent {
        Strategy::Direct
    } else {
        Strategy::Canvas
    }
}

/// axis of an unsplit manifest-less tree, spatial slices are one cell thick along the split axis
pub fn infer_axis(y_len: usize, x_len: usize) -> SplitAxis {
    match (y_len, x_len) {
        (1, x) if x > 1 => SplitAxis::Y,
        (y, 1) if y > 1 => SplitAxis::X,
        (y, x) => SplitAxis::larger(x, y),
    }
}

pub struct Merger<'a> {
    tool: &'a ArrayBackends,
    config: &'a MergeConfig,
    tree: BatchTree,
    result_dir: PathBuf,
}

impl<'a> Merger<'a> {
    pub fn new(tool: &'a ArrayBackends, config: &'a MergeConfig, batch_root: &Path, result_dir: &Path) -> Self {
        Self {
            tool,
            config,
            tree: BatchTree::new(batch_root),
            result_dir: result_dir.to_path_buf(),
        }
    }

    fn split_axis(&self, manifest: Option<&BatchSet>, groups: &OutputGroups) -> Result<SplitAxis, MergeError> {
        if let Some(manifest) = manifest {
            return Ok(manifest.axis);
        }

        let (first, dimensions) = groups
            .values()
            .flatten()
            .find_map(|(_, path)| self.readable_dimensions(path).map(|dimensions| (path, dimensions)))
            .ok_or(MergeError::NoOutputs)?;
        let len = |names: [&str; 2]| {
            dimensions
                .iter()
                .find(|dimension| names.contains(&dimension.name.as_str()))
                .map_or(1, |dimension| dimension.len)
        };

        let axis = infer_axis(len(["Y", "y"]), len(["X", "x"]));
        warn!(axis = %axis, "No batch manifest, inferred the split axis from {}", first.display());
        Ok(axis)
    }

    fn readable_dimensions(&self, path: &Path) -> Option<Vec<Dimension>> {
        match self.tool.dimensions(path) {
            Ok(dimensions) => Some(dimensions),
            Err(error) => {
                warn!(error = %error, path = ?path, "Unreadable batch file");
                None
            }
        }
    }

    /// Ask before merging over cells that did not succeed
    pub fn validate(
        &self,
        options: &MergeOptions,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<CodeSummary, MergeError> {
        let summary = CodeSummary::collect(self.tool, &self.tree.batches(), self.config.status_sentinel);

        if !summary.needs_confirmation(self.config.success_code) {
            return Ok(summary);
        }

        let write_error = MergeError::Prompt;
        writeln!(output, "Run status summary (code: cells):").map_err(write_error)?;
        for line in summary.lines() {
            writeln!(output, "{line}").map_err(write_error)?;
        }

        if options.auto_approve {
            warn!("Status codes other than {} were found, merging anyway", self.config.success_code);
            return Ok(summary);
        }

        let question = format!(
            "Status codes other than {} were found, continue merging?",
            self.config.success_code
        );
        if confirm(input, output, &question).map_err(write_error)? {
            Ok(summary)
        } else {
            Err(MergeError::Aborted)
        }
    }

    #[instrument(skip_all, fields(root = ?self.tree.root, result = ?self.result_dir))]
    pub fn run(
        &self,
        options: &MergeOptions,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<MergeReport, MergeError> {
        let present = self.tree.indices();
        if present.is_empty() {
            return Err(MergeError::NoBatches(self.tree.root.clone()));
        }

        let manifest = BatchSet::load(&self.tree.root)?;
        let expected = expected_batch_count(manifest.as_ref(), &present);

        self.validate(options, input, output)?;

        let mut groups = self.tree.output_groups();
        groups.retain(|name, _| options.selects(name));
        if groups.is_empty() {
            return Err(MergeError::NoOutputs);
        }

        let strategy = select_strategy(&groups, &present, expected);
        let axis = self.split_axis(manifest.as_ref(), &groups)?;
        info!(
            strategy = ?strategy,
            axis = %axis,
            expected = expected,
            present = present.len(),
            files = groups.len(),
            "Merging batch outputs"
        );
        if strategy == Strategy::Canvas {
            let missing: BTreeSet<usize> = (0..expected).filter(|index| !present.contains(index)).collect();
            warn!(missing = ?missing, "Batches are incomplete, missing regions are filled with sentinels");
        }

        fs::create_dir_all(&self.result_dir).map_err(|source| MergeError::Io {
            path: self.result_dir.clone(),
            source,
        })?;

        let mut report = MergeReport {
            strategy,
            expected,
            merged: Vec::new(),
            failures: BTreeMap::new(),
            runtime: None,
        };

        for (name, instances) in &groups {
            let dst = self.result_dir.join(name);
            let result = match strategy {
                Strategy::Direct => {
                    let inputs: Vec<PathBuf> = instances.iter().map(|(_, path)| path.clone()).collect();
                    concat::merge_file(self.tool, name, &inputs, axis, &dst, self.config.chunked_threshold)
                }
                Strategy::Canvas => self.canvas(name, instances, axis, expected, &dst),
            };

            match result {
                Ok(()) => {
                    info!(file = %name, "Merged");
                    report.merged.push(dst);
                }
                Err(failure) => {
                    error!(file = %name, error = %failure, "Failed to merge");
                    report.failures.insert(name.clone(), failure.to_string());
                }
            }
        }

        let status = self.result_dir.join(RUN_STATUS_FILE);
        if report.merged.contains(&status) {
            match runtime::mean_runtime(self.tool, &status) {
                Ok(runtime) => {
                    info!("{runtime}");
                    report.runtime = Some(runtime);
                }
                Err(error) => warn!(error = %error, "Failed to compute the runtime report"),
            }
        }

        Ok(report)
    }

    fn canvas(
        &self,
        name: &str,
        instances: &[(usize, PathBuf)],
        axis: SplitAxis,
        expected: usize,
        dst: &Path,
    ) -> Result<(), ArrayError> {
        let dimensions = instances
            .iter()
            .find_map(|(_, path)| self.readable_dimensions(path))
            .ok_or(ArrayError::NoInputs)?;
        let dim = concat::axis_name(name, axis, &dimensions)?;
        let summary = canvas::reassemble(self.tool, instances, &dim, expected, self.config.status_sentinel, dst)?;

        if !summary.skipped.is_empty() {
            warn!(file = %name, skipped = ?summary.skipped, "Some batch files were left out");
        }

        Ok(())
    }

    /// File level merge of everything matching `pattern`
    pub fn legacy(&self, pattern: &str) -> Result<MergeReport, MergeError> {
        let outcomes = legacy::merge(self.tool, &self.tree, pattern, &self.result_dir)?;
        let mut report = MergeReport {
            strategy: Strategy::Direct,
            expected: self.tree.indices().len(),
            merged: Vec::new(),
            failures: BTreeMap::new(),
            runtime: None,
        };

        for (name, outcome) in outcomes {
            match outcome {
                Ok(_) => report.merged.push(self.result_dir.join(&name)),
                Err(reason) => {
                    report.failures.insert(name, reason);
                }
            }
        }

        Ok(report)
    }
}
