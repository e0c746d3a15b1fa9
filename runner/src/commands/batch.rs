use super::{io_error, workers, Command, CommandError, Context};
use crate::{
    arrays::ArrayTool,
    collector::BatchTree,
    executors::{Executor, Executors},
    merge::{MergeOptions, MergeReport, Merger},
    split::{ModelArguments, Partitioner, SplitOptions, SplitOutcome},
    status::{FileCountReport, StatusChecker},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SplitCommand {
    pub input: PathBuf,
    pub cells_per_batch: Option<usize>,
    pub partition: String,
    pub model: ModelArguments,
    pub in_job: bool,
    pub invocation: Vec<String>,
}

impl Command for SplitCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let options = SplitOptions {
            input: ctx.environment.expand(&self.input),
            cells_per_batch: self.cells_per_batch,
            partition: self.partition.clone(),
            model: self.model.clone(),
            in_job: self.in_job,
            invocation: self.invocation.clone(),
        };
        let partitioner = Partitioner::new(&ctx.config, &ctx.layout, &ctx.environment, &ctx.arrays);

        match partitioner.run(&options, &ctx.executor)? {
            SplitOutcome::Dispatched(submission) => {
                info!(
                    job_id = %submission.job_id,
                    log = ?ctx.layout.work_dir.join("split.log"),
                    "Submitted the split as a job, check the log for its progress"
                );
                Ok(())
            }
            SplitOutcome::Split(report) if report.is_success() => Ok(()),
            SplitOutcome::Split(report) => {
                for failure in &report.failures {
                    error!(batch = ?failure.batch, target = ?failure.target, "{}", failure.reason);
                }
                Err(CommandError::SplitFailed(report.failures.len()))
            }
        }
    }
}

/// Submit the job script of every batch
#[derive(Debug, Clone, Default)]
pub struct RunCommand {
    pub no_timer: bool,
}

impl Command for RunCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let batches = BatchTree::new(&ctx.layout.batch_root).batches();
        if batches.is_empty() {
            return Err(CommandError::NoBatches(ctx.layout.batch_root.clone()));
        }

        let log_dir = ctx.layout.log_dir();
        fs::create_dir_all(&log_dir).map_err(io_error(&log_dir))?;

        let mut failed = 0;
        for batch in &batches {
            match ctx.executor.submit(&batch.script()) {
                Ok(submission) => info!(batch = %batch.name(), job_id = %submission.job_id, "Submitted"),
                Err(failure) => {
                    error!(batch = %batch.name(), error = %failure, "Failed to submit");
                    failed += 1;
                }
            }
        }
        info!("Submitted {}/{} batches", batches.len() - failed, batches.len());

        match &ctx.executor {
            // local jobs only live as long as this process
            Executors::Local(local) => {
                let unsuccessful = local
                    .wait(None)
                    .into_iter()
                    .filter(|(_, status)| !status.map_or(false, |status| status.success()))
                    .inspect(|(name, status)| warn!(job = %name, status = ?status, "Job did not succeed"))
                    .count();
                info!(unsuccessful = unsuccessful, "All local jobs finished");
            }
            Executors::Slurm(_) if !self.no_timer => {
                workers::elapsed_daemon(ctx).start(&ctx.worker_args(["elapsed", "--worker"]))?;
            }
            Executors::Slurm(_) => {}
        }

        if failed > 0 {
            return Err(CommandError::Partial {
                what: "submissions",
                failed,
                total: batches.len(),
            });
        }

        Ok(())
    }
}

/// Compare the number of output files across batches
#[derive(Debug, Clone, Default)]
pub struct CheckCommand;

impl Command for CheckCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let tree = BatchTree::new(&ctx.layout.batch_root);
        let report = FileCountReport::collect(&tree);

        for line in report.lines() {
            println!("{line}");
        }

        Ok(())
    }
}

/// Classify the cells of every batch by their run status
#[derive(Debug, Clone, Default)]
pub struct StatusCommand {
    // print every failed cell instead of the per batch summary only
    pub cells: bool,
}

impl Command for StatusCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let report = StatusChecker::new(&ctx.arrays, &ctx.layout.batch_root).check()?;

        if report.all_clear() {
            println!("All {} batches ran successfully.", report.batches.len());
            return Ok(());
        }

        for batch in report.flagged() {
            println!("something's wrong with {batch}");
            if self.cells {
                for (cell, code) in &batch.failed {
                    println!("    {cell}: run_status {code}");
                }
            }
        }

        Err(CommandError::Flagged(report.flagged().count()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeCommand {
    pub vars: Vec<String>,
    pub auto_approve: bool,
    // glob for the file level merge
    pub legacy: Option<String>,
}

impl MergeCommand {
    fn report(report: &MergeReport) -> Result<(), CommandError> {
        info!(
            merged = report.merged.len(),
            failed = report.failures.len(),
            "Merge finished"
        );
        if let Some(runtime) = report.runtime {
            println!("{runtime}");
        }

        if report.is_success() {
            Ok(())
        } else {
            Err(CommandError::Partial {
                what: "merged files",
                failed: report.failures.len(),
                total: report.failures.len() + report.merged.len(),
            })
        }
    }
}

impl Command for MergeCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let merger = Merger::new(
            &ctx.arrays,
            &ctx.config.merge,
            &ctx.layout.batch_root,
            &ctx.layout.result_dir,
        );

        let report = match self.legacy {
            Some(ref pattern) => merger.legacy(pattern)?,
            None => {
                let options = MergeOptions {
                    vars: self.vars.clone(),
                    auto_approve: self.auto_approve,
                };
                merger.run(&options, &mut io::stdin().lock(), &mut io::stdout())?
            }
        };

        Self::report(&report)
    }
}

/// Compare two merged output directories variable by variable
#[derive(Debug, Clone)]
pub struct DiffCommand {
    pub left: PathBuf,
    pub right: PathBuf,
}

impl DiffCommand {
    fn netcdf_files(dir: &Path) -> Result<Vec<PathBuf>, CommandError> {
        if !dir.is_dir() {
            return Err(CommandError::MissingDirectory(dir.to_path_buf()));
        }

        Ok(BatchTree::new(dir).find("*.nc", 1)?)
    }
}

impl Command for DiffCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let left = Self::netcdf_files(&ctx.environment.expand(&self.left))?;
        let right = Self::netcdf_files(&ctx.environment.expand(&self.right))?;

        if left.len() != right.len() {
            return Err(CommandError::FileCountMismatch {
                left: left.len(),
                right: right.len(),
            });
        }

        let mut differing = 0;
        for (one, two) in left.iter().zip(&right) {
            if one.file_name() != two.file_name() {
                warn!(left = ?one, right = ?two, "Comparing files with different names");
            }

            let variables = ctx.arrays.read(one)?.differing_variables(&ctx.arrays.read(two)?);
            if !variables.is_empty() {
                println!(
                    "{} and {} are not the same: {}",
                    one.display(),
                    two.display(),
                    variables.join(", ")
                );
                differing += 1;
            }
        }

        if differing > 0 {
            return Err(CommandError::Differs(differing));
        }

        println!("No difference is found. The two folders are identical.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arrays::{dataset::tests::grid, ArrayTool, NativeTool},
        batch::BatchPaths,
        commands::tests::context,
    };
    use ndarray::array;

    #[test]
    fn local_runs_wait_for_every_batch() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());

        for index in 0..2 {
            let batch = BatchPaths::new(&ctx.layout.batch_root, index);
            fs::create_dir_all(batch.output_dir()).unwrap();
            fs::write(
                batch.script(),
                format!(
                    "#!/bin/bash\n#SBATCH --job-name=test-batch-{index}\necho done > {}\n",
                    batch.output_dir().join("done.txt").display()
                ),
            )
            .unwrap();
        }

        RunCommand::default().execute(&ctx).unwrap();

        for index in 0..2 {
            let done = BatchPaths::new(&ctx.layout.batch_root, index).output_dir().join("done.txt");
            assert_eq!(fs::read_to_string(done).unwrap(), "done\n");
        }
    }

    #[test]
    fn running_without_batches_fails() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());

        assert!(matches!(
            RunCommand::default().execute(&ctx),
            Err(CommandError::NoBatches(_))
        ));
    }

    #[test]
    fn failed_cells_flag_the_status_check() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());

        for (index, codes) in [(0, array![[100.0, 100.0]]), (1, array![[100.0, -3.0]])] {
            NativeTool
                .write(
                    &grid("run_status", codes, -9999.0),
                    &BatchPaths::new(&ctx.layout.batch_root, index).run_status(),
                )
                .unwrap();
        }

        assert!(matches!(
            StatusCommand::default().execute(&ctx),
            Err(CommandError::Flagged(1))
        ));
    }

    #[test]
    fn unreadable_status_files_are_flagged_not_fatal() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());

        for index in 0..3 {
            NativeTool
                .write(
                    &grid("run_status", array![[100.0, 100.0]], -9999.0),
                    &BatchPaths::new(&ctx.layout.batch_root, index).run_status(),
                )
                .unwrap();
        }
        fs::write(BatchPaths::new(&ctx.layout.batch_root, 1).run_status(), b"garbage").unwrap();

        let report = StatusChecker::new(&ctx.arrays, &ctx.layout.batch_root).check().unwrap();
        assert_eq!(report.batches.len(), 3);
        assert!(report.batches[1].status_unreadable);
        assert_eq!(report.batches[1].assigned, 0);
        assert!(!report.batches[0].flagged());
        assert!(!report.batches[2].flagged());
        assert_eq!(report.flagged().map(|batch| batch.index).collect::<Vec<_>>(), vec![1]);

        assert!(matches!(
            StatusCommand::default().execute(&ctx),
            Err(CommandError::Flagged(1))
        ));
    }

    #[test]
    fn diff_reports_differing_files() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());
        let (left, right) = (directory.path().join("left"), directory.path().join("right"));

        for dir in [&left, &right] {
            for name in ["GPP_yearly_tr.nc", "run_status.nc"] {
                NativeTool
                    .write(&grid("value", array![[1.0, 2.0]], -9999.0), &dir.join(name))
                    .unwrap();
            }
        }
        let diff = DiffCommand {
            left: left.clone(),
            right: right.clone(),
        };
        diff.execute(&ctx).unwrap();

        NativeTool
            .write(&grid("value", array![[1.0, 3.0]], -9999.0), &right.join("GPP_yearly_tr.nc"))
            .unwrap();
        assert!(matches!(diff.execute(&ctx), Err(CommandError::Differs(1))));

        fs::remove_file(right.join("run_status.nc")).unwrap();
        assert!(matches!(
            diff.execute(&ctx),
            Err(CommandError::FileCountMismatch { left: 2, right: 1 })
        ));

        let missing = DiffCommand {
            left,
            right: directory.path().join("nowhere"),
        };
        assert!(matches!(missing.execute(&ctx), Err(CommandError::MissingDirectory(_))));
    }

    #[test]
    fn legacy_merge_reports_outcomes() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());

        for index in 0..2 {
            let output = BatchPaths::new(&ctx.layout.batch_root, index).output_dir();
            fs::create_dir_all(&output).unwrap();
            fs::write(output.join("fail_log.txt"), format!("batch {index}\n")).unwrap();
        }

        MergeCommand {
            legacy: Some("**/*.txt".to_string()),
            ..Default::default()
        }
        .execute(&ctx)
        .unwrap();

        assert_eq!(
            fs::read_to_string(ctx.layout.result_dir.join("fail_log.txt")).unwrap(),
            "batch 0\nbatch 1\n"
        );
    }
}
