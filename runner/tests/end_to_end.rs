use bp_runner::{
    arrays::{ArrayBackends, ArrayTool, DataType, Dataset, Dimension, NativeTool, Variable},
    batch::{BatchPaths, BatchSet, SplitAxis, SplitMode, RUN_STATUS_FILE},
    collector::BatchTree,
    config::{Environment, Layout, MergeConfig, RunnerConfig},
    executors::{Executor, ExecutorError, JobState, Submission},
    merge::{MergeOptions, Merger, Strategy},
    model_config::ModelConfig,
    runmask::{Cell, RunMask},
    split::{
        slice::{INPUT_FILES, INPUT_FILES_TO_COPY, RUN_MASK_FILE},
        ModelArguments, Partitioner, SplitOptions, SplitOutcome,
    },
    status::{StatusChecker, RUNTIME_VARIABLE, STATUS_VARIABLE},
};
use ndarray::{s, Array2, Ix2};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::BTreeSet,
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

const FILL: f64 = -9999.0;

/// Scheduler stand-in that only remembers what was submitted
#[derive(Default)]
struct Recording {
    submitted: Mutex<Vec<PathBuf>>,
}

impl Executor for Recording {
    fn submit(&self, script: &Path) -> Result<Submission, ExecutorError> {
        let mut submitted = self.submitted.lock();
        submitted.push(script.to_path_buf());

        Ok(Submission {
            job_id: submitted.len().to_string(),
            stdout: format!("Submitted batch job {}", submitted.len()),
            stderr: String::new(),
        })
    }

    fn queue(&self, _mine_only: bool) -> Result<Vec<JobState>, ExecutorError> {
        Ok(Vec::new())
    }

    fn update_partition(&self, _job_id: &str, _partition: &str) -> Result<(), ExecutorError> {
        Ok(())
    }
}

fn variable(values: Array2<f64>) -> Variable {
    let mut variable = Variable::new(
        vec!["Y".to_string(), "X".to_string()],
        DataType::Int,
        values.into_dyn(),
    );
    variable
        .attributes
        .insert("_FillValue".to_string(), Value::from(FILL));
    variable
}

fn grid(name: &str, values: Array2<f64>) -> Dataset {
    let (y, x) = values.dim();
    let mut dataset = Dataset::default();
    for (dim, len) in [("Y", y), ("X", x)] {
        dataset.dimensions.push(Dimension {
            name: dim.to_string(),
            len,
            unlimited: false,
        });
    }
    dataset.variables.insert(name.to_string(), variable(values));
    dataset
}

fn values(dataset: &Dataset, name: &str) -> Array2<f64> {
    dataset
        .variable(name)
        .unwrap()
        .data
        .view()
        .into_dimensionality::<Ix2>()
        .unwrap()
        .to_owned()
}

struct Fixture {
    directory: TempDir,
    environment: Environment,
    config: RunnerConfig,
    layout: Layout,
    arrays: ArrayBackends,
}

impl Fixture {
    fn new() -> Self {
        let directory = tempfile::tempdir().unwrap();
        let environment = Environment {
            home: directory.path().join("home"),
            user: "tester".to_string(),
            is_root: false,
        };
        let mut config = RunnerConfig {
            basedir: directory.path().join("apps"),
            work_dir: Some(directory.path().join("work")),
            ..Default::default()
        };
        config.executor.name = "local".to_string();
        config.arrays.backend = "native".to_string();
        let layout = Layout::new(&config, &environment);

        fs::create_dir_all(layout.config_path.parent().unwrap()).unwrap();
        fs::write(
            &layout.config_path,
            "{\n  \"IO\": {\n    // rewritten per batch\n    \"runmask_file\": \"/data/run-mask.nc\",\n    \"output_dir\": \"/data/output/\",\n    \"topo_file\": \"/data/topo.nc\"\n  }\n}\n",
        )
        .unwrap();

        Self {
            directory,
            environment,
            config,
            layout,
            arrays: ArrayBackends::Native(NativeTool),
        }
    }

    fn input(&self) -> PathBuf {
        self.directory.path().join("input")
    }

    fn split(&self, cells_per_batch: Option<usize>) -> usize {
        let options = SplitOptions {
            input: self.input(),
            cells_per_batch,
            partition: "spot".to_string(),
            model: ModelArguments::default(),
            in_job: false,
            invocation: Vec::new(),
        };

        let outcome = Partitioner::new(&self.config, &self.layout, &self.environment, &self.arrays)
            .run(&options, &Recording::default())
            .unwrap();

        match outcome {
            SplitOutcome::Split(report) => {
                assert!(report.is_success(), "{:?}", report.failures);
                report.batches
            }
            SplitOutcome::Dispatched(submission) => panic!("unexpected dispatch: {submission:?}"),
        }
    }

    fn merger<'a>(&'a self, merge: &'a MergeConfig) -> Merger<'a> {
        Merger::new(&self.arrays, merge, &self.layout.batch_root, &self.layout.result_dir)
    }
}

#[test]
fn cell_count_split_survives_a_lost_batch() {
    let fixture = Fixture::new();
    fixture
        .arrays
        .write(&grid("run", Array2::ones((5, 5))), &fixture.input().join(RUN_MASK_FILE))
        .unwrap();

    assert_eq!(fixture.split(Some(10)), 3);

    let root = &fixture.layout.batch_root;
    let manifest = BatchSet::load(root).unwrap().unwrap();
    assert_eq!(manifest.mode, SplitMode::CellCount);
    assert_eq!(manifest.axis, SplitAxis::Y);
    assert_eq!(
        manifest.batches.iter().map(|entry| entry.cells.len()).collect::<Vec<_>>(),
        vec![10, 10, 5]
    );
    assert!(manifest.batches.iter().all(|entry| entry.extent == 5));
    assert_eq!(manifest.cells(1).unwrap()[0], Cell { y: 2, x: 0 });

    // every enabled cell lands in exactly one batch
    let mut seen = BTreeSet::new();
    for batch in BatchTree::new(root).batches() {
        let mask = RunMask::load(&fixture.arrays, &batch.runmask()).unwrap();
        for cell in mask.enabled_cells() {
            assert!(seen.insert(cell), "{cell} is assigned twice");
        }

        let config = ModelConfig::load(&batch.config()).unwrap();
        assert_eq!(
            config.io_path("runmask_file"),
            Some(batch.runmask().to_string_lossy().as_ref())
        );
        let topo = format!("{}/topo.nc", fixture.input().display());
        assert_eq!(config.io_path("topo_file"), Some(topo.as_str()));

        let script = fs::read_to_string(batch.script()).unwrap();
        assert!(script.contains(&format!("logs/{}.out", batch.name())));
    }
    assert_eq!(seen.len(), 25);

    let executor = Recording::default();
    for batch in BatchTree::new(root).batches() {
        executor.submit(&batch.script()).unwrap();
    }
    assert_eq!(executor.submitted.lock().len(), 3);

    // the model writes the full domain, cells outside the batch stay fill
    for batch in BatchTree::new(root).batches() {
        let mask = RunMask::load(&fixture.arrays, &batch.runmask()).unwrap();
        let status = mask.grid.mapv(|enabled| if enabled { 100.0 } else { FILL });
        let runtime = mask.grid.mapv(|enabled| if enabled { 10.0 } else { FILL });

        let mut dataset = grid(STATUS_VARIABLE, status);
        let mut runtime = variable(runtime);
        runtime
            .attributes
            .insert("units".to_string(), Value::from("seconds"));
        dataset.variables.insert(RUNTIME_VARIABLE.to_string(), runtime);
        fixture.arrays.write(&dataset, &batch.run_status()).unwrap();
    }

    fs::remove_dir_all(BatchPaths::new(root, 1).dir).unwrap();

    let report = StatusChecker::new(&fixture.arrays, root).check().unwrap();
    assert_eq!(
        report.flagged().map(|batch| batch.index).collect::<Vec<_>>(),
        vec![1]
    );
    assert!(report.batches[1].directory_missing);
    assert_eq!(report.batches[1].assigned, 10);

    let merge = MergeConfig::default();
    let merged = fixture
        .merger(&merge)
        .run(&MergeOptions::default(), &mut Cursor::new(Vec::new()), &mut Vec::new())
        .unwrap();

    assert_eq!(merged.strategy, Strategy::Canvas);
    assert_eq!(merged.expected, 3);
    assert!(merged.is_success(), "{:?}", merged.failures);

    let result = fixture
        .arrays
        .read(&fixture.layout.result_dir.join(RUN_STATUS_FILE))
        .unwrap();
    assert_eq!(result.dimension_len("Y"), Some(15));
    assert_eq!(result.dimension_len("X"), Some(5));

    let status = values(&result, STATUS_VARIABLE);
    assert!(status.slice(s![5..10, ..]).iter().all(|value| *value == merge.status_sentinel));
    assert!(status.slice(s![0..2, ..]).iter().all(|value| *value == 100.0));
    assert!(status.slice(s![2..5, ..]).iter().all(|value| *value == FILL));
    assert!(status.slice(s![14, ..]).iter().all(|value| *value == 100.0));

    let runtime = values(&result, RUNTIME_VARIABLE);
    assert!(runtime.slice(s![5..10, ..]).iter().all(|value| *value == FILL));

    let runtime = merged.runtime.unwrap();
    assert_eq!(runtime.used, 15);
    assert_eq!(runtime.total, 75);
    assert_eq!(runtime.mean_seconds, Some(10.0));
}

#[test]
fn spatial_slices_merge_back_into_the_input() {
    let fixture = Fixture::new();
    let input = fixture.input();
    let truth = Array2::from_shape_fn((3, 4), |(y, x)| (100 + y * 10 + x) as f64);
    fs::create_dir_all(&input).unwrap();

    for name in INPUT_FILES {
        let path = input.join(name);
        if INPUT_FILES_TO_COPY.contains(&name) {
            fs::write(&path, "year,co2\n1901,296.3\n").unwrap();
        } else if name == RUN_MASK_FILE {
            fixture.arrays.write(&grid("run", Array2::ones((3, 4))), &path).unwrap();
        } else {
            fixture.arrays.write(&grid("value", truth.clone()), &path).unwrap();
        }
    }

    // X is the larger axis, one batch per column
    assert_eq!(fixture.split(None), 4);

    let root = &fixture.layout.batch_root;
    let manifest = BatchSet::load(root).unwrap().unwrap();
    assert_eq!(manifest.mode, SplitMode::SpatialSlice);
    assert_eq!(manifest.axis, SplitAxis::X);

    for batch in BatchTree::new(root).batches() {
        let topo = batch.input_dir().join("topo.nc");
        let config = ModelConfig::load(&batch.config()).unwrap();
        assert_eq!(config.io_path("topo_file"), Some(topo.to_string_lossy().as_ref()));
        assert_eq!(
            fs::read_to_string(batch.input_dir().join("co2.nc")).unwrap(),
            "year,co2\n1901,296.3\n"
        );

        // pretend the model copied the topography into its status output
        let mut dataset = fixture.arrays.read(&topo).unwrap();
        assert_eq!(dataset.dimension_len("X"), Some(1));
        assert_eq!(dataset.dimension_len("Y"), Some(3));
        let value = dataset.variables.remove("value").unwrap();
        dataset.variables.insert(STATUS_VARIABLE.to_string(), value);
        fixture.arrays.write(&dataset, &batch.run_status()).unwrap();
    }

    let merge = MergeConfig::default();
    let mut prompt = Vec::new();
    let merged = fixture
        .merger(&merge)
        .run(
            &MergeOptions {
                vars: Vec::new(),
                auto_approve: true,
            },
            &mut Cursor::new(Vec::new()),
            &mut prompt,
        )
        .unwrap();

    assert_eq!(merged.strategy, Strategy::Direct);
    assert!(merged.is_success(), "{:?}", merged.failures);
    // codes other than 100 were reported but not asked about
    assert!(String::from_utf8(prompt).unwrap().contains("status   123: 1 cells"));

    let result = fixture
        .arrays
        .read(&fixture.layout.result_dir.join(RUN_STATUS_FILE))
        .unwrap();
    assert_eq!(values(&result, STATUS_VARIABLE), truth);
}
