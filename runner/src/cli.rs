use crate::{
    commands::{
        batch::{CheckCommand, DiffCommand, MergeCommand, RunCommand, SplitCommand, StatusCommand},
        setup::{ExtractCellCommand, InitCommand, InputCommand},
        workers::{DaemonAction, ElapsedCommand, MonitorCommand, RunCheckCommand},
        Command,
    },
    split::ModelArguments,
};
use clap::{builder::PossibleValuesParser, ArgAction, Args, Parser, Subcommand};
use std::{ffi::OsString, path::PathBuf};

const LOG_LEVELS: [&str; 7] = ["debug", "info", "note", "warn", "err", "fatal", "disabled"];

/// Split, run, watch and merge dvmdostem batches on a Slurm cluster
#[derive(Parser, Debug)]
#[command(name = "bp", author, version, long_about = None, propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Runner configuration, defaults to ~/.bpconfig.yaml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Batch directory, relative paths are resolved against the work directory
    #[arg(long, global = true, value_name = "DIR")]
    pub batches: Option<PathBuf>,

    /// Raise the log level to debug, twice for trace
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalArgs {
    /// global options as they have to be handed to a re-spawned worker
    pub fn forwarded(&self) -> Vec<OsString> {
        let mut args = Vec::new();

        if let Some(ref config) = self.config {
            args.push("--config".into());
            args.push(config.clone().into_os_string());
        }
        if let Some(ref batches) = self.batches {
            args.push("--batches".into());
            args.push(batches.clone().into_os_string());
        }
        args.extend((0..self.verbose).map(|_| OsString::from("-v")));

        args
    }
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Number of PRE RUN years to run
    #[arg(short, default_value_t = ModelArguments::default().p)]
    pub p: u32,
    /// Number of EQUILIBRIUM years to run
    #[arg(short, default_value_t = ModelArguments::default().e)]
    pub e: u32,
    /// Number of SPINUP years to run
    #[arg(short, default_value_t = ModelArguments::default().s)]
    pub s: u32,
    /// Number of TRANSIENT years to run
    #[arg(short, default_value_t = ModelArguments::default().t)]
    pub t: u32,
    /// Number of SCENARIO years to run
    #[arg(short, default_value_t = ModelArguments::default().n)]
    pub n: u32,
    /// Log level of the model
    #[arg(
        short,
        long,
        default_value = "disabled",
        value_parser = PossibleValuesParser::new(LOG_LEVELS)
    )]
    pub log_level: String,
}

impl From<ModelArgs> for ModelArguments {
    fn from(args: ModelArgs) -> Self {
        Self {
            log_level: args.log_level,
            p: args.p,
            e: args.e,
            s: args.s,
            t: args.t,
            n: args.n,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare the work directory and the model installation
    Init,

    /// Point config.js at the given input directory
    Input {
        /// Directory that contains the input files, e.g. $HOME/input/four-basins
        #[arg(short, long = "input-path")]
        input: PathBuf,
    },

    /// Extract a single cell of every input file
    #[command(name = "extract_cell")]
    ExtractCell {
        #[arg(short, long = "input-path")]
        input: PathBuf,
        #[arg(short, long = "output-path")]
        output: PathBuf,
        /// Column of the cell
        #[arg(short = 'X')]
        x: usize,
        /// Row of the cell
        #[arg(short = 'Y')]
        y: usize,
    },

    /// Split, run, check and merge batches
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },

    /// Watch the submitted batches and repair what can be repaired
    Monitor {
        #[arg(value_enum)]
        action: DaemonAction,
        /// Health checks to run, defaults to monitor.strategies of the configuration
        #[arg(long = "strategy", value_name = "NAME", value_parser = PossibleValuesParser::new(["preemption", "instances", "log-pattern"]))]
        strategies: Vec<String>,
        /// Number of spot instances in the cluster, see `sinfo`
        #[arg(short = 'c', long)]
        instance_count: Option<usize>,
    },

    /// Resubmit batches whose logs report an error
    #[command(name = "run_check")]
    RunCheck {
        #[arg(value_enum)]
        action: DaemonAction,
    },

    /// Record how long it takes until the queue is empty
    Elapsed {
        /// Keep timing in the background
        #[arg(long)]
        detach: bool,
        #[arg(long, hide = true)]
        worker: bool,
    },

    /// Report batches with failed or never run cells
    #[command(alias = "run_status_check")]
    Status {
        /// List every failed cell
        #[arg(long)]
        cells: bool,
    },

    /// Compare two merged output directories variable by variable
    Diff { left: PathBuf, right: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum BatchCommands {
    /// Split the input into batches, existing batches are removed
    Split {
        #[arg(short, long = "input-path")]
        input: PathBuf,
        /// Number of cells per batch, slices along the larger axis when omitted
        #[arg(short, long)]
        cells_per_batch: Option<usize>,
        #[arg(long = "slurm-partition", visible_alias = "sp", default_value = "spot")]
        partition: String,
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long, hide = true)]
        in_job: bool,
    },

    /// Submit every batch
    Run {
        /// Don't start the elapsed timer
        #[arg(long)]
        no_timer: bool,
    },

    /// Compare the number of output files across batches
    Check,

    /// Merge the batch outputs into the result directory
    Merge {
        /// Merge only the given variables
        #[arg(long, num_args = 1..)]
        vars: Vec<String>,
        /// Continue merging even if not all cells ran successfully
        #[arg(short, long, visible_alias = "yes")]
        force: bool,
        /// File level ensemble merge of everything matching the glob
        #[arg(long, value_name = "GLOB")]
        legacy: Option<String>,
    },
}

impl Commands {
    /// detached workers write into a log file
    pub fn is_worker(&self) -> bool {
        match self {
            Self::Monitor { action, .. } | Self::RunCheck { action } => *action == DaemonAction::Worker,
            Self::Elapsed { worker, .. } => *worker,
            _ => false,
        }
    }

    pub fn into_command(self, invocation: Vec<String>) -> Box<dyn Command> {
        match self {
            Self::Init => Box::new(InitCommand),
            Self::Input { input } => Box::new(InputCommand { input }),
            Self::ExtractCell { input, output, x, y } => Box::new(ExtractCellCommand { input, output, x, y }),
            Self::Batch { command } => command.into_command(invocation),
            Self::Monitor {
                action,
                strategies,
                instance_count,
            } => Box::new(MonitorCommand {
                action,
                strategies,
                instance_count,
            }),
            Self::RunCheck { action } => Box::new(RunCheckCommand { action }),
            Self::Elapsed { detach, worker } => Box::new(ElapsedCommand { detach, worker }),
            Self::Status { cells } => Box::new(StatusCommand { cells }),
            Self::Diff { left, right } => Box::new(DiffCommand { left, right }),
        }
    }
}

impl BatchCommands {
    fn into_command(self, invocation: Vec<String>) -> Box<dyn Command> {
        match self {
            Self::Split {
                input,
                cells_per_batch,
                partition,
                model,
                in_job,
            } => Box::new(SplitCommand {
                input,
                cells_per_batch,
                partition,
                model: model.into(),
                in_job,
                invocation,
            }),
            Self::Run { no_timer } => Box::new(RunCommand { no_timer }),
            Self::Check => Box::new(CheckCommand),
            Self::Merge { vars, force, legacy } => Box::new(MergeCommand {
                vars,
                auto_approve: force,
                legacy,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn legacy_command_names_are_accepted() {
        let cli = Cli::try_parse_from(["bp", "extract_cell", "-i", "in", "-o", "out", "-X", "3", "-Y", "4"]).unwrap();
        assert!(matches!(cli.command, Commands::ExtractCell { x: 3, y: 4, .. }));

        let cli = Cli::try_parse_from(["bp", "run_status_check"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { cells: false }));

        let cli = Cli::try_parse_from(["bp", "run_check", "worker"]).unwrap();
        assert!(cli.command.is_worker());
    }

    #[test]
    fn diff_takes_two_directories() {
        let cli = Cli::try_parse_from(["bp", "diff", "merged", "~/reference"]).unwrap();
        let Commands::Diff { left, right } = cli.command else {
            panic!("expected diff, got {:?}", cli.command);
        };
        assert_eq!(left, PathBuf::from("merged"));
        assert_eq!(right, PathBuf::from("~/reference"));
    }

    #[test]
    fn split_arguments_reach_the_model() {
        let cli = Cli::try_parse_from([
            "bp", "batch", "split", "-i", "~/input", "-c", "10", "-t", "5", "--sp", "compute", "-l", "warn",
        ])
        .unwrap();

        let Commands::Batch {
            command:
                BatchCommands::Split {
                    cells_per_batch,
                    partition,
                    model,
                    in_job,
                    ..
                },
        } = cli.command
        else {
            panic!("expected a split");
        };

        let model = ModelArguments::from(model);
        assert_eq!(cells_per_batch, Some(10));
        assert_eq!(partition, "compute");
        assert_eq!(model.t, 5);
        assert_eq!(model.p, ModelArguments::default().p);
        assert_eq!(model.log_level, "warn");
        assert!(!in_job);
    }

    #[test]
    fn globals_are_forwarded_to_workers() {
        let cli = Cli::try_parse_from(["bp", "monitor", "start", "--config", "bp.yaml", "-vv"]).unwrap();

        assert_eq!(
            cli.global.forwarded(),
            ["--config", "bp.yaml", "-v", "-v"].map(OsString::from).to_vec()
        );
        assert!(!cli.command.is_worker());
    }

    #[test]
    fn merge_accepts_yes_and_variables() {
        let cli = Cli::try_parse_from(["bp", "batch", "merge", "--yes", "--vars", "GPP", "RH"]).unwrap();

        assert!(matches!(
            cli.command,
            Commands::Batch {
                command: BatchCommands::Merge { force: true, ref vars, legacy: None }
            } if vars == &["GPP", "RH"]
        ));
    }
}
