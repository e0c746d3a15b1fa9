use super::{Command, CommandError, Context};
use crate::{
    elapsed::ElapsedTracker,
    monitor::{
        daemon::{install_stop_handler, Daemon, PidGuard, StartOutcome},
        Monitor, Strategy,
    },
};
use clap::ValueEnum;
use std::{ffi::OsString, time::Duration};
use tracing::info;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    Start,
    Stop,
    Restart,
    Status,
    /// the detached process itself
    #[value(hide = true)]
    Worker,
}

pub fn monitor_daemon(ctx: &Context) -> Daemon {
    Daemon::new(
        "monitor",
        ctx.environment.home.join(".slurm-monitor.pid"),
        ctx.environment.home.join(".slurm-monitor.log"),
    )
}

pub fn run_check_daemon(ctx: &Context) -> Daemon {
    Daemon::new(
        "run_check",
        ctx.layout.work_dir.join("run_check.pid"),
        ctx.layout.work_dir.join("run_check.out"),
    )
}

pub fn elapsed_daemon(ctx: &Context) -> Daemon {
    Daemon::new(
        "elapsed",
        ctx.layout.work_dir.join("elapsed.pid"),
        ctx.layout.work_dir.join("elapsed.log"),
    )
}

fn announce(daemon: &Daemon, outcome: StartOutcome) {
    match outcome {
        StartOutcome::Started(pid) => println!(
            "The background job is started with PID {pid}. Check {} for the logs.",
            daemon.logfile.display()
        ),
        StartOutcome::AlreadyRunning(pid) => {
            println!("{} is already running with PID {pid}.", daemon.name)
        }
    }
}

/// Shared start/stop/restart/status handling, `work` runs inside the detached worker
fn control<F>(daemon: &Daemon, action: DaemonAction, args: &[OsString], work: F) -> Result<(), CommandError>
where
    F: FnOnce() -> Result<(), CommandError>,
{
    match action {
        DaemonAction::Start => announce(daemon, daemon.start(args)?),
        DaemonAction::Restart => announce(daemon, daemon.restart(args)?),
        DaemonAction::Stop => {
            if !daemon.stop()? {
                println!("{} is not running.", daemon.name);
            }
        }
        DaemonAction::Status => match daemon.status() {
            Some(pid) => println!("{} is running with PID {pid}.", daemon.name),
            None => println!("{} is not running.", daemon.name),
        },
        DaemonAction::Worker => {
            let _guard = PidGuard::acquire(daemon)?;
            info!(pid = std::process::id(), "{} worker started", daemon.name);
            return work();
        }
    }

    Ok(())
}

fn run_monitor(ctx: &Context, names: &[String], instance_count: Option<usize>) -> Result<(), CommandError> {
    let stop = install_stop_handler()?;
    let mut config = ctx.config.clone();
    if let Some(count) = instance_count {
        config.monitor.instances.count = count;
    }

    let strategies = Strategy::from_config(&config, &ctx.layout, names)?;
    Monitor::new(strategies, Duration::from_secs(config.monitor.interval)).run(&ctx.executor, stop);

    Ok(())
}

/// Health checks over the submitted batches
#[derive(Debug, Clone)]
pub struct MonitorCommand {
    pub action: DaemonAction,
    pub strategies: Vec<String>,
    pub instance_count: Option<usize>,
}

impl MonitorCommand {
    fn strategy_names(&self, ctx: &Context) -> Vec<String> {
        if self.strategies.is_empty() {
            ctx.config.monitor.strategies.clone()
        } else {
            self.strategies.iter().map(|name| name.to_lowercase()).collect()
        }
    }

    pub fn worker_args(&self, ctx: &Context) -> Vec<OsString> {
        let mut args = vec!["monitor".to_string(), "worker".to_string()];
        for name in &self.strategies {
            args.push("--strategy".to_string());
            args.push(name.clone());
        }
        if let Some(count) = self.instance_count {
            args.push("--instance-count".to_string());
            args.push(count.to_string());
        }

        ctx.worker_args(args)
    }
}

impl Command for MonitorCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        control(&monitor_daemon(ctx), self.action, &self.worker_args(ctx), || {
            run_monitor(ctx, &self.strategy_names(ctx), self.instance_count)
        })
    }
}

/// Log pattern resubmission on its own
#[derive(Debug, Clone)]
pub struct RunCheckCommand {
    pub action: DaemonAction,
}

impl Command for RunCheckCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let args = ctx.worker_args(["run_check", "worker"]);

        control(&run_check_daemon(ctx), self.action, &args, || {
            run_monitor(ctx, &["log-pattern".to_string()], None)
        })
    }
}

/// Time until the submitter's queue is empty
#[derive(Debug, Clone, Default)]
pub struct ElapsedCommand {
    pub detach: bool,
    pub worker: bool,
}

impl ElapsedCommand {
    fn track(ctx: &Context) -> Result<(), CommandError> {
        let stop = install_stop_handler()?;
        let tracker = ElapsedTracker::new(&ctx.layout, &ctx.config.elapsed);
        println!("Timer has started. Check {} for the results.", tracker.record().display());

        if let Some(elapsed) = tracker.run(&ctx.executor, stop)? {
            println!(
                "The timer has stopped after {}. Check {} for the results.",
                crate::elapsed::format_elapsed(elapsed),
                tracker.record().display()
            );
        }

        Ok(())
    }
}

impl Command for ElapsedCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let daemon = elapsed_daemon(ctx);
        let args = ctx.worker_args(["elapsed", "--worker"]);

        match (self.worker, self.detach) {
            (true, _) => control(&daemon, DaemonAction::Worker, &args, || Self::track(ctx)),
            (false, true) => control(&daemon, DaemonAction::Start, &args, || Ok(())),
            (false, false) => Self::track(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::context;

    #[test]
    fn worker_arguments_carry_globals_and_overrides() {
        let directory = tempfile::tempdir().unwrap();
        let mut ctx = context(directory.path());
        ctx.forwarded = vec!["--config".into(), "/tmp/bp.yaml".into()];

        let command = MonitorCommand {
            action: DaemonAction::Start,
            strategies: vec!["Preemption".to_string(), "instances".to_string()],
            instance_count: Some(4),
        };

        let args: Vec<String> = command
            .worker_args(&ctx)
            .into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            [
                "--config",
                "/tmp/bp.yaml",
                "monitor",
                "worker",
                "--strategy",
                "Preemption",
                "--strategy",
                "instances",
                "--instance-count",
                "4"
            ]
        );
        assert_eq!(command.strategy_names(&ctx), vec!["preemption", "instances"]);
    }

    #[test]
    fn configured_strategies_are_the_default() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());
        let command = MonitorCommand {
            action: DaemonAction::Status,
            strategies: Vec::new(),
            instance_count: None,
        };

        assert_eq!(command.strategy_names(&ctx), vec!["preemption"]);
        command.execute(&ctx).unwrap();
    }

    #[test]
    fn stopping_an_idle_worker_succeeds() {
        let directory = tempfile::tempdir().unwrap();
        let ctx = context(directory.path());

        RunCheckCommand {
            action: DaemonAction::Stop,
        }
        .execute(&ctx)
        .unwrap();
        assert!(!run_check_daemon(&ctx).pidfile.exists());
    }
}
