use bp_runner::{
    cli::{Cli, GlobalArgs},
    commands::{CommandError, Context},
};
use clap::Parser;
use std::{
    error::Error,
    io::{stderr, IsTerminal},
    process::ExitCode,
};
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

fn init_logging(global: &GlobalArgs, worker: bool) {
    // -v wins over BP_LOG
    let filter = match global.verbose {
        0 => EnvFilter::try_from_env("BP_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::default().add_directive(Level::DEBUG.into()),
        _ => EnvFilter::default().add_directive(Level::TRACE.into()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(stderr)
        .with_ansi(!worker && stderr().is_terminal())
        .init();
}

fn run(cli: Cli) -> Result<(), CommandError> {
    let ctx = Context::load(
        cli.global.config.as_deref(),
        cli.global.batches.as_deref(),
        cli.global.forwarded(),
    )?;

    cli.command
        .into_command(std::env::args().collect())
        .execute(&ctx)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.global, cli.command.is_worker());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!("{failure}");
            let mut source = failure.source();
            while let Some(cause) = source {
                error!("caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}
