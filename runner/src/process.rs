use std::{
    ffi::OsStr,
    fmt::Write as _,
    process::{Command, ExitStatus, Stdio},
};
use thiserror::Error;
use tracing::{debug, trace};

/// Failure of an external program (scheduler or array tool)
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
}

#[derive(Debug, Clone)]
/// container for the output of a finished external program
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// Render a command the way a user would type it, used for logging
pub fn describe(command: &Command) -> String {
    let mut line = program_name(command);

    for arg in command.get_args() {
        let _ = write!(line, " {}", arg.to_string_lossy());
    }

    line
}

/// Run `command` to completion and capture its output.
///
/// A non-zero exit status is turned into [`ProcessError::Failed`] carrying both output streams so
/// that call sites can print what the tool said.
pub fn capture(command: &mut Command) -> Result<Captured, ProcessError> {
    let program = program_name(command);
    debug!(command = %describe(command), "Running external command");

    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    trace!(stdout = %stdout, stderr = %stderr, "Command output");

    if output.status.success() {
        Ok(Captured { stdout, stderr })
    } else {
        Err(ProcessError::Failed {
            program,
            status: output.status,
            stdout,
            stderr,
        })
    }
}

/// Convenience to build a [`Command`] from a program and a list of arguments
pub fn command<I, S>(program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    command
}
