use super::MonitorError;
use nix::{
    errno::Errno,
    sys::signal::{kill, signal, SigHandler, Signal},
    unistd::{setsid, Pid},
};
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_: nix::libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Route SIGTERM and SIGINT into a flag polled by the worker loops
pub fn install_stop_handler() -> Result<&'static AtomicBool, MonitorError> {
    for kind in [Signal::SIGTERM, Signal::SIGINT] {
        // the handler only touches an atomic
        unsafe { signal(kind, SigHandler::Handler(request_stop)) }?;
    }

    Ok(&STOP_REQUESTED)
}

/// Sleep for `duration` in short steps so a stop request is honoured quickly
pub fn pause(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;

    while !stop.load(Ordering::SeqCst) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        thread::sleep(left.min(Duration::from_millis(250)));
    }
}

fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // exists, but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    AlreadyRunning(i32),
}

/// Background worker managed through a PID file
#[derive(Debug, Clone)]
pub struct Daemon {
    pub name: &'static str,
    pub pidfile: PathBuf,
    pub logfile: PathBuf,
    pub stop_timeout: Duration,
}

impl Daemon {
    pub fn new(name: &'static str, pidfile: PathBuf, logfile: PathBuf) -> Self {
        Self {
            name,
            pidfile,
            logfile,
            stop_timeout: Duration::from_secs(30),
        }
    }

    pub fn read_pid(&self) -> Option<i32> {
        fs::read_to_string(&self.pidfile)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    /// PID of the running worker
    pub fn status(&self) -> Option<i32> {
        let pid = self.read_pid()?;

        if is_alive(pid) {
            Some(pid)
        } else {
            debug!(pid = pid, pidfile = ?self.pidfile, "Stale PID file");
            None
        }
    }

    /// Create the PID file exclusively, `None` when another start already holds it
    fn claim(&self) -> Result<Option<File>, MonitorError> {
        let io_error = |source| MonitorError::Io {
            path: self.pidfile.clone(),
            source,
        };

        if let Some(parent) = self.pidfile.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        if let Some(stale) = self.read_pid().filter(|pid| !is_alive(*pid)) {
            debug!(pid = stale, pidfile = ?self.pidfile, "Removing stale PID file");
            self.remove_pidfile();
        }

        match OpenOptions::new().write(true).create_new(true).open(&self.pidfile) {
            Ok(file) => Ok(Some(file)),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(error) => Err(io_error(error)),
        }
    }

    /// Another start won the PID file, wait until it names its worker
    fn await_claimant(&self) -> Result<StartOutcome, MonitorError> {
        let deadline = Instant::now() + Duration::from_secs(2);

        loop {
            if let Some(pid) = self.status() {
                info!(pid = pid, "{} was started concurrently", self.name);
                return Ok(StartOutcome::AlreadyRunning(pid));
            }
            if Instant::now() >= deadline {
                return Err(MonitorError::StartInProgress(self.pidfile.clone()));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Re-spawn the current executable with `args`, the child detaches itself via [`PidGuard`]
    pub fn start(&self, args: &[OsString]) -> Result<StartOutcome, MonitorError> {
        if let Some(pid) = self.status() {
            info!(pid = pid, logfile = ?self.logfile, "{} is already running", self.name);
            return Ok(StartOutcome::AlreadyRunning(pid));
        }

        let Some(mut pidfile) = self.claim()? else {
            return self.await_claimant();
        };

        let executable = std::env::current_exe().map_err(MonitorError::Spawn)?;
        let io_error = |source| MonitorError::Io {
            path: self.logfile.clone(),
            source,
        };

        if let Some(parent) = self.logfile.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.logfile)
            .map_err(io_error)?;
        let log_err = log.try_clone().map_err(io_error)?;

        let child = match Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                self.remove_pidfile();
                return Err(MonitorError::Spawn(error));
            }
        };
        writeln!(pidfile, "{}", child.id()).map_err(|source| MonitorError::Io {
            path: self.pidfile.clone(),
            source,
        })?;

        info!(
            pid = child.id(),
            pidfile = ?self.pidfile,
            logfile = ?self.logfile,
            "Started {} in the background",
            self.name
        );
        Ok(StartOutcome::Started(child.id()))
    }

    /// SIGTERM, then SIGKILL once `stop_timeout` has passed. `false` when nothing was running
    pub fn stop(&self) -> Result<bool, MonitorError> {
        let Some(pid) = self.status() else {
            info!("{} is not running", self.name);
            self.remove_pidfile();
            return Ok(false);
        };

        let target = Pid::from_raw(pid);
        kill(target, Signal::SIGTERM)?;

        let deadline = Instant::now() + self.stop_timeout;
        while is_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(200));
        }

        if is_alive(pid) {
            warn!(pid = pid, "Force killing {}", self.name);
            match kill(target, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(error) => return Err(error.into()),
            }
        }

        self.remove_pidfile();
        info!(pid = pid, "{} stopped", self.name);
        Ok(true)
    }

    pub fn restart(&self, args: &[OsString]) -> Result<StartOutcome, MonitorError> {
        self.stop()?;
        thread::sleep(Duration::from_secs(1));
        self.start(args)
    }

    fn remove_pidfile(&self) {
        match fs::remove_file(&self.pidfile) {
            Ok(()) => debug!(pidfile = ?self.pidfile, "Removed PID file"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => error!(error = ?error, pidfile = ?self.pidfile, "Failed to remove PID file"),
        }
    }
}

/// Held by the detached worker, removes the PID file on orderly exit
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    pub fn acquire(daemon: &Daemon) -> Result<Self, MonitorError> {
        if let Some(pid) = daemon.status() {
            if pid != std::process::id() as i32 {
                return Err(MonitorError::AlreadyRunning(pid));
            }
        }

        // leave the session of the invoking shell
        match setsid() {
            Ok(session) => debug!(session = %session, "Started new session"),
            Err(Errno::EPERM) => debug!("Already a process group leader, keeping the session"),
            Err(error) => return Err(error.into()),
        }

        Self::write(&daemon.pidfile)
    }

    fn write(path: &Path) -> Result<Self, MonitorError> {
        let io_error = |source| MonitorError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, format!("{}\n", std::process::id())).map_err(io_error)?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(pidfile = ?self.path, "Removed PID file"),
            Err(error) => error!(error = ?error, pidfile = ?self.path, "Failed to remove PID file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon(directory: &Path) -> Daemon {
        Daemon::new(
            "test worker",
            directory.join("worker.pid"),
            directory.join("worker.log"),
        )
    }

    #[test]
    fn stopping_without_worker_is_clean() {
        let directory = tempfile::tempdir().unwrap();
        let daemon = daemon(directory.path());

        assert_eq!(daemon.status(), None);
        assert!(!daemon.stop().unwrap());
    }

    #[test]
    fn stale_pid_files_are_ignored() {
        let directory = tempfile::tempdir().unwrap();
        let daemon = daemon(directory.path());
        // pid_max is far below this
        fs::write(&daemon.pidfile, "999999999\n").unwrap();

        assert_eq!(daemon.read_pid(), Some(999_999_999));
        assert_eq!(daemon.status(), None);
        assert!(!daemon.stop().unwrap());
        assert!(!daemon.pidfile.exists());
    }

    #[test]
    fn stop_terminates_the_recorded_process() {
        let directory = tempfile::tempdir().unwrap();
        let mut daemon = daemon(directory.path());
        daemon.stop_timeout = Duration::from_secs(5);

        let mut child = Command::new("sleep").arg("60").spawn().unwrap();
        fs::write(&daemon.pidfile, format!("{}\n", child.id())).unwrap();
        assert_eq!(daemon.status(), Some(child.id() as i32));

        // reap concurrently so the process does not linger as a zombie
        let reaper = thread::spawn(move || child.wait().unwrap());
        assert!(daemon.stop().unwrap());
        assert!(!reaper.join().unwrap().success());
        assert!(!daemon.pidfile.exists());
    }

    #[test]
    fn pid_file_is_claimed_once() {
        let directory = tempfile::tempdir().unwrap();
        let daemon = daemon(directory.path());

        let mut claimed = daemon.claim().unwrap().unwrap();
        assert!(daemon.claim().unwrap().is_none());

        writeln!(claimed, "{}", std::process::id()).unwrap();
        let pid = std::process::id() as i32;
        assert_eq!(daemon.status(), Some(pid));
        assert_eq!(daemon.start(&[]).unwrap(), StartOutcome::AlreadyRunning(pid));
    }

    #[test]
    fn stale_pid_files_can_be_claimed() {
        let directory = tempfile::tempdir().unwrap();
        let daemon = daemon(directory.path());
        fs::write(&daemon.pidfile, "999999999\n").unwrap();

        assert!(daemon.claim().unwrap().is_some());
        assert_eq!(daemon.read_pid(), None);
    }

    #[test]
    fn guard_owns_the_pid_file() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("guard.pid");

        {
            let _guard = PidGuard::write(&path).unwrap();
            assert_eq!(
                fs::read_to_string(&path).unwrap().trim(),
                std::process::id().to_string()
            );
        }

        assert!(!path.exists());
    }

    #[test]
    fn pause_returns_early_when_stopped() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        pause(Duration::from_secs(30), &stop);

        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
