//! Non-blocking supervision of a single external process.
//!
//! The diagnostic stream of the child is switched to non-blocking mode right after spawn,
//! so [`ProcessMonitor::poll`] can be called from an interactive loop without stalling it.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::isolate_process_group;

/// Terminal code when the process could not be started.
pub const SPAWN_FAILURE: i32 = 127;
/// Terminal code for a job stopped because progress stalled.
pub const PROGRESS_TIMEOUT: i32 = 254;
/// Terminal code for a process stopped on request.
pub const STOPPED: i32 = 255;

/// Default time to wait for a graceful exit before killing.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(15);

const READ_CHUNK_SIZE: usize = 64 * 1024;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("a process is already being monitored")]
    AlreadyRunning,
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up diagnostic stream: {0}")]
    Pipe(#[source] io::Error),
}

/// Result of a single [`ProcessMonitor::poll`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// One decoded output line.
    Line(String),
    /// Nothing new right now.
    Idle,
    /// The process has terminated and all output has been consumed.
    Exited(i32),
}

/// Lifecycle wrapper for one external process: idle, running, terminated.
#[derive(Debug)]
pub struct ProcessMonitor {
    child: Option<Child>,
    stderr: Option<ChildStderr>,
    partial: Vec<u8>,
    queue: VecDeque<String>,
    return_code: Option<i32>,
    temp_file: Option<PathBuf>,
    stop_grace: Duration,
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMonitor {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            child: None,
            stderr: None,
            partial: Vec::new(),
            queue: VecDeque::new(),
            return_code: None,
            temp_file: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Set how long [`stop`](Self::stop) waits for a graceful exit.
    #[must_use]
    pub const fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    /// Spawn `argv` with stdout discarded and stderr captured.
    ///
    /// `temp_file` is deleted when the process is stopped.
    /// On spawn failure the monitor is terminated with [`SPAWN_FAILURE`].
    ///
    /// # Errors
    /// Returns an error if a process is already running or the spawn fails.
    pub fn start(&mut self, argv: &[OsString], temp_file: Option<PathBuf>) -> Result<(), MonitorError> {
        if self.child.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        self.partial.clear();
        self.queue.clear();
        self.return_code = None;
        self.temp_file = temp_file;

        let Some((program, args)) = argv.split_first() else {
            self.return_code = Some(SPAWN_FAILURE);
            return Err(MonitorError::EmptyCommand);
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.return_code = Some(SPAWN_FAILURE);
                return Err(MonitorError::Spawn {
                    program: program.to_string_lossy().to_string(),
                    source,
                });
            }
        };

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not captured"))
            .and_then(|stderr| set_nonblocking(&stderr).map(|()| stderr));

        match stderr {
            Ok(stderr) => {
                self.child = Some(child);
                self.stderr = Some(stderr);
                Ok(())
            }
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                self.return_code = Some(SPAWN_FAILURE);
                Err(MonitorError::Pipe(error))
            }
        }
    }

    /// Return the next output line, the exit code, or [`Poll::Idle`].
    ///
    /// Never blocks beyond a single non-blocking read while the process runs.
    pub fn poll(&mut self) -> Poll {
        if let Some(line) = self.queue.pop_front() {
            return Poll::Line(line);
        }
        let Some(child) = self.child.as_mut() else {
            return self.return_code.map_or(Poll::Idle, Poll::Exited);
        };

        let exited = match child.try_wait() {
            Ok(Some(status)) => Some(exit_code(status)),
            Ok(None) => None,
            Err(_) => Some(STOPPED),
        };

        if exited.is_some() {
            self.drain();
        } else {
            self.read_available();
        }

        if let Some(code) = exited {
            self.flush_partial();
            self.return_code = Some(code);
            self.child = None;
            self.stderr = None;
            return self.queue.pop_front().map_or(Poll::Exited(code), Poll::Line);
        }

        self.queue.pop_front().map_or(Poll::Idle, Poll::Line)
    }

    /// Terminate the process if it is running and delete the registered temp file.
    ///
    /// Sends a termination request first and kills the process if it outlives the grace period.
    /// Safe to call repeatedly.
    pub fn stop(&mut self, code: i32) {
        if let Some(mut child) = self.child.take()
            && matches!(child.try_wait(), Ok(None))
        {
            let _ = request_termination(&child);
            let deadline = Instant::now() + self.stop_grace;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) | Err(_) => break,
                    Ok(None) if Instant::now() >= deadline => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => thread::sleep(STOP_POLL_INTERVAL),
                }
            }
        }
        self.stderr = None;
        if let Some(temp_file) = self.temp_file.take()
            && temp_file.exists()
        {
            let _ = fs::remove_file(&temp_file);
        }
        self.partial.clear();
        self.queue.clear();
        self.return_code = Some(code);
    }

    /// True while a child process is attached.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Terminal code once known.
    #[must_use]
    pub const fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    /// OS process id of the running child.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Temp output registered for cleanup.
    #[must_use]
    pub fn temp_file(&self) -> Option<&Path> {
        self.temp_file.as_deref()
    }

    fn read_available(&mut self) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        if let Ok(count) = stderr.read(&mut buffer)
            && count > 0
        {
            self.push_bytes(&buffer[..count]);
        }
    }

    /// Read everything left in the pipe of an exited process.
    fn drain(&mut self) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };
        let mut remaining = Vec::new();
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match stderr.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => remaining.extend_from_slice(&buffer[..count]),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        self.push_bytes(&remaining);
    }

    /// Append bytes and queue every complete line.
    ///
    /// Both `\r` and `\n` terminate a line; empty fragments are dropped.
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        let Some(last) = self.partial.iter().rposition(|&byte| is_line_break(byte)) else {
            return;
        };
        let rest = self.partial.split_off(last + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        for fragment in complete.split(|&byte| is_line_break(byte)) {
            if !fragment.is_empty() {
                self.queue.push_back(String::from_utf8_lossy(fragment).into_owned());
            }
        }
    }

    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.queue.push_back(line);
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop(STOPPED);
        }
    }
}

const fn is_line_break(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(STOPPED)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn set_nonblocking(stderr: &ChildStderr) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = stderr.as_raw_fd();
    // SAFETY: `fd` is an open descriptor owned by `stderr`, which outlives both calls.
    // fcntl with F_GETFL / F_SETFL only reads and updates the descriptor status flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: see above.
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_nonblocking(_stderr: &ChildStderr) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "non-blocking pipes are only supported on unix",
    ))
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn request_termination(child: &Child) -> io::Result<()> {
    let pid = libc::pid_t::try_from(child.id()).map_err(io::Error::other)?;
    // SAFETY: kill only sends a signal; `pid` is our own child which has not been reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is only supported on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(monitor: &mut ProcessMonitor, bytes: &[u8]) -> Vec<String> {
        monitor.push_bytes(bytes);
        monitor.queue.drain(..).collect()
    }

    #[test]
    fn splits_on_carriage_return_and_newline() {
        let mut monitor = ProcessMonitor::new();
        let lines = feed(&mut monitor, b"frame=1 fps=0.0\rframe=2 fps=1.0\r\nInput #0\n\nframe=3");
        assert_eq!(lines, ["frame=1 fps=0.0", "frame=2 fps=1.0", "Input #0"]);
        assert_eq!(monitor.partial, b"frame=3");
    }

    #[test]
    fn partial_line_is_completed_by_next_chunk() {
        let mut monitor = ProcessMonitor::new();
        assert!(feed(&mut monitor, b"frame=  12 ti").is_empty());
        assert_eq!(feed(&mut monitor, b"me=00:00:01.00\r"), ["frame=  12 time=00:00:01.00"]);
        assert!(monitor.partial.is_empty());
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut monitor = ProcessMonitor::new();
        let lines = feed(&mut monitor, b"bad \xff byte\n");
        assert_eq!(lines, ["bad \u{FFFD} byte"]);
    }

    #[test]
    fn unstarted_monitor_is_idle() {
        let mut monitor = ProcessMonitor::new();
        assert_eq!(monitor.poll(), Poll::Idle);
        assert!(!monitor.is_running());
    }

    #[test]
    fn empty_command_terminates_with_spawn_failure() {
        let mut monitor = ProcessMonitor::new();
        assert!(matches!(monitor.start(&[], None), Err(MonitorError::EmptyCommand)));
        assert_eq!(monitor.poll(), Poll::Exited(SPAWN_FAILURE));
    }

    #[test]
    fn missing_program_terminates_with_spawn_failure() {
        let mut monitor = ProcessMonitor::new();
        let result = monitor.start(&[OsString::from("/nonexistent/media-shrink-encoder")], None);
        assert!(matches!(result, Err(MonitorError::Spawn { .. })));
        assert!(!monitor.is_running());
        assert_eq!(monitor.poll(), Poll::Exited(SPAWN_FAILURE));
        assert_eq!(monitor.poll(), Poll::Exited(SPAWN_FAILURE));
    }

    #[test]
    fn stop_without_process_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("TEMP.video.mkv");
        fs::write(&temp, b"partial").unwrap();

        let mut monitor = ProcessMonitor::new();
        monitor.temp_file = Some(temp.clone());
        monitor.stop(STOPPED);
        monitor.stop(STOPPED);

        assert!(!temp.exists());
        assert_eq!(monitor.poll(), Poll::Exited(STOPPED));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;

        fn shell(script: &str) -> Vec<OsString> {
            vec!["/bin/sh".into(), "-c".into(), script.into()]
        }

        fn run_to_exit(monitor: &mut ProcessMonitor) -> (Vec<String>, i32) {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut lines = Vec::new();
            loop {
                match monitor.poll() {
                    Poll::Line(line) => lines.push(line),
                    Poll::Exited(code) => return (lines, code),
                    Poll::Idle => {
                        assert!(Instant::now() < deadline, "process did not exit in time");
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        }

        #[test]
        fn collects_lines_then_exit_code() {
            let mut monitor = ProcessMonitor::new();
            monitor
                .start(&shell("printf 'one\\rtwo\\n\\nthree' >&2; exit 3"), None)
                .unwrap();

            let (lines, code) = run_to_exit(&mut monitor);
            assert_eq!(lines, ["one", "two", "three"]);
            assert_eq!(code, 3);
            assert!(!monitor.is_running());
            assert_eq!(monitor.poll(), Poll::Exited(3));
        }

        #[test]
        fn stdout_is_discarded() {
            let mut monitor = ProcessMonitor::new();
            monitor.start(&shell("echo stdout; echo stderr >&2"), None).unwrap();

            let (lines, code) = run_to_exit(&mut monitor);
            assert_eq!(lines, ["stderr"]);
            assert_eq!(code, 0);
        }

        #[test]
        fn poll_does_not_block_on_silent_process() {
            let mut monitor = ProcessMonitor::new().with_stop_grace(Duration::from_secs(5));
            monitor.start(&shell("sleep 5"), None).unwrap();

            for _ in 0..20 {
                let started = Instant::now();
                assert_eq!(monitor.poll(), Poll::Idle);
                assert!(started.elapsed() < Duration::from_millis(200));
            }

            let started = Instant::now();
            monitor.stop(STOPPED);
            assert!(started.elapsed() < Duration::from_secs(4));
            assert_eq!(monitor.poll(), Poll::Exited(STOPPED));
        }

        #[test]
        fn start_while_running_is_rejected() {
            let mut monitor = ProcessMonitor::new();
            monitor.start(&shell("sleep 5"), None).unwrap();
            assert!(matches!(
                monitor.start(&shell("true"), None),
                Err(MonitorError::AlreadyRunning)
            ));
            monitor.stop(STOPPED);
        }

        #[test]
        fn stop_kills_process_ignoring_termination() {
            let dir = tempfile::tempdir().unwrap();
            let temp = dir.path().join("TEMP.out.mkv");
            fs::write(&temp, b"partial").unwrap();

            let mut monitor = ProcessMonitor::new().with_stop_grace(Duration::from_millis(200));
            monitor
                .start(&shell("trap '' TERM; while true; do sleep 1; done"), Some(temp.clone()))
                .unwrap();
            thread::sleep(Duration::from_millis(100));

            let started = Instant::now();
            monitor.stop(PROGRESS_TIMEOUT);
            assert!(started.elapsed() < Duration::from_secs(3));
            assert!(!temp.exists());
            assert!(!monitor.is_running());
            assert_eq!(monitor.poll(), Poll::Exited(PROGRESS_TIMEOUT));
        }

        #[test]
        fn monitor_is_reusable_after_exit() {
            let mut monitor = ProcessMonitor::new();
            monitor.start(&shell("echo first >&2"), None).unwrap();
            assert_eq!(run_to_exit(&mut monitor), (vec!["first".to_string()], 0));

            monitor.start(&shell("echo second >&2; exit 1"), None).unwrap();
            assert_eq!(run_to_exit(&mut monitor), (vec!["second".to_string()], 1));
        }
    }
}
