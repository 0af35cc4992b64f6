//! One conversion attempt of a single file.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::transcode::monitor::{PROGRESS_TIMEOUT, Poll, ProcessMonitor, STOPPED};
use crate::transcode::probe::ProbeRecord;
use crate::transcode::progress::{Extracted, ProgressExtractor, StallWatch};

/// Marker inserted into converted file names.
pub const OUTPUT_MARKER: &str = ".x265";
/// Name prefix of in-progress encoder output.
pub const TEMP_PREFIX: &str = "TEMP.";
/// Name prefix of preserved originals.
pub const BACKUP_PREFIX: &str = "ORIG.";
/// Container of converted files.
const OUTPUT_EXTENSION: &str = "mkv";

/// Diagnostic line appended when the stall timer fires.
pub const TIMEOUT_TEXT: &str = "PROGRESS TIMEOUT";

/// Decoder error substrings with their severity weight, and the score that flags likely corruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionPolicy {
    pub signals: Vec<(String, u32)>,
    pub threshold: u32,
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        let signals = [
            ("corrupt decoded frame", 10),
            ("illegal mb_num", 9),
            ("marker does not match f_code", 9),
            ("damaged at", 8),
            ("Error at MB:", 7),
            ("time_increment_bits", 6),
            ("slice end not reached", 5),
            ("concealing", 2),
        ];
        Self {
            signals: signals
                .iter()
                .map(|(signal, weight)| ((*signal).to_string(), *weight))
                .collect(),
            threshold: 30,
        }
    }
}

impl CorruptionPolicy {
    /// Weighted score and event count for the given lines.
    ///
    /// Each line counts at most once, for the first signal it contains.
    #[must_use]
    pub fn score<S: AsRef<str>>(&self, lines: &[S]) -> (u32, usize) {
        lines
            .iter()
            .filter_map(|line| {
                self.signals
                    .iter()
                    .find(|(signal, _)| line.as_ref().contains(signal.as_str()))
                    .map(|(_, weight)| *weight)
            })
            .fold((0, 0), |(score, events), weight| (score + weight, events + 1))
    }

    /// Summary line when the score reaches the threshold.
    #[must_use]
    pub fn assess<S: AsRef<str>>(&self, lines: &[S], return_code: i32) -> Option<String> {
        let (score, events) = self.score(lines);
        (score >= self.threshold).then(|| {
            format!(
                "CORRUPT VIDEO: Total Severity Score {score} from {events} events. FFmpeg error_code={return_code}"
            )
        })
    }
}

/// Final name of a converted file: `<stem>.x265.mkv` next to the input.
#[must_use]
pub fn output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    input.with_file_name(format!("{stem}{OUTPUT_MARKER}.{OUTPUT_EXTENSION}"))
}

/// Encoder output location: `TEMP.<output name>` next to the input.
#[must_use]
pub fn temp_path(input: &Path) -> PathBuf {
    let output = output_path(input);
    let name = output.file_name().unwrap_or_default().to_string_lossy();
    input.with_file_name(format!("{TEMP_PREFIX}{name}"))
}

/// Backup location of the original: `ORIG.<name>` next to the input.
#[must_use]
pub fn backup_path(input: &Path) -> PathBuf {
    let name = input.file_name().unwrap_or_default().to_string_lossy();
    input.with_file_name(format!("{BACKUP_PREFIX}{name}"))
}

/// A running or finished conversion.
#[derive(Debug)]
pub struct Job {
    input: PathBuf,
    temp_file: PathBuf,
    backup_file: PathBuf,
    started: Instant,
    duration_secs: f64,
    original_size: u64,
    monitor: ProcessMonitor,
    extractor: ProgressExtractor,
    stall: StallWatch,
    command: String,
    progress: String,
    texts: Vec<String>,
    return_code: Option<i32>,
}

impl Job {
    /// Prepare a job for `input` described by `record`.
    ///
    /// `stall_limit` is the longest allowed gap between progress lines.
    #[must_use]
    pub fn new(input: &Path, record: &ProbeRecord, stall_limit: Duration, now: Instant) -> Self {
        Self {
            input: input.to_path_buf(),
            temp_file: temp_path(input),
            backup_file: backup_path(input),
            started: now,
            duration_secs: record.duration,
            original_size: record.size_bytes,
            monitor: ProcessMonitor::new(),
            extractor: ProgressExtractor::new(record.duration, record.fps, now),
            stall: StallWatch::new(stall_limit, now),
            command: String::new(),
            progress: "Started".to_string(),
            texts: Vec::new(),
            return_code: None,
        }
    }

    /// Replace the process monitor, for example to change its stop grace period.
    #[must_use]
    pub fn with_monitor(mut self, monitor: ProcessMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Launch the encoder.
    ///
    /// A spawn failure is recorded in the diagnostic lines and surfaces as the exit code on the next tick.
    pub fn start(&mut self, argv: &[OsString]) {
        self.command = quote_command(argv);
        if let Err(error) = self.monitor.start(argv, Some(self.temp_file.clone())) {
            self.texts.push(error.to_string());
        }
    }

    /// Consume all output available now and return the exit code once the job is over.
    ///
    /// Stops the encoder with [`PROGRESS_TIMEOUT`] when no progress line arrived within the stall limit.
    pub fn tick(&mut self, now: Instant) -> Option<i32> {
        if self.return_code.is_some() {
            return self.return_code;
        }
        loop {
            match self.monitor.poll() {
                Poll::Line(line) => match self.extractor.extract(&line, now) {
                    Extracted::Progress(progress) => {
                        self.stall.observe(now);
                        self.progress = progress.to_string();
                    }
                    Extracted::Throttled => self.stall.observe(now),
                    Extracted::Diagnostic => self.texts.push(line),
                },
                Poll::Exited(code) => {
                    self.return_code = Some(code);
                    return Some(code);
                }
                Poll::Idle => break,
            }
        }
        if self.stall.is_stalled(now) {
            self.texts.push(TIMEOUT_TEXT.to_string());
            self.monitor.stop(PROGRESS_TIMEOUT);
            self.return_code = Some(PROGRESS_TIMEOUT);
        }
        self.return_code
    }

    /// Stop the encoder on operator request; the temp output is deleted.
    pub fn abort(&mut self) {
        self.monitor.stop(STOPPED);
        self.return_code = Some(STOPPED);
    }

    #[must_use]
    pub fn input(&self) -> &Path {
        &self.input
    }

    #[must_use]
    pub fn temp_file(&self) -> &Path {
        &self.temp_file
    }

    #[must_use]
    pub fn backup_file(&self) -> &Path {
        &self.backup_file
    }

    #[must_use]
    pub const fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    #[must_use]
    pub const fn original_size(&self) -> u64 {
        self.original_size
    }

    /// Wall time since the job was created.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Latest progress text.
    #[must_use]
    pub fn progress(&self) -> &str {
        &self.progress
    }

    /// Shell-quoted encoder command line.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Non-progress output lines collected so far.
    #[must_use]
    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    /// Append a diagnostic line.
    pub fn push_text(&mut self, text: impl Into<String>) {
        self.texts.push(text.into());
    }

    /// Final code once terminal.
    #[must_use]
    pub const fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    /// Take the collected lines, leaving the job empty.
    pub fn take_texts(&mut self) -> Vec<String> {
        std::mem::take(&mut self.texts)
    }
}

/// Quote arguments for display as a POSIX shell command.
#[must_use]
pub fn quote_command(argv: &[OsString]) -> String {
    let mut command = String::new();
    for (index, arg) in argv.iter().enumerate() {
        if index > 0 {
            command.push(' ');
        }
        let arg = arg.to_string_lossy();
        let plain = !arg.is_empty()
            && arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
        if plain {
            command.push_str(&arg);
        } else {
            let _ = write!(command, "'{}'", arg.replace('\'', r"'\''"));
        }
    }
    command
}
