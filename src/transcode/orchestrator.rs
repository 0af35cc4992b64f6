//! Selection and conversion state machine.
//!
//! The orchestrator owns the candidate list and at most one [`Job`]. The caller drives it with
//! operator [`Input`]s and periodic [`Orchestrator::tick`] calls; rendering and logging of the
//! returned reports is left to the caller.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::transcode::anomaly::Anomaly;
use crate::transcode::cache::MetadataCache;
use crate::transcode::job::{BACKUP_PREFIX, CorruptionPolicy, Job, OUTPUT_MARKER, TEMP_PREFIX};
use crate::transcode::monitor::{DEFAULT_STOP_GRACE, PROGRESS_TIMEOUT, ProcessMonitor, STOPPED};
use crate::transcode::probe::ProbeRecord;

/// Builds the encoder command line for one file.
pub trait CommandBuilder {
    /// Argument vector encoding `input` into `output`.
    fn build(&self, input: &Path, output: &Path, record: &ProbeRecord) -> Vec<OsString>;
}

/// Replaces an original with its converted version.
pub trait FileSwapper {
    /// Retire `original` (to `backup` or elsewhere) and move `temp` into place.
    ///
    /// Returns the final path of the converted file.
    ///
    /// # Errors
    /// Returns the file system error that stopped the swap.
    fn swap(&self, original: &Path, temp: &Path, backup: &Path) -> io::Result<PathBuf>;
}

/// Codecs that count as already efficient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum CodecFilter {
    /// Only HEVC.
    #[default]
    #[value(name = "x265")]
    #[serde(rename = "x265")]
    X265,
    /// HEVC or H.264.
    #[value(name = "x26*")]
    #[serde(rename = "x26*")]
    X26x,
    /// Any codec.
    #[value(name = "all")]
    #[serde(rename = "all")]
    All,
}

impl CodecFilter {
    #[must_use]
    pub fn allows(self, codec: &str) -> bool {
        match self {
            Self::X265 => codec == "hevc",
            Self::X26x => matches!(codec, "hevc" | "h264"),
            Self::All => true,
        }
    }
}

impl fmt::Display for CodecFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::X265 => "x265",
            Self::X26x => "x26*",
            Self::All => "all",
        };
        write!(f, "{name}")
    }
}

/// Decides which files are worth converting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub bloat_threshold: u64,
    pub max_height: u32,
    pub codecs: CodecFilter,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            bloat_threshold: 1600,
            max_height: 1080,
            codecs: CodecFilter::default(),
        }
    }
}

impl SelectionPolicy {
    /// True unless resolution, bloat and codec are all acceptable.
    #[must_use]
    pub fn needs_work(&self, record: &ProbeRecord) -> bool {
        let height_ok = record.height <= self.max_height;
        let bloat_ok = record.bloat() < self.bloat_threshold;
        let codec_ok = self.codecs.allows(&record.codec);
        !(height_ok && bloat_ok && codec_ok)
    }
}

/// Tunables for the conversion loop.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub policy: SelectionPolicy,
    /// Minimum size reduction in percent for a conversion to be kept.
    pub min_shrink_percent: f64,
    /// Longest allowed gap between encoder progress lines.
    pub progress_timeout: Duration,
    /// Grace period for the encoder to exit after a stop request.
    pub stop_grace: Duration,
    pub corruption: CorruptionPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            min_shrink_percent: 10.0,
            progress_timeout: Duration::from_secs(30),
            stop_grace: DEFAULT_STOP_GRACE,
            corruption: CorruptionPolicy::default(),
        }
    }
}

/// Top-level mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Select,
    Convert,
    /// Help overlay; a running job keeps advancing underneath.
    Help,
}

/// Final classification of a finished candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Converted,
    /// Encoded fine but saved too little.
    Rejected,
    Failed,
    TimedOut,
    /// Swap failed half way; files need manual attention.
    NeedsCleanup,
}

/// Per-candidate selection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Unpicked,
    Picked,
    InProgress,
    Done(Verdict),
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unpicked => "[ ]",
            Self::Picked => "[X]",
            Self::InProgress => "IP ",
            Self::Done(Verdict::Converted) => " OK",
            Self::Done(Verdict::Rejected) => "OPT",
            Self::Done(Verdict::Failed | Verdict::TimedOut) => "ERR",
            Self::Done(Verdict::NeedsCleanup) => "!!!",
        };
        write!(f, "{label}")
    }
}

/// A file that can be selected for conversion.
#[derive(Debug, Clone)]
pub struct Candidate {
    path: PathBuf,
    record: ProbeRecord,
    selection: Selection,
    needs_work: bool,
    net_percent: Option<i64>,
}

impl Candidate {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn record(&self) -> &ProbeRecord {
        &self.record
    }

    #[must_use]
    pub const fn selection(&self) -> Selection {
        self.selection
    }

    #[must_use]
    pub const fn needs_work(&self) -> bool {
        self.needs_work
    }

    /// Size change of the last conversion in percent, negative when smaller.
    #[must_use]
    pub const fn net_percent(&self) -> Option<i64> {
        self.net_percent
    }

    /// Whether the operator or automatic policy may pick this file.
    #[must_use]
    pub fn can_pick(&self) -> bool {
        matches!(self.selection, Selection::Unpicked | Selection::Picked)
            && self.record.anomaly.is_none()
            && !is_protected_name(&self.path)
    }
}

/// Operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Start converting picked candidates.
    Go,
    /// Leave select mode, or abort conversion back to select mode.
    Quit,
    ToggleHelp,
    PickAll,
    ResetAll,
    /// Pick exactly the candidates that need work.
    InitPicks,
    Toggle(usize),
    /// Mark as never to be converted.
    Skip(usize),
    /// Manually clear a stored anomaly.
    ClearAnomaly(usize),
}

/// What the caller should do after handling an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Continue,
    Exit,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converted,
    Rejected,
    Failed,
    TimedOut,
    Aborted,
    SwapFailed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Converted => "OK",
            Self::Rejected => "REJECT",
            Self::Failed => "ERROR",
            Self::TimedOut => "TIMEOUT",
            Self::Aborted => "ABORT",
            Self::SwapFailed => "SWAP-ERROR",
        };
        write!(f, "{label}")
    }
}

/// Everything known about a finished job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub input: PathBuf,
    pub outcome: Outcome,
    pub return_code: i32,
    pub elapsed: Duration,
    pub command: String,
    pub original_size: u64,
    pub new_size: Option<u64>,
    pub net_percent: Option<i64>,
    pub new_path: Option<PathBuf>,
    pub temp_file: PathBuf,
    pub backup_file: PathBuf,
    /// Anomaly stored for the input afterwards.
    pub anomaly: Option<Anomaly>,
    pub corruption: Option<String>,
    /// Diagnostic lines from the encoder.
    pub texts: Vec<String>,
    /// Problems handling the result.
    pub errors: Vec<String>,
}

impl JobReport {
    fn new(job: &Job, outcome: Outcome, return_code: i32, now: Instant) -> Self {
        Self {
            input: job.input().to_path_buf(),
            outcome,
            return_code,
            elapsed: job.elapsed(now),
            command: job.command().to_string(),
            original_size: job.original_size(),
            new_size: None,
            net_percent: None,
            new_path: None,
            temp_file: job.temp_file().to_path_buf(),
            backup_file: job.backup_file().to_path_buf(),
            anomaly: None,
            corruption: None,
            texts: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Result of one [`Orchestrator::tick`].
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub state: State,
    /// File whose job started this tick.
    pub started: Option<PathBuf>,
    /// Progress text of the running job.
    pub progress: Option<String>,
    pub finished: Vec<JobReport>,
}

/// Counters for unattended runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoStats {
    pub ok_count: usize,
    pub error_count: usize,
    pub consecutive_failures: usize,
}

impl AutoStats {
    const fn success(&mut self) {
        self.ok_count += 1;
        self.consecutive_failures = 0;
    }

    const fn failure(&mut self) {
        self.error_count += 1;
        self.consecutive_failures += 1;
    }
}

/// Drives candidate selection and one conversion job at a time.
pub struct Orchestrator {
    cache: Arc<MetadataCache>,
    builder: Box<dyn CommandBuilder>,
    swapper: Box<dyn FileSwapper>,
    settings: OrchestratorSettings,
    candidates: Vec<Candidate>,
    job: Option<(usize, Job)>,
    state: State,
    help: bool,
    stats: AutoStats,
    pending: Vec<JobReport>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        cache: Arc<MetadataCache>,
        builder: Box<dyn CommandBuilder>,
        swapper: Box<dyn FileSwapper>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cache,
            builder,
            swapper,
            settings,
            candidates: Vec::new(),
            job: None,
            state: State::Select,
            help: false,
            stats: AutoStats::default(),
            pending: Vec::new(),
        }
    }

    /// Add files as candidates using their cached records.
    ///
    /// Work files are skipped and files carrying the output marker are flagged as done.
    /// Returns warnings for anomaly updates that could not be persisted.
    pub fn add_candidates(&mut self, paths: &[PathBuf]) -> Vec<String> {
        let mut warnings = Vec::new();
        for path in paths {
            if is_work_file(path) || self.candidates.iter().any(|c| c.path == *path) {
                continue;
            }
            // Entries validated by a preceding bulk population are not probed again.
            let mut record = match self.cache.peek(path) {
                Some(record) => record,
                None => self.cache.get(path),
            };
            if has_output_marker(path) && record.anomaly.is_none() {
                match self.cache.set_anomaly(path, Some(Anomaly::AlreadyDone)) {
                    Ok(stored) => record.anomaly = stored,
                    Err(error) => {
                        record.anomaly = Some(Anomaly::AlreadyDone);
                        warnings.push(error.to_string());
                    }
                }
            }
            let needs_work = self.settings.policy.needs_work(&record);
            self.candidates.push(Candidate {
                path: path.clone(),
                record,
                selection: Selection::Unpicked,
                needs_work,
                net_percent: None,
            });
        }
        // The running job refers to its candidate by position.
        if self.job.is_none() {
            self.sort_candidates();
        }
        warnings
    }

    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Current mode, [`State::Help`] while the help overlay is shown.
    #[must_use]
    pub const fn state(&self) -> State {
        if self.help { State::Help } else { self.state }
    }

    #[must_use]
    pub const fn stats(&self) -> AutoStats {
        self.stats
    }

    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// The running job, if any.
    #[must_use]
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref().map(|(_, job)| job)
    }

    /// Number of candidates currently picked.
    #[must_use]
    pub fn picked_count(&self) -> usize {
        self.candidates
            .iter()
            .filter(|candidate| candidate.selection == Selection::Picked)
            .count()
    }

    /// Apply an operator command.
    pub fn handle(&mut self, input: Input, now: Instant) -> Response {
        if self.help {
            if input == Input::ToggleHelp {
                self.help = false;
            }
            return Response::Continue;
        }
        if input == Input::ToggleHelp {
            self.help = true;
            return Response::Continue;
        }
        if input == Input::Quit {
            return match self.state {
                State::Select | State::Help => Response::Exit,
                State::Convert => {
                    self.abort(now);
                    Response::Continue
                }
            };
        }
        if self.state != State::Select {
            return Response::Continue;
        }
        match input {
            Input::Go => self.state = State::Convert,
            Input::PickAll => {
                for candidate in &mut self.candidates {
                    if candidate.can_pick() {
                        candidate.selection = Selection::Picked;
                    }
                }
            }
            Input::ResetAll => {
                for candidate in &mut self.candidates {
                    if candidate.selection == Selection::Picked {
                        candidate.selection = Selection::Unpicked;
                    }
                }
            }
            Input::InitPicks => self.init_picks(),
            Input::Toggle(index) => {
                if let Some(candidate) = self.candidates.get_mut(index) {
                    candidate.selection = match candidate.selection {
                        Selection::Unpicked if candidate.can_pick() => Selection::Picked,
                        Selection::Picked => Selection::Unpicked,
                        other => other,
                    };
                }
            }
            Input::Skip(index) => self.store_anomaly(index, Some(Anomaly::Skipped)),
            Input::ClearAnomaly(index) => self.store_anomaly(index, None),
            Input::Quit | Input::ToggleHelp => {}
        }
        Response::Continue
    }

    /// Pick every candidate that needs work and may be picked; unpick the rest.
    pub fn init_picks(&mut self) {
        for candidate in &mut self.candidates {
            if matches!(candidate.selection, Selection::Unpicked | Selection::Picked) {
                candidate.selection = if candidate.can_pick() && candidate.needs_work {
                    Selection::Picked
                } else {
                    Selection::Unpicked
                };
            }
        }
    }

    /// Stop the running job and return to select mode.
    ///
    /// The candidate goes back to picked without an anomaly.
    pub fn abort(&mut self, now: Instant) {
        if let Some((index, mut job)) = self.job.take() {
            job.abort();
            self.cache.invalidate(job.temp_file());
            if let Some(candidate) = self.candidates.get_mut(index) {
                candidate.selection = Selection::Picked;
            }
            let mut report = JobReport::new(&job, Outcome::Aborted, STOPPED, now);
            report.texts = job.take_texts();
            self.pending.push(report);
        }
        self.enter_select();
    }

    /// Advance the running job and start the next one when idle.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport {
            finished: std::mem::take(&mut self.pending),
            ..TickReport::default()
        };
        if self.state != State::Convert {
            report.state = self.state();
            return report;
        }

        let finished_code = self.job.as_mut().and_then(|(_, job)| job.tick(now));
        if let Some(code) = finished_code
            && let Some((index, job)) = self.job.take()
        {
            report.finished.push(self.finish(index, job, code, now));
        }

        if self.job.is_none() {
            match self.next_picked() {
                Some(index) => report.started = Some(self.start(index, now)),
                None => self.enter_select(),
            }
        }

        report.progress = self.job().map(|job| job.progress().to_string());
        report.state = self.state();
        report
    }

    fn start(&mut self, index: usize, now: Instant) -> PathBuf {
        debug_assert!(self.job.is_none(), "only one job may run at a time");
        let candidate = &mut self.candidates[index];
        let mut job = Job::new(&candidate.path, &candidate.record, self.settings.progress_timeout, now)
            .with_monitor(ProcessMonitor::new().with_stop_grace(self.settings.stop_grace));
        if job.temp_file().exists() {
            let _ = fs::remove_file(job.temp_file());
        }
        let argv = self.builder.build(&candidate.path, job.temp_file(), &candidate.record);
        job.start(&argv);
        candidate.selection = Selection::InProgress;
        let path = candidate.path.clone();
        self.job = Some((index, job));
        path
    }

    fn finish(&mut self, index: usize, mut job: Job, code: i32, now: Instant) -> JobReport {
        let outcome = if code == PROGRESS_TIMEOUT {
            Outcome::TimedOut
        } else {
            Outcome::Failed
        };
        let mut report = JobReport::new(&job, outcome, code, now);

        if code == 0 {
            let output = self.cache.get(job.temp_file());
            if output.is_placeholder() {
                report.errors.push(format!(
                    "Failed to probe encoder output: {}",
                    job.temp_file().display()
                ));
                self.fail(index, &mut job, &mut report);
            } else {
                self.evaluate(index, &job, &output, &mut report);
            }
        } else {
            self.fail(index, &mut job, &mut report);
        }

        report.texts = job.take_texts();
        report
    }

    /// Keep or reject a successful encode based on the size reduction.
    fn evaluate(&mut self, index: usize, job: &Job, output: &ProbeRecord, report: &mut JobReport) {
        let original = job.original_size();
        let reduction = if original > 0 {
            (original as f64 - output.size_bytes as f64) * 100.0 / original as f64
        } else {
            0.0
        };
        let net_percent = -(reduction.round() as i64);
        report.new_size = Some(output.size_bytes);
        report.net_percent = Some(net_percent);
        self.candidates[index].net_percent = Some(net_percent);

        // Output in a codec outside the filter is kept regardless of the size gain.
        if self.settings.policy.codecs.allows(&output.codec) && reduction < self.settings.min_shrink_percent {
            remove_temp(job.temp_file(), report);
            self.cache.invalidate(job.temp_file());
            report.outcome = Outcome::Rejected;
            report.anomaly = self.persist_anomaly(index, Anomaly::InsufficientGain, report);
            self.candidates[index].selection = Selection::Done(Verdict::Rejected);
            self.stats.failure();
            return;
        }

        match self.swapper.swap(job.input(), job.temp_file(), job.backup_file()) {
            Ok(new_path) => {
                self.cache.invalidate(job.temp_file());
                self.cache.invalidate(job.input());
                let record = self.cache.get(&new_path);
                let candidate = &mut self.candidates[index];
                candidate.needs_work = self.settings.policy.needs_work(&record);
                candidate.record = record;
                candidate.path.clone_from(&new_path);
                candidate.selection = Selection::Done(Verdict::Converted);
                report.outcome = Outcome::Converted;
                report.anomaly = candidate.record.anomaly;
                report.new_path = Some(new_path);
                self.stats.success();
            }
            Err(error) => {
                report.outcome = Outcome::SwapFailed;
                report.errors.push(format!(
                    "Swap of {} failed: {error}. Original: {}, New: {}. Manual cleanup required.",
                    job.input().display(),
                    job.backup_file().display(),
                    job.temp_file().display()
                ));
                report.anomaly = self.candidates[index].record.anomaly;
                self.candidates[index].selection = Selection::Done(Verdict::NeedsCleanup);
                self.stats.failure();
            }
        }
    }

    /// Clean up after a failed encode and escalate the encode-failure counter.
    fn fail(&mut self, index: usize, job: &mut Job, report: &mut JobReport) {
        remove_temp(job.temp_file(), report);
        self.cache.invalidate(job.temp_file());
        if report.return_code != 0
            && let Some(line) = self.settings.corruption.assess(job.texts(), report.return_code)
        {
            job.push_text(line.clone());
            report.corruption = Some(line);
        }
        report.anomaly = self.persist_anomaly(index, Anomaly::ENCODE_FAILURE, report);
        let verdict = if report.outcome == Outcome::TimedOut {
            Verdict::TimedOut
        } else {
            Verdict::Failed
        };
        self.candidates[index].selection = Selection::Done(verdict);
        self.stats.failure();
    }

    fn persist_anomaly(&mut self, index: usize, anomaly: Anomaly, report: &mut JobReport) -> Option<Anomaly> {
        let candidate = &mut self.candidates[index];
        let stored = match self.cache.set_anomaly(&candidate.path, Some(anomaly)) {
            Ok(stored) => stored,
            Err(error) => {
                report.errors.push(error.to_string());
                Some(Anomaly::escalate(candidate.record.anomaly, anomaly))
            }
        };
        candidate.record.anomaly = stored;
        stored
    }

    fn store_anomaly(&mut self, index: usize, anomaly: Option<Anomaly>) {
        let Some(candidate) = self.candidates.get_mut(index) else {
            return;
        };
        if !matches!(candidate.selection, Selection::Unpicked | Selection::Picked) {
            return;
        }
        let stored = match self.cache.set_anomaly(&candidate.path, anomaly) {
            Ok(stored) => stored,
            Err(error) => {
                crate::print_warning!("{error}");
                anomaly
            }
        };
        let candidate = &mut self.candidates[index];
        candidate.record.anomaly = stored;
        candidate.selection = Selection::Unpicked;
    }

    fn next_picked(&self) -> Option<usize> {
        self.candidates
            .iter()
            .position(|candidate| candidate.selection == Selection::Picked)
    }

    fn enter_select(&mut self) {
        self.state = State::Select;
        self.sort_candidates();
    }

    fn sort_candidates(&mut self) {
        self.candidates
            .sort_by(|a, b| b.record.bloat().cmp(&a.record.bloat()));
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("candidates", &self.candidates.len())
            .field("job", &self.job.as_ref().map(|(_, job)| job.input()))
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn remove_temp(temp_file: &Path, report: &mut JobReport) {
    if temp_file.exists()
        && let Err(error) = fs::remove_file(temp_file)
    {
        report
            .errors
            .push(format!("Failed to delete {}: {error}", temp_file.display()));
    }
}

fn file_name_lowercase(path: &Path) -> String {
    path.file_name().unwrap_or_default().to_string_lossy().to_lowercase()
}

/// Encoder output or preserved original from a previous run.
#[must_use]
pub fn is_work_file(path: &Path) -> bool {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    name.starts_with(TEMP_PREFIX) || name.starts_with(BACKUP_PREFIX)
}

/// Names that must never be converted automatically.
#[must_use]
pub fn is_protected_name(path: &Path) -> bool {
    let name = file_name_lowercase(path);
    name.starts_with("sample.") || name.starts_with("test.")
}

/// File name carries the converted-output marker.
#[must_use]
pub fn has_output_marker(path: &Path) -> bool {
    path.file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_lowercase()
        .ends_with(OUTPUT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::thread;

    use tempfile::{TempDir, tempdir};

    use crate::transcode::job::{backup_path, output_path, temp_path};
    use crate::transcode::probe::{ProbeError, Prober};

    /// Reports HEVC for converted or temp files and H.264 otherwise.
    struct FakeProber;

    impl Prober for FakeProber {
        fn probe(&self, path: &Path) -> Result<ProbeRecord, ProbeError> {
            let size_bytes = fs::metadata(path)
                .map_err(|_| ProbeError::NotFound(path.to_path_buf()))?
                .len();
            if size_bytes == 0 {
                return Err(ProbeError::NoVideoStream(path.to_path_buf()));
            }
            let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
            let hevc = name.starts_with(TEMP_PREFIX) || has_output_marker(path);
            Ok(ProbeRecord {
                anomaly: None,
                width: 1920,
                height: 1080,
                codec: if hevc { "hevc" } else { "h264" }.to_string(),
                bitrate: if hevc { 1500 } else { 9000 + size_bytes / 1000 },
                fps: 25.0,
                duration: 60.0,
                size_bytes,
                color_spt: "bt709,~,~".to_string(),
            })
        }
    }

    /// Reports the encoder output as MPEG-4 Part 2.
    struct Mpeg4OutputProber;

    impl Prober for Mpeg4OutputProber {
        fn probe(&self, path: &Path) -> Result<ProbeRecord, ProbeError> {
            let mut record = FakeProber.probe(path)?;
            if file_name_lowercase(path).starts_with("temp.") {
                record.codec = "mpeg4".to_string();
            }
            Ok(record)
        }
    }

    /// Runs a fixed shell script; `{out}` is replaced with the output path.
    struct ScriptBuilder {
        script: String,
        commands: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl ScriptBuilder {
        fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
                commands: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl CommandBuilder for ScriptBuilder {
        fn build(&self, input: &Path, output: &Path, _record: &ProbeRecord) -> Vec<OsString> {
            self.commands.lock().unwrap().push(input.to_path_buf());
            let script = self.script.replace("{out}", &output.display().to_string());
            vec!["/bin/sh".into(), "-c".into(), script.into()]
        }
    }

    /// Keeps the original as a backup and renames the temp file to the output name.
    struct RenameSwapper;

    impl FileSwapper for RenameSwapper {
        fn swap(&self, original: &Path, temp: &Path, backup: &Path) -> io::Result<PathBuf> {
            fs::rename(original, backup)?;
            let destination = output_path(original);
            fs::rename(temp, &destination)?;
            Ok(destination)
        }
    }

    struct FailingSwapper;

    impl FileSwapper for FailingSwapper {
        fn swap(&self, _original: &Path, _temp: &Path, _backup: &Path) -> io::Result<PathBuf> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only file system"))
        }
    }

    fn create_video(dir: &TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, vec![1_u8; size]).unwrap();
        path
    }

    fn orchestrator(dir: &TempDir, builder: ScriptBuilder, swapper: Box<dyn FileSwapper>) -> Orchestrator {
        let cache = Arc::new(MetadataCache::open(
            dir.path().join("cache.json"),
            Arc::new(FakeProber),
        ));
        let settings = OrchestratorSettings {
            progress_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            ..OrchestratorSettings::default()
        };
        Orchestrator::new(cache, Box::new(builder), swapper, settings)
    }

    /// Tick until the orchestrator returns to select mode.
    fn run_to_select(orchestrator: &mut Orchestrator) -> Vec<JobReport> {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut finished = Vec::new();
        loop {
            let report = orchestrator.tick(Instant::now());
            finished.extend(report.finished);
            if report.state == State::Select {
                return finished;
            }
            assert!(Instant::now() < deadline, "conversion did not finish in time");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn codec_filters() {
        assert!(CodecFilter::X265.allows("hevc"));
        assert!(!CodecFilter::X265.allows("h264"));
        assert!(CodecFilter::X26x.allows("h264"));
        assert!(!CodecFilter::X26x.allows("mpeg4"));
        assert!(CodecFilter::All.allows("mpeg4"));
    }

    #[test]
    fn needs_work_policy() {
        let policy = SelectionPolicy::default();
        let mut record = ProbeRecord {
            anomaly: None,
            width: 1920,
            height: 1080,
            codec: "hevc".to_string(),
            bitrate: 1500,
            fps: 25.0,
            duration: 60.0,
            size_bytes: 1000,
            color_spt: "~".to_string(),
        };
        assert!(!policy.needs_work(&record));

        record.height = 2160;
        assert!(policy.needs_work(&record));

        record.height = 1080;
        record.bitrate = 9000;
        assert!(policy.needs_work(&record));

        record.bitrate = 1500;
        record.codec = "h264".to_string();
        assert!(policy.needs_work(&record));
    }

    #[test]
    fn name_rules() {
        assert!(is_work_file(Path::new("/v/TEMP.a.x265.mkv")));
        assert!(is_work_file(Path::new("/v/ORIG.a.mp4")));
        assert!(!is_work_file(Path::new("/v/temp.a.mp4")));
        assert!(is_protected_name(Path::new("/v/Sample.a.mkv")));
        assert!(is_protected_name(Path::new("/v/test.a.mkv")));
        assert!(has_output_marker(Path::new("/v/Movie.X265.mkv")));
        assert!(!has_output_marker(Path::new("/v/Movie.x265.extra.mkv")));
    }

    #[test]
    fn candidates_are_filtered_sorted_and_initialized() {
        let dir = tempdir().unwrap();
        let paths = vec![
            create_video(&dir, "a.mkv", 1000),
            create_video(&dir, "sample.b.mkv", 1000),
            create_video(&dir, "c.x265.mkv", 1000),
            create_video(&dir, "TEMP.d.x265.mkv", 1000),
            create_video(&dir, "ORIG.e.mkv", 1000),
            create_video(&dir, "broken.mkv", 0),
        ];
        let mut orchestrator = orchestrator(&dir, ScriptBuilder::new("true"), Box::new(RenameSwapper));
        assert!(orchestrator.add_candidates(&paths).is_empty());
        orchestrator.init_picks();

        let names: Vec<String> = orchestrator
            .candidates()
            .iter()
            .map(|c| c.path().file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a.mkv", "sample.b.mkv", "c.x265.mkv", "broken.mkv"]);

        let selections: Vec<Selection> = orchestrator.candidates().iter().map(Candidate::selection).collect();
        assert_eq!(
            selections,
            [
                Selection::Picked,
                Selection::Unpicked,
                Selection::Unpicked,
                Selection::Unpicked
            ]
        );
        assert_eq!(
            orchestrator.candidates()[2].record().anomaly,
            Some(Anomaly::AlreadyDone)
        );
        assert_eq!(
            orchestrator.candidates()[3].record().anomaly,
            Some(Anomaly::ProbeFailure(1))
        );
    }

    #[test]
    fn operator_picking() {
        let dir = tempdir().unwrap();
        let paths = vec![
            create_video(&dir, "a.mkv", 1000),
            create_video(&dir, "b.mkv", 1000),
            create_video(&dir, "test.c.mkv", 1000),
        ];
        let mut orchestrator = orchestrator(&dir, ScriptBuilder::new("true"), Box::new(RenameSwapper));
        orchestrator.add_candidates(&paths);
        let now = Instant::now();

        orchestrator.handle(Input::PickAll, now);
        assert_eq!(orchestrator.picked_count(), 2);

        orchestrator.handle(Input::ResetAll, now);
        assert_eq!(orchestrator.picked_count(), 0);

        orchestrator.handle(Input::Toggle(0), now);
        assert_eq!(orchestrator.candidates()[0].selection(), Selection::Picked);
        orchestrator.handle(Input::Toggle(0), now);
        assert_eq!(orchestrator.candidates()[0].selection(), Selection::Unpicked);

        let protected = orchestrator
            .candidates()
            .iter()
            .position(|c| is_protected_name(c.path()))
            .unwrap();
        orchestrator.handle(Input::Toggle(protected), now);
        assert_eq!(orchestrator.candidates()[protected].selection(), Selection::Unpicked);

        orchestrator.handle(Input::Toggle(1), now);
        orchestrator.handle(Input::Skip(1), now);
        let skipped = &orchestrator.candidates()[1];
        assert_eq!(skipped.selection(), Selection::Unpicked);
        assert_eq!(skipped.record().anomaly, Some(Anomaly::Skipped));
        assert!(!skipped.can_pick());

        orchestrator.handle(Input::ClearAnomaly(1), now);
        assert!(orchestrator.candidates()[1].can_pick());
        assert_eq!(orchestrator.cache.anomaly(orchestrator.candidates()[1].path()), None);
    }

    #[test]
    fn help_overlay_blocks_other_inputs() {
        let dir = tempdir().unwrap();
        let paths = vec![create_video(&dir, "a.mkv", 1000)];
        let mut orchestrator = orchestrator(&dir, ScriptBuilder::new("true"), Box::new(RenameSwapper));
        orchestrator.add_candidates(&paths);
        let now = Instant::now();

        orchestrator.handle(Input::ToggleHelp, now);
        assert_eq!(orchestrator.state(), State::Help);
        assert_eq!(orchestrator.handle(Input::Quit, now), Response::Continue);
        orchestrator.handle(Input::PickAll, now);
        assert_eq!(orchestrator.picked_count(), 0);

        orchestrator.handle(Input::ToggleHelp, now);
        assert_eq!(orchestrator.state(), State::Select);
        assert_eq!(orchestrator.handle(Input::Quit, now), Response::Exit);
    }

    #[test]
    fn go_without_picks_returns_to_select() {
        let dir = tempdir().unwrap();
        let mut orchestrator = orchestrator(&dir, ScriptBuilder::new("true"), Box::new(RenameSwapper));
        orchestrator.handle(Input::Go, Instant::now());
        let report = orchestrator.tick(Instant::now());
        assert_eq!(report.state, State::Select);
        assert!(report.started.is_none());
    }

    #[cfg(unix)]
    mod conversion {
        use super::*;

        fn convert_single(dir: &TempDir, script: &str, swapper: Box<dyn FileSwapper>) -> (Orchestrator, JobReport) {
            let input = dir.path().join("a.mkv");
            let mut orchestrator = orchestrator(dir, ScriptBuilder::new(script), swapper);
            orchestrator.add_candidates(&[input]);
            orchestrator.init_picks();
            orchestrator.handle(Input::Go, Instant::now());
            let mut finished = run_to_select(&mut orchestrator);
            assert_eq!(finished.len(), 1);
            let report = finished.remove(0);
            (orchestrator, report)
        }

        #[test]
        fn sufficient_reduction_is_accepted() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let (orchestrator, report) =
                convert_single(&dir, "head -c 8500 /dev/zero > '{out}'", Box::new(RenameSwapper));

            assert_eq!(report.outcome, Outcome::Converted);
            assert_eq!(report.return_code, 0);
            assert_eq!(report.net_percent, Some(-15));
            assert_eq!(report.new_size, Some(8500));
            let new_path = output_path(&input);
            assert_eq!(report.new_path.as_deref(), Some(new_path.as_path()));
            assert!(backup_path(&input).exists());
            assert!(!temp_path(&input).exists());

            let candidate = &orchestrator.candidates()[0];
            assert_eq!(candidate.selection(), Selection::Done(Verdict::Converted));
            assert_eq!(candidate.path(), new_path);
            assert_eq!(candidate.record().size_bytes, 8500);
            assert_eq!(candidate.record().codec, "hevc");
            assert!(orchestrator.cache.peek(&temp_path(&input)).is_none());
            assert_eq!(orchestrator.stats().ok_count, 1);
        }

        #[test]
        fn small_reduction_is_rejected() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let (orchestrator, report) =
                convert_single(&dir, "head -c 9500 /dev/zero > '{out}'", Box::new(RenameSwapper));

            assert_eq!(report.outcome, Outcome::Rejected);
            assert_eq!(report.anomaly, Some(Anomaly::InsufficientGain));
            assert_eq!(fs::metadata(&input).unwrap().len(), 10_000);
            assert!(!temp_path(&input).exists());
            assert!(!backup_path(&input).exists());
            assert_eq!(orchestrator.cache.anomaly(&input), Some(Anomaly::InsufficientGain));
            assert_eq!(
                orchestrator.candidates()[0].selection(),
                Selection::Done(Verdict::Rejected)
            );
        }

        #[test]
        fn failure_escalates_and_flags_corruption() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let script = "echo partial > '{out}'; \
                for i in 1 2 3; do echo '[h264 @ 0x1] corrupt decoded frame in stream 0' >&2; done; exit 1";
            let (orchestrator, report) = convert_single(&dir, script, Box::new(RenameSwapper));

            assert_eq!(report.outcome, Outcome::Failed);
            assert_eq!(report.return_code, 1);
            assert_eq!(report.anomaly, Some(Anomaly::EncodeFailure(1)));
            assert!(
                report
                    .corruption
                    .as_deref()
                    .is_some_and(|line| line.starts_with("CORRUPT VIDEO: Total Severity Score 30 from 3 events"))
            );
            assert_eq!(report.texts.len(), 4);
            assert!(!temp_path(&input).exists());
            assert!(input.exists());
            assert_eq!(orchestrator.cache.anomaly(&input), Some(Anomaly::EncodeFailure(1)));
            assert_eq!(orchestrator.stats().consecutive_failures, 1);
        }

        #[test]
        fn stalled_encoder_times_out() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let cache = Arc::new(MetadataCache::open(dir.path().join("cache.json"), Arc::new(FakeProber)));
            let settings = OrchestratorSettings {
                progress_timeout: Duration::from_millis(300),
                stop_grace: Duration::from_secs(2),
                ..OrchestratorSettings::default()
            };
            let builder = ScriptBuilder::new(
                "echo partial > '{out}'; printf 'frame=  50 time=00:00:10.00 speed=2.0x\\r' >&2; sleep 30",
            );
            let mut orchestrator = Orchestrator::new(cache, Box::new(builder), Box::new(RenameSwapper), settings);
            orchestrator.add_candidates(std::slice::from_ref(&input));
            orchestrator.init_picks();
            orchestrator.handle(Input::Go, Instant::now());

            let finished = run_to_select(&mut orchestrator);
            assert_eq!(finished.len(), 1);
            assert_eq!(finished[0].outcome, Outcome::TimedOut);
            assert_eq!(finished[0].return_code, PROGRESS_TIMEOUT);
            assert!(!temp_path(&input).exists());
            assert_eq!(
                orchestrator.candidates()[0].selection(),
                Selection::Done(Verdict::TimedOut)
            );
        }

        #[test]
        fn quit_aborts_job_without_anomaly() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let mut orchestrator = orchestrator(
                &dir,
                ScriptBuilder::new("echo partial > '{out}'; sleep 30"),
                Box::new(RenameSwapper),
            );
            orchestrator.add_candidates(std::slice::from_ref(&input));
            orchestrator.init_picks();
            orchestrator.handle(Input::Go, Instant::now());

            let report = orchestrator.tick(Instant::now());
            assert_eq!(report.started.as_deref(), Some(input.as_path()));
            assert_eq!(report.state, State::Convert);
            thread::sleep(Duration::from_millis(100));

            assert_eq!(orchestrator.handle(Input::Quit, Instant::now()), Response::Continue);
            assert_eq!(orchestrator.state(), State::Select);
            assert!(orchestrator.job().is_none());
            assert!(!temp_path(&input).exists());
            assert_eq!(orchestrator.candidates()[0].selection(), Selection::Picked);
            assert_eq!(orchestrator.cache.anomaly(&input), None);

            let report = orchestrator.tick(Instant::now());
            assert_eq!(report.finished.len(), 1);
            assert_eq!(report.finished[0].outcome, Outcome::Aborted);
        }

        #[test]
        fn swap_failure_needs_cleanup() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let (orchestrator, report) =
                convert_single(&dir, "head -c 5000 /dev/zero > '{out}'", Box::new(FailingSwapper));

            assert_eq!(report.outcome, Outcome::SwapFailed);
            assert!(report.errors[0].contains("Manual cleanup required"));
            assert!(input.exists());
            assert_eq!(
                orchestrator.candidates()[0].selection(),
                Selection::Done(Verdict::NeedsCleanup)
            );
            assert_eq!(orchestrator.cache.anomaly(&input), None);
        }

        #[test]
        fn output_codec_outside_filter_skips_size_check() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let cache = Arc::new(MetadataCache::open(
                dir.path().join("cache.json"),
                Arc::new(Mpeg4OutputProber),
            ));
            let settings = OrchestratorSettings {
                progress_timeout: Duration::from_secs(5),
                stop_grace: Duration::from_secs(2),
                ..OrchestratorSettings::default()
            };
            let builder = ScriptBuilder::new("head -c 9500 /dev/zero > '{out}'");
            let mut orchestrator = Orchestrator::new(cache, Box::new(builder), Box::new(RenameSwapper), settings);
            orchestrator.add_candidates(std::slice::from_ref(&input));
            orchestrator.init_picks();
            orchestrator.handle(Input::Go, Instant::now());

            let finished = run_to_select(&mut orchestrator);
            assert_eq!(finished.len(), 1);
            assert_eq!(finished[0].outcome, Outcome::Converted);
            assert_eq!(finished[0].net_percent, Some(-5));
            assert_eq!(finished[0].anomaly, None);
            assert!(output_path(&input).exists());
        }

        #[test]
        fn candidates_added_during_conversion_keep_job_target() {
            let dir = tempdir().unwrap();
            let input = create_video(&dir, "a.mkv", 10_000);
            let mut orchestrator = orchestrator(
                &dir,
                ScriptBuilder::new("sleep 0.3; head -c 5000 /dev/zero > '{out}'"),
                Box::new(RenameSwapper),
            );
            orchestrator.add_candidates(std::slice::from_ref(&input));
            orchestrator.init_picks();
            orchestrator.handle(Input::Go, Instant::now());
            let report = orchestrator.tick(Instant::now());
            assert_eq!(report.started.as_deref(), Some(input.as_path()));

            let bigger = create_video(&dir, "z.mkv", 50_000);
            orchestrator.add_candidates(std::slice::from_ref(&bigger));
            assert_eq!(orchestrator.candidates()[0].path(), input);

            let finished = run_to_select(&mut orchestrator);
            assert_eq!(finished.len(), 1);
            assert_eq!(finished[0].outcome, Outcome::Converted);

            let converted = orchestrator
                .candidates()
                .iter()
                .find(|c| c.path() == output_path(&input))
                .unwrap();
            assert_eq!(converted.selection(), Selection::Done(Verdict::Converted));
            let added = orchestrator.candidates().iter().find(|c| c.path() == bigger).unwrap();
            assert_eq!(added.selection(), Selection::Unpicked);
            assert_eq!(orchestrator.candidates()[0].path(), bigger);
        }

        #[test]
        fn picked_candidates_run_one_at_a_time() {
            let dir = tempdir().unwrap();
            let paths = vec![create_video(&dir, "a.mkv", 10_000), create_video(&dir, "b.mkv", 10_000)];
            let builder = ScriptBuilder::new("head -c 5000 /dev/zero > '{out}'");
            let commands = Arc::clone(&builder.commands);
            let mut orchestrator = orchestrator(&dir, builder, Box::new(RenameSwapper));
            orchestrator.add_candidates(&paths);
            orchestrator.handle(Input::PickAll, Instant::now());
            orchestrator.handle(Input::Go, Instant::now());

            let finished = run_to_select(&mut orchestrator);
            assert_eq!(finished.len(), 2);
            assert!(finished.iter().all(|report| report.outcome == Outcome::Converted));
            assert_eq!(commands.lock().unwrap().len(), 2);
            assert_eq!(orchestrator.stats().ok_count, 2);
        }
    }
}
