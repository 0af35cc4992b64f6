//! Encoder progress line parsing.
//!
//! A line with a frame counter is progress. With well-formed `time=` and `speed=` fields it
//! gives a precise estimate, otherwise a rough one extrapolated from the frame count.
//! Everything else is diagnostic text.

use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::{Captures, Regex};

/// Minimum wall time between two emitted progress updates.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(3);

/// Rough estimates before this much wall time are reported as indeterminate.
const ROUGH_WARMUP: Duration = Duration::from_secs(5);

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*frame[=\s]+(\d+)\s+(?:.*?time[=\s]+(\d{2}):(\d{2}):(\d{2})\.(\d{2}))?(?:.*?speed[=\s]+(\d+\.\d+)x)?",
    )
    .expect("Failed to compile progress regex")
});

/// Progress estimate for a running encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Derived from the encoded timestamp and reported speed.
    Precise {
        percent: f64,
        elapsed: Duration,
        /// `None` when the remaining time cannot be computed yet.
        remaining: Option<Duration>,
        speed: f64,
        position: Duration,
        total: Duration,
    },
    /// Extrapolated linearly from frames done over wall time.
    Rough {
        percent: f64,
        elapsed: Duration,
        remaining: Duration,
        /// Effective speed relative to the source frame rate.
        speed: Option<f64>,
        position: Option<Duration>,
        total: Duration,
        frame: u64,
        total_frames: u64,
    },
    /// Too early or too little information for a numeric estimate.
    Working { frame: u64 },
}

/// Classification of one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Progress(Progress),
    /// Progress line arriving before the throttle interval elapsed.
    Throttled,
    /// Not a progress line.
    Diagnostic,
}

/// Turns encoder output lines into progress estimates for one job.
#[derive(Debug, Clone)]
pub struct ProgressExtractor {
    duration_secs: f64,
    fps: f64,
    started: Instant,
    throttle: Duration,
    last_emit: Option<Instant>,
}

/// Tracks time since the last observed progress line.
#[derive(Debug, Clone, Copy)]
pub struct StallWatch {
    limit: Duration,
    last_seen: Instant,
}

impl ProgressExtractor {
    /// Extractor for a source of `duration_secs` seconds at `fps` frames per second.
    #[must_use]
    pub const fn new(duration_secs: f64, fps: f64, started: Instant) -> Self {
        Self {
            duration_secs,
            fps,
            started,
            throttle: DEFAULT_THROTTLE,
            last_emit: None,
        }
    }

    #[must_use]
    pub const fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Classify a line observed at `now`.
    pub fn extract(&mut self, line: &str, now: Instant) -> Extracted {
        let Some(captures) = PROGRESS_RE.captures(line) else {
            return Extracted::Diagnostic;
        };
        if let Some(last) = self.last_emit
            && now.saturating_duration_since(last) < self.throttle
        {
            return Extracted::Throttled;
        }
        self.last_emit = Some(now);

        let frame = captures
            .get(1)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0);

        match precise_fields(&captures) {
            Some((encoded_secs, speed)) => Extracted::Progress(self.precise(encoded_secs, speed, now)),
            None => Extracted::Progress(self.rough(frame, now)),
        }
    }

    fn precise(&self, encoded_secs: u64, speed: f64, now: Instant) -> Progress {
        let elapsed = whole_seconds(now.saturating_duration_since(self.started));
        let encoded = encoded_secs as f64;
        let (percent, remaining) = if self.duration_secs > 0.0 {
            let percent = encoded * 100.0 / self.duration_secs;
            let remaining = (percent > 0.0 && speed > 0.0)
                .then(|| Duration::from_secs_f64(((self.duration_secs - encoded) / speed).max(0.0)));
            (percent, remaining)
        } else {
            (0.0, None)
        };
        Progress::Precise {
            percent,
            elapsed,
            remaining,
            speed,
            position: Duration::from_secs(encoded_secs),
            total: Duration::from_secs_f64(self.duration_secs.max(0.0)),
        }
    }

    fn rough(&self, frame: u64, now: Instant) -> Progress {
        let total_frames = (self.fps * self.duration_secs).round().max(0.0) as u64;
        let elapsed = whole_seconds(now.saturating_duration_since(self.started));
        if elapsed < ROUGH_WARMUP || total_frames == 0 || frame == 0 {
            return Progress::Working { frame };
        }

        let elapsed_secs = elapsed.as_secs_f64();
        let (done, total) = (frame as f64, total_frames as f64);
        let estimated_total = elapsed_secs * total / done;
        let remaining = Duration::from_secs_f64((estimated_total - elapsed_secs).max(0.0));
        let speed = (self.fps > 0.0).then(|| done / elapsed_secs / self.fps);
        let position = (self.duration_secs > 0.0)
            .then(|| Duration::from_secs((done * self.duration_secs / total) as u64));

        Progress::Rough {
            percent: done * 100.0 / total,
            elapsed,
            remaining,
            speed,
            position,
            total: Duration::from_secs_f64(self.duration_secs.max(0.0)),
            frame,
            total_frames,
        }
    }
}

/// Encoded whole seconds and speed, only when every field is present and well-formed.
fn precise_fields(captures: &Captures<'_>) -> Option<(u64, f64)> {
    let field = |index: usize| captures.get(index).and_then(|m| m.as_str().parse::<u64>().ok());
    let hours = field(2)?;
    let minutes = field(3)?;
    let seconds = field(4)?;
    let centis = field(5)?;
    let speed = captures.get(6)?.as_str().parse::<f64>().ok()?;
    let encoded = (hours * 3600 + minutes * 60 + seconds) as f64 + centis as f64 / 100.0;
    Some((encoded as u64, speed))
}

fn whole_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}

impl Progress {
    /// Percent complete, if known.
    #[must_use]
    pub const fn percent(&self) -> Option<f64> {
        match self {
            Self::Precise { percent, .. } | Self::Rough { percent, .. } => Some(*percent),
            Self::Working { .. } => None,
        }
    }

    /// True for estimates based on the encoded timestamp.
    #[must_use]
    pub const fn is_precise(&self) -> bool {
        matches!(self, Self::Precise { .. })
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precise {
                percent,
                elapsed,
                remaining,
                speed,
                position,
                total,
            } => {
                let remaining = remaining.map_or_else(|| "N/A".to_string(), format_clock);
                write!(
                    f,
                    "{percent:.1}% | {} | -{remaining} | {speed:.1}x | At {}/{}",
                    format_clock(*elapsed),
                    format_clock(*position),
                    format_clock(*total)
                )
            }
            Self::Rough {
                percent,
                elapsed,
                remaining,
                speed,
                position,
                total,
                frame,
                total_frames,
            } => {
                let speed = speed.map_or_else(|| "UNKx".to_string(), |speed| format!("{speed:.1}x"));
                write!(
                    f,
                    "{percent:.1}% | {} | -{} | ~{speed} | ",
                    format_clock(*elapsed),
                    format_clock(*remaining)
                )?;
                match position {
                    Some(position) => write!(f, "At ~{}/{}", format_clock(*position), format_clock(*total)),
                    None => write!(f, "Frame {frame}/{total_frames}"),
                }
            }
            Self::Working { frame } => write!(f, "Frame {frame}: MAKING PROGRESS..."),
        }
    }
}

impl StallWatch {
    #[must_use]
    pub const fn new(limit: Duration, now: Instant) -> Self {
        Self { limit, last_seen: now }
    }

    /// Record a progress line seen at `now`.
    pub const fn observe(&mut self, now: Instant) {
        self.last_seen = now;
    }

    /// True once no progress has been seen for longer than the limit.
    #[must_use]
    pub fn is_stalled(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.limit
    }

    /// Time since the last progress line.
    #[must_use]
    pub fn quiet_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Format as `H:MM:SS`, dropping a leading zero hour.
#[must_use]
pub fn format_clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    let clock = format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60);
    clock.strip_prefix("0:").map_or(clock.clone(), ToString::to_string)
}
