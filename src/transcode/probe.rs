//! Probe records and the external `ffprobe` collaborator.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::isolate_process_group;
use crate::transcode::anomaly::Anomaly;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Token used for colour fields ffprobe does not report.
const UNKNOWN_COLOR: &str = "unknown";

/// Per-file metadata stored in the cache.
///
/// The serialized field set is exactly the cache file schema:
/// unknown or missing fields fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeRecord {
    #[serde(
        serialize_with = "Anomaly::serialize_field",
        deserialize_with = "Anomaly::deserialize_field"
    )]
    pub anomaly: Option<Anomaly>,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    /// Container bitrate in kbps.
    pub bitrate: u64,
    pub fps: f64,
    /// Duration in seconds.
    pub duration: f64,
    pub size_bytes: u64,
    /// Compact colour descriptor, see [`compact_color_spt`].
    pub color_spt: String,
}

/// Why probing a file failed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ffprobe exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("malformed ffprobe output: {0}")]
    Malformed(String),
    #[error("no video stream in {}", .0.display())]
    NoVideoStream(PathBuf),
    #[error("failed to read file size of {}: {source}", .path.display())]
    Size {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Extracts a [`ProbeRecord`] from a media file.
///
/// Implementations are called concurrently from the bulk population worker pool.
pub trait Prober: Send + Sync {
    /// Probe a single file.
    ///
    /// # Errors
    /// Returns a [`ProbeError`] describing why no record could be produced.
    fn probe(&self, path: &Path) -> Result<ProbeRecord, ProbeError>;
}

/// Runs the `ffprobe` binary and parses its JSON output.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    color_space: Option<String>,
    color_primaries: Option<String>,
    color_transfer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    bit_rate: Option<String>,
    duration: Option<String>,
}

impl ProbeRecord {
    /// Minimal record carrying only an anomaly marker.
    ///
    /// `size_bytes` is the current on-disk size so the entry stays valid until the file changes.
    #[must_use]
    pub fn placeholder(anomaly: Anomaly, size_bytes: u64) -> Self {
        Self {
            anomaly: Some(anomaly),
            width: 0,
            height: 0,
            codec: String::new(),
            bitrate: 0,
            fps: 0.0,
            duration: 0.0,
            size_bytes,
            color_spt: String::new(),
        }
    }

    /// True for records produced by a failed probe.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.width == 0 && self.height == 0 && self.codec.is_empty()
    }

    /// Bitrate relative to resolution: `bitrate / sqrt(width * height) * 1000`.
    #[must_use]
    pub fn bloat(&self) -> u64 {
        let area = f64::from(self.width) * f64::from(self.height);
        if area <= 0.0 {
            return 0;
        }
        (self.bitrate as f64 / area.sqrt() * 1000.0).round() as u64
    }

    /// File size in GB, rounded to three decimals.
    #[must_use]
    pub fn gb(&self) -> f64 {
        round3(self.size_bytes as f64 / BYTES_PER_GB)
    }
}

impl std::fmt::Display for ProbeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_placeholder() {
            return write!(f, "[{}]", self.anomaly.map_or_else(String::new, |a| a.to_string()));
        }
        write!(
            f,
            "{}x{} {} {}b {:.3}G",
            self.width,
            self.height,
            self.codec,
            self.bloat(),
            self.gb()
        )
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl FfprobeProber {
    /// Use the given ffprobe executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn arguments(path: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(path.as_os_str().to_owned());
        args
    }
}

impl Prober for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<ProbeRecord, ProbeError> {
        if !path.exists() {
            return Err(ProbeError::NotFound(path.to_path_buf()));
        }

        let mut command = Command::new(&self.program);
        command
            .args(Self::arguments(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        let output = command.output().map_err(|source| ProbeError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let size_bytes = fs::metadata(path)
            .map_err(|source| ProbeError::Size {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        parse_ffprobe_json(path, &output.stdout, size_bytes)
    }
}

/// Build a record from raw `ffprobe -print_format json` output.
///
/// # Errors
/// Returns [`ProbeError::Malformed`] for unparseable output and
/// [`ProbeError::NoVideoStream`] when no video stream or format section exists.
pub fn parse_ffprobe_json(path: &Path, json: &[u8], size_bytes: u64) -> Result<ProbeRecord, ProbeError> {
    let output: FfprobeOutput = serde_json::from_slice(json).map_err(|e| ProbeError::Malformed(e.to_string()))?;

    let stream = output
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"));
    let (Some(stream), Some(format)) = (stream, output.format.as_ref()) else {
        return Err(ProbeError::NoVideoStream(path.to_path_buf()));
    };

    let bitrate_bps = parse_optional_number::<u64>(format.bit_rate.as_deref(), "bit_rate")?;
    let duration = parse_optional_number::<f64>(format.duration.as_deref(), "duration")?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .filter(|fps| *fps > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    Ok(ProbeRecord {
        anomaly: None,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        codec: stream.codec_name.clone().unwrap_or_else(|| "unk_codec".to_string()),
        bitrate: bitrate_bps / 1000,
        fps,
        duration,
        size_bytes,
        color_spt: compact_color_spt([
            stream.color_space.as_deref(),
            stream.color_primaries.as_deref(),
            stream.color_transfer.as_deref(),
        ]),
    })
}

fn parse_optional_number<T: std::str::FromStr + Default>(value: Option<&str>, field: &str) -> Result<T, ProbeError> {
    value.map_or_else(
        || Ok(T::default()),
        |text| {
            text.trim()
                .parse::<T>()
                .map_err(|_| ProbeError::Malformed(format!("{field}={text}")))
        },
    )
}

/// Parse a rational `num/den` frame rate, rounded to three decimals.
///
/// A zero denominator gives `0.0`.
#[must_use]
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (numerator, denominator) = rate.split_once('/').unwrap_or((rate, "1"));
    let numerator: f64 = numerator.trim().parse().ok()?;
    let denominator: f64 = denominator.trim().parse().ok()?;
    if denominator == 0.0 {
        return Some(0.0);
    }
    Some(round3(numerator / denominator))
}

/// Join colour space, primaries and transfer into a compact descriptor.
///
/// Missing values become `unknown` and a token equal to the previous one is written as `~`,
/// so `bt709,bt709,bt709` is stored as `bt709,~,~`.
#[must_use]
pub fn compact_color_spt(values: [Option<&str>; 3]) -> String {
    let mut tokens: Vec<&str> = Vec::with_capacity(3);
    let mut previous: Option<&str> = None;
    for value in values {
        let value = value.filter(|v| !v.is_empty()).unwrap_or(UNKNOWN_COLOR);
        tokens.push(if previous == Some(value) { "~" } else { value });
        previous = Some(value);
    }
    tokens.join(",")
}

/// Expand a compact colour descriptor back to `[space, primaries, transfer]`.
#[must_use]
pub fn expand_color_spt(color_spt: &str) -> [String; 3] {
    let mut expanded: [String; 3] = std::array::from_fn(|_| UNKNOWN_COLOR.to_string());
    let mut previous = UNKNOWN_COLOR.to_string();
    for (slot, token) in expanded.iter_mut().zip(color_spt.split(',')) {
        let token = token.trim();
        let value = match token {
            "~" => previous.clone(),
            "" => UNKNOWN_COLOR.to_string(),
            other => other.to_string(),
        };
        slot.clone_from(&value);
        previous = value;
    }
    // Fewer than three tokens repeat the last known value.
    let tokens = color_spt.split(',').filter(|t| !t.trim().is_empty()).count();
    if (1..3).contains(&tokens) {
        let last = expanded[tokens - 1].clone();
        for slot in &mut expanded[tokens..] {
            slot.clone_from(&last);
        }
    }
    expanded
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
