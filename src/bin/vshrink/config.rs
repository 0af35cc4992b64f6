use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use itertools::Itertools;
use media_shrink::print_error;
use media_shrink::transcode::cache::DEFAULT_FLUSH_EVERY;
use media_shrink::transcode::{CodecFilter, CorruptionPolicy, OrchestratorSettings, SelectionPolicy};
use serde::Deserialize;

use crate::VshrinkArgs;

/// Video extensions picked up when scanning directories.
const DEFAULT_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "wmv", "flv", "m4v", "ts", "mpg", "webm"];

/// Lowest accepted bloat threshold.
pub const MIN_BLOAT_THRESHOLD: u64 = 500;
const DEFAULT_BLOAT_THRESHOLD: u64 = 1600;
const DEFAULT_MAX_HEIGHT: u32 = 1080;
const DEFAULT_QUALITY: u8 = 28;
const DEFAULT_THREADS: usize = 3;
const DEFAULT_MIN_SHRINK: f64 = 10.0;
const DEFAULT_PROGRESS_TIMEOUT_SECS: u64 = 30;

/// User configuration from the config file.
#[derive(Debug, Default, Deserialize)]
pub struct VshrinkConfig {
    #[serde(default)]
    paths: Vec<PathBuf>,
    #[serde(default)]
    bloat_threshold: Option<u64>,
    #[serde(default)]
    max_height: Option<u32>,
    #[serde(default)]
    codecs: Option<CodecFilter>,
    #[serde(default)]
    quality: Option<u8>,
    #[serde(default)]
    threads: Option<usize>,
    #[serde(default)]
    full_speed: bool,
    #[serde(default)]
    keep_backup: bool,
    #[serde(default)]
    delete: bool,
    #[serde(default)]
    min_shrink: Option<f64>,
    #[serde(default)]
    progress_timeout: Option<u64>,
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default)]
    flush_every: Option<usize>,
    #[serde(default)]
    cache: Option<PathBuf>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    corruption_signals: Vec<(String, u32)>,
    #[serde(default)]
    corruption_threshold: Option<u32>,
    #[serde(default)]
    verbose: bool,
}

/// Wrapper needed for parsing the config file section.
#[derive(Debug, Default, Deserialize)]
struct UserConfig {
    #[serde(default)]
    vshrink: VshrinkConfig,
}

/// Encoder command options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderOptions {
    pub(crate) quality: u8,
    pub(crate) threads: usize,
    pub(crate) full_speed: bool,
    pub(crate) max_height: u32,
}

/// What happens to the original after a successful conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposal {
    /// Keep as `ORIG.<name>` next to the output.
    KeepBackup,
    #[default]
    Trash,
    Delete,
}

/// Final config combined from CLI arguments and user config file.
#[derive(Debug)]
pub struct Config {
    pub(crate) paths: Vec<PathBuf>,
    pub(crate) settings: OrchestratorSettings,
    pub(crate) encoder: EncoderOptions,
    pub(crate) disposal: Disposal,
    pub(crate) workers: usize,
    pub(crate) flush_every: usize,
    pub(crate) cache_path: PathBuf,
    pub(crate) count: Option<usize>,
    pub(crate) list_only: bool,
    pub(crate) exclude: Vec<String>,
    pub(crate) extensions: Vec<String>,
    pub(crate) verbose: bool,
}

impl VshrinkConfig {
    /// Try to read user config from the file if it exists.
    /// Otherwise, fall back to default config.
    pub fn get_user_config() -> Self {
        media_shrink::config::CONFIG_PATH
            .as_deref()
            .filter(|path| path.exists())
            .and_then(|path| {
                fs::read_to_string(path)
                    .map_err(|e| {
                        print_error!("Error reading config file {}: {e}", path.display());
                    })
                    .ok()
            })
            .and_then(|config_string| Self::from_toml_str(&config_string))
            .unwrap_or_default()
    }

    /// Parse the `[vshrink]` section from config file contents.
    pub fn from_toml_str(config_string: &str) -> Option<Self> {
        toml::from_str::<UserConfig>(config_string)
            .map_err(|e| {
                print_error!("Error reading config file: {e}");
            })
            .ok()
            .map(|config| config.vshrink)
    }
}

impl Config {
    /// Create config from given command line args and user config file.
    pub(crate) fn try_from_args(args: VshrinkArgs, user_config: VshrinkConfig) -> Result<Self> {
        let paths: Vec<PathBuf> = args.paths.into_iter().chain(user_config.paths).unique().collect();
        let paths = if paths.is_empty() {
            vec![media_shrink::resolve_input_path(None)?]
        } else {
            paths
                .iter()
                .map(|path| media_shrink::resolve_input_path(Some(path)))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .unique()
                .collect()
        };

        let exclude: Vec<String> = args.exclude.into_iter().chain(user_config.exclude).unique().collect();
        let extensions = if !args.extension.is_empty() {
            Self::lowercase_vec(&args.extension)
        } else if !user_config.extensions.is_empty() {
            Self::lowercase_vec(&user_config.extensions)
        } else {
            Self::lowercase_vec(DEFAULT_EXTENSIONS)
        };

        let max_height = args.max_height.or(user_config.max_height).unwrap_or(DEFAULT_MAX_HEIGHT);
        let policy = SelectionPolicy {
            bloat_threshold: args
                .bloat_threshold
                .or(user_config.bloat_threshold)
                .unwrap_or(DEFAULT_BLOAT_THRESHOLD)
                .max(MIN_BLOAT_THRESHOLD),
            max_height,
            codecs: args.codecs.or(user_config.codecs).unwrap_or_default(),
        };

        let mut corruption = CorruptionPolicy::default();
        if !user_config.corruption_signals.is_empty() {
            corruption.signals = user_config.corruption_signals;
        }
        if let Some(threshold) = user_config.corruption_threshold {
            corruption.threshold = threshold;
        }

        let settings = OrchestratorSettings {
            policy,
            min_shrink_percent: args
                .min_shrink
                .or(user_config.min_shrink)
                .unwrap_or(DEFAULT_MIN_SHRINK),
            progress_timeout: Duration::from_secs(
                args.progress_timeout
                    .or(user_config.progress_timeout)
                    .unwrap_or(DEFAULT_PROGRESS_TIMEOUT_SECS),
            ),
            corruption,
            ..OrchestratorSettings::default()
        };

        let encoder = EncoderOptions {
            quality: args.quality.or(user_config.quality).unwrap_or(DEFAULT_QUALITY),
            threads: args.threads.or(user_config.threads).unwrap_or(DEFAULT_THREADS),
            full_speed: args.full_speed || user_config.full_speed,
            max_height,
        };

        let disposal = if args.keep_backup {
            Disposal::KeepBackup
        } else if args.delete {
            Disposal::Delete
        } else if user_config.keep_backup {
            Disposal::KeepBackup
        } else if user_config.delete {
            Disposal::Delete
        } else {
            Disposal::Trash
        };

        let cache_path = match args.cache.or(user_config.cache) {
            Some(path) => path,
            None => default_cache_path()?,
        };

        Ok(Self {
            paths,
            settings,
            encoder,
            disposal,
            workers: args
                .workers
                .or(user_config.workers)
                .unwrap_or_else(num_cpus::get)
                .max(1),
            flush_every: args
                .flush_every
                .or(user_config.flush_every)
                .unwrap_or(DEFAULT_FLUSH_EVERY)
                .max(1),
            cache_path,
            count: args.count.or(user_config.count),
            list_only: args.list,
            exclude,
            extensions,
            verbose: args.verbose || user_config.verbose,
        })
    }

    /// Convert a slice of strings to lowercase.
    fn lowercase_vec(slice: &[impl AsRef<str>]) -> Vec<String> {
        slice
            .iter()
            .map(|s| s.as_ref().trim_start_matches('.').to_lowercase())
            .collect()
    }
}

/// Default probe cache location: `<local data dir>/media-shrink/video_probes.json`
fn default_cache_path() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir().context("Failed to get local data directory")?;
    Ok(data_dir.join(env!("CARGO_PKG_NAME")).join("video_probes.json"))
}
