mod commands;
mod config;
mod logger;
mod shrink;
mod stats;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use media_shrink::transcode::CodecFilter;

use crate::config::{Config, VshrinkConfig};
use crate::shrink::VideoShrink;

#[derive(Parser)]
#[command(author, version, name = env!("CARGO_BIN_NAME"), about = "Find bloated video files and re-encode them to HEVC with ffmpeg")]
pub(crate) struct VshrinkArgs {
    /// Input directories or files
    #[arg(value_hint = clap::ValueHint::AnyPath)]
    paths: Vec<PathBuf>,

    /// Pick files whose bloat is at least LIMIT (minimum 500)
    #[arg(short, long, name = "LIMIT", value_parser = clap::value_parser!(u64).range(500..))]
    bloat_threshold: Option<u64>,

    /// Pick files taller than HEIGHT and downscale them
    #[arg(short = 'H', long, name = "HEIGHT")]
    max_height: Option<u32>,

    /// Codecs that count as already efficient
    #[arg(short, long, value_enum)]
    codecs: Option<CodecFilter>,

    /// Encoder quality (CRF, lower is better)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=51))]
    quality: Option<u8>,

    /// Encoder thread count, 0 lets ffmpeg decide
    #[arg(short, long)]
    threads: Option<usize>,

    /// Run the encoder without nice and ionice
    #[arg(short = 'F', long)]
    full_speed: bool,

    /// Keep the original as ORIG.<name> instead of trashing it
    #[arg(short, long)]
    keep_backup: bool,

    /// Delete originals immediately instead of moving to trash
    #[arg(short, long, conflicts_with = "keep_backup")]
    delete: bool,

    /// Reject conversions that shrink the file less than PERCENT
    #[arg(short, long, name = "PERCENT")]
    min_shrink: Option<f64>,

    /// Stop the encoder after SECONDS without progress
    #[arg(short = 'T', long, name = "SECONDS")]
    progress_timeout: Option<u64>,

    /// Number of concurrent probe workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Write the probe cache after this many changes
    #[arg(long, name = "CHANGES")]
    flush_every: Option<usize>,

    /// Probe cache file
    #[arg(short = 'C', long, value_hint = clap::ValueHint::FilePath)]
    cache: Option<PathBuf>,

    /// Limit the number of files to convert
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Only list candidates without converting
    #[arg(short = 'L', long)]
    list: bool,

    /// Exclude files that contain the given pattern
    #[arg(short = 'e', long, num_args = 1, action = clap::ArgAction::Append, name = "EXCLUDE")]
    exclude: Vec<String>,

    /// Override video file extensions
    #[arg(short = 'x', long, num_args = 1, action = clap::ArgAction::Append, name = "EXTENSION")]
    extension: Vec<String>,

    /// Generate shell completion
    #[arg(short = 'l', long, name = "SHELL")]
    completion: Option<Shell>,

    /// Print verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = VshrinkArgs::parse();
    if let Some(ref shell) = args.completion {
        media_shrink::generate_shell_completion(*shell, VshrinkArgs::command(), true, env!("CARGO_BIN_NAME"))
    } else {
        let config = Config::try_from_args(args, VshrinkConfig::get_user_config())?;
        VideoShrink::new(config)?.run()
    }
}
