//! ffmpeg command construction and original file replacement.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use media_shrink::transcode::job::output_path;
use media_shrink::transcode::probe::expand_color_spt;
use media_shrink::transcode::{CommandBuilder, FileSwapper, ProbeRecord};

use crate::config::{Disposal, EncoderOptions};

const FFMPEG_DEFAULT_ARGS: &[&str] = &["-hide_banner", "-nostdin", "-stats", "-loglevel", "info", "-y"];
const LOW_PRIORITY_PREFIX: &[&str] = &["nice", "-n19", "ionice", "-c3"];
const DEFAULT_COLOR_SPACE: &str = "bt709";
const DEFAULT_COLOR_PRIMARIES: &str = "bt709";
/// ffmpeg accepts the numeric name more reliably for the transfer characteristic.
const DEFAULT_COLOR_TRC: &str = "709";
const UNKNOWN: &str = "unknown";

/// Builds `libx265` encodes with ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    options: EncoderOptions,
}

impl FfmpegCommandBuilder {
    pub(crate) const fn new(options: EncoderOptions) -> Self {
        Self { options }
    }

    /// Downscale filter for videos taller than the maximum height.
    fn scale_args(&self, record: &ProbeRecord) -> Vec<String> {
        if record.height <= self.options.max_height || record.height == 0 {
            return Vec::new();
        }
        let width = u64::from(self.options.max_height) * u64::from(record.width) / u64::from(record.height);
        vec!["-vf".to_string(), format!("scale={width}:-2")]
    }
}

/// Colour tagging options with bt709 fallbacks for unknown values.
fn color_args(color_spt: &str) -> Vec<String> {
    let [space, primaries, trc] = expand_color_spt(color_spt);
    let space = if space == UNKNOWN { DEFAULT_COLOR_SPACE.to_string() } else { space };
    let primaries = if primaries == UNKNOWN {
        DEFAULT_COLOR_PRIMARIES.to_string()
    } else {
        primaries
    };
    let trc = if trc == UNKNOWN || trc == "bt709" {
        DEFAULT_COLOR_TRC.to_string()
    } else {
        trc
    };
    vec![
        "-colorspace".to_string(),
        space,
        "-color_primaries".to_string(),
        primaries,
        "-color_trc".to_string(),
        trc,
    ]
}

impl CommandBuilder for FfmpegCommandBuilder {
    fn build(&self, input: &Path, output: &Path, record: &ProbeRecord) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::new();
        if !self.options.full_speed {
            argv.extend(LOW_PRIORITY_PREFIX.iter().map(OsString::from));
        }
        argv.push("ffmpeg".into());
        argv.extend(FFMPEG_DEFAULT_ARGS.iter().map(OsString::from));
        argv.push("-i".into());
        argv.push(input.as_os_str().to_os_string());

        let mut encode: Vec<String> = vec!["-c:v".into(), "libx265".into()];
        if !self.options.full_speed && self.options.threads > 0 {
            encode.extend(["-threads".to_string(), self.options.threads.to_string()]);
        }
        encode.extend([
            "-crf".to_string(),
            self.options.quality.to_string(),
            "-preset".to_string(),
            "medium".to_string(),
        ]);
        encode.extend(self.scale_args(record));
        encode.extend(color_args(&record.color_spt));
        encode.extend(
            [
                "-map", "0:v:0", "-map", "0:a?", "-c:a", "copy", "-map", "0:s?", "-c:s", "srt", "-map", "-0:t", "-map",
                "-0:d",
            ]
            .iter()
            .map(ToString::to_string),
        );
        argv.extend(encode.into_iter().map(OsString::from));
        argv.push(output.as_os_str().to_os_string());
        argv
    }
}

/// Replaces originals with converted files, trashing, deleting or keeping the original.
#[derive(Debug, Clone, Copy)]
pub struct OriginalSwapper {
    disposal: Disposal,
}

impl OriginalSwapper {
    pub(crate) const fn new(disposal: Disposal) -> Self {
        Self { disposal }
    }

    fn retire_original(&self, original: &Path, backup: &Path) -> io::Result<()> {
        match self.disposal {
            Disposal::KeepBackup => fs::rename(original, backup),
            // Trash does not work on network drives
            Disposal::Delete => fs::remove_file(original),
            Disposal::Trash if media_shrink::is_network_path(original) => fs::remove_file(original),
            Disposal::Trash => trash::delete(original).map_err(io::Error::other),
        }
    }
}

impl FileSwapper for OriginalSwapper {
    fn swap(&self, original: &Path, temp: &Path, backup: &Path) -> io::Result<PathBuf> {
        let destination = output_path(original);
        let modified = fs::metadata(original).and_then(|metadata| metadata.modified()).ok();
        self.retire_original(original, backup)?;
        fs::rename(temp, &destination)?;
        if let Some(modified) = modified
            && let Ok(file) = fs::File::options().write(true).open(&destination)
        {
            let _ = file.set_modified(modified);
        }
        Ok(destination)
    }
}
