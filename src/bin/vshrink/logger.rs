use std::fs;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use media_shrink::transcode::{JobReport, Outcome, ProbeRecord};

use crate::config::Config;
use crate::stats::RunStats;

/// Number of encoder diagnostic lines kept in a failure record.
const DIAGNOSTIC_TAIL: usize = 20;

/// Simple file logger for conversion runs with buffered writes
pub struct FileLogger {
    writer: BufWriter<File>,
}

impl FileLogger {
    /// Create a new file logger, writing to ~/logs/media-shrink/vshrink_<timestamp>.log
    pub(crate) fn new() -> Result<Self> {
        let home_dir = dirs::home_dir().context("Failed to get home directory")?;
        let log_dir = home_dir.join("logs").join(env!("CARGO_PKG_NAME"));

        if !log_dir.exists() {
            fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        }

        let log_path = log_dir.join(format!("vshrink_{}.log", Local::now().format("%Y-%m-%d_%H-%M-%S")));
        Self::create(&log_path)
    }

    /// Create a logger appending to the given file.
    pub(crate) fn create(log_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn timestamp() -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Log when starting the program
    pub(crate) fn log_init(&mut self, config: &Config) {
        let settings = &config.settings;
        let _ = writeln!(self.writer, "[{}] INIT {:?}", Self::timestamp(), config.paths);
        let _ = writeln!(self.writer, "  bloat_threshold: {}", settings.policy.bloat_threshold);
        let _ = writeln!(self.writer, "  max_height: {}", settings.policy.max_height);
        let _ = writeln!(self.writer, "  codecs: {}", settings.policy.codecs);
        let _ = writeln!(self.writer, "  quality: {}", config.encoder.quality);
        let _ = writeln!(self.writer, "  threads: {}", config.encoder.threads);
        let _ = writeln!(self.writer, "  full_speed: {}", config.encoder.full_speed);
        let _ = writeln!(self.writer, "  disposal: {:?}", config.disposal);
        let _ = writeln!(self.writer, "  min_shrink: {}%", settings.min_shrink_percent);
        let _ = writeln!(self.writer, "  progress_timeout: {:?}", settings.progress_timeout);
        let _ = writeln!(self.writer, "  workers: {}", config.workers);
        let _ = writeln!(self.writer, "  cache: {}", config.cache_path.display());
        if !config.exclude.is_empty() {
            let _ = writeln!(self.writer, "  exclude: {:?}", config.exclude);
        }
        let _ = writeln!(self.writer, "  extensions: {:?}", config.extensions);
        if let Some(count) = config.count {
            let _ = writeln!(self.writer, "  count: {count}");
        }
        let _ = self.writer.flush();
    }

    /// Log when a job starts
    pub(crate) fn log_start(&mut self, file_path: &Path, file_index: &str, record: &ProbeRecord) {
        let _ = writeln!(
            self.writer,
            "[{}] START   {} - \"{}\" | {}",
            Self::timestamp(),
            file_index,
            file_path.display(),
            record
        );
        let _ = self.writer.flush();
    }

    /// Log a finished job with its outcome
    pub(crate) fn log_finish(&mut self, report: &JobReport) {
        let size_info = match (report.new_size, report.net_percent) {
            (Some(new_size), Some(net)) => format!(
                " | {} -> {} ({net:+}%)",
                media_shrink::format_size(report.original_size),
                media_shrink::format_size(new_size)
            ),
            _ => String::new(),
        };
        let anomaly = report.anomaly.map_or_else(String::new, |anomaly| format!(" | [{anomaly}]"));
        let _ = writeln!(
            self.writer,
            "[{}] {:<7} \"{}\" | rc={} | Time: {}{size_info}{anomaly}",
            Self::timestamp(),
            report.outcome.to_string(),
            report.input.display(),
            report.return_code,
            media_shrink::format_duration(report.elapsed),
        );
        if let Some(new_path) = &report.new_path {
            let _ = writeln!(self.writer, "  -> \"{}\"", new_path.display());
        }
        if !matches!(report.outcome, Outcome::Converted | Outcome::Rejected) {
            let _ = writeln!(self.writer, "  $ {}", report.command);
            let skip = report.texts.len().saturating_sub(DIAGNOSTIC_TAIL);
            for line in report.texts.iter().skip(skip) {
                let _ = writeln!(self.writer, "  | {line}");
            }
        }
        if let Some(corruption) = &report.corruption {
            let _ = writeln!(self.writer, "  {corruption}");
        }
        if report.outcome == Outcome::SwapFailed {
            let _ = writeln!(
                self.writer,
                "  OLD: \"{}\" NEW: \"{}\"",
                report.backup_file.display(),
                report.temp_file.display()
            );
        }
        for error in &report.errors {
            let _ = writeln!(self.writer, "  ! {error}");
        }
        let _ = self.writer.flush();
    }

    /// Log final statistics
    pub(crate) fn log_stats(&mut self, stats: &RunStats) {
        let _ = writeln!(self.writer, "[{}] STATISTICS", Self::timestamp());
        let _ = writeln!(self.writer, "  Files converted: {}", stats.files_converted);
        let _ = writeln!(self.writer, "  Files rejected:  {}", stats.files_rejected);
        let _ = writeln!(self.writer, "  Files failed:    {}", stats.files_failed);
        let _ = writeln!(self.writer, "  Files timed out: {}", stats.files_timed_out);
        let _ = writeln!(self.writer, "  Files aborted:   {}", stats.files_aborted);

        if stats.files_converted > 0 {
            let _ = writeln!(
                self.writer,
                "  Total original size:  {}",
                media_shrink::format_size(stats.total_original_size)
            );
            let _ = writeln!(
                self.writer,
                "  Total converted size: {}",
                media_shrink::format_size(stats.total_converted_size)
            );
            let saved = stats.space_saved();
            if saved >= 0 {
                let _ = writeln!(
                    self.writer,
                    "  Space saved: {}",
                    media_shrink::format_size(saved.unsigned_abs())
                );
            } else {
                let _ = writeln!(
                    self.writer,
                    "  Space increased: {}",
                    media_shrink::format_size(saved.unsigned_abs())
                );
            }
        }

        let _ = writeln!(
            self.writer,
            "  Total time: {}",
            media_shrink::format_duration(stats.total_duration)
        );
        let _ = writeln!(self.writer, "[{}] END", Self::timestamp());
        let _ = self.writer.flush();
    }
}
