use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use colored::Colorize;
use itertools::Itertools;
use media_shrink::transcode::orchestrator::is_work_file;
use media_shrink::transcode::{
    CacheError, Candidate, FfprobeProber, Input, JobReport, MetadataCache, Orchestrator, Outcome, Selection, State,
};
use media_shrink::{print_error, print_warning};
use walkdir::WalkDir;

use crate::commands::{FfmpegCommandBuilder, OriginalSwapper};
use crate::config::Config;
use crate::logger::FileLogger;
use crate::stats::RunStats;

const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// Exit status after an interrupt.
const INTERRUPTED: i32 = 130;

/// Scans for bloated videos and converts the picked ones one at a time.
pub struct VideoShrink {
    config: Config,
    logger: FileLogger,
}

impl VideoShrink {
    pub fn new(config: Config) -> Result<Self> {
        let logger = FileLogger::new()?;
        Ok(Self { config, logger })
    }

    /// Run the scan, probe and conversion loop.
    pub fn run(mut self) -> Result<()> {
        let files = gather_files(&self.config.paths, &self.config.extensions, &self.config.exclude);
        if files.is_empty() {
            println!("No video files found");
            return Ok(());
        }
        if self.config.verbose {
            println!("Found {} video file(s)", files.len());
        }

        // Set up Ctrl+C handler for graceful abort
        let abort_flag = Arc::new(AtomicBool::new(false));
        let abort_flag_handler = Arc::clone(&abort_flag);
        ctrlc::set_handler(move || {
            if abort_flag_handler.load(Ordering::SeqCst) {
                // Second Ctrl+C - force exit
                std::process::exit(INTERRUPTED);
            }
            println!("\n{}", "Received Ctrl+C, stopping...".yellow().bold());
            abort_flag_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl+C handler");

        let cache = Arc::new(self.open_cache()?);
        match cache.batch_get_or_probe(&files, self.config.workers, &abort_flag) {
            Ok(outcome) => {
                if self.config.verbose {
                    println!(
                        "Probed {} file(s): {} cached, {} failed",
                        outcome.probed + outcome.hits,
                        outcome.hits,
                        outcome.failed
                    );
                }
            }
            Err(CacheError::Interrupted { completed, requested }) => {
                print_warning!("Interrupted after probing {completed}/{requested} files");
                std::process::exit(INTERRUPTED);
            }
            Err(error) => return Err(error).context("Failed to probe video files"),
        }

        let mut orchestrator = Orchestrator::new(
            Arc::clone(&cache),
            Box::new(FfmpegCommandBuilder::new(self.config.encoder)),
            Box::new(OriginalSwapper::new(self.config.disposal)),
            self.config.settings.clone(),
        );
        for warning in orchestrator.add_candidates(&files) {
            print_warning!("{warning}");
        }
        orchestrator.handle(Input::InitPicks, Instant::now());
        if let Some(count) = self.config.count {
            limit_picks(&mut orchestrator, count);
        }

        self.print_candidates(orchestrator.candidates());

        let total = orchestrator.picked_count();
        if self.config.list_only || total == 0 {
            if total == 0 {
                println!("Nothing to convert");
            }
            cache.store().context("Failed to save probe cache")?;
            return Ok(());
        }

        self.logger.log_init(&self.config);
        let stats = self.convert(&mut orchestrator, total, &abort_flag);
        self.logger.log_stats(&stats);
        cache.store().context("Failed to save probe cache")?;

        let auto = orchestrator.stats();
        if self.config.verbose {
            println!("ok: {}, errors: {}", auto.ok_count, auto.error_count);
        }
        if abort_flag.load(Ordering::SeqCst) {
            println!("\n{}", "Aborted by user".bold().red());
        }
        stats.print_summary();
        Ok(())
    }

    fn open_cache(&self) -> Result<MetadataCache> {
        if let Some(parent) = self.config.cache_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
        }
        let cache = MetadataCache::open(&self.config.cache_path, Arc::new(FfprobeProber::default()))
            .with_flush_every(self.config.flush_every);
        if self.config.verbose {
            println!("Probe cache: {} ({} entries)", cache.path().display(), cache.len());
        }
        Ok(cache)
    }

    /// Tick the orchestrator until it returns to select mode.
    fn convert(&mut self, orchestrator: &mut Orchestrator, total: usize, abort_flag: &AtomicBool) -> RunStats {
        let mut stats = RunStats::default();
        let num_digits = total.to_string().chars().count();
        let mut started = 0;

        orchestrator.handle(Input::Go, Instant::now());
        loop {
            if abort_flag.load(Ordering::SeqCst) && orchestrator.state() == State::Convert {
                orchestrator.handle(Input::Quit, Instant::now());
            }

            let report = orchestrator.tick(Instant::now());
            for finished in &report.finished {
                self.print_finished(finished);
                self.logger.log_finish(finished);
                stats.add_report(finished);
            }

            if let Some(path) = &report.started {
                started += 1;
                let file_index = format!("[{started:>num_digits$}/{total}]");
                println!("\r{} {}", file_index.bold(), self.display_name(path));
                if let Some(candidate) = orchestrator.candidates().iter().find(|c| c.path() == path) {
                    self.logger.log_start(path, &file_index, candidate.record());
                }
            }

            if let Some(progress) = &report.progress {
                print!("\r{progress:<80}");
                let _ = std::io::stdout().flush();
            }

            if report.state == State::Select {
                break;
            }
            thread::sleep(TICK_INTERVAL);
        }
        stats
    }

    fn print_finished(&self, report: &JobReport) {
        print!("\r{:<80}\r", "");
        let elapsed = media_shrink::format_duration(report.elapsed);
        match report.outcome {
            Outcome::Converted => {
                let net = report.net_percent.unwrap_or_default();
                println!("{}", format!("✓ Converted in {elapsed}: {net:+}%").green());
            }
            Outcome::Rejected => {
                let net = report.net_percent.unwrap_or_default();
                println!("{}", format!("⊘ Rejected after {elapsed}: only {net:+}%").yellow());
            }
            Outcome::Aborted => println!("{}", format!("Aborted after {elapsed}").yellow()),
            Outcome::Failed | Outcome::TimedOut | Outcome::SwapFailed => {
                print_error!("{} rc={} after {elapsed}: {}", report.outcome, report.return_code, report.input.display());
                if self.config.verbose {
                    for line in report.texts.iter().rev().take(5).rev() {
                        eprintln!("  {line}");
                    }
                }
            }
        }
        if let Some(corruption) = &report.corruption {
            print_warning!("{corruption}");
        }
        for error in &report.errors {
            print_error!("{error}");
        }
    }

    fn print_candidates(&self, candidates: &[Candidate]) {
        for candidate in candidates {
            let selection = candidate.selection().to_string();
            let net = candidate
                .net_percent()
                .map_or_else(|| "    ".to_string(), |net| format!("{net:>+4}"));
            let line = format!(
                "{selection} {net} {} {}",
                candidate.record(),
                self.display_name(candidate.path())
            );
            if candidate.record().anomaly.is_some() {
                println!("{}", line.dimmed());
            } else if candidate.selection() == Selection::Picked {
                println!("{}", line.green());
            } else {
                println!("{line}");
            }
        }
        let picked: Vec<&Candidate> = candidates
            .iter()
            .filter(|candidate| candidate.selection() == Selection::Picked)
            .collect();
        let picked_size: u64 = picked.iter().map(|candidate| candidate.record().size_bytes).sum();
        println!(
            "{}",
            format!(
                "Picked {}/{} files, {}",
                picked.len(),
                candidates.len(),
                media_shrink::format_size(picked_size)
            )
            .bold()
        );
    }

    /// Path relative to the input root that contains it.
    fn display_name(&self, path: &Path) -> String {
        self.config
            .paths
            .iter()
            .find(|root| path.starts_with(root))
            .map_or_else(
                || media_shrink::path_to_filename_string(path),
                |root| media_shrink::get_relative_path_or_filename(path, root),
            )
    }
}

/// Unpick everything after the first `count` picked candidates.
fn limit_picks(orchestrator: &mut Orchestrator, count: usize) {
    let excess: Vec<usize> = orchestrator
        .candidates()
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.selection() == Selection::Picked)
        .map(|(index, _)| index)
        .skip(count)
        .collect();
    for index in excess {
        orchestrator.handle(Input::Toggle(index), Instant::now());
    }
}

/// Collect video files from the given files and directories.
///
/// Hidden entries and leftover work files are skipped.
/// The result is sorted case-insensitively without duplicates.
fn gather_files(paths: &[PathBuf], extensions: &[String], exclude: &[String]) -> Vec<PathBuf> {
    let should_include = |path: &Path| {
        let extension = media_shrink::path_to_file_extension_string(path);
        let name = media_shrink::path_to_filename_string(path).to_lowercase();
        extensions.contains(&extension)
            && !is_work_file(path)
            && !exclude.iter().any(|pattern| name.contains(&pattern.to_lowercase()))
    };

    paths
        .iter()
        .flat_map(|path| {
            if path.is_file() {
                vec![path.clone()]
            } else {
                WalkDir::new(path)
                    .into_iter()
                    .filter_entry(|entry| entry.depth() == 0 || !media_shrink::is_hidden(entry))
                    .filter_map(std::result::Result::ok)
                    .filter(|entry| entry.file_type().is_file())
                    .map(walkdir::DirEntry::into_path)
                    .collect()
            }
        })
        .filter(|path| should_include(path))
        .unique()
        .sorted_by_cached_key(|path| media_shrink::path_to_string(path).to_lowercase())
        .collect()
}
