use std::time::Duration;

use colored::Colorize;
use media_shrink::transcode::{JobReport, Outcome};

/// Statistics for the conversion run
#[derive(Debug, Default)]
pub struct RunStats {
    pub(crate) files_converted: usize,
    pub(crate) files_rejected: usize,
    pub(crate) files_failed: usize,
    pub(crate) files_timed_out: usize,
    pub(crate) files_aborted: usize,
    pub(crate) total_original_size: u64,
    pub(crate) total_converted_size: u64,
    pub(crate) total_duration: Duration,
}

impl RunStats {
    pub(crate) fn add_report(&mut self, report: &JobReport) {
        self.total_duration += report.elapsed;
        match report.outcome {
            Outcome::Converted => {
                self.files_converted += 1;
                self.total_original_size += report.original_size;
                self.total_converted_size += report.new_size.unwrap_or_default();
            }
            Outcome::Rejected => self.files_rejected += 1,
            Outcome::Failed | Outcome::SwapFailed => self.files_failed += 1,
            Outcome::TimedOut => self.files_timed_out += 1,
            Outcome::Aborted => self.files_aborted += 1,
        }
    }

    /// Number of jobs that ended in any way.
    pub(crate) const fn total_jobs(&self) -> usize {
        self.files_converted + self.files_rejected + self.files_failed + self.files_timed_out + self.files_aborted
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) const fn space_saved(&self) -> i64 {
        self.total_original_size as i64 - self.total_converted_size as i64
    }

    pub(crate) fn print_summary(&self) {
        println!("{}", "\n--- Conversion Summary ---".bold().magenta());
        println!("Files converted:        {}", self.files_converted);
        println!("Files rejected:         {}", self.files_rejected);
        println!(
            "Files failed:           {}",
            if self.files_failed > 0 {
                self.files_failed.to_string().red()
            } else {
                "0".normal()
            }
        );
        println!("Files timed out:        {}", self.files_timed_out);
        if self.files_aborted > 0 {
            println!("Files aborted:          {}", self.files_aborted);
        }
        println!();

        if self.files_converted > 0 {
            println!(
                "Total original size:    {}",
                media_shrink::format_size(self.total_original_size)
            );
            println!(
                "Total converted size:   {}",
                media_shrink::format_size(self.total_converted_size)
            );

            if self.total_original_size > 0 {
                let saved = self.space_saved();
                let ratio = saved.unsigned_abs() as f64 / self.total_original_size as f64 * 100.0;
                let label = if saved >= 0 { "Space saved:   " } else { "Space increased:" };
                println!(
                    "{label}        {} ({ratio:.1}%)",
                    media_shrink::format_size(saved.unsigned_abs())
                );
            }
        }

        println!(
            "Total time:             {}",
            media_shrink::format_duration(self.total_duration)
        );
    }
}
