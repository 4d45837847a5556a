//! Terminal output — spinner and colored status lines.
//!
//! Uses `indicatif` for the progress spinner and `console` for color
//! styling. [`JobProgress`] visually tracks one job's run in the terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Job, JobStatus};

/// Visual progress indicator for one job run.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Start the spinner with the program being run.
    pub fn start(program: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("running {program}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Show a retry notice with the attempt number.
    #[allow(dead_code)]
    pub fn retry(&self, attempt: u32, max: u32, reason: &str) {
        self.pb.println(format!(
            "  {} Retry {attempt}/{max}: {reason}",
            self.yellow.apply_to("↻")
        ));
    }

    /// Stop the spinner and print the terminal status.
    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.status {
            JobStatus::Completed => {
                let exit_code = job.result.as_ref().map(|r| r.exit_code).unwrap_or(-1);
                println!(
                    "  {} Job completed (exit code {exit_code}, {} attempt{})",
                    self.green.apply_to("✓"),
                    job.attempts,
                    if job.attempts == 1 { "" } else { "s" }
                );
            }
            JobStatus::Cancelled => {
                println!("  {} Job cancelled", self.yellow.apply_to("⊘"));
            }
            _ => {
                let reason = job
                    .last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".into());
                println!("  {} Job failed: {reason}", self.red.apply_to("✗"));
            }
        }
    }

    /// Print the final job record as pretty JSON.
    pub fn print_report(&self, job: &Job) {
        let status_style = match job.status {
            JobStatus::Completed => &self.green,
            JobStatus::Error => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── Job Report ───"));
        println!("{}", serde_json::to_string_pretty(job).unwrap_or_default());
    }
}
