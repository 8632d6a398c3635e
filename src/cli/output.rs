//! Output formatting module for devfleet
//!
//! Colored human output on stderr and stdout, or JSON on stdout.

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use devfleet::deploy::{DeployReport, HostOutcome};
use devfleet::transfer::{Direction, TransferSummary};

/// Output formatter for different output modes
pub struct OutputFormatter {
    /// Use colored output
    use_color: bool,
    /// JSON output mode
    json_mode: bool,
    /// Verbosity level
    verbosity: u8,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, json_mode: bool, verbosity: u8) -> Self {
        // Respect NO_COLOR environment variable
        let use_color = use_color && std::env::var("NO_COLOR").is_err();
        if !use_color {
            colored::control::set_override(false);
        }

        Self {
            use_color,
            json_mode,
            verbosity,
        }
    }

    /// Whether JSON output is requested
    pub fn is_json(&self) -> bool {
        self.json_mode
    }

    /// Whether progress bars should be drawn
    pub fn show_progress(&self) -> bool {
        !self.json_mode
    }

    /// Print an informational line
    pub fn info(&self, message: &str) {
        if self.json_mode {
            return;
        }
        eprintln!("{}", message);
    }

    /// Print a debug line (only with -v)
    pub fn debug(&self, message: &str) {
        if self.json_mode || self.verbosity < 1 {
            return;
        }
        eprintln!("{}", message.dimmed());
    }

    /// Print a warning
    pub fn warning(&self, message: &str) {
        eprintln!("{} {}", "warning:".yellow().bold(), message);
    }

    /// Print an error
    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "error:".red().bold(), message);
    }

    /// Print `value` as pretty JSON on stdout
    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Print the per-server deploy recap
    pub fn deploy_report(&self, report: &DeployReport) -> Result<()> {
        if self.json_mode {
            return self.json(report);
        }

        let width = report
            .outcomes
            .iter()
            .map(|o| o.server.len())
            .max()
            .unwrap_or(0);

        println!();
        println!("{}", "DEPLOY RECAP".bold());
        for outcome in &report.outcomes {
            println!("{}", self.recap_line(outcome, width));
        }

        let failed = report.failed().count();
        let summary = format!(
            "{} ok, {} failed",
            report.outcomes.len() - failed,
            failed
        );
        if failed == 0 {
            println!("{}", summary.green());
        } else {
            println!("{}", summary.red().bold());
        }
        Ok(())
    }

    fn recap_line(&self, outcome: &HostOutcome, width: usize) -> String {
        let server = format!("{:width$}", outcome.server, width = width);
        match &outcome.error {
            None => {
                let revision = outcome
                    .revision
                    .as_deref()
                    .map(|r| r.chars().take(12).collect::<String>())
                    .unwrap_or_default();
                let patch = if outcome.patch_applied {
                    "patch applied"
                } else {
                    "no local changes"
                };
                format!(
                    "{} : {} {} ({})",
                    server.bold(),
                    "ok".green(),
                    revision,
                    patch
                )
            }
            Some(error) => {
                let status = if outcome.revision_mismatch {
                    "mismatch".yellow().bold()
                } else {
                    "failed".red().bold()
                };
                format!(
                    "{} : {} [{}] {}",
                    server.bold(),
                    status,
                    outcome.phase,
                    error
                )
            }
        }
    }

    /// Print the result of a transfer
    pub fn transfer_summary(&self, direction: Direction, summary: &TransferSummary) -> Result<()> {
        if self.json_mode {
            return self.json(summary);
        }

        let verb = match direction {
            Direction::Get => "Downloaded",
            Direction::Put => "Uploaded",
        };
        let mut line = format!(
            "{} {} files ({})",
            verb,
            summary.files_transferred,
            human_bytes(summary.bytes_transferred)
        );
        if summary.files_skipped > 0 {
            line.push_str(&format!(", {} skipped", summary.files_skipped));
        }
        if summary.files_filtered > 0 {
            line.push_str(&format!(", {} filtered", summary.files_filtered));
        }

        if self.use_color {
            println!("{}", line.green());
        } else {
            println!("{}", line);
        }
        Ok(())
    }
}

/// Format a byte count with a binary unit.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
