//! Operator-facing output: the reporter implementation and session
//! summaries. Human-readable messages go to stderr; stdout is reserved
//! for structured status.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use siteshift_core::orchestrator::Reporter;
use siteshift_types::{MigrationSession, StepStatus};

pub struct CliReporter {
    spinner: ProgressBar,
}

impl CliReporter {
    pub fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(120));
        CliReporter { spinner }
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for CliReporter {
    fn info(&self, msg: &str) {
        self.spinner.set_message(msg.to_string());
        // Plain writes rather than ProgressBar::println so output
        // survives non-terminal stderr (CI, pipes).
        self.spinner.suspend(|| eprintln!("[info] {msg}"));
    }

    fn warn(&self, msg: &str) {
        self.spinner.suspend(|| eprintln!("[warn] {msg}"));
    }

    fn error(&self, msg: &str) {
        self.spinner.suspend(|| eprintln!("[error] {msg}"));
    }
}

pub fn print_session_summary(session: &MigrationSession) {
    println!("session: {}", session.id);
    println!("status: {}", session.status);
    if let Some(duration) = session.duration_secs {
        println!("duration: {duration:.1}s");
    }
    println!("progress: {:.0}%", session.overall_progress());
    println!();

    for step in &session.steps {
        let marker = match step.status {
            StepStatus::Completed => "ok",
            StepStatus::Skipped => "--",
            StepStatus::Failed => "XX",
            StepStatus::Cancelled => "!c",
            StepStatus::Running => ">>",
            StepStatus::Pending => "..",
        };
        let duration = step
            .duration_secs
            .map(|d| format!(" ({d:.1}s)"))
            .unwrap_or_default();
        println!("  [{marker}] {}{duration}", step.id);
    }

    if !session.artifacts.is_empty() {
        println!();
        println!("artifacts:");
        for artifact in &session.artifacts {
            println!(
                "  {} {} ({} bytes)",
                artifact.kind,
                artifact.location.display(),
                artifact.size
            );
        }
    }

    if let Some(error) = &session.error {
        println!();
        println!("error: [{}] {}", error.code, error.message);
        if let Some(step) = &error.step_id {
            println!("failing step: {step}");
        }
    }
}
