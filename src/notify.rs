use tracing::info;

use crate::models::ProgressReport;

/// User-facing notification surface (system tray, foreground notification,
/// terminal line...). Called from the session's sequencer only.
pub trait Notifier: Send + Sync {
    fn connecting(&self, _ssid: &str) {}

    /// Aggregate progress of the running session. `title` is the console
    /// name once the manifest is known.
    fn progress(&self, _title: Option<&str>, _report: ProgressReport) {}

    fn completed(&self, _console_name: &str) {}

    /// The session is over; drop any ongoing notification.
    fn idle(&self) {}
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn connecting(&self, ssid: &str) {
        info!(ssid, "connecting");
    }

    fn progress(&self, title: Option<&str>, report: ProgressReport) {
        let title = title.unwrap_or("");
        match report {
            ProgressReport::Indeterminate => info!(console = title, "downloading"),
            ProgressReport::Percent(percent) => info!(console = title, percent, "downloading"),
        }
    }

    fn completed(&self, console_name: &str) {
        info!(console = console_name, "download completed");
    }
}
