//! Boundary to the host's toast/notification renderer.

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Error,
}

/// Renders a short user-facing message. Never required for correctness.
pub trait Notifier: Send {
    fn notify(&mut self, message: &str, severity: Severity);
}

/// Writes notifications to the log; used when no UI is attached.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, message: &str, severity: Severity) {
        match severity {
            Severity::Success => info!("{}", message),
            Severity::Error => warn!("{}", message),
        }
    }
}
