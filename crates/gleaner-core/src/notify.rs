//! Administrative notifications.

use std::sync::Mutex;

/// Receives operator-facing messages such as data-quality fallbacks.
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, message: &str);
}

/// Emits notifications as `warn` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, subject: &str, message: &str) {
        tracing::warn!(target: "gleaner::notify", subject, "{}", message);
    }
}

/// Keeps notifications in memory, for inspection after a run.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, subject: &str, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((subject.to_string(), message.to_string()));
        }
    }
}
