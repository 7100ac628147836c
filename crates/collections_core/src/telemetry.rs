//! Error-telemetry seam.
//!
//! The repository reports recovered failures (rows that could not become
//! entities) here in addition to logging them. Hosts plug in their own sink;
//! the core ships a no-op reporter and an in-memory buffer.

use log::warn;
use std::error::Error;
use std::sync::Mutex;

/// Fire-and-forget sink for errors the core recovered from.
pub trait ErrorReporter: Send + Sync {
    fn capture_exception(&self, err: &(dyn Error + 'static));
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopErrorReporter;

impl ErrorReporter for NoopErrorReporter {
    fn capture_exception(&self, _err: &(dyn Error + 'static)) {}
}

/// Keeps rendered reports in memory until a host drains and uploads them.
#[derive(Debug, Default)]
pub struct BufferedErrorReporter {
    reports: Mutex<Vec<String>>,
}

impl BufferedErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reports waiting to be drained.
    pub fn len(&self) -> usize {
        self.reports.lock().map_or(0, |reports| reports.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes all pending reports, oldest first.
    pub fn drain(&self) -> Vec<String> {
        self.reports
            .lock()
            .map(|mut reports| std::mem::take(&mut *reports))
            .unwrap_or_default()
    }
}

impl ErrorReporter for BufferedErrorReporter {
    fn capture_exception(&self, err: &(dyn Error + 'static)) {
        match self.reports.lock() {
            Ok(mut reports) => reports.push(render_chain(err)),
            Err(_) => warn!(
                "event=telemetry_capture module=telemetry status=error error_code=lock_poisoned"
            ),
        }
    }
}

/// Renders an error and its sources as `outer: inner: root`.
fn render_chain(err: &(dyn Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
