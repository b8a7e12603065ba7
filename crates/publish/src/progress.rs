//! Progress event plumbing for one publish call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use deltapush_remote::ByteProgress;
use deltapush_transfer::ThroughputMeter;
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::PublishEvent;

/// Smallest fraction step that produces a new event for the same status.
const MIN_FRACTION_STEP: f64 = 0.005;

/// Emits monotonic progress events without ever blocking the upload.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<PublishEvent>,
    header: String,
    last: Mutex<Last>,
}

#[derive(Default)]
struct Last {
    fraction: f64,
    status: String,
}

impl ProgressReporter {
    pub(crate) fn new(tx: mpsc::Sender<PublishEvent>, header: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                tx,
                header,
                last: Mutex::new(Last::default()),
            }),
        }
    }

    /// Reports `fraction`, clamped to `0..=1` and never below an earlier
    /// report.
    pub(crate) fn report(&self, fraction: f64, status: &str, sub_status: &str) {
        let fraction = {
            let Ok(mut last) = self.inner.last.lock() else {
                return;
            };
            let fraction = fraction.clamp(0.0, 1.0).max(last.fraction);
            let status_changed = last.status != status;
            if !status_changed && fraction - last.fraction < MIN_FRACTION_STEP && fraction < 1.0 {
                return;
            }
            last.fraction = fraction;
            if status_changed {
                last.status = status.to_string();
            }
            fraction
        };

        let event = PublishEvent::Progress {
            header: self.inner.header.clone(),
            fraction,
            status: status.to_string(),
            sub_status: sub_status.to_string(),
        };
        if self.inner.tx.try_send(event).is_err() {
            trace!(fraction, "progress event dropped");
        }
    }

    /// Maps transport byte progress onto `start..end` of the overall bar.
    pub(crate) fn byte_progress(&self, start: f64, end: f64, status: &str) -> ByteProgress {
        let reporter = self.clone();
        let status = status.to_string();
        let meter = ThroughputMeter::default();
        let last_done = AtomicU64::new(0);

        Arc::new(move |done, total| {
            let previous = last_done.swap(done, Ordering::AcqRel);
            meter.record(done.saturating_sub(previous));

            let ratio = if total == 0 {
                1.0
            } else {
                done as f64 / total as f64
            };
            let sub_status = format!(
                "{} of {} ({})",
                format_bytes(done),
                format_bytes(total),
                meter.describe()
            );
            reporter.report(start + (end - start) * ratio, &status, &sub_status);
        })
    }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
