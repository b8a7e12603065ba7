use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Sample {
    bytes: u64,
    at: Instant,
}

struct MeterInner {
    samples: VecDeque<Sample>,
    window: Duration,
    max_samples: usize,
}

/// Transfer rate over a sliding time window.
///
/// Fed from byte-progress callbacks, which may arrive from any thread.
pub struct ThroughputMeter {
    inner: Mutex<MeterInner>,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}

impl ThroughputMeter {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                samples: VecDeque::new(),
                window,
                max_samples: max_samples.max(2),
            }),
        }
    }

    /// Records `bytes` transferred since the previous sample.
    pub fn record(&self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    fn record_at(&self, bytes: u64, at: Instant) {
        let Ok(mut m) = self.inner.lock() else {
            return;
        };
        m.samples.push_back(Sample { bytes, at });
        let window = m.window;
        while m
            .samples
            .front()
            .is_some_and(|s| at.duration_since(s.at) > window)
        {
            m.samples.pop_front();
        }
        while m.samples.len() > m.max_samples {
            m.samples.pop_front();
        }
    }

    /// Average bytes per second in the window; 0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let Ok(m) = self.inner.lock() else {
            return 0.0;
        };
        let (Some(first), Some(last)) = (m.samples.front(), m.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.duration_since(first.at);
        if m.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample's bytes were transferred before the window opened.
        let bytes: u64 = m.samples.iter().skip(1).map(|s| s.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining` bytes; `None` while the rate is 0.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn reset(&self) {
        if let Ok(mut m) = self.inner.lock() {
            m.samples.clear();
        }
    }

    /// Human-readable rate, e.g. `"12.5 MB/s"`.
    pub fn describe(&self) -> String {
        format_rate(self.bytes_per_second())
    }
}

fn format_rate(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_second;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
