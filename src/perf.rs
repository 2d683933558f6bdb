//! Lightweight performance aggregation utilities.
//!
//! Coarse timing and counter tracking for end-of-run summaries
//! (`nnmusic --verbose`). Always enabled; the overhead is one atomic add per
//! recorded event.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Duration,
    Counter,
}

#[derive(Debug, Clone, Copy)]
struct MetricInfo {
    name: &'static str,
    kind: MetricKind,
}

/// Named metrics tracked by the perf collector.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Metric {
    AudioRead,
    AudioWrite,
    CorpusScan,
    CorpusFill,
    TrainEpoch,
    CheckpointSave,
    CheckpointLoad,
    ComposeSeed,
    ComposeStep,
    FilesRead,
    FilesSkipped,
    SamplesRead,
    GradientSteps,
    ComposedSteps,
}

impl Metric {
    const COUNT: usize = 14;

    fn index(self) -> usize {
        self as usize
    }
}

const METRICS: [MetricInfo; Metric::COUNT] = [
    MetricInfo {
        name: "audio.read",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "audio.write",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "corpus.scan",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "corpus.fill",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "train.epoch",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "checkpoint.save",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "checkpoint.load",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "compose.seed",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "compose.step",
        kind: MetricKind::Duration,
    },
    MetricInfo {
        name: "files.read",
        kind: MetricKind::Counter,
    },
    MetricInfo {
        name: "files.skipped",
        kind: MetricKind::Counter,
    },
    MetricInfo {
        name: "samples.read",
        kind: MetricKind::Counter,
    },
    MetricInfo {
        name: "train.gradient_steps",
        kind: MetricKind::Counter,
    },
    MetricInfo {
        name: "compose.steps",
        kind: MetricKind::Counter,
    },
];

struct PerfCollector {
    start: Instant,
    totals_us: [AtomicU64; Metric::COUNT],
    counts: [AtomicU64; Metric::COUNT],
}

impl PerfCollector {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            totals_us: std::array::from_fn(|_| AtomicU64::new(0)),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn add_duration(&self, metric: Metric, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let index = metric.index();
        self.totals_us[index].fetch_add(micros, Ordering::Relaxed);
        self.counts[index].fetch_add(1, Ordering::Relaxed);
    }

    fn add_count(&self, metric: Metric, delta: u64) {
        self.counts[metric.index()].fetch_add(delta, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            uptime: self.start.elapsed(),
            totals_us: std::array::from_fn(|idx| self.totals_us[idx].load(Ordering::Relaxed)),
            counts: std::array::from_fn(|idx| self.counts[idx].load(Ordering::Relaxed)),
        }
    }
}

static COLLECTOR: OnceLock<PerfCollector> = OnceLock::new();

fn collector() -> &'static PerfCollector {
    COLLECTOR.get_or_init(PerfCollector::new)
}

/// A RAII timer that records its duration when dropped.
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        collector().add_duration(self.metric, self.start.elapsed());
    }
}

/// Begin a named timing span.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

/// Record a counter delta for a named metric.
pub fn add_count(metric: Metric, delta: u64) {
    collector().add_count(metric, delta);
}

/// Current value of a counter metric.
pub fn count(metric: Metric) -> u64 {
    collector().counts[metric.index()].load(Ordering::Relaxed)
}

/// Snapshot of collected performance data.
#[derive(Debug)]
pub struct PerfSnapshot {
    uptime: Duration,
    totals_us: [u64; Metric::COUNT],
    counts: [u64; Metric::COUNT],
}

impl PerfSnapshot {
    fn seconds(&self, metric: Metric) -> f64 {
        self.totals_us[metric.index()] as f64 / 1e6
    }

    fn count(&self, metric: Metric) -> u64 {
        self.counts[metric.index()]
    }

    /// Rate of `numerator` per second spent in `timer`, when both were recorded.
    fn rate(&self, numerator: Metric, timer: Metric) -> Option<f64> {
        let seconds = self.seconds(timer);
        let value = self.count(numerator);
        (seconds > 0.0 && value > 0).then(|| value as f64 / seconds)
    }

    /// Format a human-readable report.
    ///
    /// Rows keep pipeline order (ingestion, training, composition) and only
    /// metrics that were touched are listed. Throughput lines follow when the
    /// matching counter and timer both ran.
    pub fn format(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(
            output,
            "nnmusic timings after {:.3}s",
            self.uptime.as_secs_f64()
        );

        let mut any = false;
        for (idx, info) in METRICS.iter().enumerate() {
            let (total_us, count) = (self.totals_us[idx], self.counts[idx]);
            match info.kind {
                MetricKind::Duration if count > 0 => {
                    let mean_ms = total_us as f64 / count as f64 / 1e3;
                    let _ = writeln!(
                        output,
                        "  {:<22} {:>9.3}s over {count:>6} (mean {mean_ms:.3}ms)",
                        info.name,
                        total_us as f64 / 1e6
                    );
                }
                MetricKind::Counter if count > 0 => {
                    let _ = writeln!(output, "  {:<22} {count:>10}", info.name);
                }
                _ => continue,
            }
            any = true;
        }
        if !any {
            output.push_str("  nothing recorded\n");
            return output;
        }

        if let Some(rate) = self.rate(Metric::SamplesRead, Metric::AudioRead) {
            let _ = writeln!(output, "  decoded {rate:.0} samples/s");
        }
        if let Some(rate) = self.rate(Metric::GradientSteps, Metric::TrainEpoch) {
            let _ = writeln!(output, "  trained {rate:.2} updates/s");
        }
        if let Some(rate) = self.rate(Metric::ComposedSteps, Metric::ComposeStep) {
            let _ = writeln!(output, "  composed {rate:.0} steps/s");
        }
        output
    }
}

/// Format a report of all collected metrics.
pub fn report() -> String {
    collector().snapshot().format()
}
