use crate::ring_buffer::{PackedSample, RingBuffer};
use arc_swap::ArcSwap;
use std::sync::Arc;

pub const PERF_SAMPLE_CAPACITY: usize = 65536;

/// One frame's duration in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerfSample {
    pub dt: f32,
}

impl PackedSample for PerfSample {
    fn pack(self) -> u64 {
        self.dt.pack()
    }

    fn unpack(bits: u64) -> Self {
        Self { dt: f32::unpack(bits) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameStats {
    pub samples: usize,
    pub average_fps: f64,
    pub median_frame_time_ms: f64,
    pub median_fps: f64,
    pub low_1_percent_fps: f64,
    pub low_01_percent_fps: f64,
    pub p99_frame_time_ms: f64,
    pub p999_frame_time_ms: f64,
}

impl FrameStats {
    /// Computes statistics over frame times given in seconds.
    pub fn from_frame_times(frame_times: &[f32]) -> Option<Self> {
        let mut sorted: Vec<f64> = frame_times
            .iter()
            .map(|&dt| dt as f64)
            .filter(|dt| dt.is_finite() && *dt > 0.0)
            .collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sorted.len();
        let total: f64 = sorted.iter().sum();
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1] + sorted[n / 2]) * 0.5
        } else {
            sorted[n / 2]
        };

        Some(Self {
            samples: n,
            average_fps: n as f64 / total,
            median_frame_time_ms: median * 1000.0,
            median_fps: 1.0 / median,
            low_1_percent_fps: 1.0 / slowest_mean(&sorted, 0.01),
            low_01_percent_fps: 1.0 / slowest_mean(&sorted, 0.001),
            p99_frame_time_ms: percentile(&sorted, 0.99) * 1000.0,
            p999_frame_time_ms: percentile(&sorted, 0.999) * 1000.0,
        })
    }

    pub fn display_text(&self) -> String {
        format!(
            "FPS: {:.1} ({:.1} ms median)   (1% Low: {:.1}, 0.1% Low: {:.1})   Top FT: P99 {:.1} ms, P99.9 {:.1} ms",
            self.average_fps,
            self.median_frame_time_ms,
            self.low_1_percent_fps,
            self.low_01_percent_fps,
            self.p99_frame_time_ms,
            self.p999_frame_time_ms,
        )
    }
}

// Mean of the slowest `fraction` of an ascending slice, at least one sample.
fn slowest_mean(sorted: &[f64], fraction: f64) -> f64 {
    let take = ((sorted.len() as f64 * fraction).round() as usize).clamp(1, sorted.len());
    let tail = &sorted[sorted.len() - take..];
    tail.iter().sum::<f64>() / take as f64
}

// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Frame-time samples from the present path and the text the overlay shows.
pub struct PerfStats {
    samples: RingBuffer<PerfSample>,
    text: ArcSwap<String>,
    latest: ArcSwap<Option<FrameStats>>,
}

impl PerfStats {
    pub fn new() -> Self {
        Self::with_capacity(PERF_SAMPLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: RingBuffer::new(capacity),
            text: ArcSwap::from_pointee(String::new()),
            latest: ArcSwap::from_pointee(None),
        }
    }

    pub fn record_frame_time(&self, dt_seconds: f32) {
        self.samples.record(PerfSample { dt: dt_seconds });
    }

    pub fn sample_count(&self) -> usize {
        self.samples.count()
    }

    /// Recomputes statistics and republishes the display string.
    pub fn aggregate(&self) -> Option<FrameStats> {
        let frame_times: Vec<f32> = self.samples.snapshot().into_iter().map(|s| s.dt).collect();
        let stats = FrameStats::from_frame_times(&frame_times);
        if let Some(stats) = &stats {
            self.text.store(Arc::new(stats.display_text()));
        }
        self.latest.store(Arc::new(stats));
        stats
    }

    pub fn text(&self) -> Arc<String> {
        self.text.load_full()
    }

    pub fn latest(&self) -> Option<FrameStats> {
        **self.latest.load()
    }

    pub fn reset(&self) {
        self.samples.reset();
        self.text.store(Arc::new(String::new()));
        self.latest.store(Arc::new(None));
    }
}

impl Default for PerfStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spiky_frames() -> Vec<f32> {
        let mut frames = vec![0.00694f32; 990];
        frames.extend(std::iter::repeat(0.0333f32).take(10));
        frames
    }

    #[test]
    fn one_percent_low_averages_slowest_frames() {
        let stats = FrameStats::from_frame_times(&spiky_frames()).unwrap();
        assert_eq!(stats.samples, 1000);
        assert!((stats.low_1_percent_fps - 30.03).abs() < 0.1, "{}", stats.low_1_percent_fps);
        assert!((stats.median_fps - 144.09).abs() < 0.1, "{}", stats.median_fps);
        assert!((stats.median_frame_time_ms - 6.94).abs() < 0.01);
        assert!((stats.p999_frame_time_ms - 33.3).abs() < 0.01);
        assert!((stats.p99_frame_time_ms - 6.94).abs() < 0.01);
    }

    #[test]
    fn invalid_samples_are_ignored() {
        assert!(FrameStats::from_frame_times(&[0.0, -1.0, f32::NAN]).is_none());
        let stats = FrameStats::from_frame_times(&[0.01, f32::INFINITY]).unwrap();
        assert_eq!(stats.samples, 1);
        assert!((stats.low_01_percent_fps - 100.0).abs() < 0.01);
    }

    #[test]
    fn aggregate_publishes_text_and_reset_clears_it() {
        let perf = PerfStats::with_capacity(2048);
        for dt in spiky_frames() {
            perf.record_frame_time(dt);
        }
        let stats = perf.aggregate().unwrap();
        let text = perf.text();
        assert!(text.starts_with("FPS: "), "{}", text);
        assert!(text.contains("(6.9 ms median)"), "{}", text);
        assert!(text.contains("1% Low: 30.0"), "{}", text);
        assert_eq!(perf.latest(), Some(stats));

        perf.reset();
        assert_eq!(perf.sample_count(), 0);
        assert!(perf.text().is_empty());
        assert!(perf.aggregate().is_none());
    }
}
