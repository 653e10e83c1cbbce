//! Latency histogram collection and summary statistics.
//!
//! A [`SampleSet`] is a fixed-width table of cycle counts: column 0 holds the
//! absolute start timestamp of each iteration, the remaining columns hold
//! per-segment latencies. Widths 2 and 3 are the only ones the probes
//! produce; anything else is rejected up front.

use crate::error::DiscoveryError;
use crate::timing::MemoryTimer;

/// Fixed-width table of timing rows, one row per probe iteration.
#[derive(Debug, Clone)]
pub struct SampleSet {
    width: usize,
    rows: Vec<u64>,
}

impl SampleSet {
    /// Allocate an empty set for `iterations` rows of `width` columns.
    pub fn with_width(iterations: usize, width: usize) -> Result<Self, DiscoveryError> {
        if width != 2 && width != 3 {
            return Err(DiscoveryError::UnsupportedHistogramWidth(width));
        }
        Ok(Self {
            width,
            rows: Vec::with_capacity(iterations * width),
        })
    }

    /// Wrap pre-collected rows, flattened row-major.
    pub fn from_rows(rows: Vec<u64>, width: usize) -> Result<Self, DiscoveryError> {
        if width != 2 && width != 3 {
            return Err(DiscoveryError::UnsupportedHistogramWidth(width));
        }
        assert!(rows.len() % width == 0, "row data not a multiple of width");
        Ok(Self { width, rows })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows collected.
    pub fn len(&self) -> usize {
        self.rows.len() / self.width
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One row: `[t0, d1]` or `[t0, d1, d2]`.
    pub fn row(&self, i: usize) -> &[u64] {
        &self.rows[i * self.width..(i + 1) * self.width]
    }

    /// All values of one column.
    pub fn column(&self, col: usize) -> Vec<u64> {
        assert!(col < self.width);
        self.rows
            .chunks_exact(self.width)
            .map(|r| r[col])
            .collect()
    }

    /// Summary statistics of one column.
    pub fn stats(&self, col: usize) -> LatencyStats {
        LatencyStats::from_samples(&self.column(col))
    }

    fn push_row(&mut self, row: &[u64]) {
        debug_assert_eq!(row.len(), self.width);
        self.rows.extend_from_slice(row);
    }

    /// Convert absolute end timestamps into segment deltas, last column
    /// first, matching the capture order `[t0, t1(, t2)]`.
    fn finalize_deltas(&mut self) {
        let width = self.width;
        for row in self.rows.chunks_exact_mut(width) {
            for c in (1..width).rev() {
                row[c] = row[c].saturating_sub(row[c - 1]);
            }
        }
    }
}

/// Distribution summary used for thresholding decisions.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct LatencyStats {
    pub min: u64,
    pub p25: u64,
    pub median: u64,
    pub p75: u64,
    pub max: u64,
    pub mean: f64,
}

impl LatencyStats {
    /// Nearest-rank quartiles and mean. An empty slice yields an all-zero
    /// record without error.
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self {
                min: 0,
                p25: 0,
                median: 0,
                p75: 0,
                max: 0,
                mean: 0.0,
            };
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let n = sorted.len();
        let rank = |q: usize| sorted[(n - 1) * q / 4];

        Self {
            min: sorted[0],
            p25: rank(1),
            median: rank(2),
            p75: rank(3),
            max: sorted[n - 1],
            mean: sorted.iter().sum::<u64>() as f64 / n as f64,
        }
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Collects latency histograms through a [`MemoryTimer`].
///
/// Every iteration follows the strict order
/// `flush → fence → t0 → access(es) → fence → t_end`; deltas are computed
/// after the loop so no arithmetic lands inside the timed window.
pub struct Sampler<'t, T: MemoryTimer> {
    timer: &'t T,
}

impl<'t, T: MemoryTimer> Sampler<'t, T> {
    pub fn new(timer: &'t T) -> Self {
        Self { timer }
    }

    /// One uncached load per iteration: rows `[t0, d1]`.
    pub fn sample_single(&self, addr: usize, iterations: usize) -> SampleSet {
        let mut set = SampleSet::with_width(iterations, 2).expect("width 2 is always supported");
        let t = self.timer;
        for _ in 0..iterations {
            t.flush(addr);
            t.fence();
            let t0 = t.timestamp();
            t.touch(addr);
            t.fence();
            let t1 = t.timestamp();
            set.push_row(&[t0, t1]);
        }
        set.finalize_deltas();
        set
    }

    /// Two back-to-back uncached loads timed as one segment: rows `[t0, d1]`.
    pub fn sample_paired_coarse(&self, a1: usize, a2: usize, iterations: usize) -> SampleSet {
        let mut set = SampleSet::with_width(iterations, 2).expect("width 2 is always supported");
        let t = self.timer;
        for _ in 0..iterations {
            t.flush(a1);
            t.flush(a2);
            t.fence();
            let t0 = t.timestamp();
            t.touch(a1);
            t.touch(a2);
            t.fence();
            let t1 = t.timestamp();
            set.push_row(&[t0, t1]);
        }
        set.finalize_deltas();
        set
    }

    /// Two uncached loads timed separately: rows `[t0, d1, d2]`.
    pub fn sample_paired_fine(&self, a1: usize, a2: usize, iterations: usize) -> SampleSet {
        let mut set = SampleSet::with_width(iterations, 3).expect("width 3 is always supported");
        let t = self.timer;
        for _ in 0..iterations {
            t.flush(a1);
            t.flush(a2);
            t.fence();
            let t0 = t.timestamp();
            t.touch(a1);
            t.fence();
            let t1 = t.timestamp();
            t.touch(a2);
            t.fence();
            let t2 = t.timestamp();
            set.push_row(&[t0, t1, t2]);
        }
        set.finalize_deltas();
        set
    }

    /// `length` serialized uncached loads of one address timed as a single
    /// segment: rows `[t0, d1]`. Used to expose refresh stalls.
    pub fn sample_consecutive(&self, addr: usize, iterations: usize, length: usize) -> SampleSet {
        let mut set = SampleSet::with_width(iterations, 2).expect("width 2 is always supported");
        let t = self.timer;
        for _ in 0..iterations {
            t.flush(addr);
            t.fence();
            let t0 = t.timestamp();
            for _ in 0..length {
                t.touch(addr);
                t.flush(addr);
                t.fence();
            }
            let t1 = t.timestamp();
            set.push_row(&[t0, t1]);
        }
        set.finalize_deltas();
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Deterministic timer: every touch costs a fixed cycle count, fences
    /// and flushes cost one cycle.
    struct ScriptedTimer {
        clock: Cell<u64>,
        touch_cost: u64,
    }

    impl ScriptedTimer {
        fn new(touch_cost: u64) -> Self {
            Self {
                clock: Cell::new(0),
                touch_cost,
            }
        }
    }

    impl MemoryTimer for ScriptedTimer {
        fn flush(&self, _addr: usize) {
            self.clock.set(self.clock.get() + 1);
        }

        fn fence(&self) {
            self.clock.set(self.clock.get() + 1);
        }

        fn timestamp(&self) -> u64 {
            self.clock.get()
        }

        fn touch(&self, _addr: usize) {
            self.clock.set(self.clock.get() + self.touch_cost);
        }
    }

    #[test]
    fn unsupported_width_is_rejected() {
        assert!(matches!(
            SampleSet::with_width(16, 4),
            Err(DiscoveryError::UnsupportedHistogramWidth(4))
        ));
        assert!(matches!(
            SampleSet::with_width(16, 1),
            Err(DiscoveryError::UnsupportedHistogramWidth(1))
        ));
    }

    #[test]
    fn single_probe_rows_hold_touch_latency() {
        let timer = ScriptedTimer::new(100);
        let sampler = Sampler::new(&timer);
        let set = sampler.sample_single(0x1000, 8);

        assert_eq!(set.len(), 8);
        assert_eq!(set.width(), 2);
        for i in 0..set.len() {
            assert_eq!(set.row(i)[1], 100);
        }
    }

    #[test]
    fn paired_coarse_combines_both_segments() {
        let timer = ScriptedTimer::new(100);
        let sampler = Sampler::new(&timer);
        let set = sampler.sample_paired_coarse(0x1000, 0x2000, 4);

        for i in 0..set.len() {
            assert_eq!(set.row(i)[1], 200);
        }
    }

    #[test]
    fn paired_fine_separates_segments() {
        let timer = ScriptedTimer::new(100);
        let sampler = Sampler::new(&timer);
        let set = sampler.sample_paired_fine(0x1000, 0x2000, 4);

        assert_eq!(set.width(), 3);
        for i in 0..set.len() {
            // d1 covers touch + intervening fence, d2 the second touch + fence.
            assert_eq!(set.row(i)[1], 101);
            assert_eq!(set.row(i)[2], 101);
        }
    }

    #[test]
    fn consecutive_probe_scales_with_length() {
        let timer = ScriptedTimer::new(100);
        let sampler = Sampler::new(&timer);
        let set = sampler.sample_consecutive(0x1000, 4, 4);

        for i in 0..set.len() {
            // 4 × (touch + flush + fence).
            assert_eq!(set.row(i)[1], 4 * 102);
        }
    }

    #[test]
    fn start_timestamps_are_monotone() {
        let timer = ScriptedTimer::new(7);
        let sampler = Sampler::new(&timer);
        let set = sampler.sample_single(0x1000, 16);

        let t0s = set.column(0);
        for w in t0s.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn deltas_are_non_negative_under_real_clock() {
        let timer = crate::timing::FallbackTimer::new();
        let sampler = Sampler::new(&timer);
        let buf = vec![0u8; 4096];
        let set = sampler.sample_single(buf.as_ptr() as usize, 64);

        assert!(set.column(1).iter().all(|&d| d < u64::MAX / 2));
    }

    #[test]
    fn empty_sample_set_yields_zeroed_stats() {
        let set = SampleSet::with_width(0, 2).unwrap();
        let stats = set.stats(1);
        assert_eq!(stats.min, 0);
        assert_eq!(stats.median, 0);
        assert_eq!(stats.max, 0);
        assert_eq!(stats.mean, 0.0);
    }

    #[test]
    fn stats_quartiles() {
        let samples: Vec<u64> = (1..=100).collect();
        let stats = LatencyStats::from_samples(&samples);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.p25, 25);
        assert_eq!(stats.median, 50);
        assert_eq!(stats.p75, 75);
        assert_eq!(stats.max, 100);
        assert!((stats.mean - 50.5).abs() < 1e-9);
    }

    #[test]
    fn stats_constant_distribution() {
        let stats = LatencyStats::from_samples(&[300; 31]);
        assert_eq!(stats.min, 300);
        assert_eq!(stats.p25, 300);
        assert_eq!(stats.median, 300);
        assert_eq!(stats.max, 300);
    }
}
