//! The conflict oracle: "do these two addresses share a bank?"
//!
//! Two uncached loads from different rows of the same bank serialise through
//! the sense amplifiers and land in a distinct, elevated latency band. The
//! oracle samples a pair repeatedly and places the median of the combined
//! latency against the platform profile's conflict band.

use std::cell::Cell;

use log::debug;
use serde::Serialize;

use crate::config::PlatformProfile;
use crate::constants::CONFLICT_SAMPLE_ITERATIONS;
use crate::histogram::{LatencyStats, Sampler};
use crate::pool::AddressRecord;
use crate::timing::MemoryTimer;

/// Outcome of a same-bank query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    /// Median inside the conflict band: row-buffer conflict, same bank.
    Same,
    /// Median below the band: no conflict observed.
    Different,
    /// Median above the band, or refresh interference that survived a
    /// retry. Counts against the hypothesis under test, never for it.
    Inconclusive,
}

/// Decision seam between the statistical layers and the hardware.
///
/// The pipeline only ever talks to this trait, so tests can substitute a
/// deterministic oracle built from a known mapping function.
pub trait ConflictOracle {
    fn same_bank(&self, a: &AddressRecord, b: &AddressRecord) -> Verdict;

    /// Decisions that needed a refresh-outlier re-sample so far.
    fn retries(&self) -> u64 {
        0
    }
}

/// Production oracle: paired-load latency medians against the profile band.
pub struct TimingConflictOracle<'t, T: MemoryTimer> {
    sampler: Sampler<'t, T>,
    profile: PlatformProfile,
    iterations: usize,
    retries: Cell<u64>,
}

impl<'t, T: MemoryTimer> TimingConflictOracle<'t, T> {
    pub fn new(timer: &'t T, profile: PlatformProfile) -> Self {
        Self {
            sampler: Sampler::new(timer),
            profile,
            iterations: CONFLICT_SAMPLE_ITERATIONS,
            retries: Cell::new(0),
        }
    }

    /// Override the per-decision sample count. Test hook.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    fn collect(&self, a: usize, b: usize) -> LatencyStats {
        self.sampler.sample_paired_coarse(a, b, self.iterations).stats(1)
    }

    /// The p25 whisker dropping below the band while the median sits inside
    /// it is the signature of a refresh train polluting the sample.
    fn refresh_polluted(&self, stats: &LatencyStats) -> bool {
        stats.p25 < self.profile.sbdr_lower
            && (self.profile.sbdr_lower..=self.profile.sbdr_upper).contains(&stats.median)
    }

    fn decide(&self, stats: &LatencyStats) -> Verdict {
        if stats.median < self.profile.sbdr_lower {
            if stats.median >= self.profile.bank_group_threshold {
                debug!(
                    "median {} under conflict band but above bank-group threshold {}; \
                     likely same-bank-group neighbour",
                    stats.median, self.profile.bank_group_threshold
                );
            }
            Verdict::Different
        } else if stats.median <= self.profile.sbdr_upper {
            Verdict::Same
        } else {
            Verdict::Inconclusive
        }
    }
}

impl<T: MemoryTimer> ConflictOracle for TimingConflictOracle<'_, T> {
    fn retries(&self) -> u64 {
        self.retries.get()
    }

    fn same_bank(&self, a: &AddressRecord, b: &AddressRecord) -> Verdict {
        let mut stats = self.collect(a.vaddr, b.vaddr);

        if self.refresh_polluted(&stats) {
            self.retries.set(self.retries.get() + 1);
            stats = self.collect(a.vaddr, b.vaddr);
            if self.refresh_polluted(&stats) {
                return Verdict::Inconclusive;
            }
        }

        self.decide(&stats)
    }
}
