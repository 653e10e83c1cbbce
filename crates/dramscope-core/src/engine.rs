//! The discovery pipeline: pool → partition → hypothesize → score →
//! refresh-validate → assemble.
//!
//! The pipeline is sequential and single-threaded; the timing-critical inner
//! loops live in the probes it drives. Cancellation is cooperative and
//! checked between probes only — an in-flight sample set always completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{MemoryTopology, PlatformProfile};
use crate::constants::{
    CALIBRATION_SWEEP_ITERATIONS, CONFLICT_SAMPLE_ITERATIONS, CONSECUTIVE_ACCESS_LENGTH,
    CONSECUTIVE_SAMPLE_ITERATIONS,
};
use crate::diagnostics::{Diagnostics, TraceVerdict};
use crate::error::DiscoveryError;
use crate::histogram::{LatencyStats, Sampler};
use crate::hypothesis::{FunctionHypothesis, HypothesisEnumerator};
use crate::mapping::{Mapping, MappingAssembler};
use crate::oracle::ConflictOracle;
use crate::partition::Partitioner;
use crate::pool::{AddressPool, AddressRecord};
use crate::refresh::RefreshCheck;
use crate::scorer::Scorer;
use crate::timing::{MemoryTimer, pin_to_cpu};

/// Cooperative cancellation flag shared between the engine and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Knobs for one discovery run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Same-bank clusters the partitioner must establish before the search
    /// starts; a failed cluster aborts the run early with a clear signal
    /// that the profile is wrong.
    pub num_clusters: usize,
    /// Hardware thread to pin before the first probe.
    pub pinned_cpu: Option<usize>,
    /// Seed for every random draw; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Draws allowed when searching a same-side pair for refresh validation.
    pub pair_search_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_clusters: 2,
            pinned_cpu: None,
            seed: None,
            pair_search_attempts: 1024,
        }
    }
}

/// Mapping plus the full diagnostics trail.
#[derive(Debug)]
pub struct MappingReport {
    pub mapping: Mapping,
    pub diagnostics: Diagnostics,
}

/// Sequences the full discovery pipeline over injected oracle and refresh
/// seams.
pub struct DiscoveryEngine<'a, O: ConflictOracle + ?Sized, R: RefreshCheck + ?Sized> {
    pool: &'a AddressPool,
    oracle: &'a O,
    refresh: &'a R,
    topology: MemoryTopology,
    profile: PlatformProfile,
    config: EngineConfig,
    cancel: CancelToken,
}

impl<'a, O: ConflictOracle + ?Sized, R: RefreshCheck + ?Sized> DiscoveryEngine<'a, O, R> {
    pub fn new(
        pool: &'a AddressPool,
        oracle: &'a O,
        refresh: &'a R,
        topology: MemoryTopology,
        profile: PlatformProfile,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            oracle,
            refresh,
            topology,
            profile,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Token the caller may use to interrupt the run between probes.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the pipeline to completion.
    pub fn run(&self) -> Result<MappingReport, DiscoveryError> {
        if self.pool.is_empty() {
            return Err(DiscoveryError::EmptyPool);
        }

        if let Some(cpu) = self.config.pinned_cpu {
            match pin_to_cpu(cpu) {
                Ok(()) => info!("pinned to CPU {cpu}"),
                Err(e) => warn!("could not pin to CPU {cpu}: {e}"),
            }
        }

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut diagnostics = Diagnostics::default();

        // Establish that the conflict signal exists at all before burning
        // the full search budget.
        let partitioner = Partitioner::new(self.pool, self.oracle);
        let clusters = partitioner.build_clusters(self.config.num_clusters, &mut rng)?;
        diagnostics.record_clusters(clusters.iter().map(|c| c.len()));

        let expected = self.topology.expected_function_count();
        info!(
            "searching for {} independent functions over {} banks",
            expected,
            self.topology.num_banks()
        );

        let validated = self.search_functions(expected, &mut rng, &mut diagnostics)?;
        diagnostics.oracle_retries = self.oracle.retries();

        let assembler = MappingAssembler::new(&self.topology, &self.profile);
        let mapping = assembler.assemble(&validated)?;

        Ok(MappingReport {
            mapping,
            diagnostics,
        })
    }

    /// Enumerate, pre-filter, score and refresh-validate candidates until
    /// enough independent functions survive.
    fn search_functions(
        &self,
        expected: usize,
        rng: &mut StdRng,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<FunctionHypothesis>, DiscoveryError> {
        use crate::constants::{FUNCTION_MAX_BITS, FUNCTION_MIN_BITS};

        let g = &self.topology.geometry;
        let enumerator = HypothesisEnumerator::new(
            self.profile.cacheline_offset,
            g.address_bits(),
            g.row_bit_base(),
            FUNCTION_MIN_BITS,
            FUNCTION_MAX_BITS,
        );
        let scorer = Scorer::new(self.pool, self.oracle);

        let mut validated: Vec<FunctionHypothesis> = Vec::new();
        let mut basis: Vec<u64> = Vec::new();

        for hypothesis in enumerator {
            if self.cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }

            if !scorer.prefilter(hypothesis, rng) {
                diagnostics.record_prefiltered();
                continue;
            }

            let score = scorer.score(hypothesis, rng);
            if !score.promoted() {
                let verdict = if score.discarded() {
                    TraceVerdict::Discarded
                } else {
                    TraceVerdict::Undecided
                };
                diagnostics.record_score(&score, None, verdict);
                continue;
            }

            let Some((a, b)) = self.same_side_pair(hypothesis, rng) else {
                diagnostics.record_score(&score, None, TraceVerdict::RefreshSkipped);
                continue;
            };

            let signature = self.refresh.validate(&a, &b)?;
            if !signature.regular {
                diagnostics.record_score(
                    &score,
                    Some(signature.median),
                    TraceVerdict::RefreshRejected,
                );
                continue;
            }

            diagnostics.record_score(&score, Some(signature.median), TraceVerdict::Validated);
            validated.push(hypothesis);

            if insert_into_basis(&mut basis, hypothesis.mask()) && basis.len() >= expected {
                info!("found {} independent functions; stopping the search", expected);
                break;
            }
        }

        Ok(validated)
    }

    /// Draw a pair on the same side of the candidate's partition.
    fn same_side_pair(
        &self,
        hypothesis: FunctionHypothesis,
        rng: &mut impl Rng,
    ) -> Option<(AddressRecord, AddressRecord)> {
        for _ in 0..self.config.pair_search_attempts {
            let (a, b) = self.pool.random_pair(rng);
            if hypothesis.agrees(a.paddr, b.paddr) {
                return Some((a, b));
            }
        }
        None
    }
}

/// Insert into a GF(2) basis; returns whether the vector was independent.
fn insert_into_basis(basis: &mut Vec<u64>, mask: u64) -> bool {
    let mut v = mask;
    for &b in basis.iter() {
        v = v.min(v ^ b);
    }
    if v == 0 {
        false
    } else {
        basis.push(v);
        true
    }
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Latency distributions for tuning a platform profile's conflict band.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CalibrationReport {
    /// Single uncached load at one address.
    pub single: LatencyStats,
    /// Combined latency of a random uncached pair.
    pub paired: LatencyStats,
    /// Serialized back-to-back uncached loads at one address; refresh stalls
    /// show up in the upper tail.
    pub consecutive: LatencyStats,
}

/// Sweep single-, paired- and consecutive-load latencies over random pool
/// records.
///
/// The single distribution sits at the row-hit/row-miss floor; the paired
/// distribution is bimodal, and its upper mode is the conflict band the
/// profile must bracket.
pub fn calibrate<T: MemoryTimer>(
    timer: &T,
    pool: &AddressPool,
    rng: &mut impl Rng,
) -> CalibrationReport {
    let sampler = Sampler::new(timer);
    let record = pool.random_record(rng);
    let single = sampler
        .sample_single(record.vaddr, CALIBRATION_SWEEP_ITERATIONS)
        .stats(1);

    let (a, b) = pool.random_pair(rng);
    let paired = sampler
        .sample_paired_coarse(a.vaddr, b.vaddr, CONFLICT_SAMPLE_ITERATIONS)
        .stats(1);

    let consecutive = sampler
        .sample_consecutive(
            record.vaddr,
            CONSECUTIVE_SAMPLE_ITERATIONS,
            CONSECUTIVE_ACCESS_LENGTH,
        )
        .stats(1);

    CalibrationReport {
        single,
        paired,
        consecutive,
    }
}
