//! Run diagnostics: every hypothesis tested, its scores, its refresh
//! signature, and the final verdict.
//!
//! The collector is append-only during a run and serializes to JSON for the
//! caller's sink; per-hypothesis records also stream through `log::debug!`
//! as they land.

use std::io::{self, Write};

use log::debug;
use serde::Serialize;

use crate::hypothesis::FunctionHypothesis;
use crate::scorer::FunctionScore;

/// Terminal state of one tested hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceVerdict {
    /// Failure budget exceeded during full scoring.
    Discarded,
    /// Scored but never reached the success threshold.
    Undecided,
    /// Promoted by the scorer, then rejected by refresh validation.
    RefreshRejected,
    /// Promoted but no same-side pair could be drawn for validation.
    RefreshSkipped,
    /// Promoted and refresh-validated.
    Validated,
}

/// One scored hypothesis.
#[derive(Debug, Clone, Serialize)]
pub struct HypothesisTrace {
    pub bits: Vec<u32>,
    pub success: u32,
    pub failure: u32,
    pub refresh_median: Option<u64>,
    pub verdict: TraceVerdict,
}

/// Whole-run diagnostics, emitted alongside the mapping artifact.
#[derive(Debug, Default, Serialize)]
pub struct Diagnostics {
    /// Sizes of the same-bank clusters the partitioner built.
    pub cluster_sizes: Vec<usize>,
    /// Hypotheses dropped by the cheap pre-filter (not traced individually).
    pub prefiltered: u64,
    /// Every fully scored hypothesis.
    pub hypotheses: Vec<HypothesisTrace>,
    /// Conflict-oracle re-samples caused by refresh pollution.
    pub oracle_retries: u64,
}

impl Diagnostics {
    pub fn record_clusters(&mut self, sizes: impl IntoIterator<Item = usize>) {
        self.cluster_sizes.extend(sizes);
    }

    pub fn record_prefiltered(&mut self) {
        self.prefiltered += 1;
    }

    pub fn record_score(
        &mut self,
        score: &FunctionScore,
        refresh_median: Option<u64>,
        verdict: TraceVerdict,
    ) {
        debug!(
            "{}: {}+/{}- refresh={:?} => {:?}",
            score.hypothesis, score.success, score.failure, refresh_median, verdict
        );
        self.hypotheses.push(HypothesisTrace {
            bits: score.hypothesis.bits(),
            success: score.success,
            failure: score.failure,
            refresh_median,
            verdict,
        });
    }

    /// Validated functions, in trace order.
    pub fn validated(&self) -> Vec<FunctionHypothesis> {
        self.hypotheses
            .iter()
            .filter(|t| t.verdict == TraceVerdict::Validated)
            .map(|t| FunctionHypothesis::from_bits(&t.bits))
            .collect()
    }

    /// Pretty-printed JSON to the caller's sink.
    pub fn write_json(&self, w: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *w, self)?;
        writeln!(w)
    }
}
