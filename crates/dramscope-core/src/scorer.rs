//! Scoring candidate functions against the conflict oracle.
//!
//! A candidate earns a success when it agrees with the oracle about a random
//! address pair and a failure when it disagrees; `Inconclusive` verdicts are
//! ignored. A cheap pre-filter kills hopeless candidates before the full
//! pass, and the full pass short-circuits as soon as the failure budget is
//! exceeded.

use log::trace;
use rand::Rng;
use serde::Serialize;

use crate::constants::{
    EFFECTIVE_TRIALS, PREFILTER_FAILURE_SCORE, PREFILTER_TRIALS, TRIAL_FAILURE_SCORE,
    TRIAL_SUCCESS_SCORE,
};
use crate::hypothesis::FunctionHypothesis;
use crate::oracle::{ConflictOracle, Verdict};
use crate::pool::AddressPool;

/// Tally of one scoring pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FunctionScore {
    pub hypothesis: FunctionHypothesis,
    pub success: u32,
    pub failure: u32,
}

impl FunctionScore {
    /// Enough agreement to advance to refresh validation.
    pub fn promoted(&self) -> bool {
        self.success >= TRIAL_SUCCESS_SCORE
    }

    /// Failure budget exceeded; the pass was cut short.
    pub fn discarded(&self) -> bool {
        self.failure > TRIAL_FAILURE_SCORE
    }
}

/// Drives pre-filter and full scoring passes over pool pairs.
pub struct Scorer<'a, O: ConflictOracle + ?Sized> {
    pool: &'a AddressPool,
    oracle: &'a O,
    effective_trials: usize,
    prefilter_trials: usize,
}

impl<'a, O: ConflictOracle + ?Sized> Scorer<'a, O> {
    pub fn new(pool: &'a AddressPool, oracle: &'a O) -> Self {
        Self {
            pool,
            oracle,
            effective_trials: EFFECTIVE_TRIALS,
            prefilter_trials: PREFILTER_TRIALS,
        }
    }

    /// Override the pair budgets. Test hook.
    pub fn with_trials(mut self, effective: usize, prefilter: usize) -> Self {
        self.effective_trials = effective;
        self.prefilter_trials = prefilter;
        self
    }

    /// Cheap pre-filter pass. Returns `false` when the candidate
    /// accumulates the disqualifying failure count early.
    pub fn prefilter(&self, hypothesis: FunctionHypothesis, rng: &mut impl Rng) -> bool {
        let mut failures = 0u32;
        for _ in 0..self.prefilter_trials {
            if let Some(agreed) = self.observe(hypothesis, rng) {
                if !agreed {
                    failures += 1;
                    if failures >= PREFILTER_FAILURE_SCORE {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Full scoring pass with failure short-circuit.
    pub fn score(&self, hypothesis: FunctionHypothesis, rng: &mut impl Rng) -> FunctionScore {
        let mut score = FunctionScore {
            hypothesis,
            success: 0,
            failure: 0,
        };

        for _ in 0..self.effective_trials {
            match self.observe(hypothesis, rng) {
                Some(true) => score.success += 1,
                Some(false) => {
                    score.failure += 1;
                    if score.failure > TRIAL_FAILURE_SCORE {
                        break;
                    }
                }
                None => {}
            }
        }

        trace!(
            "scored {}: {}+/{}-",
            hypothesis, score.success, score.failure
        );
        score
    }

    /// One pair observation: `Some(true)` when the candidate and the oracle
    /// agree, `Some(false)` when they disagree, `None` on `Inconclusive`.
    fn observe(&self, hypothesis: FunctionHypothesis, rng: &mut impl Rng) -> Option<bool> {
        let (a, b) = self.pool.random_pair(rng);
        let agrees = hypothesis.agrees(a.paddr, b.paddr);
        match self.oracle.same_bank(&a, &b) {
            Verdict::Same => Some(agrees),
            Verdict::Different => Some(!agrees),
            Verdict::Inconclusive => None,
        }
    }
}
