//! Iteration budgets and score thresholds for the discovery pipeline.
//!
//! These are platform-independent; the platform-dependent cycle bounds live
//! in [`crate::config::PlatformProfile`].

/// Paired-access samples collected per conflict-oracle decision.
pub const CONFLICT_SAMPLE_ITERATIONS: usize = 300;

/// Samples collected per refresh-interval probe.
pub const REFRESH_SAMPLE_ITERATIONS: usize = 1024;

/// Samples collected per consecutive-load probe.
pub const CONSECUTIVE_SAMPLE_ITERATIONS: usize = 512;

/// Back-to-back uncached loads per consecutive-probe iteration.
pub const CONSECUTIVE_ACCESS_LENGTH: usize = 4;

/// Samples collected by the calibration latency sweep.
pub const CALIBRATION_SWEEP_ITERATIONS: usize = 16384;

/// A bank cluster is usable for statistics once it holds this many records.
pub const MIN_CLUSTER_SIZE: usize = 64;

/// Candidate draws the partitioner may spend on a single cluster before
/// giving up on the conflict signal.
pub const MAX_PARTITION_TRIALS: usize = 16384;

/// Address pairs drawn for a full scoring pass.
pub const EFFECTIVE_TRIALS: usize = 1024;

/// Failures tolerated before a hypothesis is discarded mid-pass.
pub const TRIAL_FAILURE_SCORE: u32 = 64;

/// Successes required to promote a hypothesis.
pub const TRIAL_SUCCESS_SCORE: u32 = (EFFECTIVE_TRIALS as u32) - TRIAL_FAILURE_SCORE;

/// Address pairs drawn for the cheap pre-filter pass.
pub const PREFILTER_TRIALS: usize = 64;

/// Pre-filter failures that disqualify a hypothesis before full scoring.
// Mirrors the additional filter sequence from "ZenHammer: Rowhammer Attacks
// on AMD Zen-based Platforms" (USENIX Security 2024).
pub const PREFILTER_FAILURE_SCORE: u32 = 4;

/// Smallest XOR function cardinality the hypothesizer emits.
pub const FUNCTION_MIN_BITS: u32 = 1;

/// Largest XOR function cardinality the hypothesizer emits.
pub const FUNCTION_MAX_BITS: u32 = 12;
