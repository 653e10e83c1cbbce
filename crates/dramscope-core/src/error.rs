//! Typed failures surfaced by the discovery engine.
//!
//! The engine never terminates the host process; every abort path in the
//! pipeline is a [`DiscoveryError`] value returned to the caller, who may
//! retune thresholds and re-invoke.

use thiserror::Error;

use crate::hypothesis::FunctionHypothesis;

/// Everything that can go wrong between huge-page acquisition and the final
/// mapping artifact.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The pagemap lookup yielded zero. Usually the process lacks
    /// `CAP_SYS_ADMIN` and the kernel hid the PFN.
    #[error("pagemap returned no physical translation for 0x{vaddr:x} (missing CAP_SYS_ADMIN?)")]
    NoPhysicalTranslation { vaddr: usize },

    /// Huge-page `mmap` failed. 1 GiB pages must be reserved at boot.
    #[error("huge-page allocation failed: {reason}")]
    AllocationFailure { reason: String },

    /// Clustering could not fill a same-bank set within the trial budget.
    /// The platform profile's conflict-latency bounds are likely wrong.
    #[error(
        "insufficient conflict signal: cluster reached {got} of {needed} records \
         within the trial budget"
    )]
    InsufficientConflictSignal { got: usize, needed: usize },

    /// A histogram was requested or consumed with a column count the sampler
    /// does not produce.
    #[error("unsupported histogram width {0} (expected 2 or 3 columns)")]
    UnsupportedHistogramWidth(usize),

    /// Fewer than two refresh events were detected; no interval can be
    /// formed. The refresh-cycle thresholds are likely wrong.
    #[error("fewer than two refresh events detected; cannot compute intervals")]
    EmptyIntervalSample,

    /// The surviving hypothesis count disagrees with the configured DRAM
    /// geometry. All survivors are carried for diagnostics.
    #[error("mapping incomplete: expected {expected} independent functions, found {found}")]
    MappingIncomplete {
        expected: usize,
        found: usize,
        survivors: Vec<FunctionHypothesis>,
    },

    /// No platform profile is registered under the requested identifier.
    #[error("unknown platform profile `{0}`")]
    UnknownProfile(String),

    /// No chip entry matches the requested DRAM organization.
    #[error("no DRAM table entry for {ddr} chip_size={chip_size} dq={dq}")]
    UnknownGeometry {
        ddr: String,
        chip_size: u64,
        dq: u16,
    },

    /// The address pool has no records after filtering.
    #[error("address pool is empty after filtering")]
    EmptyPool,

    /// The cooperative cancellation flag was raised between probes.
    #[error("discovery cancelled")]
    Cancelled,
}
