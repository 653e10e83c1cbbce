//! # dramscope-core
//!
//! **Your memory controller is hiding a hash function.**
//!
//! `dramscope-core` reverse-engineers the DRAM address mapping of a commodity
//! memory controller from userspace: the XOR-over-physical-address-bit
//! functions that pick a channel, rank, bank group and bank for every cache
//! line. Two timing side channels drive the search — the row-buffer-conflict
//! latency band decides whether two addresses share a bank, and the periodic
//! refresh heartbeat (tREFI) cross-validates every surviving candidate.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dramscope_core::{
//!     AddressPool, DiscoveryEngine, DramGeometry, DdrType, EngineConfig,
//!     HugePageRegion, MemoryTopology, PlatformProfile, TimingConflictOracle,
//!     TimingRefreshValidator, TscTimer, GB,
//! };
//!
//! # fn main() -> Result<(), dramscope_core::DiscoveryError> {
//! let profile = PlatformProfile::lookup("intel-core-12th-ddr4")?;
//! let geometry = DramGeometry::resolve(DdrType::Ddr4, 32 * GB, 2, 8)?;
//!
//! let region = HugePageRegion::allocate(4)?;
//! let pool = AddressPool::from_regions(&region.mapped_regions()?, &[], &profile)?;
//!
//! let timer = TscTimer::new();
//! let oracle = TimingConflictOracle::new(&timer, profile);
//! let refresh = TimingRefreshValidator::new(&timer, profile);
//!
//! let engine = DiscoveryEngine::new(
//!     &pool,
//!     &oracle,
//!     &refresh,
//!     MemoryTopology::single_channel(geometry),
//!     profile,
//!     EngineConfig::default(),
//! );
//! let report = engine.run()?;
//! println!("{}", serde_json::to_string_pretty(&report.mapping).unwrap());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Pool → Partitioner → Hypothesizer → Scorer → Refresh validator → Assembler
//!
//! - The [`AddressPool`] owns every probe-able `(vaddr, paddr)` record,
//!   expanded from 1 GiB huge pages with mask and PCI-hole filtering.
//! - The [`TimingConflictOracle`] answers "same bank?" from paired-load
//!   latency medians against the selected [`PlatformProfile`] band.
//! - The [`HypothesisEnumerator`] walks XOR candidate functions in
//!   increasing size; the [`Scorer`] checks each against 1024 timed pairs
//!   with an early pre-filter and failure short-circuit.
//! - The [`TimingRefreshValidator`] rejects candidates whose inter-refresh
//!   interval signature is irregular or off-bracket.
//! - The [`MappingAssembler`] selects a linearly independent function set
//!   matching the configured [`DramGeometry`] and emits the [`Mapping`].
//!
//! All timing flows through the [`MemoryTimer`] trait and all bank decisions
//! through the [`ConflictOracle`]/[`RefreshCheck`] traits, so every layer
//! above the hardware runs deterministically under test stubs.

pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod histogram;
pub mod hugepage;
pub mod hypothesis;
pub mod mapping;
pub mod oracle;
pub mod partition;
pub mod pool;
pub mod refresh;
pub mod scorer;
pub mod timing;

pub use config::{DdrType, DramGeometry, GB, KB, MB, MemoryTopology, PlatformProfile};
pub use diagnostics::{Diagnostics, HypothesisTrace, TraceVerdict};
pub use engine::{
    CalibrationReport, CancelToken, DiscoveryEngine, EngineConfig, MappingReport, calibrate,
};
pub use error::DiscoveryError;
pub use histogram::{LatencyStats, SampleSet, Sampler};
#[cfg(target_os = "linux")]
pub use hugepage::{HUGE_PAGE_SIZE, HugePageRegion, physical_address};
pub use hypothesis::{FunctionHypothesis, HypothesisEnumerator};
pub use mapping::{BitRange, Mapping, MappingAssembler};
pub use oracle::{ConflictOracle, TimingConflictOracle, Verdict};
pub use partition::{BankCluster, Partitioner};
pub use pool::{AddressPool, AddressRecord, MappedRegion};
pub use refresh::{
    RefreshCheck, RefreshProbe, RefreshSignature, TimingRefreshValidator, refresh_intervals,
    refresh_timestamps,
};
pub use scorer::{FunctionScore, Scorer};
pub use timing::{FallbackTimer, MemoryTimer, pin_to_cpu, quiesce_cpu_frequency};
#[cfg(target_arch = "x86_64")]
pub use timing::TscTimer;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
