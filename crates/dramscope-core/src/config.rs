//! Runtime configuration: platform timing profiles and DRAM geometry.
//!
//! The timing bounds that drive every oracle decision are per-CPU and
//! per-DDR-generation. They are selected at runtime from a registry keyed by
//! a CPU/DDR identifier and passed through the pipeline as an immutable
//! value; nothing here is baked in at compile time.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::DiscoveryError;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

// ---------------------------------------------------------------------------
// Platform timing profile
// ---------------------------------------------------------------------------

/// Immutable per-platform timing constants, in TSC cycles or physical-address
/// bit positions.
///
/// `sbdr_lower..=sbdr_upper` is the row-buffer-conflict latency band for a
/// paired uncached load; `refresh_lower..=refresh_upper` brackets the
/// expected inter-refresh interval (tREFI); `regular_refresh_fraction` is the
/// share of measured intervals that must fall inside that bracket for a
/// refresh signature to count as regular.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlatformProfile {
    /// Lowest combined latency still counted as a row-buffer conflict.
    pub sbdr_lower: u64,
    /// Highest combined latency still counted as a row-buffer conflict.
    pub sbdr_upper: u64,
    /// Lower bound of a plausible inter-refresh interval.
    pub refresh_lower: u64,
    /// Upper bound of a plausible inter-refresh interval.
    pub refresh_upper: u64,
    /// Fraction of intervals that must land inside the refresh window.
    pub regular_refresh_fraction: f64,
    /// Latency at/above which a non-conflict pair is likely a same-bank-group
    /// neighbour. Diagnostic band edge only.
    pub bank_group_threshold: u64,
    /// Start of the PCI/MMIO hole excluded from the address pool.
    pub pci_lower: u64,
    /// End (exclusive) of the PCI/MMIO hole.
    pub pci_upper: u64,
    /// log2 of the cache-line size; address bits below this are meaningless
    /// to the mapping.
    pub cacheline_offset: u32,
}

/// A registry entry: CPU/DDR identifier plus its profile.
struct ProfileEntry {
    key: &'static str,
    profile: PlatformProfile,
}

// Starting points measured on the named parts. The conflict and refresh
// bands are TSC-frequency dependent; recalibrate when the signal is weak.
static PROFILE_REGISTRY: &[ProfileEntry] = &[
    ProfileEntry {
        key: "intel-core-12th-ddr4",
        profile: PlatformProfile {
            sbdr_lower: 420,
            sbdr_upper: 600,
            refresh_lower: 22_800,
            refresh_upper: 25_600,
            regular_refresh_fraction: 0.7,
            bank_group_threshold: 380,
            pci_lower: 0,
            pci_upper: 0,
            cacheline_offset: 6,
        },
    },
    ProfileEntry {
        key: "intel-core-12th-ddr5",
        profile: PlatformProfile {
            sbdr_lower: 460,
            sbdr_upper: 660,
            refresh_lower: 11_200,
            refresh_upper: 13_200,
            regular_refresh_fraction: 0.7,
            bank_group_threshold: 410,
            pci_lower: 0,
            pci_upper: 0,
            cacheline_offset: 6,
        },
    },
    ProfileEntry {
        key: "intel-core-14th-ddr5",
        profile: PlatformProfile {
            sbdr_lower: 480,
            sbdr_upper: 700,
            refresh_lower: 12_400,
            refresh_upper: 14_600,
            regular_refresh_fraction: 0.7,
            bank_group_threshold: 430,
            pci_lower: 0,
            pci_upper: 0,
            cacheline_offset: 6,
        },
    },
    ProfileEntry {
        key: "amd-zen4-ddr5",
        profile: PlatformProfile {
            sbdr_lower: 560,
            sbdr_upper: 780,
            refresh_lower: 31_000,
            refresh_upper: 36_500,
            regular_refresh_fraction: 0.65,
            bank_group_threshold: 500,
            // Low-DRAM MMIO hole below 4 GiB on Zen platforms.
            pci_lower: 0xC000_0000,
            pci_upper: 0x1_0000_0000,
            cacheline_offset: 6,
        },
    },
    ProfileEntry {
        key: "intel-skylake-ddr4",
        profile: PlatformProfile {
            sbdr_lower: 340,
            sbdr_upper: 500,
            refresh_lower: 19_800,
            refresh_upper: 22_400,
            regular_refresh_fraction: 0.7,
            bank_group_threshold: 300,
            pci_lower: 0,
            pci_upper: 0,
            cacheline_offset: 6,
        },
    },
    ProfileEntry {
        key: "intel-spr-ddr5",
        profile: PlatformProfile {
            sbdr_lower: 520,
            sbdr_upper: 760,
            refresh_lower: 14_200,
            refresh_upper: 16_800,
            regular_refresh_fraction: 0.65,
            bank_group_threshold: 470,
            pci_lower: 0,
            pci_upper: 0,
            cacheline_offset: 6,
        },
    },
];

impl PlatformProfile {
    /// Look up a profile by its CPU/DDR identifier.
    pub fn lookup(key: &str) -> Result<PlatformProfile, DiscoveryError> {
        PROFILE_REGISTRY
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.profile)
            .ok_or_else(|| DiscoveryError::UnknownProfile(key.to_string()))
    }

    /// All registered profile identifiers.
    pub fn known_keys() -> Vec<&'static str> {
        PROFILE_REGISTRY.iter().map(|e| e.key).collect()
    }

    /// Cache-line size in bytes.
    pub fn cacheline_size(&self) -> u64 {
        1 << self.cacheline_offset
    }

    /// Whether `paddr` falls inside the excluded PCI/MMIO hole.
    pub fn in_pci_hole(&self, paddr: u64) -> bool {
        self.pci_lower < self.pci_upper && (self.pci_lower..self.pci_upper).contains(&paddr)
    }
}

// ---------------------------------------------------------------------------
// DRAM geometry
// ---------------------------------------------------------------------------

/// DDR generation of the installed modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DdrType {
    Ddr4,
    Ddr5,
}

impl fmt::Display for DdrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ddr4 => write!(f, "DDR4"),
            Self::Ddr5 => write!(f, "DDR5"),
        }
    }
}

impl FromStr for DdrType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ddr4" => Ok(Self::Ddr4),
            "ddr5" => Ok(Self::Ddr5),
            other => Err(format!("unknown DDR type `{other}` (expected ddr4 or ddr5)")),
        }
    }
}

/// One row of the per-chip organization table.
struct ChipEntry {
    ddr: DdrType,
    chip_size: u64,
    dq: u16,
    bank_group_bits: u32,
    bank_address_bits: u32,
    row_bits: u32,
    column_bits: u32,
    burst_length: u32,
}

// {ddr, chip_size, dq, bg, ba, row, column, burst_length}
static CHIP_TABLE: &[ChipEntry] = &[
    // 16GB DDR4 2Rx8
    ChipEntry { ddr: DdrType::Ddr4, chip_size: 8 * GB, dq: 8, bank_group_bits: 2, bank_address_bits: 2, row_bits: 16, column_bits: 10, burst_length: 8 },
    // 32GB DDR4 2Rx8
    ChipEntry { ddr: DdrType::Ddr4, chip_size: 16 * GB, dq: 8, bank_group_bits: 2, bank_address_bits: 2, row_bits: 17, column_bits: 10, burst_length: 8 },
    // 32GB DDR4 1Rx4
    ChipEntry { ddr: DdrType::Ddr4, chip_size: 8 * GB, dq: 4, bank_group_bits: 2, bank_address_bits: 2, row_bits: 17, column_bits: 10, burst_length: 8 },
    // 32GB DDR5 2Rx8
    ChipEntry { ddr: DdrType::Ddr5, chip_size: 16 * GB, dq: 8, bank_group_bits: 3, bank_address_bits: 2, row_bits: 16, column_bits: 10, burst_length: 16 },
    // 32GB DDR5 1Rx4
    ChipEntry { ddr: DdrType::Ddr5, chip_size: 16 * GB, dq: 4, bank_group_bits: 3, bank_address_bits: 2, row_bits: 16, column_bits: 11, burst_length: 16 },
];

/// Resolved organization of one DRAM module.
///
/// The lowest `log2(burst_length)` column bits are implicit in the burst and
/// already removed from `num_column_bits`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DramGeometry {
    pub ddr: DdrType,
    pub module_size: u64,
    pub num_ranks: u16,
    pub dq: u16,
    pub chip_size: u64,
    pub num_rank_bits: u32,
    pub num_subchannel_bits: u32,
    pub num_bank_group_bits: u32,
    pub num_bank_address_bits: u32,
    pub num_row_bits: u32,
    pub num_column_bits: u32,
}

impl DramGeometry {
    /// Derive the chip organization from module-level parameters.
    ///
    /// `chip_size = module_size / (ranks * 64 / dq) * 8`, then the table is
    /// consulted keyed by `(ddr, chip_size, dq)`.
    pub fn resolve(
        ddr: DdrType,
        module_size: u64,
        num_ranks: u16,
        dq: u16,
    ) -> Result<Self, DiscoveryError> {
        let chips_per_rank = 64 / dq as u64;
        let chip_size = module_size / (num_ranks as u64 * chips_per_rank) * 8;

        let entry = CHIP_TABLE
            .iter()
            .find(|e| e.ddr == ddr && e.chip_size == chip_size && e.dq == dq)
            .ok_or_else(|| DiscoveryError::UnknownGeometry {
                ddr: ddr.to_string(),
                chip_size,
                dq,
            })?;

        Ok(Self {
            ddr,
            module_size,
            num_ranks,
            dq,
            chip_size,
            num_rank_bits: (num_ranks as u32).ilog2(),
            num_subchannel_bits: match ddr {
                DdrType::Ddr4 => 0,
                DdrType::Ddr5 => 1,
            },
            num_bank_group_bits: entry.bank_group_bits,
            num_bank_address_bits: entry.bank_address_bits,
            num_row_bits: entry.row_bits,
            num_column_bits: entry.column_bits - entry.burst_length.ilog2(),
        })
    }

    /// Meaningful physical-address width of one module.
    pub fn address_bits(&self) -> u32 {
        self.module_size.ilog2()
    }

    /// Lowest physical-address bit belonging to the row index.
    pub fn row_bit_base(&self) -> u32 {
        self.address_bits() - self.num_row_bits
    }
}

impl fmt::Display for DramGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}Rx{},{}GB",
            self.ddr,
            self.num_ranks,
            self.dq,
            self.module_size / GB
        )
    }
}

// ---------------------------------------------------------------------------
// Memory system topology
// ---------------------------------------------------------------------------

/// Controller-level layout above a single module.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryTopology {
    pub num_mcs: u32,
    pub num_channels_per_mc: u32,
    pub num_dimms_per_channel: u32,
    pub geometry: DramGeometry,
}

impl MemoryTopology {
    /// Single controller, single channel, single DIMM.
    pub fn single_channel(geometry: DramGeometry) -> Self {
        Self {
            num_mcs: 1,
            num_channels_per_mc: 1,
            num_dimms_per_channel: 1,
            geometry,
        }
    }

    /// Total rank count across all DIMMs.
    pub fn num_ranks(&self) -> u64 {
        self.num_mcs as u64
            * self.num_channels_per_mc as u64
            * self.num_dimms_per_channel as u64
            * self.geometry.num_ranks as u64
    }

    /// Banks addressable inside one rank.
    pub fn banks_per_rank(&self) -> u64 {
        1 << (self.geometry.num_subchannel_bits
            + self.geometry.num_bank_group_bits
            + self.geometry.num_bank_address_bits)
    }

    /// Total bank count the mapping must partition.
    pub fn num_banks(&self) -> u64 {
        self.num_ranks() * self.banks_per_rank()
    }

    /// XOR functions the assembler must select: one per rank, subchannel,
    /// bank-group and bank-address bit.
    pub fn expected_function_count(&self) -> usize {
        (self.geometry.num_rank_bits
            + self.geometry.num_subchannel_bits
            + self.geometry.num_bank_group_bits
            + self.geometry.num_bank_address_bits) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_profile() {
        let p = PlatformProfile::lookup("intel-core-12th-ddr4").unwrap();
        assert!(p.sbdr_lower < p.sbdr_upper);
        assert!(p.refresh_lower < p.refresh_upper);
        assert_eq!(p.cacheline_size(), 64);
    }

    #[test]
    fn lookup_unknown_profile_is_typed_error() {
        let err = PlatformProfile::lookup("pentium-133-edo").unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownProfile(_)));
    }

    #[test]
    fn registry_lists_all_keys() {
        let keys = PlatformProfile::known_keys();
        assert_eq!(keys.len(), 6);
        assert!(keys.contains(&"amd-zen4-ddr5"));
    }

    #[test]
    fn pci_hole_membership() {
        let p = PlatformProfile::lookup("amd-zen4-ddr5").unwrap();
        assert!(p.in_pci_hole(0xC000_0000));
        assert!(p.in_pci_hole(0xFFFF_FFFF));
        assert!(!p.in_pci_hole(0x1_0000_0000));
        assert!(!p.in_pci_hole(0x1000));

        let intel = PlatformProfile::lookup("intel-skylake-ddr4").unwrap();
        // Empty hole excludes nothing.
        assert!(!intel.in_pci_hole(0));
        assert!(!intel.in_pci_hole(0xC000_0000));
    }

    #[test]
    fn resolve_ddr4_2rx8_32gb() {
        let g = DramGeometry::resolve(DdrType::Ddr4, 32 * GB, 2, 8).unwrap();
        assert_eq!(g.chip_size, 16 * GB);
        assert_eq!(g.num_rank_bits, 1);
        assert_eq!(g.num_subchannel_bits, 0);
        assert_eq!(g.num_bank_group_bits, 2);
        assert_eq!(g.num_bank_address_bits, 2);
        assert_eq!(g.num_row_bits, 17);
        // 10 column bits minus log2(burst 8).
        assert_eq!(g.num_column_bits, 7);
        assert_eq!(g.to_string(), "DDR4,2Rx8,32GB");
    }

    #[test]
    fn resolve_ddr5_2rx8_32gb() {
        let g = DramGeometry::resolve(DdrType::Ddr5, 32 * GB, 2, 8).unwrap();
        assert_eq!(g.chip_size, 16 * GB);
        assert_eq!(g.num_subchannel_bits, 1);
        assert_eq!(g.num_bank_group_bits, 3);
        assert_eq!(g.num_bank_address_bits, 2);
        // 10 column bits minus log2(burst 16).
        assert_eq!(g.num_column_bits, 6);

        let topo = MemoryTopology::single_channel(g);
        assert_eq!(topo.expected_function_count(), 7);
        assert_eq!(topo.num_ranks(), 2);
        assert_eq!(topo.banks_per_rank(), 64);
    }

    #[test]
    fn resolve_unknown_organization_is_typed_error() {
        // 64GB 1Rx8 would need a 64GB chip; no such table entry.
        let err = DramGeometry::resolve(DdrType::Ddr4, 64 * GB, 1, 8).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownGeometry { .. }));
    }

    #[test]
    fn address_and_row_bit_derivation() {
        let g = DramGeometry::resolve(DdrType::Ddr4, 32 * GB, 2, 8).unwrap();
        assert_eq!(g.address_bits(), 35);
        assert_eq!(g.row_bit_base(), 18);
    }
}
