//! Assembling validated functions into the final mapping artifact.
//!
//! The assembler deduplicates validated hypotheses, keeps only a linearly
//! independent set over GF(2) (the XOR of two real bank functions is itself
//! a "function" that scores perfectly, and must not be double-counted),
//! checks the count against the configured geometry, and assigns each
//! function a role by its highest address bit.

use log::{info, warn};
use serde::Serialize;

use crate::config::{MemoryTopology, PlatformProfile};
use crate::error::DiscoveryError;
use crate::hypothesis::FunctionHypothesis;

/// Half-open range of physical-address bits, `lo..hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BitRange {
    pub lo: u32,
    pub hi: u32,
}

/// The terminal artifact: the recovered address mapping.
///
/// Function bit indices and bit ranges are expressed in physical-address
/// space.
#[derive(Debug, Clone, Serialize)]
pub struct Mapping {
    pub rank: Vec<FunctionHypothesis>,
    pub subchannel: Vec<FunctionHypothesis>,
    pub bank_group: Vec<FunctionHypothesis>,
    pub bank: Vec<FunctionHypothesis>,
    pub row_bits: BitRange,
    pub column_bits: BitRange,
}

impl Mapping {
    /// All selected functions, highest address region first.
    pub fn functions(&self) -> Vec<FunctionHypothesis> {
        self.rank
            .iter()
            .chain(&self.subchannel)
            .chain(&self.bank_group)
            .chain(&self.bank)
            .copied()
            .collect()
    }
}

/// Combines surviving hypotheses into a [`Mapping`].
pub struct MappingAssembler<'a> {
    topology: &'a MemoryTopology,
    profile: &'a PlatformProfile,
}

impl<'a> MappingAssembler<'a> {
    pub fn new(topology: &'a MemoryTopology, profile: &'a PlatformProfile) -> Self {
        Self { topology, profile }
    }

    /// Select the independent function set and assign roles.
    ///
    /// Fails with [`DiscoveryError::MappingIncomplete`] (carrying every
    /// survivor) when the independent count disagrees with the geometry.
    pub fn assemble(
        &self,
        validated: &[FunctionHypothesis],
    ) -> Result<Mapping, DiscoveryError> {
        let selected = independent_set(validated);
        let expected = self.topology.expected_function_count();

        if selected.len() != expected {
            warn!(
                "independent function count {} disagrees with geometry ({} expected)",
                selected.len(),
                expected
            );
            return Err(DiscoveryError::MappingIncomplete {
                expected,
                found: selected.len(),
                survivors: validated.to_vec(),
            });
        }

        // Highest bit position approximates which address region a function
        // partitions: rank above subchannel above bank group above bank.
        let mut ordered = selected;
        ordered.sort_by(|a, b| {
            b.highest_bit()
                .cmp(&a.highest_bit())
                .then(b.mask().cmp(&a.mask()))
        });

        let g = &self.topology.geometry;
        let mut cursor = ordered.into_iter();
        let mut take = |n: u32| -> Vec<FunctionHypothesis> { cursor.by_ref().take(n as usize).collect() };

        let mapping = Mapping {
            rank: take(g.num_rank_bits),
            subchannel: take(g.num_subchannel_bits),
            bank_group: take(g.num_bank_group_bits),
            bank: take(g.num_bank_address_bits),
            row_bits: BitRange {
                lo: g.row_bit_base(),
                hi: g.address_bits(),
            },
            column_bits: BitRange {
                lo: self.profile.cacheline_offset,
                hi: self.profile.cacheline_offset + g.num_column_bits,
            },
        };

        info!(
            "assembled mapping for {}: {} functions over {} banks",
            g,
            expected,
            self.topology.num_banks()
        );
        Ok(mapping)
    }
}

/// Greedy GF(2) basis selection, simplest functions first.
///
/// Duplicates reduce to zero against the basis and drop out, as does any
/// hypothesis equal to the XOR of already-selected ones.
fn independent_set(validated: &[FunctionHypothesis]) -> Vec<FunctionHypothesis> {
    let mut candidates: Vec<FunctionHypothesis> = validated.to_vec();
    candidates.sort_by_key(|f| (f.num_bits(), f.mask()));
    candidates.dedup_by_key(|f| f.mask());

    let mut basis: Vec<u64> = Vec::new();
    let mut selected = Vec::new();

    for candidate in candidates {
        let mut v = candidate.mask();
        for &b in &basis {
            v = v.min(v ^ b);
        }
        if v != 0 {
            basis.push(v);
            selected.push(candidate);
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DdrType, DramGeometry, GB};

    fn ddr4_topology() -> MemoryTopology {
        MemoryTopology::single_channel(
            DramGeometry::resolve(DdrType::Ddr4, 32 * GB, 2, 8).unwrap(),
        )
    }

    fn ddr5_topology() -> MemoryTopology {
        MemoryTopology::single_channel(
            DramGeometry::resolve(DdrType::Ddr5, 32 * GB, 2, 8).unwrap(),
        )
    }

    fn profile() -> PlatformProfile {
        PlatformProfile::lookup("intel-core-12th-ddr4").unwrap()
    }

    #[test]
    fn xor_combinations_are_dropped() {
        let a = FunctionHypothesis::from_bits(&[13]);
        let b = FunctionHypothesis::from_bits(&[17]);
        let combo = FunctionHypothesis::from_bits(&[13, 17]);

        let set = independent_set(&[a, b, combo]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
        assert!(set.contains(&b));
    }

    #[test]
    fn duplicates_are_dropped() {
        let a = FunctionHypothesis::from_bits(&[13, 17]);
        let set = independent_set(&[a, a, a]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn count_mismatch_is_mapping_incomplete() {
        // DDR5 2Rx8 32GB needs 7 functions (1 rank + 1 subchannel + 3 bank
        // group + 2 bank); hand it 6.
        let topo = ddr5_topology();
        let profile = profile();
        let assembler = MappingAssembler::new(&topo, &profile);

        let survivors: Vec<FunctionHypothesis> = (0..6)
            .map(|i| FunctionHypothesis::from_bits(&[6 + i, 20 + i]))
            .collect();

        let err = assembler.assemble(&survivors).unwrap_err();
        match err {
            DiscoveryError::MappingIncomplete {
                expected,
                found,
                survivors: s,
            } => {
                assert_eq!(expected, 7);
                assert_eq!(found, 6);
                assert_eq!(s.len(), 6);
            }
            other => panic!("expected MappingIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn dependent_survivors_fall_short() {
        // Five distinct masks but only four independent: the last is the XOR
        // of the first two.
        let topo = ddr4_topology(); // expects 5
        let profile = profile();
        let assembler = MappingAssembler::new(&topo, &profile);

        let mut survivors: Vec<FunctionHypothesis> = (0..4)
            .map(|i| FunctionHypothesis::from_bits(&[6 + i, 20 + i]))
            .collect();
        survivors.push(FunctionHypothesis::from_bits(&[6, 7, 20, 21]));

        let err = assembler.assemble(&survivors).unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::MappingIncomplete {
                expected: 5,
                found: 4,
                ..
            }
        ));
    }

    #[test]
    fn roles_follow_highest_bit_order() {
        // DDR4 2Rx8 32GB: 1 rank + 0 subchannel + 2 bank group + 2 bank.
        let topo = ddr4_topology();
        assert_eq!(topo.expected_function_count(), 5);

        let profile = profile();
        let assembler = MappingAssembler::new(&topo, &profile);

        let rank_f = FunctionHypothesis::from_bits(&[16, 34]); // top bit 34
        let bg1 = FunctionHypothesis::from_bits(&[13, 19]);
        let bg2 = FunctionHypothesis::from_bits(&[14, 20]);
        let bk1 = FunctionHypothesis::from_bits(&[6, 15]);
        let bk2 = FunctionHypothesis::from_bits(&[7, 16]);

        let mapping = assembler.assemble(&[bk1, bg1, rank_f, bk2, bg2]).unwrap();

        assert_eq!(mapping.rank, vec![rank_f]);
        assert!(mapping.subchannel.is_empty());
        assert_eq!(mapping.bank_group, vec![bg2, bg1]);
        assert_eq!(mapping.bank, vec![bk2, bk1]);

        assert_eq!(mapping.row_bits, BitRange { lo: 18, hi: 35 });
        assert_eq!(mapping.column_bits, BitRange { lo: 6, hi: 13 });
        assert_eq!(mapping.functions().len(), 5);
    }

    #[test]
    fn mapping_serializes_to_bit_lists() {
        let topo = ddr4_topology();
        let profile = profile();
        let assembler = MappingAssembler::new(&topo, &profile);

        let fns = [
            FunctionHypothesis::from_bits(&[16, 34]),
            FunctionHypothesis::from_bits(&[13, 19]),
            FunctionHypothesis::from_bits(&[14, 20]),
            FunctionHypothesis::from_bits(&[6, 15]),
            FunctionHypothesis::from_bits(&[7, 16]),
        ];
        let mapping = assembler.assemble(&fns).unwrap();
        let json = serde_json::to_value(&mapping).unwrap();

        assert_eq!(json["rank"][0], serde_json::json!([16, 34]));
        assert_eq!(json["row_bits"]["lo"], 18);
        assert_eq!(json["column_bits"]["hi"], 13);
    }
}
