//! Candidate XOR mapping functions and their enumeration.
//!
//! A memory controller's bank-selection functions are linear over GF(2): a
//! bank bit is the XOR of some subset of physical-address bits. A
//! [`FunctionHypothesis`] is one such subset; the [`HypothesisEnumerator`]
//! walks every candidate subset in increasing cardinality, lexicographic by
//! bit index within a cardinality, each exactly once.

use std::fmt;

use serde::ser::{Serialize, SerializeSeq, Serializer};

/// A non-empty set of physical-address bit positions defining the function
/// `f(p) = XOR of bit_b(p) over all b in the set`.
///
/// Stored as a bit mask over the 64-bit physical address. Serializes as the
/// sorted list of bit indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionHypothesis {
    mask: u64,
}

impl FunctionHypothesis {
    /// Build from a raw address-bit mask. Must be non-empty.
    pub fn from_mask(mask: u64) -> Self {
        assert!(mask != 0, "a mapping function needs at least one bit");
        Self { mask }
    }

    /// Build from explicit bit positions.
    pub fn from_bits(bits: &[u32]) -> Self {
        let mask = bits.iter().fold(0u64, |acc, &b| acc | (1u64 << b));
        Self::from_mask(mask)
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Sorted bit positions.
    pub fn bits(&self) -> Vec<u32> {
        (0..64).filter(|b| self.mask >> b & 1 == 1).collect()
    }

    pub fn num_bits(&self) -> u32 {
        self.mask.count_ones()
    }

    pub fn highest_bit(&self) -> u32 {
        63 - self.mask.leading_zeros()
    }

    pub fn lowest_bit(&self) -> u32 {
        self.mask.trailing_zeros()
    }

    /// GF(2) evaluation: parity of the selected address bits.
    pub fn evaluate(&self, paddr: u64) -> bool {
        (paddr & self.mask).count_ones() & 1 == 1
    }

    /// Do two addresses fall on the same side of the partition?
    pub fn agrees(&self, a: u64, b: u64) -> bool {
        self.evaluate(a) == self.evaluate(b)
    }
}

impl fmt::Display for FunctionHypothesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.bits();
        let mut first = true;
        for b in bits {
            if !first {
                write!(f, "^")?;
            }
            write!(f, "b{b}")?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for FunctionHypothesis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bits = self.bits();
        let mut seq = serializer.serialize_seq(Some(bits.len()))?;
        for b in bits {
            seq.serialize_element(&b)?;
        }
        seq.end()
    }
}

/// Restartable producer of candidate functions.
///
/// Candidate bit positions span `[cacheline_offset, address_bits)`. Subsets
/// whose bits sit entirely at or above the row-bit base are skipped: a
/// function that only reads row bits cannot partition banks. Consumers may
/// stop the iterator early once enough functions are confirmed.
pub struct HypothesisEnumerator {
    candidate_bits: Vec<u32>,
    row_bit_base: u32,
    max_bits: usize,
    k: usize,
    indices: Vec<usize>,
    fresh_k: bool,
    exhausted: bool,
}

impl HypothesisEnumerator {
    pub fn new(
        cacheline_offset: u32,
        address_bits: u32,
        row_bit_base: u32,
        min_bits: u32,
        max_bits: u32,
    ) -> Self {
        let candidate_bits: Vec<u32> = (cacheline_offset..address_bits).collect();
        let max_bits = (max_bits as usize).min(candidate_bits.len());
        let min_bits = (min_bits as usize).max(1);
        Self {
            candidate_bits,
            row_bit_base,
            max_bits,
            k: min_bits,
            indices: Vec::new(),
            fresh_k: true,
            exhausted: false,
        }
    }

    /// Advance `indices` to the next k-combination in lexicographic order.
    /// Returns false when the current cardinality is exhausted.
    fn next_combination(&mut self) -> bool {
        let n = self.candidate_bits.len();
        let k = self.k;

        if self.fresh_k {
            self.fresh_k = false;
            self.indices = (0..k).collect();
            return k <= n;
        }

        let mut i = k;
        loop {
            if i == 0 {
                return false;
            }
            i -= 1;
            if self.indices[i] < n - (k - i) {
                break;
            }
        }
        self.indices[i] += 1;
        for j in i + 1..k {
            self.indices[j] = self.indices[j - 1] + 1;
        }
        true
    }
}

impl Iterator for HypothesisEnumerator {
    type Item = FunctionHypothesis;

    fn next(&mut self) -> Option<FunctionHypothesis> {
        while !self.exhausted {
            if !self.next_combination() {
                if self.k >= self.max_bits {
                    self.exhausted = true;
                    break;
                }
                self.k += 1;
                self.fresh_k = true;
                continue;
            }

            // Lowest selected bit at/above the row base ⇒ the whole set is.
            if self.candidate_bits[self.indices[0]] >= self.row_bit_base {
                continue;
            }

            let bits: Vec<u32> = self.indices.iter().map(|&i| self.candidate_bits[i]).collect();
            return Some(FunctionHypothesis::from_bits(&bits));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn evaluation_is_bit_parity() {
        let f = FunctionHypothesis::from_bits(&[13, 17]);
        assert_eq!(f.mask(), (1 << 13) | (1 << 17));
        assert!(f.evaluate(1 << 13));
        assert!(f.evaluate(1 << 17));
        assert!(!f.evaluate((1 << 13) | (1 << 17)));
        assert!(!f.evaluate(0));
        assert!(f.agrees(1 << 13, 1 << 17));
        assert!(!f.agrees(0, 1 << 13));
    }

    #[test]
    fn bit_accessors() {
        let f = FunctionHypothesis::from_bits(&[6, 13, 17]);
        assert_eq!(f.bits(), vec![6, 13, 17]);
        assert_eq!(f.num_bits(), 3);
        assert_eq!(f.lowest_bit(), 6);
        assert_eq!(f.highest_bit(), 17);
        assert_eq!(f.to_string(), "b6^b13^b17");
    }

    #[test]
    fn serializes_as_bit_list() {
        let f = FunctionHypothesis::from_bits(&[13, 17]);
        assert_eq!(serde_json::to_string(&f).unwrap(), "[13,17]");
    }

    #[test]
    fn enumerates_each_subset_exactly_once() {
        // Bits 2..8, cardinality 1..=3, no row pruning.
        let all: Vec<_> = HypothesisEnumerator::new(2, 8, 8, 1, 3).collect();
        let expected = 6 + 15 + 20; // C(6,1)+C(6,2)+C(6,3)
        assert_eq!(all.len(), expected);

        let unique: HashSet<u64> = all.iter().map(|f| f.mask()).collect();
        assert_eq!(unique.len(), expected);
    }

    #[test]
    fn order_is_cardinality_then_lexicographic() {
        let all: Vec<_> = HypothesisEnumerator::new(2, 6, 6, 1, 2).collect();
        let bit_lists: Vec<Vec<u32>> = all.iter().map(|f| f.bits()).collect();
        assert_eq!(
            bit_lists,
            vec![
                vec![2],
                vec![3],
                vec![4],
                vec![5],
                vec![2, 3],
                vec![2, 4],
                vec![2, 5],
                vec![3, 4],
                vec![3, 5],
                vec![4, 5],
            ]
        );
    }

    #[test]
    fn row_only_subsets_are_pruned() {
        // Bits 2..8 with the row region starting at 6: {6}, {7}, {6,7} gone.
        let all: Vec<_> = HypothesisEnumerator::new(2, 8, 6, 1, 2).collect();
        for f in &all {
            assert!(f.lowest_bit() < 6, "row-only subset {f} not pruned");
        }
        // C(6,1)+C(6,2) minus the three row-only subsets.
        assert_eq!(all.len(), 6 + 15 - 3);
    }

    #[test]
    fn respects_cardinality_bounds() {
        let all: Vec<_> = HypothesisEnumerator::new(2, 10, 10, 2, 3).collect();
        assert!(all.iter().all(|f| (2..=3).contains(&f.num_bits())));
    }

    #[test]
    fn max_bits_clamped_to_candidate_width() {
        // Only 3 candidate bits but max cardinality 12.
        let all: Vec<_> = HypothesisEnumerator::new(2, 5, 5, 1, 12).collect();
        assert_eq!(all.len(), 7); // every non-empty subset of 3 bits
    }
}
