//! The candidate address pool.
//!
//! The pool owns every `(vaddr, paddr)` record the engine may probe. It is
//! built either directly from pre-translated records or by expanding mapped
//! huge-page regions into cache-line-granular records, dropping anything
//! that hits the configured bit masks or the platform's PCI/MMIO hole.
//!
//! Mask filtering touches millions of candidate lines and is embarrassingly
//! parallel, so it fans out over scoped worker threads. Everything that
//! *times* memory stays single-threaded elsewhere.

use rand::Rng;
use rand::seq::index;

use crate::config::PlatformProfile;
use crate::error::DiscoveryError;

/// One probe-able cache line: a virtual address the engine may dereference
/// and the physical address it maps to.
///
/// Both addresses are canonicalized to cache-line granularity; `paddr` is
/// never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    pub vaddr: usize,
    pub paddr: u64,
}

/// A contiguous virtual mapping with known physical base, typically one
/// 1 GiB huge page.
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub vaddr: usize,
    pub paddr: u64,
    pub len: usize,
}

/// Read-only set of candidate records for the whole run.
pub struct AddressPool {
    records: Vec<AddressRecord>,
    cacheline_offset: u32,
}

impl AddressPool {
    /// Build a pool from pre-translated records.
    ///
    /// Addresses are rounded down to line granularity. A zero physical
    /// address means the pagemap hid the translation.
    pub fn from_records(
        records: impl IntoIterator<Item = AddressRecord>,
        cacheline_offset: u32,
    ) -> Result<Self, DiscoveryError> {
        let line = 1u64 << cacheline_offset;
        let mut out = Vec::new();
        for r in records {
            if r.paddr == 0 {
                return Err(DiscoveryError::NoPhysicalTranslation { vaddr: r.vaddr });
            }
            out.push(AddressRecord {
                vaddr: r.vaddr & !((line as usize) - 1),
                paddr: r.paddr & !(line - 1),
            });
        }
        if out.is_empty() {
            return Err(DiscoveryError::EmptyPool);
        }
        Ok(Self {
            records: out,
            cacheline_offset,
        })
    }

    /// Expand mapped regions into every cache-line-aligned record whose
    /// physical address clears all `masks` (`paddr & mask == 0`) and falls
    /// outside the profile's PCI hole.
    pub fn from_regions(
        regions: &[MappedRegion],
        masks: &[u64],
        profile: &PlatformProfile,
    ) -> Result<Self, DiscoveryError> {
        let line = profile.cacheline_size() as usize;
        let combined_mask = masks.iter().fold(0u64, |acc, m| acc | m);

        let mut records = Vec::new();
        for region in regions {
            if region.paddr == 0 {
                return Err(DiscoveryError::NoPhysicalTranslation {
                    vaddr: region.vaddr,
                });
            }
            records.extend(filter_region(region, combined_mask, profile, line));
        }

        if records.is_empty() {
            return Err(DiscoveryError::EmptyPool);
        }
        Ok(Self {
            records,
            cacheline_offset: profile.cacheline_offset,
        })
    }

    /// Number of records in the pool.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cacheline_offset(&self) -> u32 {
        self.cacheline_offset
    }

    /// Every record, in expansion order.
    pub fn all_records(&self) -> &[AddressRecord] {
        &self.records
    }

    /// One record drawn uniformly at random.
    pub fn random_record(&self, rng: &mut impl Rng) -> AddressRecord {
        self.records[rng.random_range(0..self.records.len())]
    }

    /// Two distinct records drawn uniformly at random.
    ///
    /// Panics if the pool holds fewer than two records.
    pub fn random_pair(&self, rng: &mut impl Rng) -> (AddressRecord, AddressRecord) {
        assert!(self.records.len() >= 2, "pool too small for pair draws");
        let a = rng.random_range(0..self.records.len());
        let b = loop {
            let b = rng.random_range(0..self.records.len());
            if b != a {
                break b;
            }
        };
        (self.records[a], self.records[b])
    }

    /// `k` distinct records drawn without replacement (all of them if the
    /// pool is smaller).
    pub fn sample_k(&self, rng: &mut impl Rng, k: usize) -> Vec<AddressRecord> {
        let k = k.min(self.records.len());
        index::sample(rng, self.records.len(), k)
            .into_iter()
            .map(|i| self.records[i])
            .collect()
    }
}

/// Data-parallel filter over one region's cache lines.
fn filter_region(
    region: &MappedRegion,
    mask: u64,
    profile: &PlatformProfile,
    line: usize,
) -> Vec<AddressRecord> {
    let num_lines = region.len / line;
    if num_lines == 0 {
        return Vec::new();
    }

    let workers = num_cpus::get().clamp(1, 16);
    let chunk = num_lines.div_ceil(workers);

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for w in 0..workers {
            let start = w * chunk;
            let end = ((w + 1) * chunk).min(num_lines);
            if start >= end {
                break;
            }
            handles.push(scope.spawn(move || {
                let mut local = Vec::new();
                for i in start..end {
                    let offset = i * line;
                    let paddr = region.paddr + offset as u64;
                    if paddr & mask == 0 && !profile.in_pci_hole(paddr) {
                        local.push(AddressRecord {
                            vaddr: region.vaddr + offset,
                            paddr,
                        });
                    }
                }
                local
            }));
        }

        let mut records = Vec::new();
        for h in handles {
            records.extend(h.join().expect("filter worker panicked"));
        }
        records
    })
}
