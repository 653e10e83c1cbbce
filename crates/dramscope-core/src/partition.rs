//! Clustering the address pool into presumed same-bank sets.
//!
//! A cluster grows from a random pivot: candidates that the conflict oracle
//! places in the pivot's bank join the set. Each subsequent cluster's pivot
//! must answer `Different` against one representative of every existing
//! cluster, keeping clusters disjoint by construction.

use std::collections::HashSet;

use log::{debug, info};
use rand::Rng;

use crate::constants::{MAX_PARTITION_TRIALS, MIN_CLUSTER_SIZE};
use crate::error::DiscoveryError;
use crate::oracle::{ConflictOracle, Verdict};
use crate::pool::{AddressPool, AddressRecord};

/// A set of records presumed to share one DRAM bank.
///
/// Invariant: at decision time, every member answered `Same` against the
/// cluster pivot (its first record).
#[derive(Debug, Clone)]
pub struct BankCluster {
    records: Vec<AddressRecord>,
}

impl BankCluster {
    fn new(pivot: AddressRecord) -> Self {
        Self {
            records: vec![pivot],
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[AddressRecord] {
        &self.records
    }

    /// The pivot the cluster grew from.
    pub fn representative(&self) -> &AddressRecord {
        &self.records[0]
    }
}

/// Builds same-bank clusters from the pool through the oracle.
pub struct Partitioner<'a, O: ConflictOracle + ?Sized> {
    pool: &'a AddressPool,
    oracle: &'a O,
    min_cluster_size: usize,
    max_trials: usize,
}

impl<'a, O: ConflictOracle + ?Sized> Partitioner<'a, O> {
    pub fn new(pool: &'a AddressPool, oracle: &'a O) -> Self {
        Self {
            pool,
            oracle,
            min_cluster_size: MIN_CLUSTER_SIZE,
            max_trials: MAX_PARTITION_TRIALS,
        }
    }

    /// Override the size/budget limits. Test hook.
    pub fn with_limits(mut self, min_cluster_size: usize, max_trials: usize) -> Self {
        self.min_cluster_size = min_cluster_size;
        self.max_trials = max_trials;
        self
    }

    /// Build `count` disjoint clusters of at least the minimum size.
    pub fn build_clusters(
        &self,
        count: usize,
        rng: &mut impl Rng,
    ) -> Result<Vec<BankCluster>, DiscoveryError> {
        if self.pool.is_empty() {
            return Err(DiscoveryError::EmptyPool);
        }

        let mut clusters: Vec<BankCluster> = Vec::with_capacity(count);
        let mut claimed: HashSet<u64> = HashSet::new();

        for cluster_idx in 0..count {
            let pivot = self.pick_pivot(&clusters, &claimed, rng)?;
            claimed.insert(pivot.paddr);
            let mut cluster = BankCluster::new(pivot);

            let mut trials = 0usize;
            while cluster.len() < self.min_cluster_size && trials < self.max_trials {
                trials += 1;
                let candidate = self.pool.random_record(rng);
                if claimed.contains(&candidate.paddr) {
                    continue;
                }
                if self.oracle.same_bank(&pivot, &candidate) == Verdict::Same {
                    claimed.insert(candidate.paddr);
                    cluster.records.push(candidate);
                }
            }

            if cluster.len() < self.min_cluster_size {
                return Err(DiscoveryError::InsufficientConflictSignal {
                    got: cluster.len(),
                    needed: self.min_cluster_size,
                });
            }

            debug!(
                "cluster {}: {} records after {} trials",
                cluster_idx,
                cluster.len(),
                trials
            );
            clusters.push(cluster);
        }

        info!(
            "partitioned {} clusters ({} records claimed)",
            clusters.len(),
            claimed.len()
        );
        Ok(clusters)
    }

    /// A pivot for a new cluster must sit in a bank no existing cluster
    /// covers: one oracle call per cluster representative, all `Different`.
    fn pick_pivot(
        &self,
        clusters: &[BankCluster],
        claimed: &HashSet<u64>,
        rng: &mut impl Rng,
    ) -> Result<AddressRecord, DiscoveryError> {
        for _ in 0..self.max_trials {
            let candidate = self.pool.random_record(rng);
            if claimed.contains(&candidate.paddr) {
                continue;
            }
            let disjoint = clusters.iter().all(|c| {
                self.oracle.same_bank(c.representative(), &candidate) == Verdict::Different
            });
            if disjoint {
                return Ok(candidate);
            }
        }
        Err(DiscoveryError::InsufficientConflictSignal {
            got: 0,
            needed: self.min_cluster_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Oracle backed by a planted two-bit XOR bank function: banks are
    /// `(bit13(p) ^ bit17(p), bit14(p))`.
    struct PlantedOracle;

    fn bank_of(paddr: u64) -> u64 {
        let f1 = ((paddr >> 13) ^ (paddr >> 17)) & 1;
        let f2 = (paddr >> 14) & 1;
        f1 | (f2 << 1)
    }

    impl ConflictOracle for PlantedOracle {
        fn same_bank(&self, a: &AddressRecord, b: &AddressRecord) -> Verdict {
            if bank_of(a.paddr) == bank_of(b.paddr) {
                Verdict::Same
            } else {
                Verdict::Different
            }
        }
    }

    fn pool() -> AddressPool {
        AddressPool::from_records(
            (0..4096u64).map(|i| AddressRecord {
                vaddr: 0x1000_0000 + (i as usize) * 64,
                paddr: 0x4000_0000 + i * 64,
            }),
            6,
        )
        .unwrap()
    }

    #[test]
    fn clusters_are_pure_and_disjoint() {
        let pool = pool();
        let oracle = PlantedOracle;
        let partitioner = Partitioner::new(&pool, &oracle).with_limits(32, 4096);
        let mut rng = StdRng::seed_from_u64(11);

        let clusters = partitioner.build_clusters(3, &mut rng).unwrap();
        assert_eq!(clusters.len(), 3);

        let mut seen = HashSet::new();
        for cluster in &clusters {
            assert!(cluster.len() >= 32);
            let bank = bank_of(cluster.representative().paddr);
            for r in cluster.records() {
                // Replaying the oracle on any member pair stays Same.
                assert_eq!(bank_of(r.paddr), bank);
                assert!(seen.insert(r.paddr));
            }
        }

        // Three clusters cover three distinct banks.
        let banks: HashSet<u64> = clusters
            .iter()
            .map(|c| bank_of(c.representative().paddr))
            .collect();
        assert_eq!(banks.len(), 3);
    }

    #[test]
    fn degenerate_pool_fails_with_insufficient_signal() {
        let pool = AddressPool::from_records(
            [AddressRecord {
                vaddr: 0x1000,
                paddr: 0x4000_0000,
            }],
            6,
        )
        .unwrap();
        let oracle = PlantedOracle;
        let partitioner = Partitioner::new(&pool, &oracle).with_limits(64, 512);
        let mut rng = StdRng::seed_from_u64(3);

        let err = partitioner.build_clusters(1, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::InsufficientConflictSignal { got: 1, needed: 64 }
        ));
    }

    /// An oracle that never sees a conflict: wrong profile bounds.
    struct DeafOracle;

    impl ConflictOracle for DeafOracle {
        fn same_bank(&self, _a: &AddressRecord, _b: &AddressRecord) -> Verdict {
            Verdict::Different
        }
    }

    #[test]
    fn no_conflict_signal_fails() {
        let pool = pool();
        let oracle = DeafOracle;
        let partitioner = Partitioner::new(&pool, &oracle).with_limits(64, 256);
        let mut rng = StdRng::seed_from_u64(5);

        let err = partitioner.build_clusters(1, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::InsufficientConflictSignal { .. }
        ));
    }
}
