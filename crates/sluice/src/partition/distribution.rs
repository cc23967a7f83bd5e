use serde::{Deserialize, Serialize};

/// Assignment of every partition id to exactly one replica index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDistribution {
    assignments: Vec<usize>,
    replica_count: usize,
}

/// One partition changing owner between two distributions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PartitionMigration {
    pub partition_id: usize,
    pub source_replica: usize,
    pub target_replica: usize,
}

impl PartitionDistribution {
    /// Distributes `partition_count` partitions round-robin across
    /// `replica_count` replicas.
    pub fn new(partition_count: usize, replica_count: usize) -> Self {
        assert!(partition_count > 0, "partition count must be positive");
        assert!(replica_count > 0, "replica count must be positive");
        Self {
            assignments: (0..partition_count).map(|p| p % replica_count).collect(),
            replica_count,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn replica_index(&self, partition_id: usize) -> usize {
        self.assignments[partition_id]
    }

    pub fn partitions_owned_by(&self, replica_index: usize) -> Vec<usize> {
        self.assignments
            .iter()
            .enumerate()
            .filter(|(_, &owner)| owner == replica_index)
            .map(|(partition_id, _)| partition_id)
            .collect()
    }

    /// Produces a distribution over `new_replica_count` replicas, moving as
    /// few partitions as an even spread allows. Partitions keep their owner
    /// whenever the owner survives and is not above its even-share target.
    pub fn rebalance(&self, new_replica_count: usize) -> Self {
        assert!(new_replica_count > 0, "replica count must be positive");
        if new_replica_count == self.replica_count {
            return self.clone();
        }

        let partition_count = self.partition_count();
        let base = partition_count / new_replica_count;
        let remainder = partition_count % new_replica_count;
        let target =
            |replica: usize| -> usize { base + usize::from(replica < remainder) };

        let mut assignments = vec![usize::MAX; partition_count];
        let mut kept = vec![0usize; new_replica_count];

        // First pass: retain ownership where the owner survives and still
        // has room under its target.
        for (partition_id, &owner) in self.assignments.iter().enumerate() {
            if owner < new_replica_count && kept[owner] < target(owner) {
                assignments[partition_id] = owner;
                kept[owner] += 1;
            }
        }

        // Second pass: place the displaced partitions on replicas with a
        // deficit, in replica order for determinism.
        let mut next_replica = 0;
        for assignment in assignments.iter_mut() {
            if *assignment != usize::MAX {
                continue;
            }
            while kept[next_replica] >= target(next_replica) {
                next_replica += 1;
            }
            *assignment = next_replica;
            kept[next_replica] += 1;
        }

        Self {
            assignments,
            replica_count: new_replica_count,
        }
    }

    /// Partitions whose owner differs between `self` and `new`.
    pub fn migrations(&self, new: &PartitionDistribution) -> Vec<PartitionMigration> {
        assert_eq!(
            self.partition_count(),
            new.partition_count(),
            "distributions cover different partition counts"
        );
        self.assignments
            .iter()
            .zip(new.assignments.iter())
            .enumerate()
            .filter(|(_, (old, new))| old != new)
            .map(|(partition_id, (&source, &target))| PartitionMigration {
                partition_id,
                source_replica: source,
                target_replica: target,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_robin_assignment() {
        let dist = PartitionDistribution::new(4, 2);
        assert_eq!(dist.replica_index(0), 0);
        assert_eq!(dist.replica_index(1), 1);
        assert_eq!(dist.replica_index(2), 0);
        assert_eq!(dist.replica_index(3), 1);
    }

    #[test]
    fn shrink_reassigns_only_removed_replicas() {
        let dist = PartitionDistribution::new(8, 4);
        let shrunk = dist.rebalance(2);
        assert_eq!(shrunk.replica_count(), 2);
        for migration in dist.migrations(&shrunk) {
            // Only partitions owned by removed replicas move.
            assert!(migration.source_replica >= 2);
            assert!(migration.target_replica < 2);
        }
    }

    #[test]
    fn grow_moves_partitions_to_new_replicas_only() {
        let dist = PartitionDistribution::new(9, 2);
        let grown = dist.rebalance(3);
        for migration in dist.migrations(&grown) {
            assert_eq!(migration.target_replica, 2);
        }
        // Even spread: 3 partitions per replica.
        for replica in 0..3 {
            assert_eq!(grown.partitions_owned_by(replica).len(), 3);
        }
    }

    proptest! {
        #[test]
        fn every_partition_owned_by_exactly_one_replica(
            partition_count in 1usize..300,
            replica_count in 1usize..16,
            new_replica_count in 1usize..16,
        ) {
            let dist = PartitionDistribution::new(partition_count, replica_count);
            let rebalanced = dist.rebalance(new_replica_count);
            for partition_id in 0..partition_count {
                prop_assert!(rebalanced.replica_index(partition_id) < new_replica_count);
            }
            let total: usize = (0..new_replica_count)
                .map(|r| rebalanced.partitions_owned_by(r).len())
                .sum();
            prop_assert_eq!(total, partition_count);
        }

        #[test]
        fn rebalance_spread_is_even(
            partition_count in 1usize..300,
            replica_count in 1usize..16,
            new_replica_count in 1usize..16,
        ) {
            let dist = PartitionDistribution::new(partition_count, replica_count);
            let rebalanced = dist.rebalance(new_replica_count);
            let loads: Vec<usize> = (0..new_replica_count)
                .map(|r| rebalanced.partitions_owned_by(r).len())
                .collect();
            let min = loads.iter().min().unwrap();
            let max = loads.iter().max().unwrap();
            prop_assert!(max - min <= 1);
        }
    }
}
