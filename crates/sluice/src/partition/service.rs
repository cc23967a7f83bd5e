use crate::config::PartitionServiceConfig;
use crate::error::EngineError;
use crate::partition::PartitionDistribution;
use std::collections::HashMap;
use tracing::info;

/// Owns the partition distribution of every partitioned-stateful region.
///
/// Driven by the control thread only; replica threads never touch it.
#[derive(Debug)]
pub struct PartitionService {
    partition_count: usize,
    distributions: HashMap<u32, PartitionDistribution>,
}

impl PartitionService {
    pub fn new(config: &PartitionServiceConfig) -> Self {
        Self {
            partition_count: config.partition_count,
            distributions: HashMap::new(),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn create_distribution(
        &mut self,
        region_id: u32,
        replica_count: usize,
    ) -> &PartitionDistribution {
        assert!(
            !self.distributions.contains_key(&region_id),
            "partition distribution for region {region_id} already exists"
        );
        info!(
            region_id,
            replica_count, "creating partition distribution with {} partitions", self.partition_count
        );
        self.distributions
            .entry(region_id)
            .or_insert_with(|| PartitionDistribution::new(self.partition_count, replica_count))
    }

    pub fn distribution(&self, region_id: u32) -> Option<&PartitionDistribution> {
        self.distributions.get(&region_id)
    }

    pub fn distribution_or_fail(
        &self,
        region_id: u32,
    ) -> Result<&PartitionDistribution, EngineError> {
        self.distributions
            .get(&region_id)
            .ok_or(EngineError::RegionNotFound { region_id })
    }

    /// Replaces the region's distribution with one over `new_replica_count`
    /// replicas, returning `(old, new)`.
    pub fn rebalance(
        &mut self,
        region_id: u32,
        new_replica_count: usize,
    ) -> Result<(PartitionDistribution, PartitionDistribution), EngineError> {
        let current = self
            .distributions
            .get(&region_id)
            .ok_or(EngineError::RegionNotFound { region_id })?
            .clone();
        let rebalanced = current.rebalance(new_replica_count);
        info!(
            region_id,
            new_replica_count,
            moved = current.migrations(&rebalanced).len(),
            "rebalanced partition distribution"
        );
        self.distributions.insert(region_id, rebalanced.clone());
        Ok((current, rebalanced))
    }

    pub fn release(&mut self, region_id: u32) {
        self.distributions.remove(&region_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rebalance_replaces_stored_distribution() {
        let mut service = PartitionService::new(&PartitionServiceConfig {
            partition_count: 4,
        });
        service.create_distribution(1, 2);
        let (old, new) = service.rebalance(1, 3).unwrap();
        assert_eq!(old.replica_count(), 2);
        assert_eq!(new.replica_count(), 3);
        assert_eq!(service.distribution(1).unwrap(), &new);
    }

    #[test]
    fn unknown_region_fails() {
        let mut service = PartitionService::new(&PartitionServiceConfig {
            partition_count: 4,
        });
        assert!(matches!(
            service.rebalance(9, 2),
            Err(EngineError::RegionNotFound { region_id: 9 })
        ));
    }
}
