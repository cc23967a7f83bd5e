//! Key-value state façades per operator replica.
//!
//! Stateless operators get no store, stateful operators a single slot, and
//! partitioned-stateful operators one store per partition key. Partition
//! containers hold the stores of one hash bucket and move between replicas
//! intact during a rebalance, with the same exclusive-ownership discipline
//! as the tuple-queue containers.

use crate::partition::{partition_id, PartitionDistribution, PartitionKey};
use sluice_api::KvStore;
use std::collections::HashMap;
use tracing::info;

/// The key-value stores of one partition: one store per partition key.
#[derive(Debug, Default)]
pub struct KvStoreContainer {
    partition_id: usize,
    stores: HashMap<PartitionKey, KvStore>,
}

impl KvStoreContainer {
    pub fn new(partition_id: usize) -> Self {
        Self {
            partition_id,
            stores: HashMap::new(),
        }
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn store_for(&mut self, key: &PartitionKey) -> &mut KvStore {
        self.stores.entry(key.clone()).or_default()
    }

    pub fn key_count(&self) -> usize {
        self.stores.len()
    }

    pub fn clear(&mut self) {
        self.stores.clear();
    }
}

/// Per-partition key-value state of one partitioned-stateful operator
/// replica.
#[derive(Debug)]
pub struct PartitionedOperatorKvStore {
    operator_id: String,
    replica_index: usize,
    partition_count: usize,
    containers: Vec<Option<KvStoreContainer>>,
}

impl PartitionedOperatorKvStore {
    pub fn new(
        operator_id: impl Into<String>,
        replica_index: usize,
        distribution: &PartitionDistribution,
    ) -> Self {
        let partition_count = distribution.partition_count();
        let mut store = Self::new_empty(operator_id, replica_index, partition_count);
        for partition in 0..partition_count {
            if distribution.replica_index(partition) == replica_index {
                store.containers[partition] = Some(KvStoreContainer::new(partition));
            }
        }
        store
    }

    pub fn new_empty(
        operator_id: impl Into<String>,
        replica_index: usize,
        partition_count: usize,
    ) -> Self {
        Self {
            operator_id: operator_id.into(),
            replica_index,
            partition_count,
            containers: (0..partition_count).map(|_| None).collect(),
        }
    }

    pub fn store_for(&mut self, key: &PartitionKey) -> &mut KvStore {
        let partition = partition_id(key.partition_hash(), self.partition_count);
        self.containers[partition]
            .as_mut()
            .unwrap_or_else(|| {
                panic!(
                    "operator {} replica {} accessed state of partition {partition} it does not own",
                    self.operator_id, self.replica_index
                )
            })
            .store_for(key)
    }

    /// Takes ownership of migrated state containers. Acquiring a partition
    /// this replica already owns is a programming defect.
    pub fn acquire_partitions(&mut self, partitions: Vec<KvStoreContainer>) {
        for container in &partitions {
            assert!(
                self.containers[container.partition_id()].is_none(),
                "state of partition {} is already acquired by operator {} replica {}",
                container.partition_id(),
                self.operator_id,
                self.replica_index
            );
        }
        let partition_ids: Vec<usize> = partitions
            .iter()
            .map(KvStoreContainer::partition_id)
            .collect();
        for container in partitions {
            let partition_id = container.partition_id();
            self.containers[partition_id] = Some(container);
        }
        info!(
            operator_id = %self.operator_id,
            replica_index = self.replica_index,
            ?partition_ids,
            "state partitions acquired"
        );
    }

    pub fn release_partitions(&mut self, partition_ids: &[usize]) -> Vec<KvStoreContainer> {
        for &partition in partition_ids {
            assert!(
                self.containers[partition].is_some(),
                "state of partition {partition} is not acquired by operator {} replica {}",
                self.operator_id,
                self.replica_index
            );
        }
        let released = partition_ids
            .iter()
            .map(|&partition| self.containers[partition].take().expect("owned partition"))
            .collect();
        info!(
            operator_id = %self.operator_id,
            replica_index = self.replica_index,
            ?partition_ids,
            "state partitions released"
        );
        released
    }

    pub fn owned_partition_ids(&self) -> Vec<usize> {
        self.containers
            .iter()
            .enumerate()
            .filter(|(_, container)| container.is_some())
            .map(|(partition, _)| partition)
            .collect()
    }

    pub fn clear(&mut self) {
        for container in self.containers.iter_mut().flatten() {
            container.clear();
        }
    }
}

/// The per-operator/per-replica key-value store façade.
#[derive(Debug)]
pub enum OperatorKvStore {
    /// Stateless operators carry no state.
    Empty,
    /// One store per replica, for stateful operators.
    Default(KvStore),
    /// One store per partition key, for partitioned-stateful operators.
    Partitioned(PartitionedOperatorKvStore),
}

impl OperatorKvStore {
    /// The store for `key`, or `None` for stateless operators. Partitioned
    /// stores require a key; the default store ignores it.
    pub fn store(&mut self, key: Option<&PartitionKey>) -> Option<&mut KvStore> {
        match self {
            OperatorKvStore::Empty => None,
            OperatorKvStore::Default(store) => Some(store),
            OperatorKvStore::Partitioned(stores) => {
                let key = key.expect("partitioned store accessed without a partition key");
                Some(stores.store_for(key))
            }
        }
    }

    pub fn as_partitioned_mut(&mut self) -> Option<&mut PartitionedOperatorKvStore> {
        match self {
            OperatorKvStore::Partitioned(stores) => Some(stores),
            _ => None,
        }
    }

    /// Drops all state. Called when a replica is shut down.
    pub fn release(&mut self) {
        match self {
            OperatorKvStore::Empty => {}
            OperatorKvStore::Default(store) => store.clear(),
            OperatorKvStore::Partitioned(stores) => stores.clear(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::partition::PartitionKeyExtractor;
    use sluice_api::Tuple;

    fn key_of(value: i64) -> PartitionKey {
        PartitionKeyExtractor::new(vec!["key".to_string()]).extract(&Tuple::of("key", value))
    }

    #[test]
    fn partitioned_state_moves_with_its_container() {
        let distribution = PartitionDistribution::new(4, 1);
        let mut source = PartitionedOperatorKvStore::new("op", 0, &distribution);
        let key = key_of(9);
        source.store_for(&key).set("seen", 3i64);

        let owned = source.owned_partition_ids();
        let released = source.release_partitions(&owned);
        let mut target = PartitionedOperatorKvStore::new_empty("op", 1, 4);
        target.acquire_partitions(released);
        assert_eq!(
            target.store_for(&key).get("seen"),
            Some(&sluice_api::Value::Int(3))
        );
    }

    #[test]
    #[should_panic(expected = "already acquired")]
    fn double_acquire_panics() {
        let distribution = PartitionDistribution::new(4, 1);
        let mut store = PartitionedOperatorKvStore::new("op", 0, &distribution);
        store.acquire_partitions(vec![KvStoreContainer::new(0)]);
    }
}
