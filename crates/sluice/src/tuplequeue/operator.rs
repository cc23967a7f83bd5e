use crate::partition::{partition_id, PartitionDistribution, PartitionKeyExtractor};
use crate::tuplequeue::{Drainer, ThreadingMode, TupleQueue, TupleQueueContainer};
use sluice_api::{PortCondition, Tuple};
use std::sync::Arc;
use tracing::{debug, info};

const NON_DRAINABLE: usize = usize::MAX;

/// No-op queue for operators with no upstream connection. Always
/// non-drainable, accepts no offers; uniformly represents "this
/// pipeline/operator has no input".
#[derive(Debug)]
pub struct EmptyOperatorQueue {
    operator_id: String,
    input_port_count: usize,
}

impl EmptyOperatorQueue {
    pub fn new(operator_id: impl Into<String>, input_port_count: usize) -> Self {
        Self {
            operator_id: operator_id.into(),
            input_port_count,
        }
    }
}

/// Single-key queue variant for non-partitioned operators: one tuple queue
/// per input port. Whether it is drainable is decided by the drainer itself
/// against the port queues.
#[derive(Debug)]
pub struct DefaultOperatorQueue {
    operator_id: String,
    queues: Box<[TupleQueue]>,
}

impl DefaultOperatorQueue {
    pub fn new(
        operator_id: impl Into<String>,
        input_port_count: usize,
        mode: ThreadingMode,
        capacity: usize,
    ) -> Self {
        Self {
            operator_id: operator_id.into(),
            queues: (0..input_port_count)
                .map(|_| TupleQueue::new(mode, capacity))
                .collect(),
        }
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn input_port_count(&self) -> usize {
        self.queues.len()
    }

    /// Offers into one port, accepting what capacity allows under the
    /// multi-threaded discipline. Accepted tuples are removed from `tuples`.
    pub fn offer(&self, port: usize, tuples: &mut Vec<Tuple>) -> usize {
        self.queues[port].offer(tuples)
    }

    pub fn force_offer(&self, port: usize, tuples: impl IntoIterator<Item = Tuple>) {
        self.queues[port].force_offer(tuples);
    }

    pub fn drain(&self, drainer: &mut Drainer) {
        drainer.drain(None, &self.queues);
    }

    pub fn is_overloaded(&self) -> bool {
        self.queues
            .iter()
            .any(|queue| queue.size() >= queue.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(TupleQueue::is_empty)
    }

    pub fn clear(&self) -> usize {
        self.queues.iter().map(TupleQueue::clear).sum()
    }

    pub fn ensure_capacity(&self, capacity: usize) {
        for queue in self.queues.iter() {
            queue.ensure_capacity(capacity);
        }
    }

    pub fn mode(&self) -> ThreadingMode {
        self.queues
            .first()
            .map(TupleQueue::mode)
            .unwrap_or(ThreadingMode::SingleThreaded)
    }

    /// Switches the access discipline of every port queue in place. Used
    /// when pipelines are merged or split.
    pub fn switch_threading_mode(&self, mode: ThreadingMode) {
        for queue in self.queues.iter() {
            queue.switch_threading_mode(mode);
        }
    }
}

/// Partition-aware queue variant for partitioned-stateful operators.
///
/// Owns one [`TupleQueueContainer`] per partition assigned to this replica.
/// Drainable partitions are kept in a dense array with a reverse index and a
/// round-robin cursor: activation and deactivation are O(1) via swap-to-end,
/// and repeated draining starves no partition.
#[derive(Debug)]
pub struct PartitionedOperatorQueue {
    operator_id: String,
    replica_index: usize,
    input_port_count: usize,
    partition_count: usize,
    extractor: PartitionKeyExtractor,
    containers: Vec<Option<TupleQueueContainer>>,
    /// Reverse index: partition id -> its slot in `drainable_partitions`,
    /// or `NON_DRAINABLE`.
    drain_indices: Vec<usize>,
    /// Dense array of drainable partition ids; only the first
    /// `drainable_partition_count` slots are meaningful.
    drainable_partitions: Vec<usize>,
    drainable_partition_count: usize,
    next_drain_index: usize,
    total_drainable_key_count: usize,
    max_drainable_key_count: usize,
}

impl PartitionedOperatorQueue {
    /// Creates the queue with fresh containers for every partition the
    /// distribution assigns to `replica_index`.
    pub fn new(
        operator_id: impl Into<String>,
        input_port_count: usize,
        extractor: PartitionKeyExtractor,
        replica_index: usize,
        distribution: &PartitionDistribution,
        max_drainable_key_count: usize,
    ) -> Self {
        let partition_count = distribution.partition_count();
        let mut queue = Self::new_empty(
            operator_id,
            input_port_count,
            extractor,
            replica_index,
            partition_count,
            max_drainable_key_count,
        );
        for partition in 0..partition_count {
            if distribution.replica_index(partition) == replica_index {
                queue.containers[partition] =
                    Some(TupleQueueContainer::new(partition, input_port_count));
            }
        }
        queue
    }

    /// Creates the queue with no containers at all; ownership arrives later
    /// through [`PartitionedOperatorQueue::acquire_partitions`]. Used when a
    /// rebalance grows a region and the new replica's partitions migrate in
    /// from the old owners.
    pub fn new_empty(
        operator_id: impl Into<String>,
        input_port_count: usize,
        extractor: PartitionKeyExtractor,
        replica_index: usize,
        partition_count: usize,
        max_drainable_key_count: usize,
    ) -> Self {
        Self {
            operator_id: operator_id.into(),
            replica_index,
            input_port_count,
            partition_count,
            extractor,
            containers: (0..partition_count).map(|_| None).collect(),
            drain_indices: vec![NON_DRAINABLE; partition_count],
            drainable_partitions: vec![NON_DRAINABLE; partition_count],
            drainable_partition_count: 0,
            next_drain_index: NON_DRAINABLE,
            total_drainable_key_count: 0,
            max_drainable_key_count,
        }
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn input_port_count(&self) -> usize {
        self.input_port_count
    }

    pub fn extractor(&self) -> &PartitionKeyExtractor {
        &self.extractor
    }

    pub fn offer(&mut self, port: usize, tuples: impl IntoIterator<Item = Tuple>) {
        for tuple in tuples {
            let key = self.extractor.extract(&tuple);
            let partition = partition_id(key.partition_hash(), self.partition_count);
            let container = self.containers[partition].as_mut().unwrap_or_else(|| {
                panic!(
                    "operator {} replica {} offered a tuple of partition {partition} it does not own",
                    self.operator_id, self.replica_index
                )
            });
            if container.offer(port, tuple, key) {
                self.mark_drainable_partition(partition, 1);
            }
        }
    }

    /// Advances the round-robin cursor and lets `drainer` extract from the
    /// next drainable partition; partitions that cannot satisfy the drainer
    /// are deactivated and the next one is tried, up to exhausting all
    /// drainable partitions in one call.
    pub fn drain(&mut self, drainer: &mut Drainer) {
        if drainer.is_greedy() {
            self.drain_greedily(drainer);
            return;
        }
        while self.drainable_partition_count > 0 {
            let partition = self.drainable_partitions[self.next_drain_index];
            let deactivated_keys = self.containers[partition]
                .as_mut()
                .expect("drainable partition without container")
                .drain(drainer);
            self.total_drainable_key_count -= deactivated_keys;

            if drainer.has_result() {
                self.next_drain_index =
                    (self.next_drain_index + 1) % self.drainable_partition_count;
                return;
            }
            self.unmark_drainable_partition(partition, self.next_drain_index);
        }
    }

    /// Greedy drains must reach partitions and keys the tuple-count policy
    /// does not consider drainable. One key is extracted per call; the
    /// drainable bookkeeping is rebuilt afterwards.
    fn drain_greedily(&mut self, drainer: &mut Drainer) {
        for container in self.containers.iter_mut().flatten() {
            if container.is_empty() {
                continue;
            }
            container.drain(drainer);
            if drainer.has_result() {
                break;
            }
        }
        self.populate_drain_indices();
    }

    fn mark_drainable_partition(&mut self, partition: usize, new_drainable_key_count: usize) {
        if self.drain_indices[partition] == NON_DRAINABLE {
            self.drain_indices[partition] = self.drainable_partition_count;
            self.drainable_partitions[self.drainable_partition_count] = partition;
            self.drainable_partition_count += 1;
            if self.next_drain_index == NON_DRAINABLE {
                self.next_drain_index = 0;
            }
        }
        self.total_drainable_key_count += new_drainable_key_count;
    }

    fn unmark_drainable_partition(&mut self, partition: usize, slot: usize) {
        self.drainable_partition_count -= 1;
        let moved = self.drainable_partitions[self.drainable_partition_count];
        self.drainable_partitions[slot] = moved;
        self.drain_indices[moved] = slot;
        self.drain_indices[partition] = NON_DRAINABLE;
        self.next_drain_index = if self.drainable_partition_count == 0 {
            NON_DRAINABLE
        } else {
            (self.next_drain_index + 1) % self.drainable_partition_count
        };
    }

    fn reset_drain_indices(&mut self) {
        self.drain_indices.fill(NON_DRAINABLE);
        self.drainable_partitions.fill(NON_DRAINABLE);
        self.next_drain_index = NON_DRAINABLE;
        self.drainable_partition_count = 0;
        self.total_drainable_key_count = 0;
    }

    fn populate_drain_indices(&mut self) {
        self.reset_drain_indices();
        for partition in 0..self.partition_count {
            if let Some(container) = &self.containers[partition] {
                let drainable_keys = container.drainable_key_count();
                if drainable_keys > 0 {
                    self.mark_drainable_partition(partition, drainable_keys);
                }
            }
        }
    }

    pub fn set_tuple_counts(&mut self, tuple_counts: &[usize], port_condition: PortCondition) {
        debug!(
            operator_id = %self.operator_id,
            ?tuple_counts,
            ?port_condition,
            "setting tuple requirements of partitioned queue"
        );
        for container in self.containers.iter_mut().flatten() {
            container.set_tuple_counts(tuple_counts, port_condition);
        }
        self.populate_drain_indices();
    }

    /// Advisory overload check consulted by producers for backpressure, not
    /// enforced internally.
    pub fn is_overloaded(&self) -> bool {
        self.total_drainable_key_count >= self.max_drainable_key_count
    }

    pub fn is_empty(&self) -> bool {
        self.containers
            .iter()
            .flatten()
            .all(TupleQueueContainer::is_empty)
    }

    pub fn clear(&mut self) {
        info!(
            operator_id = %self.operator_id,
            drainable_keys = self.total_drainable_key_count,
            "clearing partitioned tuple queues"
        );
        for container in self.containers.iter_mut().flatten() {
            container.clear();
        }
        self.reset_drain_indices();
    }

    pub fn owned_partition_ids(&self) -> Vec<usize> {
        self.containers
            .iter()
            .enumerate()
            .filter(|(_, container)| container.is_some())
            .map(|(partition, _)| partition)
            .collect()
    }

    /// Takes ownership of migrated partition containers. Acquiring a
    /// partition this replica already owns is a programming defect.
    pub fn acquire_partitions(&mut self, partitions: Vec<TupleQueueContainer>) {
        for container in &partitions {
            assert!(
                self.containers[container.partition_id()].is_none(),
                "partition {} is already acquired by operator {} replica {}",
                container.partition_id(),
                self.operator_id,
                self.replica_index
            );
        }
        let partition_ids: Vec<usize> = partitions
            .iter()
            .map(TupleQueueContainer::partition_id)
            .collect();
        for container in partitions {
            let partition_id = container.partition_id();
            self.containers[partition_id] = Some(container);
        }
        self.populate_drain_indices();
        info!(
            operator_id = %self.operator_id,
            replica_index = self.replica_index,
            ?partition_ids,
            "partitions acquired"
        );
    }

    /// Releases the given partitions' containers so another replica can
    /// acquire them. Releasing an unowned partition is a programming
    /// defect.
    pub fn release_partitions(&mut self, partition_ids: &[usize]) -> Vec<TupleQueueContainer> {
        for &partition in partition_ids {
            assert!(
                self.containers[partition].is_some(),
                "partition {partition} is not acquired by operator {} replica {}",
                self.operator_id,
                self.replica_index
            );
        }
        let released = partition_ids
            .iter()
            .map(|&partition| self.containers[partition].take().expect("owned partition"))
            .collect();
        self.populate_drain_indices();
        info!(
            operator_id = %self.operator_id,
            replica_index = self.replica_index,
            ?partition_ids,
            "partitions released"
        );
        released
    }

    pub fn total_drainable_key_count(&self) -> usize {
        self.total_drainable_key_count
    }
}

/// The per-operator/per-replica façade over one or more tuple queues.
///
/// Multi-threaded default queues (pipeline self queues and the head
/// operator's queue) are shared with upstream senders through the `Arc`;
/// the other variants are owned by their replica thread exclusively.
#[derive(Debug)]
pub enum OperatorQueue {
    Empty(EmptyOperatorQueue),
    Default(Arc<DefaultOperatorQueue>),
    Partitioned(PartitionedOperatorQueue),
}

impl OperatorQueue {
    pub fn operator_id(&self) -> &str {
        match self {
            OperatorQueue::Empty(queue) => &queue.operator_id,
            OperatorQueue::Default(queue) => queue.operator_id(),
            OperatorQueue::Partitioned(queue) => queue.operator_id(),
        }
    }

    pub fn input_port_count(&self) -> usize {
        match self {
            OperatorQueue::Empty(queue) => queue.input_port_count,
            OperatorQueue::Default(queue) => queue.input_port_count(),
            OperatorQueue::Partitioned(queue) => queue.input_port_count(),
        }
    }

    /// Offers into one port. The empty queue accepts nothing; the
    /// partitioned queue accepts everything (backpressure is advisory via
    /// [`OperatorQueue::is_overloaded`]).
    pub fn offer(&mut self, port: usize, tuples: &mut Vec<Tuple>) -> usize {
        match self {
            OperatorQueue::Empty(_) => 0,
            OperatorQueue::Default(queue) => queue.offer(port, tuples),
            OperatorQueue::Partitioned(queue) => {
                let accepted = tuples.len();
                queue.offer(port, tuples.drain(..));
                accepted
            }
        }
    }

    /// Offers into one port ignoring capacity. Used for in-pipeline
    /// forwarding and migration re-offers, where rejecting tuples would
    /// lose data.
    pub fn force_offer(&mut self, port: usize, tuples: Vec<Tuple>) {
        match self {
            OperatorQueue::Empty(_) => {}
            OperatorQueue::Default(queue) => queue.force_offer(port, tuples),
            OperatorQueue::Partitioned(queue) => queue.offer(port, tuples),
        }
    }

    pub fn drain(&mut self, drainer: &mut Drainer) {
        match self {
            OperatorQueue::Empty(_) => {}
            OperatorQueue::Default(queue) => queue.drain(drainer),
            OperatorQueue::Partitioned(queue) => queue.drain(drainer),
        }
    }

    pub fn set_tuple_counts(&mut self, tuple_counts: &[usize], port_condition: PortCondition) {
        match self {
            OperatorQueue::Empty(_) | OperatorQueue::Default(_) => {}
            OperatorQueue::Partitioned(queue) => {
                queue.set_tuple_counts(tuple_counts, port_condition)
            }
        }
    }

    pub fn is_overloaded(&self) -> bool {
        match self {
            OperatorQueue::Empty(_) => false,
            OperatorQueue::Default(queue) => queue.is_overloaded(),
            OperatorQueue::Partitioned(queue) => queue.is_overloaded(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            OperatorQueue::Empty(_) => true,
            OperatorQueue::Default(queue) => queue.is_empty(),
            OperatorQueue::Partitioned(queue) => queue.is_empty(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            OperatorQueue::Empty(_) => {}
            OperatorQueue::Default(queue) => {
                queue.clear();
            }
            OperatorQueue::Partitioned(queue) => queue.clear(),
        }
    }

    pub fn ensure_capacity(&mut self, capacity: usize) {
        if let OperatorQueue::Default(queue) = self {
            queue.ensure_capacity(capacity);
        }
    }

    /// Clone of the shared default queue, for wiring upstream senders.
    pub fn shared_default(&self) -> Option<Arc<DefaultOperatorQueue>> {
        match self {
            OperatorQueue::Default(queue) => Some(Arc::clone(queue)),
            _ => None,
        }
    }

    pub fn as_partitioned_mut(&mut self) -> Option<&mut PartitionedOperatorQueue> {
        match self {
            OperatorQueue::Partitioned(queue) => Some(queue),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tuplequeue::{GreedyDrainer, SinglePortDrainer};
    use sluice_api::{CountCondition, Tuple};

    fn extractor() -> PartitionKeyExtractor {
        PartitionKeyExtractor::new(vec!["key".to_string()])
    }

    fn partitioned(replica_index: usize, replica_count: usize) -> PartitionedOperatorQueue {
        let distribution = PartitionDistribution::new(4, replica_count);
        PartitionedOperatorQueue::new("op", 1, extractor(), replica_index, &distribution, 64)
    }

    fn key_tuples(key: i64, n: usize) -> Vec<Tuple> {
        (0..n).map(|_| Tuple::of("key", key)).collect()
    }

    /// Keys hashing to distinct partitions of a 4-partition, 1-replica
    /// layout, found by probing the extractor.
    fn keys_on_distinct_partitions(count: usize) -> Vec<i64> {
        let extractor = extractor();
        let mut found: Vec<(usize, i64)> = Vec::new();
        for candidate in 0..10_000i64 {
            let tuple = Tuple::of("key", candidate);
            let partition = partition_id(extractor.partition_hash(&tuple), 4);
            if !found.iter().any(|(p, _)| *p == partition) {
                found.push((partition, candidate));
                if found.len() == count {
                    break;
                }
            }
        }
        assert_eq!(found.len(), count, "probing failed to cover partitions");
        found.into_iter().map(|(_, key)| key).collect()
    }

    #[test]
    fn drain_round_robin_visits_all_partitions_before_repeating() {
        let mut queue = partitioned(0, 1);
        let keys = keys_on_distinct_partitions(3);
        // Two tuples per key so every partition stays drainable after one
        // single-tuple drain.
        for &key in &keys {
            queue.offer(0, key_tuples(key, 2));
        }

        let mut drainer =
            Drainer::SinglePort(SinglePortDrainer::new(1, CountCondition::Exact));
        let mut seen = Vec::new();
        for _ in 0..3 {
            queue.drain(&mut drainer);
            let (key, batch) = drainer.take_result().unwrap();
            assert_eq!(batch.tuple_count(0), 1);
            seen.push(key.unwrap().values()[0].as_int().unwrap());
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3, "a partition was visited twice in one round");
    }

    #[test]
    fn drain_deactivates_unsatisfiable_partitions() {
        let mut queue = partitioned(0, 1);
        let keys = keys_on_distinct_partitions(2);
        queue.offer(0, key_tuples(keys[0], 1));
        queue.offer(0, key_tuples(keys[1], 3));

        // Threshold 3: only the second key satisfies it; the first
        // partition is deactivated along the way.
        queue.set_tuple_counts(&[3], PortCondition::AllPorts);
        let mut drainer =
            Drainer::SinglePort(SinglePortDrainer::new(3, CountCondition::Exact));
        queue.drain(&mut drainer);
        let (key, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.tuple_count(0), 3);
        assert_eq!(key.unwrap().values()[0].as_int(), Some(keys[1]));

        // Nothing else satisfies the policy.
        queue.drain(&mut drainer);
        assert!(drainer.take_result().is_none());
        assert!(!queue.is_empty());
    }

    #[test]
    fn overload_reports_against_drainable_key_bound() {
        let distribution = PartitionDistribution::new(4, 1);
        let mut queue =
            PartitionedOperatorQueue::new("op", 1, extractor(), 0, &distribution, 2);
        queue.offer(0, key_tuples(1, 1));
        assert!(!queue.is_overloaded());
        queue.offer(0, key_tuples(2, 1));
        assert!(queue.is_overloaded());
    }

    #[test]
    fn release_and_acquire_move_buffered_data() {
        let mut source = partitioned(0, 1);
        source.offer(0, key_tuples(5, 2));
        let owned = source.owned_partition_ids();

        let released = source.release_partitions(&owned);
        assert!(source.is_empty());
        assert_eq!(source.total_drainable_key_count(), 0);

        let mut target = PartitionedOperatorQueue::new_empty("op", 1, extractor(), 1, 4, 64);
        target.acquire_partitions(released);
        assert_eq!(target.total_drainable_key_count(), 1);

        let mut drainer = Drainer::Greedy(GreedyDrainer::new());
        target.drain(&mut drainer);
        let (_, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.tuple_count(0), 2);
    }

    #[test]
    #[should_panic(expected = "already acquired")]
    fn double_acquire_panics() {
        let mut queue = partitioned(0, 1);
        queue.acquire_partitions(vec![TupleQueueContainer::new(0, 1)]);
    }

    #[test]
    fn empty_queue_accepts_nothing() {
        let mut queue = OperatorQueue::Empty(EmptyOperatorQueue::new("src", 1));
        let mut tuples = vec![Tuple::of("n", 1i64)];
        assert_eq!(queue.offer(0, &mut tuples), 0);
        assert!(queue.is_empty());
        let mut drainer = Drainer::Greedy(GreedyDrainer::new());
        queue.drain(&mut drainer);
        assert!(!drainer.has_result());
    }
}
