use crate::partition::PartitionKey;
use crate::tuplequeue::{Drainer, ThreadingMode, TupleQueue};
use sluice_api::{PortCondition, Tuple};
use std::collections::{HashMap, VecDeque};

/// Per-partition storage: one set of per-port queues for every partition key
/// hashing into this partition, plus drainability bookkeeping.
///
/// A key is *drainable* once the current tuple-count policy is satisfied for
/// it across the required ports. Drainable keys are visited round-robin so
/// no key is starved under repeated draining. The container is owned by
/// exactly one replica at a time and moves between replicas intact during a
/// rebalance.
#[derive(Debug)]
pub struct TupleQueueContainer {
    partition_id: usize,
    input_port_count: usize,
    queues: HashMap<PartitionKey, KeyQueues>,
    tuple_counts: Vec<usize>,
    port_condition: PortCondition,
    /// Round-robin order over currently drainable keys. A key is in this
    /// deque iff its `drainable` flag is set.
    drainable_keys: VecDeque<PartitionKey>,
}

#[derive(Debug)]
struct KeyQueues {
    queues: Box<[TupleQueue]>,
    drainable: bool,
}

impl KeyQueues {
    fn new(input_port_count: usize) -> Self {
        Self {
            queues: (0..input_port_count)
                .map(|_| TupleQueue::new(ThreadingMode::SingleThreaded, usize::MAX))
                .collect(),
            drainable: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(TupleQueue::is_empty)
    }

    fn satisfies(
        &self,
        tuple_counts: &[usize],
        port_condition: PortCondition,
    ) -> bool {
        match port_condition {
            PortCondition::AllPorts => tuple_counts
                .iter()
                .enumerate()
                .filter(|(_, &count)| count > 0)
                .all(|(port, &count)| self.queues[port].size() >= count),
            PortCondition::AnyPort => tuple_counts
                .iter()
                .enumerate()
                .filter(|(_, &count)| count > 0)
                .any(|(port, &count)| self.queues[port].size() >= count),
        }
    }
}

impl TupleQueueContainer {
    pub fn new(partition_id: usize, input_port_count: usize) -> Self {
        Self {
            partition_id,
            input_port_count,
            queues: HashMap::new(),
            // Until the owning operator declares a strategy, a single tuple
            // on any port makes a key drainable.
            tuple_counts: vec![1; input_port_count],
            port_condition: PortCondition::AnyPort,
            drainable_keys: VecDeque::new(),
        }
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn input_port_count(&self) -> usize {
        self.input_port_count
    }

    /// Buffers one tuple under `key`. Returns `true` if the key just became
    /// drainable.
    pub fn offer(&mut self, port: usize, tuple: Tuple, key: PartitionKey) -> bool {
        let entry = self
            .queues
            .entry(key.clone())
            .or_insert_with(|| KeyQueues::new(self.input_port_count));
        entry.queues[port].push(tuple);
        if !entry.drainable && entry.satisfies(&self.tuple_counts, self.port_condition) {
            entry.drainable = true;
            self.drainable_keys.push_back(key);
            return true;
        }
        false
    }

    /// Lets `drainer` extract from drainable keys round-robin until it
    /// produces a result or no drainable key remains. Returns the number of
    /// keys that became non-drainable during the call.
    pub fn drain(&mut self, drainer: &mut Drainer) -> usize {
        if drainer.is_greedy() {
            return self.drain_any_key(drainer);
        }
        let mut deactivated = 0;
        let mut remaining = self.drainable_keys.len();
        while remaining > 0 {
            remaining -= 1;
            let key = self.drainable_keys.pop_front().expect("drainable key");
            let entry = self.queues.get_mut(&key).expect("queues of drainable key");
            drainer.drain(Some(&key), &entry.queues);
            let produced = drainer.has_result();
            let still_drainable = entry.satisfies(&self.tuple_counts, self.port_condition);
            if still_drainable {
                // Keeps its flag; rotate to the back for fairness.
                self.drainable_keys.push_back(key);
            } else {
                entry.drainable = false;
                deactivated += 1;
                if entry.is_empty() {
                    self.queues.remove(&key);
                }
            }
            if produced {
                return deactivated;
            }
        }
        deactivated
    }

    /// Greedy extraction visits every buffered key, drainable or not, so
    /// that migration and shutdown paths strand no data. One key is
    /// extracted per call, mirroring the per-key invocation model.
    fn drain_any_key(&mut self, drainer: &mut Drainer) -> usize {
        let mut deactivated = 0;
        while let Some(key) = self.queues.keys().next().cloned() {
            let entry = self.queues.remove(&key).expect("buffered key");
            drainer.drain(Some(&key), &entry.queues);
            if entry.drainable {
                self.drainable_keys.retain(|drainable| drainable != &key);
                deactivated += 1;
            }
            if drainer.has_result() {
                return deactivated;
            }
        }
        deactivated
    }

    pub fn drainable_key_count(&self) -> usize {
        self.drainable_keys.len()
    }

    /// Installs a new tuple-count policy and re-evaluates every key.
    /// Returns the new drainable key count.
    pub fn set_tuple_counts(
        &mut self,
        tuple_counts: &[usize],
        port_condition: PortCondition,
    ) -> usize {
        assert_eq!(
            tuple_counts.len(),
            self.input_port_count,
            "tuple counts do not cover all input ports of partition {}",
            self.partition_id
        );
        self.tuple_counts = tuple_counts.to_vec();
        self.port_condition = port_condition;
        self.drainable_keys.clear();
        for (key, entry) in &mut self.queues {
            entry.drainable = entry.satisfies(&self.tuple_counts, self.port_condition);
            if entry.drainable {
                self.drainable_keys.push_back(key.clone());
            }
        }
        self.drainable_keys.len()
    }

    /// Discards all buffered tuples. Returns the number of keys that were
    /// drainable at the time.
    pub fn clear(&mut self) -> usize {
        let drainable = self.drainable_keys.len();
        self.queues.clear();
        self.drainable_keys.clear();
        drainable
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(KeyQueues::is_empty)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::partition::PartitionKeyExtractor;
    use crate::tuplequeue::{GreedyDrainer, SinglePortDrainer};
    use sluice_api::{CountCondition, Tuple};

    fn extractor() -> PartitionKeyExtractor {
        PartitionKeyExtractor::new(vec!["key".to_string()])
    }

    fn offer_one(container: &mut TupleQueueContainer, port: usize, key: i64) -> bool {
        let tuple = Tuple::of("key", key);
        let partition_key = extractor().extract(&tuple);
        container.offer(port, tuple, partition_key)
    }

    #[test]
    fn key_becomes_drainable_once() {
        let mut container = TupleQueueContainer::new(0, 1);
        assert!(offer_one(&mut container, 0, 7));
        assert!(!offer_one(&mut container, 0, 7));
        assert_eq!(container.drainable_key_count(), 1);
    }

    #[test]
    fn policy_change_reevaluates_keys() {
        let mut container = TupleQueueContainer::new(0, 1);
        offer_one(&mut container, 0, 1);
        offer_one(&mut container, 0, 2);
        offer_one(&mut container, 0, 2);
        assert_eq!(container.drainable_key_count(), 2);

        let drainable = container.set_tuple_counts(&[2], PortCondition::AllPorts);
        // Only key 2 has two tuples buffered.
        assert_eq!(drainable, 1);
    }

    #[test]
    fn greedy_drain_deactivates_and_removes_key() {
        let mut container = TupleQueueContainer::new(0, 1);
        offer_one(&mut container, 0, 7);
        let mut drainer = Drainer::Greedy(GreedyDrainer::new());
        let deactivated = container.drain(&mut drainer);
        assert_eq!(deactivated, 1);
        assert!(drainer.has_result());
        assert_eq!(container.drainable_key_count(), 0);
        assert!(container.is_empty());
    }

    #[test]
    fn round_robin_rotates_when_key_stays_drainable() {
        let mut container = TupleQueueContainer::new(0, 1);
        for _ in 0..2 {
            offer_one(&mut container, 0, 1);
            offer_one(&mut container, 0, 2);
        }
        let mut drainer = Drainer::SinglePort(SinglePortDrainer::new(1, CountCondition::Exact));
        // First drain takes one tuple of key 1, which keeps a second tuple
        // buffered and stays drainable, rotating behind key 2.
        container.drain(&mut drainer);
        let first = drainer.take_result().unwrap();
        container.drain(&mut drainer);
        let second = drainer.take_result().unwrap();
        assert_ne!(first.0, second.0);
    }

}
