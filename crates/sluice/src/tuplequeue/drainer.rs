use crate::partition::PartitionKey;
use crate::tuplequeue::TupleQueue;
use sluice_api::{CountCondition, TupleBatch};
use std::time::{Duration, Instant};

/// A batch extracted by a drainer, together with the partition key it was
/// drained for (`None` on non-partitioned queues).
pub type DrainedBatch = (Option<PartitionKey>, TupleBatch);

/// The stateless-per-call executor of one scheduling strategy against a set
/// of per-port queues.
///
/// A drainer either populates its result and leaves the drainable flag for
/// retry, or extracts nothing and leaves the data queued. Instances are
/// pooled per operator replica and reconfigured in place between
/// invocations.
#[derive(Debug)]
pub enum Drainer {
    Greedy(GreedyDrainer),
    SinglePort(SinglePortDrainer),
    MultiPortConjunctive(MultiPortConjunctiveDrainer),
    MultiPortDisjunctive(MultiPortDisjunctiveDrainer),
    /// Extracts nothing; placeholder for operators whose strategy is
    /// `Never`.
    Nop,
}

impl Drainer {
    pub fn drain(&mut self, key: Option<&PartitionKey>, queues: &[TupleQueue]) {
        match self {
            Drainer::Greedy(drainer) => drainer.drain(key, queues),
            Drainer::SinglePort(drainer) => drainer.drain(key, queues),
            Drainer::MultiPortConjunctive(drainer) => drainer.drain(key, queues),
            Drainer::MultiPortDisjunctive(drainer) => drainer.drain(key, queues),
            Drainer::Nop => {}
        }
    }

    pub fn has_result(&self) -> bool {
        match self {
            Drainer::Greedy(drainer) => drainer.result.is_some(),
            Drainer::SinglePort(drainer) => drainer.result.is_some(),
            Drainer::MultiPortConjunctive(drainer) => drainer.result.is_some(),
            Drainer::MultiPortDisjunctive(drainer) => drainer.result.is_some(),
            Drainer::Nop => false,
        }
    }

    pub fn take_result(&mut self) -> Option<DrainedBatch> {
        match self {
            Drainer::Greedy(drainer) => drainer.result.take(),
            Drainer::SinglePort(drainer) => drainer.result.take(),
            Drainer::MultiPortConjunctive(drainer) => drainer.result.take(),
            Drainer::MultiPortDisjunctive(drainer) => drainer.result.take(),
            Drainer::Nop => None,
        }
    }

    pub fn reset(&mut self) {
        self.take_result();
    }

    /// `true` for the greedy drainer, which may extract from keys the
    /// tuple-count policy does not consider drainable.
    pub fn is_greedy(&self) -> bool {
        matches!(self, Drainer::Greedy(_))
    }
}

/// Ignores thresholds and drains everything unconditionally. Used for
/// migration and shutdown paths where no data may be stranded, and for
/// operators scheduled `WhenAvailable`.
#[derive(Debug, Default)]
pub struct GreedyDrainer {
    result: Option<DrainedBatch>,
}

impl GreedyDrainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn drain(&mut self, key: Option<&PartitionKey>, queues: &[TupleQueue]) {
        let mut batch = TupleBatch::new(queues.len());
        for (port, queue) in queues.iter().enumerate() {
            batch.add_all(port, queue.poll_all());
        }
        if batch.is_non_empty() {
            self.result = Some((key.cloned(), batch));
        }
    }
}

/// Single-port threshold drainer: `Exact` takes exactly the threshold,
/// `AtLeast` takes everything once the threshold is met.
#[derive(Debug)]
pub struct SinglePortDrainer {
    count: usize,
    condition: CountCondition,
    block: Option<Duration>,
    result: Option<DrainedBatch>,
}

impl SinglePortDrainer {
    pub fn new(count: usize, condition: CountCondition) -> Self {
        assert!(count > 0, "tuple count must be positive");
        Self {
            count,
            condition,
            block: None,
            result: None,
        }
    }

    pub fn new_blocking(count: usize, condition: CountCondition, timeout: Duration) -> Self {
        let mut drainer = Self::new(count, condition);
        drainer.block = Some(timeout);
        drainer
    }

    pub fn reconfigure(&mut self, count: usize, condition: CountCondition) {
        assert!(count > 0, "tuple count must be positive");
        self.count = count;
        self.condition = condition;
        self.result = None;
    }

    fn drain(&mut self, key: Option<&PartitionKey>, queues: &[TupleQueue]) {
        assert_eq!(queues.len(), 1, "single-port drainer over multiple ports");
        let queue = &queues[0];
        if let Some(timeout) = self.block {
            queue.await_size(self.count, timeout);
        }
        let tuples = match self.condition {
            CountCondition::Exact => queue.poll_exact(self.count),
            CountCondition::AtLeast => {
                if queue.size() >= self.count {
                    Some(queue.poll_all())
                } else {
                    None
                }
            }
        };
        if let Some(tuples) = tuples {
            let mut batch = TupleBatch::new(1);
            batch.add_all(0, tuples);
            self.result = Some((key.cloned(), batch));
        }
    }
}

/// Multi-port drainer requiring every port with a non-zero threshold to
/// satisfy it before anything is drained.
#[derive(Debug)]
pub struct MultiPortConjunctiveDrainer {
    counts: Vec<usize>,
    condition: CountCondition,
    block: Option<Duration>,
    result: Option<DrainedBatch>,
}

impl MultiPortConjunctiveDrainer {
    pub fn new(counts: Vec<usize>, condition: CountCondition) -> Self {
        assert!(counts.len() > 1, "conjunctive drainer needs multiple ports");
        assert!(
            counts.iter().any(|&count| count > 0),
            "conjunctive drainer needs at least one positive tuple count"
        );
        Self {
            counts,
            condition,
            block: None,
            result: None,
        }
    }

    pub fn new_blocking(counts: Vec<usize>, condition: CountCondition, timeout: Duration) -> Self {
        let mut drainer = Self::new(counts, condition);
        drainer.block = Some(timeout);
        drainer
    }

    pub fn reconfigure(&mut self, counts: Vec<usize>, condition: CountCondition) {
        assert!(counts.len() > 1, "conjunctive drainer needs multiple ports");
        self.counts = counts;
        self.condition = condition;
        self.result = None;
    }

    fn drain(&mut self, key: Option<&PartitionKey>, queues: &[TupleQueue]) {
        assert_eq!(queues.len(), self.counts.len(), "port count mismatch");
        if let Some(timeout) = self.block {
            let deadline = Instant::now() + timeout;
            for (port, &count) in self.counts.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let now = Instant::now();
                if now >= deadline || !queues[port].await_size(count, deadline - now) {
                    break;
                }
            }
        }
        let satisfied = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .all(|(port, &count)| queues[port].size() >= count);
        if !satisfied {
            return;
        }
        let mut batch = TupleBatch::new(queues.len());
        for (port, queue) in queues.iter().enumerate() {
            let tuples = match self.condition {
                CountCondition::Exact => queue.poll(self.counts[port]),
                CountCondition::AtLeast => queue.poll_all(),
            };
            batch.add_all(port, tuples);
        }
        self.result = Some((key.cloned(), batch));
    }
}

/// Multi-port drainer where any single port reaching its threshold triggers
/// a drain across all ports present.
#[derive(Debug)]
pub struct MultiPortDisjunctiveDrainer {
    counts: Vec<usize>,
    condition: CountCondition,
    block: Option<Duration>,
    result: Option<DrainedBatch>,
}

impl MultiPortDisjunctiveDrainer {
    pub fn new(counts: Vec<usize>, condition: CountCondition) -> Self {
        assert!(counts.len() > 1, "disjunctive drainer needs multiple ports");
        assert!(
            counts.iter().any(|&count| count > 0),
            "disjunctive drainer needs at least one positive tuple count"
        );
        Self {
            counts,
            condition,
            block: None,
            result: None,
        }
    }

    pub fn new_blocking(counts: Vec<usize>, condition: CountCondition, timeout: Duration) -> Self {
        let mut drainer = Self::new(counts, condition);
        drainer.block = Some(timeout);
        drainer
    }

    pub fn reconfigure(&mut self, counts: Vec<usize>, condition: CountCondition) {
        assert!(counts.len() > 1, "disjunctive drainer needs multiple ports");
        self.counts = counts;
        self.condition = condition;
        self.result = None;
    }

    fn satisfied(&self, queues: &[TupleQueue]) -> bool {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .any(|(port, &count)| queues[port].size() >= count)
    }

    fn drain(&mut self, key: Option<&PartitionKey>, queues: &[TupleQueue]) {
        assert_eq!(queues.len(), self.counts.len(), "port count mismatch");
        if let Some(timeout) = self.block {
            // No single condvar covers all ports, so a blocking disjunctive
            // wait is sliced over the first required port.
            let deadline = Instant::now() + timeout;
            while !self.satisfied(queues) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let slice = (deadline - now).min(Duration::from_millis(1));
                let probe_port = self
                    .counts
                    .iter()
                    .position(|&count| count > 0)
                    .expect("at least one positive tuple count");
                queues[probe_port].await_size(self.counts[probe_port], slice);
            }
        }
        if !self.satisfied(queues) {
            return;
        }
        let mut batch = TupleBatch::new(queues.len());
        for (port, queue) in queues.iter().enumerate() {
            let tuples = match self.condition {
                CountCondition::Exact => queue.poll(self.counts[port]),
                CountCondition::AtLeast => queue.poll_all(),
            };
            batch.add_all(port, tuples);
        }
        self.result = Some((key.cloned(), batch));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tuplequeue::ThreadingMode;
    use sluice_api::Tuple;

    fn queue_with(n: usize) -> TupleQueue {
        let queue = TupleQueue::new(ThreadingMode::SingleThreaded, usize::MAX);
        for i in 0..n {
            queue.push(Tuple::of("n", i as i64));
        }
        queue
    }

    #[test]
    fn single_port_exact_takes_exactly_the_threshold() {
        let queues = [queue_with(5)];
        let mut drainer = Drainer::SinglePort(SinglePortDrainer::new(3, CountCondition::Exact));
        drainer.drain(None, &queues);
        let (_, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.tuple_count(0), 3);
        assert_eq!(queues[0].size(), 2);
    }

    #[test]
    fn single_port_exact_leaves_partial_data_queued() {
        let queues = [queue_with(2)];
        let mut drainer = Drainer::SinglePort(SinglePortDrainer::new(3, CountCondition::Exact));
        drainer.drain(None, &queues);
        assert!(!drainer.has_result());
        assert_eq!(queues[0].size(), 2);
    }

    #[test]
    fn single_port_at_least_takes_everything() {
        let queues = [queue_with(5)];
        let mut drainer = Drainer::SinglePort(SinglePortDrainer::new(3, CountCondition::AtLeast));
        drainer.drain(None, &queues);
        let (_, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.tuple_count(0), 5);
        assert!(queues[0].is_empty());
    }

    #[test]
    fn conjunctive_requires_every_port() {
        let queues = [queue_with(1), queue_with(2)];
        let mut drainer = Drainer::MultiPortConjunctive(MultiPortConjunctiveDrainer::new(
            vec![2, 2],
            CountCondition::AtLeast,
        ));
        drainer.drain(None, &queues);
        assert!(!drainer.has_result());
        assert_eq!(queues[0].size(), 1);
        assert_eq!(queues[1].size(), 2);
    }

    #[test]
    fn conjunctive_at_least_drains_all_buffered() {
        let queues = [queue_with(1), queue_with(2)];
        let mut drainer = Drainer::MultiPortConjunctive(MultiPortConjunctiveDrainer::new(
            vec![1, 1],
            CountCondition::AtLeast,
        ));
        drainer.drain(None, &queues);
        let (_, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.tuple_count(0), 1);
        assert_eq!(batch.tuple_count(1), 2);
        assert!(queues[0].is_empty() && queues[1].is_empty());
    }

    #[test]
    fn conjunctive_exact_drains_thresholds_only() {
        let queues = [queue_with(3), queue_with(2)];
        let mut drainer = Drainer::MultiPortConjunctive(MultiPortConjunctiveDrainer::new(
            vec![2, 2],
            CountCondition::Exact,
        ));
        drainer.drain(None, &queues);
        let (_, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.tuple_count(0), 2);
        assert_eq!(batch.tuple_count(1), 2);
        assert_eq!(queues[0].size(), 1);
    }

    #[test]
    fn disjunctive_triggers_on_any_port() {
        let queues = [queue_with(0), queue_with(3)];
        let mut drainer = Drainer::MultiPortDisjunctive(MultiPortDisjunctiveDrainer::new(
            vec![2, 2],
            CountCondition::AtLeast,
        ));
        drainer.drain(None, &queues);
        let (_, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.tuple_count(0), 0);
        assert_eq!(batch.tuple_count(1), 3);
    }

    #[test]
    fn greedy_ignores_thresholds() {
        let queues = [queue_with(1), queue_with(4)];
        let mut drainer = Drainer::Greedy(GreedyDrainer::new());
        drainer.drain(None, &queues);
        let (_, batch) = drainer.take_result().unwrap();
        assert_eq!(batch.total_tuple_count(), 5);
    }

    #[test]
    fn greedy_yields_nothing_on_empty_queues() {
        let queues = [queue_with(0)];
        let mut drainer = Drainer::Greedy(GreedyDrainer::new());
        drainer.drain(None, &queues);
        assert!(!drainer.has_result());
    }
}
