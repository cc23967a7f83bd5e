use crate::config::DownstreamConfig;
use crate::error::EngineError;
use crate::idle::BackoffIdleStrategy;
use crate::partition::{partition_id, PartitionDistribution, PartitionKeyExtractor};
use crate::pipeline::{PipelineReplicaId, Ticker};
use crate::tuplequeue::DefaultOperatorQueue;
use crossbeam::channel::{bounded, Receiver, Sender};
use sluice_api::{Tuple, TupleBatch};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Instant;
use tracing::{info, warn};

/// Routes an operator's output batches to the correct downstream queues.
///
/// Offers retry with a bounded idle/backoff strategy; once the backoff
/// saturates, the global failure flag is consulted and a set flag aborts
/// the send with a hard engine failure instead of spinning forever.
#[derive(Debug)]
pub enum DownstreamSender {
    /// For pipelines with no downstream consumer.
    Nop,
    Simple(SimpleSender),
    Partitioned(PartitionedSender),
    Composite(CompositeSender),
}

impl DownstreamSender {
    pub fn send(&mut self, batch: &TupleBatch) -> Result<(), EngineError> {
        match self {
            DownstreamSender::Nop => Ok(()),
            DownstreamSender::Simple(sender) => sender.send(batch),
            DownstreamSender::Partitioned(sender) => sender.send(batch),
            DownstreamSender::Composite(sender) => sender.send(batch),
        }
    }
}

/// Offers each source port's tuples to a fixed port of one downstream
/// queue.
#[derive(Debug)]
pub struct SimpleSender {
    /// `(source_port, destination_port)` pairs.
    ports: Vec<(usize, usize)>,
    queue: Arc<DefaultOperatorQueue>,
    idle: BackoffIdleStrategy,
    failure_flag: Arc<AtomicBool>,
}

impl SimpleSender {
    pub fn new(
        queue: Arc<DefaultOperatorQueue>,
        ports: Vec<(usize, usize)>,
        failure_flag: Arc<AtomicBool>,
        config: &DownstreamConfig,
    ) -> Self {
        Self {
            ports,
            queue,
            idle: BackoffIdleStrategy::new(config),
            failure_flag,
        }
    }

    fn send(&mut self, batch: &TupleBatch) -> Result<(), EngineError> {
        for &(source_port, destination_port) in &self.ports {
            let mut tuples: Vec<Tuple> = batch.tuples(source_port).to_vec();
            while !tuples.is_empty() {
                let offered = self.queue.offer(destination_port, &mut tuples);
                if offered > 0 {
                    self.idle.reset();
                } else if self.idle.idle() && self.failure_flag.load(Ordering::Acquire) {
                    return Err(EngineError::EngineFailed);
                }
            }
            self.idle.reset();
        }
        Ok(())
    }
}

/// Computes each output tuple's partition id from the destination region's
/// partition function and routes it to the owning replica's queue, batching
/// per destination replica before offering.
#[derive(Debug)]
pub struct PartitionedSender {
    /// `(source_port, destination_port)` pairs.
    ports: Vec<(usize, usize)>,
    partition_count: usize,
    /// Partition id -> destination replica index.
    distribution: Vec<usize>,
    queues: Vec<Arc<DefaultOperatorQueue>>,
    extractor: PartitionKeyExtractor,
    buffers: Vec<Vec<Tuple>>,
    idle: BackoffIdleStrategy,
    failure_flag: Arc<AtomicBool>,
    ticker: Arc<Ticker>,
}

impl PartitionedSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Vec<Arc<DefaultOperatorQueue>>,
        ports: Vec<(usize, usize)>,
        distribution: &PartitionDistribution,
        extractor: PartitionKeyExtractor,
        failure_flag: Arc<AtomicBool>,
        ticker: Arc<Ticker>,
        config: &DownstreamConfig,
    ) -> Self {
        assert_eq!(
            queues.len(),
            distribution.replica_count(),
            "one destination queue per replica"
        );
        let buffers = (0..queues.len()).map(|_| Vec::new()).collect();
        Self {
            ports,
            partition_count: distribution.partition_count(),
            distribution: (0..distribution.partition_count())
                .map(|partition| distribution.replica_index(partition))
                .collect(),
            queues,
            extractor,
            buffers,
            idle: BackoffIdleStrategy::new(config),
            failure_flag,
            ticker,
        }
    }

    fn send(&mut self, batch: &TupleBatch) -> Result<(), EngineError> {
        for pair in 0..self.ports.len() {
            let (source_port, destination_port) = self.ports[pair];
            for tuple in batch.tuples(source_port) {
                let partition =
                    partition_id(self.extractor.partition_hash(tuple), self.partition_count);
                self.buffers[self.distribution[partition]].push(tuple.clone());
            }

            if self.ticker.try_tick() {
                let now = Instant::now();
                for buffer in &mut self.buffers {
                    if let Some(first) = buffer.first_mut() {
                        first.set_queue_offer_time(now);
                    }
                }
            }

            loop {
                let mut all_done = true;
                let mut progressed = false;
                for (replica, buffer) in self.buffers.iter_mut().enumerate() {
                    if buffer.is_empty() {
                        continue;
                    }
                    if self.queues[replica].offer(destination_port, buffer) > 0 {
                        progressed = true;
                    }
                    if !buffer.is_empty() {
                        all_done = false;
                    }
                }
                if all_done {
                    break;
                }
                if progressed {
                    self.idle.reset();
                } else if self.idle.idle() && self.failure_flag.load(Ordering::Acquire) {
                    for buffer in &mut self.buffers {
                        buffer.clear();
                    }
                    return Err(EngineError::EngineFailed);
                }
            }
            self.idle.reset();
        }
        Ok(())
    }
}

/// Runs an ordered list of senders against the same output, for fan-out to
/// multiple independent consumers.
#[derive(Debug)]
pub struct CompositeSender {
    senders: Vec<DownstreamSender>,
}

impl CompositeSender {
    pub fn new(senders: Vec<DownstreamSender>) -> Self {
        Self { senders }
    }

    fn send(&mut self, batch: &TupleBatch) -> Result<(), EngineError> {
        for sender in &mut self.senders {
            sender.send(batch)?;
        }
        Ok(())
    }
}

type SendCompletion = Result<(), EngineError>;

/// Per-replica forwarder enforcing one outstanding downstream send.
///
/// The sender runs on a dedicated forwarder thread; the runner hands a
/// batch over, keeps invoking, and awaits the completion before issuing the
/// next send. After [`DownstreamLink::shutdown`] the link rejects further
/// sends, standing in for the fail-fast sender of a replica that already
/// signaled completion to its consumers.
#[derive(Debug)]
pub struct DownstreamLink {
    replica: PipelineReplicaId,
    tx: Option<Sender<(TupleBatch, Sender<SendCompletion>)>>,
    pending: Option<Receiver<SendCompletion>>,
    thread: Option<JoinHandle<()>>,
}

impl DownstreamLink {
    pub fn new(replica: PipelineReplicaId, mut sender: DownstreamSender) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<(TupleBatch, Sender<SendCompletion>)>(1);
        let thread_replica = replica.clone();
        let thread = Builder::new()
            .name(format!("{}-downstream", replica.thread_name()))
            .spawn(move || {
                for (batch, done) in rx.iter() {
                    let result = sender.send(&batch);
                    let failed = result.is_err();
                    if done.send(result).is_err() || failed {
                        if failed {
                            warn!(replica = %thread_replica, "downstream send failed, forwarder exiting");
                        }
                        break;
                    }
                }
            })?;
        Ok(Self {
            replica,
            tx: Some(tx),
            pending: None,
            thread: Some(thread),
        })
    }

    /// Issues a send, awaiting the previously issued one first so that at
    /// most one send is outstanding and per-replica output order holds.
    pub fn forward(&mut self, batch: TupleBatch) -> Result<(), EngineError> {
        self.await_pending()?;
        let tx = self.tx.as_ref().ok_or_else(|| EngineError::SendAfterStopped {
            replica: self.replica.to_string(),
        })?;
        let (done_tx, done_rx) = bounded(1);
        tx.send((batch, done_tx))
            .map_err(|_| EngineError::AbnormalTermination {
                replica: self.replica.to_string(),
                reason: "downstream forwarder terminated".to_string(),
            })?;
        self.pending = Some(done_rx);
        Ok(())
    }

    /// Blocks until the outstanding send, if any, has completed.
    pub fn await_pending(&mut self) -> Result<(), EngineError> {
        match self.pending.take() {
            None => Ok(()),
            Some(done) => match done.recv() {
                Ok(result) => result,
                Err(_) => Err(EngineError::AbnormalTermination {
                    replica: self.replica.to_string(),
                    reason: "downstream forwarder terminated mid-send".to_string(),
                }),
            },
        }
    }

    /// Flushes the outstanding send and stops the forwarder. Further
    /// [`DownstreamLink::forward`] calls fail fast.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        let flushed = self.await_pending();
        self.tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!(replica = %self.replica, "downstream sender stopped");
        flushed
    }
}

impl Drop for DownstreamLink {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tuplequeue::ThreadingMode;

    fn batch_of(values: &[i64]) -> TupleBatch {
        let mut batch = TupleBatch::new(1);
        for &value in values {
            batch.add(0, Tuple::of("key", value));
        }
        batch
    }

    fn shared_queue(capacity: usize) -> Arc<DefaultOperatorQueue> {
        Arc::new(DefaultOperatorQueue::new(
            "down",
            1,
            ThreadingMode::MultiThreaded,
            capacity,
        ))
    }

    #[test]
    fn simple_sender_offers_batch_in_order() {
        let queue = shared_queue(16);
        let mut sender = SimpleSender::new(
            Arc::clone(&queue),
            vec![(0, 0)],
            Arc::new(AtomicBool::new(false)),
            &DownstreamConfig::default(),
        );
        sender.send(&batch_of(&[1, 2, 3])).unwrap();
        let mut drainer =
            crate::tuplequeue::Drainer::Greedy(crate::tuplequeue::GreedyDrainer::new());
        queue.drain(&mut drainer);
        let (_, drained) = drainer.take_result().unwrap();
        let values: Vec<i64> = drained
            .tuples(0)
            .iter()
            .map(|tuple| tuple.get("key").unwrap().as_int().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn partitioned_sender_routes_by_distribution() {
        let distribution = PartitionDistribution::new(4, 2);
        let queues = vec![shared_queue(64), shared_queue(64)];
        let extractor = PartitionKeyExtractor::new(vec!["key".to_string()]);
        let mut sender = PartitionedSender::new(
            queues.clone(),
            vec![(0, 0)],
            &distribution,
            extractor.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Ticker::default()),
            &DownstreamConfig::default(),
        );

        let values: Vec<i64> = (0..100).collect();
        sender.send(&batch_of(&values)).unwrap();

        let mut routed = 0;
        for (replica, queue) in queues.iter().enumerate() {
            let mut drainer =
                crate::tuplequeue::Drainer::Greedy(crate::tuplequeue::GreedyDrainer::new());
            queue.drain(&mut drainer);
            if let Some((_, drained)) = drainer.take_result() {
                for tuple in drained.tuples(0) {
                    let partition =
                        partition_id(extractor.partition_hash(tuple), 4);
                    assert_eq!(distribution.replica_index(partition), replica);
                    routed += 1;
                }
            }
        }
        assert_eq!(routed, 100);
    }

    #[test]
    fn composite_sender_fans_out_to_every_consumer() {
        let first = shared_queue(16);
        let second = shared_queue(16);
        let flag = Arc::new(AtomicBool::new(false));
        let config = DownstreamConfig::default();
        let mut sender = DownstreamSender::Composite(CompositeSender::new(vec![
            DownstreamSender::Simple(SimpleSender::new(
                Arc::clone(&first),
                vec![(0, 0)],
                Arc::clone(&flag),
                &config,
            )),
            DownstreamSender::Simple(SimpleSender::new(
                Arc::clone(&second),
                vec![(0, 0)],
                flag,
                &config,
            )),
        ]));
        sender.send(&batch_of(&[1, 2])).unwrap();
        for queue in [&first, &second] {
            let mut drainer =
                crate::tuplequeue::Drainer::Greedy(crate::tuplequeue::GreedyDrainer::new());
            queue.drain(&mut drainer);
            let (_, drained) = drainer.take_result().unwrap();
            assert_eq!(drained.tuple_count(0), 2);
        }
    }

    #[test]
    fn saturated_backoff_aborts_on_failure_flag() {
        // Queue of capacity 1 that nobody drains: the second tuple can
        // never be offered.
        let queue = shared_queue(1);
        let failure_flag = Arc::new(AtomicBool::new(true));
        let mut sender = SimpleSender::new(
            queue,
            vec![(0, 0)],
            failure_flag,
            &DownstreamConfig {
                max_spins: 1,
                max_yields: 1,
                min_park_micros: 1,
                max_park_micros: 2,
            },
        );
        let result = sender.send(&batch_of(&[1, 2]));
        assert!(matches!(result, Err(EngineError::EngineFailed)));
    }

    #[test]
    fn link_rejects_sends_after_shutdown() {
        let replica = PipelineReplicaId::new(crate::pipeline::PipelineId::new(0, 0), 0);
        let mut link = DownstreamLink::new(replica, DownstreamSender::Nop).unwrap();
        link.forward(batch_of(&[1])).unwrap();
        link.shutdown().unwrap();
        assert!(matches!(
            link.forward(batch_of(&[2])),
            Err(EngineError::SendAfterStopped { .. })
        ));
    }
}
