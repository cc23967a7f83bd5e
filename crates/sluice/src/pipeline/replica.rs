use crate::error::{EngineError, OperatorShutdownFailure};
use crate::pipeline::{
    OperatorReplica, OperatorReplicaStatus, PipelineReplicaId, PipelineReplicaMeter,
    UpstreamContext,
};
use crate::tuplequeue::{Drainer, GreedyDrainer, OperatorQueue};
use sluice_api::TupleBatch;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// A pipeline replica shared between the region registry and its runner
/// thread. The lock enforces the ownership contract: structural operations
/// touch a replica only while its runner is not mid-invocation.
pub type SharedPipelineReplica = Arc<Mutex<PipelineReplica>>;

/// An ordered chain of operator replicas sharing one thread of execution
/// and one upstream ("self") queue.
///
/// Only the head operator reads the self queue; interior operators are fed
/// by their predecessor's output. Adjacent operators are port-aligned:
/// output port `p` of one operator feeds input port `p` of the next.
pub struct PipelineReplica {
    id: PipelineReplicaId,
    operators: Vec<OperatorReplica>,
    self_queue: OperatorQueue,
    meter: Arc<PipelineReplicaMeter>,
    /// Dedicated greedy drainer moving buffered tuples from the self queue
    /// into the head operator's queue.
    self_queue_drainer: Drainer,
    initialized: bool,
}

impl PipelineReplica {
    pub fn new(
        id: PipelineReplicaId,
        operators: Vec<OperatorReplica>,
        self_queue: OperatorQueue,
        meter: Arc<PipelineReplicaMeter>,
    ) -> Self {
        assert!(!operators.is_empty(), "pipeline replica without operators");
        Self {
            id,
            operators,
            self_queue,
            meter,
            self_queue_drainer: Drainer::Greedy(GreedyDrainer::new()),
            initialized: false,
        }
    }

    pub fn into_shared(self) -> SharedPipelineReplica {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> &PipelineReplicaId {
        &self.id
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    pub fn operator(&self, index: usize) -> &OperatorReplica {
        &self.operators[index]
    }

    pub fn operator_mut(&mut self, index: usize) -> &mut OperatorReplica {
        &mut self.operators[index]
    }

    pub fn self_queue(&self) -> &OperatorQueue {
        &self.self_queue
    }

    pub fn self_queue_mut(&mut self) -> &mut OperatorQueue {
        &mut self.self_queue
    }

    pub fn meter(&self) -> &Arc<PipelineReplicaMeter> {
        &self.meter
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Splits this replica into its parts. Used by the pipeline
    /// transformer when merging and splitting pipelines.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        PipelineReplicaId,
        Vec<OperatorReplica>,
        OperatorQueue,
        Arc<PipelineReplicaMeter>,
        bool,
    ) {
        (
            self.id,
            self.operators,
            self.self_queue,
            self.meter,
            self.initialized,
        )
    }

    /// Reassembles a replica from transformed parts, preserving its
    /// initialization state.
    pub fn compose(
        id: PipelineReplicaId,
        operators: Vec<OperatorReplica>,
        self_queue: OperatorQueue,
        meter: Arc<PipelineReplicaMeter>,
        initialized: bool,
    ) -> Self {
        let mut replica = Self::new(id, operators, self_queue, meter);
        replica.initialized = initialized;
        replica
    }

    /// Initializes all operators. The head operator receives the given
    /// upstream connectivity; interior operators start with all ports open
    /// and observe closures through in-pipeline completion propagation.
    pub fn init(&mut self, upstream: UpstreamContext) -> Result<(), EngineError> {
        assert!(!self.initialized, "pipeline replica {} initialized twice", self.id);
        info!(replica = %self.id, operators = self.operators.len(), "initializing pipeline replica");
        for (index, operator) in self.operators.iter_mut().enumerate() {
            let context = if index == 0 {
                upstream.clone()
            } else {
                UpstreamContext::open(operator.operator_def().input_port_count())
            };
            operator.init(context)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Index of the last operator that is still invokable, or `None` when
    /// the whole chain has completed.
    pub fn highest_invokable_index(&self) -> Option<usize> {
        self.operators
            .iter()
            .rposition(OperatorReplica::is_invokable)
    }

    pub fn is_completed(&self) -> bool {
        self.highest_invokable_index().is_none()
    }

    /// `true` once the tail operator has completed; the pipeline will not
    /// produce further downstream output even if earlier operators still
    /// consume input.
    pub fn tail_completed(&self) -> bool {
        !matches!(
            self.operators
                .last()
                .expect("pipeline replica without operators")
                .status(),
            OperatorReplicaStatus::Initial
                | OperatorReplicaStatus::Running
                | OperatorReplicaStatus::Completing
        )
    }

    /// Installs a fresher upstream context on the head operator.
    pub fn refresh_upstream(&mut self, upstream: &UpstreamContext) {
        self.operators[0].refresh_upstream(upstream);
    }

    /// Forces the head operator towards completion; the rest of the chain
    /// follows through completion propagation.
    pub fn begin_completion(&mut self) {
        debug!(replica = %self.id, "beginning forced completion");
        self.operators[0].begin_completion();
    }

    /// Runs one invocation pass over the chain and returns the tail
    /// operator's output, if any.
    pub fn invoke(&mut self) -> Result<Option<TupleBatch>, EngineError> {
        assert!(self.initialized, "pipeline replica {} invoked before init", self.id);
        self.transfer_self_queue();

        let Some(highest) = self.highest_invokable_index() else {
            return Ok(None);
        };
        let last_index = self.operators.len() - 1;
        let mut carried: Option<TupleBatch> = None;
        let mut tail_output = None;
        let mut produced = 0;
        for index in 0..=highest {
            let output = self.operators[index].invoke(carried.take())?;
            if self.operators[index].status() == OperatorReplicaStatus::Completed
                && index < last_index
            {
                self.operators[index + 1].close_upstream();
            }
            if let Some(output) = output {
                produced += output.total_tuple_count();
                if index == highest && highest == last_index {
                    tail_output = Some(output);
                } else if index < highest {
                    carried = Some(output);
                }
                // Output of the highest invokable operator is dropped when
                // operators after it have already completed.
            }
        }
        self.meter.on_invocation(produced);
        Ok(tail_output)
    }

    /// Moves everything buffered in the self queue into the head operator's
    /// queue, unless the head is overloaded (backpressure stays in the
    /// multi-threaded self queue, where producers observe it).
    fn transfer_self_queue(&mut self) {
        if matches!(self.self_queue, OperatorQueue::Empty(_)) {
            return;
        }
        let head = &mut self.operators[0];
        if head.queue().is_overloaded() {
            return;
        }
        self.self_queue.drain(&mut self.self_queue_drainer);
        if let Some((_, mut batch)) = self.self_queue_drainer.take_result() {
            for port in 0..batch.port_count() {
                let tuples = batch.take(port);
                if !tuples.is_empty() {
                    head.queue_mut().force_offer(port, tuples);
                }
            }
        }
    }

    /// Shuts down every operator, collecting failures instead of aborting
    /// on the first one.
    pub fn shutdown(&mut self) -> Vec<OperatorShutdownFailure> {
        let mut failures = Vec::new();
        for operator in &mut self.operators {
            if let Err(error) = operator.shutdown() {
                failures.push(OperatorShutdownFailure {
                    operator_id: operator.operator_id().to_string(),
                    error: error.into(),
                });
            }
        }
        failures
    }
}

impl std::fmt::Debug for PipelineReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineReplica")
            .field("id", &self.id)
            .field("operators", &self.operators)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
