use crate::error::EngineError;
use crate::kvstore::OperatorKvStore;
use crate::pipeline::{OutputSupplier, PipelineReplicaId, UpstreamContext};
use crate::tuplequeue::{DrainerPool, OperatorQueue};
use sluice_api::{
    InitContext, InvocationContext, InvocationReason, OperatorDef, SchedulingStrategy,
    SchedulingStrategySlot, TupleBatch,
};
use tracing::{debug, info, warn};

/// Lifecycle of one operator replica.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorReplicaStatus {
    Initial,
    Running,
    /// Upstream closed (or completion was forced); the operator is invoked
    /// with the greedy drainer until its queue is empty, then flushed once
    /// more and completed.
    Completing,
    Completed,
    ShutDown,
}

/// One operator instance bound to a queue, a key-value store, a drainer
/// pool and an output supplier, invoked by its pipeline replica's thread.
pub struct OperatorReplica {
    replica_id: PipelineReplicaId,
    def: OperatorDef,
    operator: Box<dyn sluice_api::Operator>,
    queue: OperatorQueue,
    kv_store: OperatorKvStore,
    drainer_pool: DrainerPool,
    output_supplier: OutputSupplier,
    status: OperatorReplicaStatus,
    strategy: SchedulingStrategy,
    upstream: UpstreamContext,
}

impl OperatorReplica {
    pub fn new(
        replica_id: PipelineReplicaId,
        def: OperatorDef,
        queue: OperatorQueue,
        kv_store: OperatorKvStore,
        drainer_pool: DrainerPool,
        output_supplier: OutputSupplier,
    ) -> Self {
        let operator = def.create_operator();
        let input_port_count = def.input_port_count();
        Self {
            replica_id,
            def,
            operator,
            queue,
            kv_store,
            drainer_pool,
            output_supplier,
            status: OperatorReplicaStatus::Initial,
            strategy: SchedulingStrategy::Never,
            upstream: UpstreamContext::open(input_port_count),
        }
    }

    pub fn operator_def(&self) -> &OperatorDef {
        &self.def
    }

    pub fn operator_id(&self) -> &str {
        self.def.id()
    }

    pub fn status(&self) -> OperatorReplicaStatus {
        self.status
    }

    pub fn strategy(&self) -> &SchedulingStrategy {
        &self.strategy
    }

    pub fn queue(&self) -> &OperatorQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut OperatorQueue {
        &mut self.queue
    }

    pub fn kv_store_mut(&mut self) -> &mut OperatorKvStore {
        &mut self.kv_store
    }

    pub fn drainer_pool_mut(&mut self) -> &mut DrainerPool {
        &mut self.drainer_pool
    }

    pub fn upstream_version(&self) -> u64 {
        self.upstream.version()
    }

    pub fn is_invokable(&self) -> bool {
        matches!(
            self.status,
            OperatorReplicaStatus::Running | OperatorReplicaStatus::Completing
        )
    }

    /// Initializes the operator and installs its declared strategy.
    pub fn init(&mut self, upstream: UpstreamContext) -> Result<SchedulingStrategy, EngineError> {
        assert_eq!(
            self.status,
            OperatorReplicaStatus::Initial,
            "operator {} initialized twice",
            self.def.id()
        );
        self.upstream = upstream;
        let partition_fields = self.def.partition_field_names().to_vec();
        let port_states = self.upstream.port_states().to_vec();
        let ctx = InitContext::new(
            self.def.id(),
            self.def.input_port_count(),
            self.def.output_port_count(),
            &partition_fields,
            &port_states,
        );
        let strategy = self
            .operator
            .init(&ctx)
            .map_err(|cause| EngineError::OperatorFailed {
                operator_id: self.def.id().to_string(),
                cause,
            })?;
        info!(
            operator_id = %self.def.id(),
            replica = %self.replica_id,
            ?strategy,
            "operator initialized"
        );
        self.status = OperatorReplicaStatus::Running;
        self.apply_strategy(strategy.clone());
        Ok(strategy)
    }

    fn apply_strategy(&mut self, strategy: SchedulingStrategy) {
        match &strategy {
            SchedulingStrategy::Never => {
                if self.status == OperatorReplicaStatus::Running {
                    debug!(operator_id = %self.def.id(), "operator declared it is done");
                    self.status = OperatorReplicaStatus::Completed;
                }
            }
            SchedulingStrategy::WhenTuplesAvailable {
                counts, by_port, ..
            } => {
                self.queue.set_tuple_counts(counts, *by_port);
            }
            SchedulingStrategy::WhenAvailable => {}
        }
        self.strategy = strategy;
    }

    /// Installs a fresher upstream context for the head operator of a
    /// pipeline. Closing the last open port moves a running operator to
    /// `Completing`.
    pub fn refresh_upstream(&mut self, upstream: &UpstreamContext) {
        if upstream.version() <= self.upstream.version() {
            return;
        }
        self.upstream = upstream.clone();
        if self.status == OperatorReplicaStatus::Running && self.upstream.all_closed() {
            info!(operator_id = %self.def.id(), "all upstream ports closed, completing");
            self.status = OperatorReplicaStatus::Completing;
        }
    }

    /// Closes every upstream port. Used when the predecessor operator in
    /// the pipeline completes.
    pub fn close_upstream(&mut self) {
        let closed = self.upstream.with_all_closed();
        self.refresh_upstream(&closed);
    }

    /// Forces the operator towards completion regardless of upstream
    /// connectivity. Used by the stop path, where source operators have no
    /// ports that could close.
    pub fn begin_completion(&mut self) {
        if self.status == OperatorReplicaStatus::Running {
            self.upstream = self.upstream.with_all_closed();
            self.status = OperatorReplicaStatus::Completing;
        }
    }

    /// Drains input per the current strategy and invokes the operator once.
    /// Returns the produced output, if any.
    ///
    /// `input` is the predecessor operator's output; it is buffered into
    /// this operator's queue before draining, so scheduling thresholds apply
    /// uniformly whether data arrives from another pipeline or from the same
    /// chain.
    pub fn invoke(
        &mut self,
        input: Option<TupleBatch>,
    ) -> Result<Option<TupleBatch>, EngineError> {
        if let Some(mut input) = input {
            for port in 0..input.port_count().min(self.def.input_port_count()) {
                let tuples = input.take(port);
                if !tuples.is_empty() {
                    self.queue.force_offer(port, tuples);
                }
            }
        }

        if !self.is_invokable() {
            return Ok(None);
        }

        let mut completing_flush = false;
        let (key, batch, reason) = match self.status {
            OperatorReplicaStatus::Running => {
                let drainer = self.drainer_pool.acquire(&self.strategy);
                self.queue.drain(drainer);
                match drainer.take_result() {
                    Some((key, batch)) => (key, batch, InvocationReason::Success),
                    None => match self.strategy {
                        // Operators scheduled on availability run with
                        // whatever is buffered, including nothing.
                        SchedulingStrategy::WhenAvailable => (
                            None,
                            TupleBatch::new(self.def.input_port_count()),
                            InvocationReason::Success,
                        ),
                        _ => return Ok(None),
                    },
                }
            }
            OperatorReplicaStatus::Completing => {
                let drainer = self.drainer_pool.greedy();
                self.queue.drain(drainer);
                match drainer.take_result() {
                    Some((key, batch)) => (key, batch, InvocationReason::InputPortClosed),
                    None => {
                        // Queue is empty: one final flush invocation, then
                        // the operator is done.
                        completing_flush = true;
                        let reason = if self.def.input_port_count() > 0 {
                            InvocationReason::InputPortClosed
                        } else {
                            InvocationReason::Shutdown
                        };
                        (
                            None,
                            TupleBatch::new(self.def.input_port_count()),
                            reason,
                        )
                    }
                }
            }
            _ => unreachable!("invoke on non-invokable operator"),
        };

        let mut output = self.output_supplier.supply();
        let mut slot = SchedulingStrategySlot::new();
        let port_states = self.upstream.port_states().to_vec();
        let key_values = key.as_ref().map(|key| key.values().to_vec());
        let kv_store = self.kv_store.store(key.as_ref());
        let mut ctx = InvocationContext::new(
            reason,
            &batch,
            &mut output,
            kv_store,
            key_values.as_deref(),
            &port_states,
            &mut slot,
        );
        if let Err(cause) = self.operator.invoke(&mut ctx) {
            warn!(operator_id = %self.def.id(), %cause, "operator invocation failed");
            return Err(EngineError::OperatorFailed {
                operator_id: self.def.id().to_string(),
                cause,
            });
        }

        if let Some(next) = slot.take() {
            self.apply_strategy(next);
        }
        if completing_flush && self.status == OperatorReplicaStatus::Completing {
            self.status = OperatorReplicaStatus::Completed;
            info!(operator_id = %self.def.id(), replica = %self.replica_id, "operator completed");
        }

        if output.is_empty() {
            self.output_supplier.recycle(output);
            Ok(None)
        } else {
            Ok(Some(output))
        }
    }

    /// Releases the operator's resources. Failures are returned for the
    /// caller's collect-and-log loop; the replica is marked shut down
    /// either way.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        if self.status == OperatorReplicaStatus::ShutDown {
            return Ok(());
        }
        self.status = OperatorReplicaStatus::ShutDown;
        self.kv_store.release();
        self.queue.clear();
        self.operator
            .shutdown()
            .map_err(|cause| EngineError::OperatorFailed {
                operator_id: self.def.id().to_string(),
                cause,
            })
    }
}

impl std::fmt::Debug for OperatorReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorReplica")
            .field("replica_id", &self.replica_id)
            .field("operator_id", &self.def.id())
            .field("status", &self.status)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
