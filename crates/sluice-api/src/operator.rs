use crate::{KvStore, SchedulingStrategy, TupleBatch, Value};
use anyhow::Result;

/// Why an operator is being invoked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvocationReason {
    /// The operator's scheduling strategy was satisfied.
    Success,
    /// Some or all upstream ports closed; the operator is invoked with
    /// whatever input remains buffered and should flush any pending state.
    InputPortClosed,
    /// Final invocation before the operator is shut down.
    Shutdown,
}

impl InvocationReason {
    /// `true` for the forced invocation reasons that bypass the operator's
    /// scheduling strategy.
    pub fn is_forced(&self) -> bool {
        !matches!(self, InvocationReason::Success)
    }
}

/// Connectivity of one upstream port as observed by an operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortState {
    Open,
    Closed,
}

/// Slot through which an operator re-declares its scheduling strategy.
///
/// Leaving the slot untouched keeps the current strategy.
#[derive(Debug, Default)]
pub struct SchedulingStrategySlot(Option<SchedulingStrategy>);

impl SchedulingStrategySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, strategy: SchedulingStrategy) {
        self.0 = Some(strategy);
    }

    /// Takes the declared strategy, if any. Called by the engine after each
    /// invocation.
    pub fn take(&mut self) -> Option<SchedulingStrategy> {
        self.0.take()
    }
}

/// Context handed to [`Operator::init`]. Constructed by the engine.
pub struct InitContext<'a> {
    operator_id: &'a str,
    input_port_count: usize,
    output_port_count: usize,
    partition_field_names: &'a [String],
    upstream_port_states: &'a [PortState],
}

impl<'a> InitContext<'a> {
    pub fn new(
        operator_id: &'a str,
        input_port_count: usize,
        output_port_count: usize,
        partition_field_names: &'a [String],
        upstream_port_states: &'a [PortState],
    ) -> Self {
        Self {
            operator_id,
            input_port_count,
            output_port_count,
            partition_field_names,
            upstream_port_states,
        }
    }

    pub fn operator_id(&self) -> &str {
        self.operator_id
    }

    pub fn input_port_count(&self) -> usize {
        self.input_port_count
    }

    pub fn output_port_count(&self) -> usize {
        self.output_port_count
    }

    pub fn partition_field_names(&self) -> &[String] {
        self.partition_field_names
    }

    pub fn upstream_port_states(&self) -> &[PortState] {
        self.upstream_port_states
    }
}

/// Context handed to [`Operator::invoke`]. Constructed by the engine once
/// per invocation; the engine owns the calling convention and thread
/// affinity, the operator owns the business logic.
pub struct InvocationContext<'a> {
    reason: InvocationReason,
    input: &'a TupleBatch,
    output: &'a mut TupleBatch,
    kv_store: Option<&'a mut KvStore>,
    partition_key: Option<&'a [Value]>,
    upstream_port_states: &'a [PortState],
    next_strategy: &'a mut SchedulingStrategySlot,
}

impl<'a> InvocationContext<'a> {
    pub fn new(
        reason: InvocationReason,
        input: &'a TupleBatch,
        output: &'a mut TupleBatch,
        kv_store: Option<&'a mut KvStore>,
        partition_key: Option<&'a [Value]>,
        upstream_port_states: &'a [PortState],
        next_strategy: &'a mut SchedulingStrategySlot,
    ) -> Self {
        Self {
            reason,
            input,
            output,
            kv_store,
            partition_key,
            upstream_port_states,
            next_strategy,
        }
    }

    pub fn reason(&self) -> InvocationReason {
        self.reason
    }

    /// The input drained for this invocation, per port. The returned
    /// borrow is independent of the context, so reading input while
    /// collecting output borrows nothing twice.
    pub fn input(&self) -> &'a TupleBatch {
        self.input
    }

    /// Collector for the operator's output, per output port.
    pub fn output(&mut self) -> &mut TupleBatch {
        self.output
    }

    /// The key-value store for the current partition key, or the replica's
    /// store for non-partitioned stateful operators. `None` for stateless
    /// operators.
    pub fn kv_store(&mut self) -> Option<&mut KvStore> {
        self.kv_store.as_deref_mut()
    }

    /// Values of the partition key this invocation is scoped to, in
    /// partition-field order. `None` unless the operator is
    /// partitioned-stateful.
    pub fn partition_key(&self) -> Option<&'a [Value]> {
        self.partition_key
    }

    pub fn upstream_port_states(&self) -> &'a [PortState] {
        self.upstream_port_states
    }

    /// Declares the strategy for the next invocation. Not calling this keeps
    /// the current strategy.
    pub fn set_next_strategy(&mut self, strategy: SchedulingStrategy) {
        self.next_strategy.set(strategy);
    }
}

/// A dataflow operator. Implementations hold only business-logic state; all
/// queueing, partitioning and threading concerns belong to the engine.
pub trait Operator: Send {
    /// Called once before the first invocation. Returns the operator's
    /// initial scheduling strategy.
    fn init(&mut self, ctx: &InitContext) -> Result<SchedulingStrategy>;

    /// Processes one batch of input. Invoked only when the declared
    /// scheduling strategy holds, or with a forced
    /// [`InvocationReason`] during shutdown and port-closure flushes.
    fn invoke(&mut self, ctx: &mut InvocationContext) -> Result<()>;

    /// Releases operator-owned resources. Called exactly once.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
