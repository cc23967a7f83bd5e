//! Public API types for the Sluice dataflow engine.
//!
//! Everything an operator author needs lives here: the [`Tuple`] data model,
//! multi-port [`TupleBatch`]es, the [`Operator`] trait with its invocation
//! contexts, [`SchedulingStrategy`] declarations, operator and flow
//! definitions, and the key-value store surface. The execution engine itself
//! lives in the `sluice` crate and consumes these types without extending
//! them.

mod batch;
mod def;
mod flow;
mod kvstore;
mod operator;
mod scheduling;
mod tuple;
mod value;

pub use batch::TupleBatch;
pub use def::{OperatorDef, OperatorFactory, OperatorType};
pub use flow::{FlowDef, FlowDefBuilder, FlowError, Port};
pub use kvstore::KvStore;
pub use operator::{
    InitContext, InvocationContext, InvocationReason, Operator, PortState, SchedulingStrategySlot,
};
pub use scheduling::{CountCondition, PortCondition, SchedulingStrategy};
pub use tuple::Tuple;
pub use value::Value;

/// Index of the default (and usually only) port of an operator.
pub const DEFAULT_PORT_INDEX: usize = 0;
