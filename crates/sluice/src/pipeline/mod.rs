//! Pipeline replicas: the per-thread chain of operator replicas, the runner
//! state machine driving it, and the downstream senders forwarding its
//! output.

mod meter;
mod operator_replica;
mod replica;
mod runner;
mod sender;
mod supplier;

pub use meter::{PipelineReplicaMeter, Ticker};
pub use operator_replica::{OperatorReplica, OperatorReplicaStatus};
pub use replica::{PipelineReplica, SharedPipelineReplica};
pub use runner::{CommandFuture, PipelineReplicaRunner, RunnerHandle, RunnerStatus};
pub use sender::{
    CompositeSender, DownstreamLink, DownstreamSender, PartitionedSender, SimpleSender,
};
pub use supplier::OutputSupplier;

use crate::error::EngineError;
use sluice_api::PortState;
use std::fmt::{self, Display, Formatter};

/// Identifies a pipeline: its region and the in-region index of its first
/// operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId {
    pub region_id: u32,
    pub pipeline_start_index: usize,
}

impl PipelineId {
    pub fn new(region_id: u32, pipeline_start_index: usize) -> Self {
        Self {
            region_id,
            pipeline_start_index,
        }
    }
}

impl Display for PipelineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "P[{},{}]", self.region_id, self.pipeline_start_index)
    }
}

/// Identifies one replica of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineReplicaId {
    pub pipeline_id: PipelineId,
    pub replica_index: usize,
}

impl PipelineReplicaId {
    pub fn new(pipeline_id: PipelineId, replica_index: usize) -> Self {
        Self {
            pipeline_id,
            replica_index,
        }
    }

    /// Thread name for this replica's runner.
    pub fn thread_name(&self) -> String {
        format!(
            "sluice-pipeline-{}-{}-{}",
            self.pipeline_id.region_id, self.pipeline_id.pipeline_start_index, self.replica_index
        )
    }
}

impl Display for PipelineReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.pipeline_id, self.replica_index)
    }
}

/// Connectivity of an operator's upstream ports, versioned so replicas can
/// detect changes cheaply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamContext {
    version: u64,
    port_states: Vec<PortState>,
}

impl UpstreamContext {
    /// All ports open, version 0.
    pub fn open(port_count: usize) -> Self {
        Self {
            version: 0,
            port_states: vec![PortState::Open; port_count],
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn port_states(&self) -> &[PortState] {
        &self.port_states
    }

    /// `true` once every port is closed. An operator without input ports is
    /// never externally closed; it completes by declaring `Never`.
    pub fn all_closed(&self) -> bool {
        !self.port_states.is_empty()
            && self.port_states.iter().all(|state| *state == PortState::Closed)
    }

    /// A successor context with `port` closed and the version bumped.
    pub fn with_closed_port(&self, port: usize) -> Self {
        let mut port_states = self.port_states.clone();
        port_states[port] = PortState::Closed;
        Self {
            version: self.version + 1,
            port_states,
        }
    }

    /// A successor context with every port closed and the version bumped.
    pub fn with_all_closed(&self) -> Self {
        Self {
            version: self.version + 1,
            port_states: vec![PortState::Closed; self.port_states.len()],
        }
    }
}

/// The narrow callback surface through which the adaptation and lifecycle
/// machinery is driven.
pub trait Supervisor: Send + Sync {
    /// A replica finished its run naturally. Sent exactly once per replica.
    fn notify_replica_completed(&self, id: &PipelineReplicaId);

    /// A replica terminated with a failure.
    fn notify_replica_failed(&self, id: &PipelineReplicaId, cause: &EngineError);

    /// A replica will produce no further downstream output, although it may
    /// still be consuming input.
    fn notify_stopped_sending_downstream(&self, id: &PipelineReplicaId);

    /// The freshest upstream connectivity for a replica's head operator, if
    /// it changed since the version given.
    fn upstream_context(
        &self,
        id: &PipelineReplicaId,
        current_version: u64,
    ) -> Option<UpstreamContext>;
}
