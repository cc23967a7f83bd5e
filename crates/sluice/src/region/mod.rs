//! Regions: maximal runs of compatible operators, their execution plans,
//! and the manager that builds, merges, splits and rebalances them.

mod manager;
mod transform;

pub use manager::RegionManager;

use crate::error::EngineError;
use crate::pipeline::{PipelineId, SharedPipelineReplica};
use sluice_api::{OperatorDef, OperatorType};

/// A maximal run of flow operators sharing a replication/partitioning
/// contract.
#[derive(Clone, Debug)]
pub struct RegionDef {
    region_id: u32,
    region_type: OperatorType,
    partition_field_names: Vec<String>,
    operators: Vec<OperatorDef>,
}

impl RegionDef {
    pub fn new(
        region_id: u32,
        region_type: OperatorType,
        partition_field_names: Vec<String>,
        operators: Vec<OperatorDef>,
    ) -> Result<Self, EngineError> {
        if operators.is_empty() {
            return Err(EngineError::InvalidExecutionPlan {
                region_id,
                reason: "region has no operators".to_string(),
            });
        }
        match region_type {
            OperatorType::PartitionedStateful if partition_field_names.is_empty() => {
                return Err(EngineError::InvalidExecutionPlan {
                    region_id,
                    reason: "partitioned-stateful region without partition fields".to_string(),
                });
            }
            OperatorType::Stateless | OperatorType::Stateful
                if !partition_field_names.is_empty() =>
            {
                return Err(EngineError::InvalidExecutionPlan {
                    region_id,
                    reason: "partition fields on a non-partitioned region".to_string(),
                });
            }
            _ => {}
        }
        for operator in &operators {
            let compatible = operator.operator_type() == region_type
                || operator.operator_type() == OperatorType::Stateless;
            if !compatible {
                return Err(EngineError::InvalidExecutionPlan {
                    region_id,
                    reason: format!(
                        "operator {} of type {:?} does not fit region type {:?}",
                        operator.id(),
                        operator.operator_type(),
                        region_type
                    ),
                });
            }
            // Partitioned operators may key on a superset of the region's
            // partition fields; the region fields must be a prefix so that
            // all operators agree on partition placement.
            if operator.operator_type() == OperatorType::PartitionedStateful {
                let fields = operator.partition_field_names();
                let prefix_matches = fields.len() >= partition_field_names.len()
                    && fields
                        .iter()
                        .zip(partition_field_names.iter())
                        .all(|(a, b)| a == b);
                if !prefix_matches {
                    return Err(EngineError::InvalidExecutionPlan {
                        region_id,
                        reason: format!(
                            "partition fields of operator {} do not extend the region's",
                            operator.id()
                        ),
                    });
                }
            }
        }
        Ok(Self {
            region_id,
            region_type,
            partition_field_names,
            operators,
        })
    }

    pub fn region_id(&self) -> u32 {
        self.region_id
    }

    pub fn region_type(&self) -> OperatorType {
        self.region_type
    }

    pub fn partition_field_names(&self) -> &[String] {
        &self.partition_field_names
    }

    pub fn operators(&self) -> &[OperatorDef] {
        &self.operators
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }
}

/// A region's current runtime shape: pipeline boundaries and replica count.
///
/// Plans are replaced, not mutated: merge, split and rebalance install a new
/// plan under the same region id.
#[derive(Clone, Debug)]
pub struct RegionExecutionPlan {
    region_def: RegionDef,
    pipeline_start_indices: Vec<usize>,
    replica_count: usize,
}

impl RegionExecutionPlan {
    pub fn new(
        region_def: RegionDef,
        mut pipeline_start_indices: Vec<usize>,
        replica_count: usize,
    ) -> Result<Self, EngineError> {
        let region_id = region_def.region_id();
        let valid_replicas = match region_def.region_type() {
            OperatorType::Stateful | OperatorType::Stateless => replica_count == 1,
            OperatorType::PartitionedStateful => replica_count > 0,
        };
        if !valid_replicas {
            return Err(EngineError::InvalidExecutionPlan {
                region_id,
                reason: format!(
                    "invalid replica count {replica_count} for {:?} region",
                    region_def.region_type()
                ),
            });
        }
        if pipeline_start_indices.first() != Some(&0) {
            pipeline_start_indices.insert(0, 0);
        }
        let mut previous: Option<usize> = None;
        for &index in &pipeline_start_indices {
            let increasing = previous.map_or(true, |previous| index > previous);
            if !increasing || index >= region_def.operator_count() {
                return Err(EngineError::InvalidExecutionPlan {
                    region_id,
                    reason: format!("invalid pipeline start indices {pipeline_start_indices:?}"),
                });
            }
            previous = Some(index);
        }
        Ok(Self {
            region_def,
            pipeline_start_indices,
            replica_count,
        })
    }

    pub fn region_id(&self) -> u32 {
        self.region_def.region_id()
    }

    pub fn region_def(&self) -> &RegionDef {
        &self.region_def
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipeline_start_indices.len()
    }

    pub fn pipeline_start_indices(&self) -> &[usize] {
        &self.pipeline_start_indices
    }

    pub fn pipeline_start_index(&self, pipeline_index: usize) -> usize {
        self.pipeline_start_indices[pipeline_index]
    }

    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.pipeline_start_indices
            .iter()
            .map(|&start| PipelineId::new(self.region_id(), start))
            .collect()
    }

    /// Index of the pipeline whose first operator sits at `start_index`.
    pub fn pipeline_index(&self, start_index: usize) -> Result<usize, EngineError> {
        self.pipeline_start_indices
            .iter()
            .position(|&index| index == start_index)
            .ok_or_else(|| EngineError::InvalidExecutionPlan {
                region_id: self.region_id(),
                reason: format!("no pipeline starts at operator index {start_index}"),
            })
    }

    pub fn operator_count_by_pipeline_index(&self, pipeline_index: usize) -> usize {
        self.operator_defs_by_pipeline_index(pipeline_index).len()
    }

    pub fn operator_defs_by_pipeline_index(&self, pipeline_index: usize) -> &[OperatorDef] {
        let start = self.pipeline_start_indices[pipeline_index];
        let end = self
            .pipeline_start_indices
            .get(pipeline_index + 1)
            .copied()
            .unwrap_or(self.region_def.operator_count());
        &self.region_def.operators()[start..end]
    }

    pub fn with_replica_count(&self, replica_count: usize) -> Result<Self, EngineError> {
        Self::new(
            self.region_def.clone(),
            self.pipeline_start_indices.clone(),
            replica_count,
        )
    }

    pub fn with_pipeline_start_indices(
        &self,
        pipeline_start_indices: Vec<usize>,
    ) -> Result<Self, EngineError> {
        Self::new(
            self.region_def.clone(),
            pipeline_start_indices,
            self.replica_count,
        )
    }
}

/// The runtime instantiation of an execution plan: one pipeline replica per
/// (pipeline index, replica index) pair.
///
/// Replicas are shared with their runner threads; see
/// [`SharedPipelineReplica`] for the ownership contract.
#[derive(Debug)]
pub struct Region {
    plan: RegionExecutionPlan,
    /// Indexed `[pipeline_index][replica_index]`.
    replicas: Vec<Vec<SharedPipelineReplica>>,
}

impl Region {
    pub fn new(plan: RegionExecutionPlan, replicas: Vec<Vec<SharedPipelineReplica>>) -> Self {
        assert_eq!(
            replicas.len(),
            plan.pipeline_count(),
            "replica matrix does not match the plan's pipeline count"
        );
        for row in &replicas {
            assert_eq!(
                row.len(),
                plan.replica_count(),
                "replica matrix does not match the plan's replica count"
            );
        }
        Self { plan, replicas }
    }

    pub fn region_id(&self) -> u32 {
        self.plan.region_id()
    }

    pub fn plan(&self) -> &RegionExecutionPlan {
        &self.plan
    }

    pub fn pipeline_replicas(&self, pipeline_index: usize) -> &[SharedPipelineReplica] {
        &self.replicas[pipeline_index]
    }

    pub fn replica(&self, pipeline_index: usize, replica_index: usize) -> &SharedPipelineReplica {
        &self.replicas[pipeline_index][replica_index]
    }

    pub fn into_parts(self) -> (RegionExecutionPlan, Vec<Vec<SharedPipelineReplica>>) {
        (self.plan, self.replicas)
    }
}
