use crate::flow::FlowError;
use crate::Operator;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// State discipline of an operator, which determines its region's
/// replication and partitioning contract.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Stateless,
    Stateful,
    PartitionedStateful,
}

/// Produces a fresh operator instance per replica.
pub type OperatorFactory = Arc<dyn Fn() -> Box<dyn Operator> + Send + Sync>;

/// Static descriptor of an operator: identity, state discipline, port
/// counts, partition fields, and the factory that instantiates it.
#[derive(Clone)]
pub struct OperatorDef {
    id: String,
    operator_type: OperatorType,
    input_port_count: usize,
    output_port_count: usize,
    partition_field_names: Vec<String>,
    factory: OperatorFactory,
}

impl OperatorDef {
    pub fn new(
        id: impl Into<String>,
        operator_type: OperatorType,
        input_port_count: usize,
        output_port_count: usize,
        partition_field_names: Vec<String>,
        factory: OperatorFactory,
    ) -> Result<Self, FlowError> {
        let id = id.into();
        if id.is_empty() {
            return Err(FlowError::EmptyOperatorId);
        }
        // Partition fields are meaningful only for partitioned-stateful
        // operators, and mandatory for them.
        match operator_type {
            OperatorType::PartitionedStateful if partition_field_names.is_empty() => {
                return Err(FlowError::MissingPartitionFields { operator_id: id });
            }
            OperatorType::Stateless | OperatorType::Stateful
                if !partition_field_names.is_empty() =>
            {
                return Err(FlowError::UnexpectedPartitionFields { operator_id: id });
            }
            _ => {}
        }
        Ok(Self {
            id,
            operator_type,
            input_port_count,
            output_port_count,
            partition_field_names,
            factory,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operator_type(&self) -> OperatorType {
        self.operator_type
    }

    pub fn input_port_count(&self) -> usize {
        self.input_port_count
    }

    pub fn output_port_count(&self) -> usize {
        self.output_port_count
    }

    pub fn partition_field_names(&self) -> &[String] {
        &self.partition_field_names
    }

    /// Instantiates a fresh operator for one replica.
    pub fn create_operator(&self) -> Box<dyn Operator> {
        (self.factory)()
    }
}

impl Debug for OperatorDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorDef")
            .field("id", &self.id)
            .field("operator_type", &self.operator_type)
            .field("input_port_count", &self.input_port_count)
            .field("output_port_count", &self.output_port_count)
            .field("partition_field_names", &self.partition_field_names)
            .finish_non_exhaustive()
    }
}
