use crate::OperatorDef;
use indexmap::IndexMap;
use thiserror::Error;

/// One endpoint of a connection: an operator id plus a port index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Port {
    pub operator_id: String,
    pub index: usize,
}

impl Port {
    pub fn new(operator_id: impl Into<String>, index: usize) -> Self {
        Self {
            operator_id: operator_id.into(),
            index,
        }
    }
}

/// Errors raised while defining a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("operator id cannot be empty")]
    EmptyOperatorId,
    #[error("operator {operator_id} is already defined")]
    DuplicateOperator { operator_id: String },
    #[error("operator {operator_id} is not defined")]
    UnknownOperator { operator_id: String },
    #[error("port {port} is out of range for operator {operator_id} ({side} port count {count})")]
    InvalidPort {
        operator_id: String,
        port: usize,
        side: &'static str,
        count: usize,
    },
    #[error("partitioned-stateful operator {operator_id} declares no partition fields")]
    MissingPartitionFields { operator_id: String },
    #[error("operator {operator_id} declares partition fields but is not partitioned-stateful")]
    UnexpectedPartitionFields { operator_id: String },
}

/// An immutable graph of operator definitions and directed port-to-port
/// connections.
///
/// The engine only reads upstream/downstream connection sets per operator id
/// and per port; it never mutates the graph.
#[derive(Clone, Debug)]
pub struct FlowDef {
    operators: IndexMap<String, OperatorDef>,
    connections: Vec<(Port, Port)>,
}

impl FlowDef {
    pub fn builder() -> FlowDefBuilder {
        FlowDefBuilder::default()
    }

    pub fn operator(&self, operator_id: &str) -> Option<&OperatorDef> {
        self.operators.get(operator_id)
    }

    pub fn operators(&self) -> impl Iterator<Item = &OperatorDef> {
        self.operators.values()
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    /// Connections whose destination is `operator_id`.
    pub fn upstream_connections(&self, operator_id: &str) -> Vec<&(Port, Port)> {
        self.connections
            .iter()
            .filter(|(_, to)| to.operator_id == operator_id)
            .collect()
    }

    /// Connections whose source is `operator_id`.
    pub fn downstream_connections(&self, operator_id: &str) -> Vec<&(Port, Port)> {
        self.connections
            .iter()
            .filter(|(from, _)| from.operator_id == operator_id)
            .collect()
    }

    /// `true` if no connection feeds `operator_id` (a source operator).
    pub fn has_no_upstream(&self, operator_id: &str) -> bool {
        self.upstream_connections(operator_id).is_empty()
    }
}

/// Builder validating operator ids and port ranges as connections are added.
#[derive(Default)]
pub struct FlowDefBuilder {
    operators: IndexMap<String, OperatorDef>,
    connections: Vec<(Port, Port)>,
}

impl FlowDefBuilder {
    pub fn add_operator(mut self, def: OperatorDef) -> Result<Self, FlowError> {
        if self.operators.contains_key(def.id()) {
            return Err(FlowError::DuplicateOperator {
                operator_id: def.id().to_string(),
            });
        }
        self.operators.insert(def.id().to_string(), def);
        Ok(self)
    }

    /// Connects the default ports of two operators.
    pub fn connect(self, from: &str, to: &str) -> Result<Self, FlowError> {
        self.connect_ports(from, 0, to, 0)
    }

    pub fn connect_ports(
        mut self,
        from: &str,
        from_port: usize,
        to: &str,
        to_port: usize,
    ) -> Result<Self, FlowError> {
        let from_def = self
            .operators
            .get(from)
            .ok_or_else(|| FlowError::UnknownOperator {
                operator_id: from.to_string(),
            })?;
        if from_port >= from_def.output_port_count() {
            return Err(FlowError::InvalidPort {
                operator_id: from.to_string(),
                port: from_port,
                side: "output",
                count: from_def.output_port_count(),
            });
        }
        let to_def = self
            .operators
            .get(to)
            .ok_or_else(|| FlowError::UnknownOperator {
                operator_id: to.to_string(),
            })?;
        if to_port >= to_def.input_port_count() {
            return Err(FlowError::InvalidPort {
                operator_id: to.to_string(),
                port: to_port,
                side: "input",
                count: to_def.input_port_count(),
            });
        }
        self.connections
            .push((Port::new(from, from_port), Port::new(to, to_port)));
        Ok(self)
    }

    pub fn build(self) -> FlowDef {
        FlowDef {
            operators: self.operators,
            connections: self.connections,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{OperatorType, SchedulingStrategy};
    use std::sync::Arc;

    struct Nop;
    impl crate::Operator for Nop {
        fn init(&mut self, _ctx: &crate::InitContext) -> anyhow::Result<SchedulingStrategy> {
            Ok(SchedulingStrategy::WhenAvailable)
        }
        fn invoke(&mut self, _ctx: &mut crate::InvocationContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn def(id: &str, inputs: usize, outputs: usize) -> OperatorDef {
        OperatorDef::new(
            id,
            OperatorType::Stateless,
            inputs,
            outputs,
            vec![],
            Arc::new(|| Box::new(Nop)),
        )
        .unwrap()
    }

    #[test]
    fn upstream_lookup_follows_connections() {
        let flow = FlowDef::builder()
            .add_operator(def("src", 0, 1))
            .unwrap()
            .add_operator(def("sink", 1, 0))
            .unwrap()
            .connect("src", "sink")
            .unwrap()
            .build();

        assert!(flow.has_no_upstream("src"));
        assert!(!flow.has_no_upstream("sink"));
        assert_eq!(flow.upstream_connections("sink").len(), 1);
        assert_eq!(flow.downstream_connections("src").len(), 1);
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let result = FlowDef::builder()
            .add_operator(def("src", 0, 1))
            .unwrap()
            .add_operator(def("sink", 1, 0))
            .unwrap()
            .connect_ports("src", 1, "sink", 0);
        assert!(matches!(result, Err(FlowError::InvalidPort { .. })));
    }

    #[test]
    fn partition_fields_require_partitioned_stateful() {
        let result = OperatorDef::new(
            "op",
            OperatorType::Stateless,
            1,
            1,
            vec!["key".to_string()],
            Arc::new(|| Box::new(Nop)),
        );
        assert!(matches!(
            result,
            Err(FlowError::UnexpectedPartitionFields { .. })
        ));

        let result = OperatorDef::new(
            "op",
            OperatorType::PartitionedStateful,
            1,
            1,
            vec![],
            Arc::new(|| Box::new(Nop)),
        );
        assert!(matches!(
            result,
            Err(FlowError::MissingPartitionFields { .. })
        ));
    }
}
