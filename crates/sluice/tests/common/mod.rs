//! Shared fixtures for the engine integration tests.

// Each test binary uses its own subset of these fixtures.
#![allow(dead_code)]

use sluice::config::SluiceConfig;
use sluice::pipeline::{PipelineReplicaId, Supervisor, UpstreamContext};
use sluice::EngineError;
use sluice_api::{
    InitContext, InvocationContext, Operator, OperatorDef, OperatorFactory, OperatorType,
    SchedulingStrategy, DEFAULT_PORT_INDEX,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Supervisor recording every callback, with a controllable upstream
/// context per replica.
#[derive(Default)]
pub struct TestSupervisor {
    pub completed: Mutex<Vec<PipelineReplicaId>>,
    pub failed: Mutex<Vec<(PipelineReplicaId, String)>>,
    pub stopped_sending: Mutex<Vec<PipelineReplicaId>>,
    upstream: Mutex<HashMap<PipelineReplicaId, UpstreamContext>>,
}

impl TestSupervisor {
    pub fn set_upstream(&self, id: PipelineReplicaId, context: UpstreamContext) {
        self.upstream.lock().unwrap().insert(id, context);
    }

    pub fn completed_count(&self, id: &PipelineReplicaId) -> usize {
        self.completed
            .lock()
            .unwrap()
            .iter()
            .filter(|completed| *completed == id)
            .count()
    }
}

impl Supervisor for TestSupervisor {
    fn notify_replica_completed(&self, id: &PipelineReplicaId) {
        self.completed.lock().unwrap().push(id.clone());
    }

    fn notify_replica_failed(&self, id: &PipelineReplicaId, cause: &EngineError) {
        self.failed
            .lock()
            .unwrap()
            .push((id.clone(), cause.to_string()));
    }

    fn notify_stopped_sending_downstream(&self, id: &PipelineReplicaId) {
        self.stopped_sending.lock().unwrap().push(id.clone());
    }

    fn upstream_context(
        &self,
        id: &PipelineReplicaId,
        current_version: u64,
    ) -> Option<UpstreamContext> {
        self.upstream
            .lock()
            .unwrap()
            .get(id)
            .filter(|context| context.version() > current_version)
            .cloned()
    }
}

/// Source operator that produces nothing; used when a flow needs an
/// upstream endpoint whose region is not under test.
pub struct IdleSource;

impl Operator for IdleSource {
    fn init(&mut self, _ctx: &InitContext) -> anyhow::Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::Never)
    }

    fn invoke(&mut self, _ctx: &mut InvocationContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Echoes its input to its output, scheduled on an exact single-port
/// threshold.
pub struct EchoOperator {
    pub threshold: usize,
}

impl Operator for EchoOperator {
    fn init(&mut self, _ctx: &InitContext) -> anyhow::Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::exactly(self.threshold))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<()> {
        for tuple in ctx.input().tuples(DEFAULT_PORT_INDEX) {
            ctx.output().add(DEFAULT_PORT_INDEX, tuple.clone());
        }
        Ok(())
    }
}

/// Partitioned-stateful operator accumulating a per-key tuple count in its
/// key-value store.
pub struct KeyCounter;

impl Operator for KeyCounter {
    fn init(&mut self, _ctx: &InitContext) -> anyhow::Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::at_least(1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<()> {
        let drained = ctx.input().tuple_count(DEFAULT_PORT_INDEX) as i64;
        if drained == 0 {
            return Ok(());
        }
        let store = ctx.kv_store().expect("partitioned operator has state");
        let count = store.get("count").and_then(|value| value.as_int()).unwrap_or(0);
        store.set("count", count + drained);
        Ok(())
    }
}

pub fn operator_def(
    id: &str,
    operator_type: OperatorType,
    input_ports: usize,
    output_ports: usize,
    partition_fields: &[&str],
    factory: OperatorFactory,
) -> OperatorDef {
    OperatorDef::new(
        id,
        operator_type,
        input_ports,
        output_ports,
        partition_fields.iter().map(|field| field.to_string()).collect(),
        factory,
    )
    .expect("valid operator def")
}

pub fn idle_source_def(id: &str) -> OperatorDef {
    operator_def(
        id,
        OperatorType::Stateless,
        0,
        1,
        &[],
        Arc::new(|| Box::new(IdleSource)),
    )
}

/// Installs a compact tracing subscriber once per test binary, so engine
/// lifecycle logs show up under `cargo test -- --nocapture`.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Engine config tuned for fast tests: short blocking waits, small queues.
pub fn test_config(partition_count: usize) -> SluiceConfig {
    init_tracing();
    let mut config = SluiceConfig::default();
    config.partition_service.partition_count = partition_count;
    config.drainer.drain_timeout_ms = 10;
    config.pipeline_runner.wait_timeout_ms = 20;
    config
}
