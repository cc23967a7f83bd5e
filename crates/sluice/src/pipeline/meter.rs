use crate::pipeline::PipelineReplicaId;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sampling mask: latency is traced on one out of every `TICK_MASK + 1`
/// invocations.
const TICK_MASK: u64 = 0xFF;

/// Lock-free sampling ticker shared between a replica's runner thread and
/// its downstream forwarder.
#[derive(Debug, Default)]
pub struct Ticker {
    count: AtomicU64,
}

impl Ticker {
    /// `true` once per `TICK_MASK + 1` calls.
    pub fn try_tick(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed) & TICK_MASK == 0
    }
}

/// Per-replica invocation and tuple counters, emitted through the `metrics`
/// facade.
#[derive(Debug)]
pub struct PipelineReplicaMeter {
    replica: String,
    ticker: Arc<Ticker>,
}

impl PipelineReplicaMeter {
    pub fn new(id: &PipelineReplicaId) -> Self {
        Self {
            replica: id.to_string(),
            ticker: Arc::new(Ticker::default()),
        }
    }

    pub fn on_invocation(&self, tuple_count: usize) {
        counter!("sluice_pipeline_invocations_total", "replica" => self.replica.clone())
            .increment(1);
        if tuple_count > 0 {
            counter!("sluice_pipeline_tuples_total", "replica" => self.replica.clone())
                .increment(tuple_count as u64);
        }
    }

    pub fn ticker(&self) -> Arc<Ticker> {
        Arc::clone(&self.ticker)
    }
}
