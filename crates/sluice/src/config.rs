//! Engine configuration.
//!
//! Plain-old-data knobs consumed by name, resolved before region
//! construction. Every struct deserializes with full defaults so a partial
//! config document only overrides what it names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub tuple_queue: TupleQueueConfig,
    pub partition_service: PartitionServiceConfig,
    pub drainer: DrainerConfig,
    pub pipeline_runner: PipelineRunnerConfig,
    pub downstream: DownstreamConfig,
    pub region_manager: RegionManagerConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TupleQueueConfig {
    /// Advisory capacity of a single tuple queue. Multi-threaded queues
    /// reject offers beyond it; single-threaded queues only report it.
    pub capacity: usize,
    /// A partitioned operator queue reports itself overloaded once its
    /// total drainable key count reaches this bound.
    pub max_drainable_key_count: usize,
}

impl Default for TupleQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_drainable_key_count: 4096,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionServiceConfig {
    /// Number of hash buckets the partition-key space is divided into.
    pub partition_count: usize,
}

impl Default for PartitionServiceConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainerConfig {
    /// Upper bound on how long a blocking drainer waits for its queue to
    /// satisfy the current strategy before giving up for this invocation.
    pub drain_timeout_ms: u64,
}

impl DrainerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineRunnerConfig {
    /// Bound on a paused runner's wait between command checks.
    pub wait_timeout_ms: u64,
}

impl PipelineRunnerConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for PipelineRunnerConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 1000,
        }
    }
}

/// Idle-strategy parameters for the bounded backoff used when a downstream
/// queue cannot accept an offer immediately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    pub max_spins: u64,
    pub max_yields: u64,
    pub min_park_micros: u64,
    pub max_park_micros: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            max_spins: 100,
            max_yields: 100,
            min_park_micros: 1,
            max_park_micros: 1000,
        }
    }
}

/// Which output buffer the terminal operator of the whole flow gets.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailOutputSupplierKind {
    /// Reuse one cached buffer across invocations (the interior-operator
    /// discipline).
    #[default]
    Cached,
    /// Allocate a fresh buffer per invocation, for sinks that keep the
    /// batch beyond the invocation.
    Fresh,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionManagerConfig {
    pub tail_output_supplier: TailOutputSupplierKind,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let config: SluiceConfig =
            serde_json::from_str(r#"{"tuple_queue": {"capacity": 16}}"#).unwrap();
        assert_eq!(config.tuple_queue.capacity, 16);
        assert_eq!(
            config.tuple_queue.max_drainable_key_count,
            TupleQueueConfig::default().max_drainable_key_count
        );
        assert_eq!(config.partition_service.partition_count, 271);
    }
}
