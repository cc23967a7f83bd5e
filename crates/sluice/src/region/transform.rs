//! Pipeline restructuring: merging contiguous pipelines into one thread of
//! execution and splitting one pipeline into several.
//!
//! Transforms preserve all operator state and buffered data; only queue
//! threading disciplines, drainer pool disciplines and pipeline identities
//! change. The caller has already validated the request and removed the
//! region from the registry.

use crate::config::SluiceConfig;
use crate::error::EngineError;
use crate::pipeline::{
    OperatorReplica, PipelineId, PipelineReplica, PipelineReplicaId, PipelineReplicaMeter,
    SharedPipelineReplica,
};
use crate::region::Region;
use crate::tuplequeue::{
    DefaultOperatorQueue, Drainer, EmptyOperatorQueue, GreedyDrainer, OperatorQueue, ThreadingMode,
};
use sluice_api::OperatorType;
use std::sync::Arc;
use tracing::info;

/// Restructuring consumes replicas; a replica still referenced by a live
/// runner must not be restructured.
fn unwrap_replica(shared: SharedPipelineReplica) -> PipelineReplica {
    Arc::try_unwrap(shared)
        .unwrap_or_else(|_| panic!("pipeline replica is still referenced by a runner"))
        .into_inner()
        .expect("replica lock")
}

/// Merges the pipelines starting at `start_indices` (contiguous, sorted)
/// into the first of them.
pub(crate) fn merge_pipelines(
    region: Region,
    start_indices: &[usize],
) -> Result<Region, EngineError> {
    let (plan, mut rows) = region.into_parts();
    let first_pipeline_index = plan.pipeline_index(start_indices[0])?;
    let merged_count = start_indices.len();
    info!(
        region_id = plan.region_id(),
        ?start_indices,
        "merging pipelines"
    );

    let new_starts: Vec<usize> = plan
        .pipeline_start_indices()
        .iter()
        .copied()
        .filter(|start| !start_indices[1..].contains(start))
        .collect();
    let new_plan = plan.with_pipeline_start_indices(new_starts)?;

    let absorbed_rows: Vec<Vec<SharedPipelineReplica>> = rows
        .drain(first_pipeline_index + 1..first_pipeline_index + merged_count)
        .collect();
    let first_row = std::mem::take(&mut rows[first_pipeline_index]);
    let mut absorbed_iters: Vec<_> = absorbed_rows
        .into_iter()
        .map(|row| row.into_iter())
        .collect();

    let mut merged_row = Vec::with_capacity(first_row.len());
    for first_replica in first_row {
        let (id, mut operators, self_queue, meter, initialized) =
            unwrap_replica(first_replica).into_parts();
        for absorbed in &mut absorbed_iters {
            let replica = absorbed.next().expect("equal replica counts per pipeline");
            let (_, mut absorbed_operators, mut absorbed_self_queue, _, _) =
                unwrap_replica(replica).into_parts();
            // The absorbed pipeline's own queue may still hold tuples;
            // they belong to its head operator now.
            let mut drainer = Drainer::Greedy(GreedyDrainer::new());
            absorbed_self_queue.drain(&mut drainer);
            if let Some((_, mut batch)) = drainer.take_result() {
                for port in 0..batch.port_count() {
                    let tuples = batch.take(port);
                    if !tuples.is_empty() {
                        absorbed_operators[0].queue_mut().force_offer(port, tuples);
                    }
                }
            }
            // The absorbed head is an interior operator now: its queue is
            // owned by one thread and it must never block.
            if let Some(shared) = absorbed_operators[0].queue().shared_default() {
                shared.switch_threading_mode(ThreadingMode::SingleThreaded);
            }
            absorbed_operators[0].drainer_pool_mut().make_non_blocking();
            operators.append(&mut absorbed_operators);
        }
        merged_row.push(
            PipelineReplica::compose(id, operators, self_queue, meter, initialized).into_shared(),
        );
    }
    rows[first_pipeline_index] = merged_row;
    Ok(Region::new(new_plan, rows))
}

/// Splits the pipeline at the given in-pipeline operator indices (strictly
/// increasing, strictly inside the operator range).
pub(crate) fn split_pipeline(
    config: &SluiceConfig,
    region: Region,
    pipeline_id: PipelineId,
    operator_indices: &[usize],
) -> Result<Region, EngineError> {
    let (plan, mut rows) = region.into_parts();
    let region_id = plan.region_id();
    let pipeline_index = plan.pipeline_index(pipeline_id.pipeline_start_index)?;
    let base = pipeline_id.pipeline_start_index;
    info!(region_id, %pipeline_id, ?operator_indices, "splitting pipeline");

    let mut new_starts = plan.pipeline_start_indices().to_vec();
    new_starts.extend(operator_indices.iter().map(|&index| base + index));
    new_starts.sort_unstable();
    let new_plan = plan.with_pipeline_start_indices(new_starts)?;

    let split_row = std::mem::take(&mut rows[pipeline_index]);
    let segment_count = operator_indices.len() + 1;
    let mut segment_rows: Vec<Vec<SharedPipelineReplica>> =
        (0..segment_count).map(|_| Vec::new()).collect();

    for replica in split_row {
        let (id, mut operators, self_queue, meter, initialized) =
            unwrap_replica(replica).into_parts();

        let mut segments: Vec<Vec<OperatorReplica>> = Vec::with_capacity(segment_count);
        for &boundary in operator_indices.iter().rev() {
            segments.push(operators.split_off(boundary));
        }
        segments.push(operators);
        segments.reverse();

        let mut first_parts = Some((self_queue, meter));
        for (segment_index, mut segment) in segments.into_iter().enumerate() {
            if segment_index == 0 {
                let (self_queue, meter) = first_parts.take().expect("first segment parts");
                segment_rows[0].push(
                    PipelineReplica::compose(id.clone(), segment, self_queue, meter, initialized)
                        .into_shared(),
                );
                continue;
            }

            // The boundary operator becomes a pipeline head: it gets the
            // multi-threaded ingress discipline of a freshly created
            // pipeline.
            let head_def = segment[0].operator_def().clone();
            let self_queue = if head_def.operator_type() == OperatorType::PartitionedStateful {
                OperatorQueue::Default(Arc::new(DefaultOperatorQueue::new(
                    head_def.id(),
                    head_def.input_port_count(),
                    ThreadingMode::MultiThreaded,
                    config.tuple_queue.capacity,
                )))
            } else {
                if let Some(shared) = segment[0].queue().shared_default() {
                    shared.switch_threading_mode(ThreadingMode::MultiThreaded);
                }
                if head_def.input_port_count() > 0 {
                    segment[0]
                        .drainer_pool_mut()
                        .make_blocking(config.drainer.drain_timeout());
                }
                OperatorQueue::Empty(EmptyOperatorQueue::new(
                    head_def.id(),
                    head_def.input_port_count(),
                ))
            };

            let new_id = PipelineReplicaId::new(
                PipelineId::new(region_id, base + operator_indices[segment_index - 1]),
                id.replica_index,
            );
            let meter = Arc::new(PipelineReplicaMeter::new(&new_id));
            segment_rows[segment_index].push(
                PipelineReplica::compose(new_id, segment, self_queue, meter, initialized)
                    .into_shared(),
            );
        }
    }

    rows.splice(pipeline_index..pipeline_index + 1, segment_rows);
    Ok(Region::new(new_plan, rows))
}
