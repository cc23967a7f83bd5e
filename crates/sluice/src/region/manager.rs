use crate::config::{SluiceConfig, TailOutputSupplierKind};
use crate::error::{EngineError, OperatorShutdownFailure};
use crate::kvstore::{KvStoreContainer, OperatorKvStore, PartitionedOperatorKvStore};
use crate::partition::{
    partition_id, PartitionDistribution, PartitionKeyExtractor, PartitionMigration,
    PartitionService,
};
use crate::pipeline::{
    OperatorReplica, OutputSupplier, PipelineId, PipelineReplica, PipelineReplicaId,
    PipelineReplicaMeter, SharedPipelineReplica,
};
use crate::region::{transform, Region, RegionExecutionPlan};
use crate::tuplequeue::{
    DefaultOperatorQueue, Drainer, DrainerPool, EmptyOperatorQueue, GreedyDrainer, OperatorQueue,
    PartitionedOperatorQueue, ThreadingMode, TupleQueueContainer,
};
use sluice_api::{FlowDef, KvStore, OperatorDef, OperatorType, TupleBatch};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

type StagedContainers = HashMap<(usize, usize, usize), (Vec<TupleQueueContainer>, Vec<KvStoreContainer>)>;

/// Builds, merges, splits and rebalances regions into concrete replica
/// sets.
///
/// Driven by a single control thread. Every mutating operation replaces the
/// old region with a new one under the same region id, so no stale region
/// is observable mid-transition; late-arriving operations from the old
/// region's replicas fail fast instead of racing the new owner.
pub struct RegionManager {
    config: SluiceConfig,
    partition_service: PartitionService,
    regions: HashMap<u32, Region>,
}

impl RegionManager {
    pub fn new(config: SluiceConfig) -> Self {
        let partition_service = PartitionService::new(&config.partition_service);
        Self {
            config,
            partition_service,
            regions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SluiceConfig {
        &self.config
    }

    pub fn partition_service(&self) -> &PartitionService {
        &self.partition_service
    }

    pub fn region(&self, region_id: u32) -> Option<&Region> {
        self.regions.get(&region_id)
    }

    pub fn region_mut(&mut self, region_id: u32) -> Option<&mut Region> {
        self.regions.get_mut(&region_id)
    }

    /// Instantiates a region per its execution plan: queues, drainer pools,
    /// key-value stores and output suppliers per operator replica, composed
    /// into pipeline replicas and indexed into the region's matrix.
    pub fn create_region(
        &mut self,
        flow: &FlowDef,
        plan: RegionExecutionPlan,
    ) -> Result<&Region, EngineError> {
        let region_id = plan.region_id();
        if self.regions.contains_key(&region_id) {
            return Err(EngineError::RegionAlreadyExists { region_id });
        }
        let replica_count = plan.replica_count();
        let pipeline_count = plan.pipeline_count();
        info!(region_id, pipeline_count, replica_count, "creating region");

        let distribution = if plan.region_def().region_type() == OperatorType::PartitionedStateful
        {
            if self.partition_service.distribution(region_id).is_none() {
                self.partition_service
                    .create_distribution(region_id, replica_count);
            }
            Some(
                self.partition_service
                    .distribution(region_id)
                    .expect("distribution just created")
                    .clone(),
            )
        } else {
            None
        };

        let mut matrix = Vec::with_capacity(pipeline_count);
        for pipeline_index in 0..pipeline_count {
            let pipeline_id = PipelineId::new(region_id, plan.pipeline_start_index(pipeline_index));
            let defs = plan.operator_defs_by_pipeline_index(pipeline_index).to_vec();
            let mut row = Vec::with_capacity(replica_count);
            for replica_index in 0..replica_count {
                let replica_id = PipelineReplicaId::new(pipeline_id, replica_index);
                row.push(self.build_pipeline_replica(
                    flow,
                    &plan,
                    replica_id,
                    &defs,
                    replica_index,
                    distribution.as_ref(),
                )?);
            }
            matrix.push(row);
        }

        let region = Region::new(plan, matrix);
        self.regions.insert(region_id, region);
        Ok(self.regions.get(&region_id).expect("region just inserted"))
    }

    fn build_pipeline_replica(
        &self,
        flow: &FlowDef,
        plan: &RegionExecutionPlan,
        replica_id: PipelineReplicaId,
        defs: &[OperatorDef],
        replica_index: usize,
        distribution: Option<&PartitionDistribution>,
    ) -> Result<SharedPipelineReplica, EngineError> {
        let meter = Arc::new(PipelineReplicaMeter::new(&replica_id));
        let mut operators = Vec::with_capacity(defs.len());
        for (operator_index, def) in defs.iter().enumerate() {
            let is_first = operator_index == 0;
            let is_last = operator_index == defs.len() - 1;
            let queue = self.build_operator_queue(flow, plan, def, is_first, replica_index, distribution);
            let pool = self.build_drainer_pool(def, is_first);
            let kv_store = self.build_kv_store(plan, def, replica_index, distribution)?;
            let supplier = self.build_output_supplier(def, is_last);
            operators.push(OperatorReplica::new(
                replica_id.clone(),
                def.clone(),
                queue,
                kv_store,
                pool,
                supplier,
            ));
        }
        let self_queue = self.build_pipeline_self_queue(flow, &defs[0]);
        Ok(PipelineReplica::new(replica_id, operators, self_queue, meter).into_shared())
    }

    fn build_operator_queue(
        &self,
        flow: &FlowDef,
        plan: &RegionExecutionPlan,
        def: &OperatorDef,
        is_first: bool,
        replica_index: usize,
        distribution: Option<&PartitionDistribution>,
    ) -> OperatorQueue {
        if flow.has_no_upstream(def.id()) {
            return OperatorQueue::Empty(EmptyOperatorQueue::new(
                def.id(),
                def.input_port_count(),
            ));
        }
        if def.operator_type() == OperatorType::PartitionedStateful {
            let distribution = distribution.expect("partitioned region without distribution");
            return OperatorQueue::Partitioned(PartitionedOperatorQueue::new(
                def.id(),
                def.input_port_count(),
                self.operator_extractor(plan, def),
                replica_index,
                distribution,
                self.config.tuple_queue.max_drainable_key_count,
            ));
        }
        let mode = if is_first {
            ThreadingMode::MultiThreaded
        } else {
            ThreadingMode::SingleThreaded
        };
        OperatorQueue::Default(Arc::new(DefaultOperatorQueue::new(
            def.id(),
            def.input_port_count(),
            mode,
            self.config.tuple_queue.capacity,
        )))
    }

    /// Only the thread driving a pipeline's head may block waiting on its
    /// own queue; partitioned heads get their input moved in from the self
    /// queue, so they stay non-blocking too.
    fn build_drainer_pool(&self, def: &OperatorDef, is_first: bool) -> DrainerPool {
        if is_first
            && def.input_port_count() > 0
            && def.operator_type() != OperatorType::PartitionedStateful
        {
            DrainerPool::new_blocking(def.input_port_count(), self.config.drainer.drain_timeout())
        } else {
            DrainerPool::new_non_blocking(def.input_port_count())
        }
    }

    fn build_kv_store(
        &self,
        plan: &RegionExecutionPlan,
        def: &OperatorDef,
        replica_index: usize,
        distribution: Option<&PartitionDistribution>,
    ) -> Result<OperatorKvStore, EngineError> {
        match def.operator_type() {
            OperatorType::Stateless => Ok(OperatorKvStore::Empty),
            OperatorType::Stateful => {
                debug_assert_eq!(plan.replica_count(), 1);
                Ok(OperatorKvStore::Default(KvStore::new()))
            }
            OperatorType::PartitionedStateful => {
                let distribution = distribution.expect("partitioned region without distribution");
                Ok(OperatorKvStore::Partitioned(PartitionedOperatorKvStore::new(
                    def.id(),
                    replica_index,
                    distribution,
                )))
            }
        }
    }

    fn build_output_supplier(&self, def: &OperatorDef, is_last: bool) -> OutputSupplier {
        if is_last {
            match self.config.region_manager.tail_output_supplier {
                TailOutputSupplierKind::Cached => OutputSupplier::cached(def.output_port_count()),
                TailOutputSupplierKind::Fresh => OutputSupplier::fresh(def.output_port_count()),
            }
        } else {
            OutputSupplier::cached(def.output_port_count())
        }
    }

    /// The pipeline's own queue: the multi-threaded ingress for a
    /// partitioned head (whose operator queue is single-thread-owned), and
    /// a no-op queue otherwise (sources have no input; other heads take
    /// offers directly on their multi-threaded operator queue).
    fn build_pipeline_self_queue(&self, flow: &FlowDef, head: &OperatorDef) -> OperatorQueue {
        if !flow.has_no_upstream(head.id())
            && head.operator_type() == OperatorType::PartitionedStateful
        {
            OperatorQueue::Default(Arc::new(DefaultOperatorQueue::new(
                head.id(),
                head.input_port_count(),
                ThreadingMode::MultiThreaded,
                self.config.tuple_queue.capacity,
            )))
        } else {
            OperatorQueue::Empty(EmptyOperatorQueue::new(head.id(), head.input_port_count()))
        }
    }

    fn operator_extractor(
        &self,
        plan: &RegionExecutionPlan,
        def: &OperatorDef,
    ) -> PartitionKeyExtractor {
        PartitionKeyExtractor::with_forward_key_limit(
            def.partition_field_names().to_vec(),
            plan.region_def().partition_field_names().len(),
        )
    }

    /// Merges contiguous pipelines of one region into a single pipeline,
    /// preserving all buffered data.
    pub fn merge_pipelines(&mut self, pipeline_ids: &[PipelineId]) -> Result<&Region, EngineError> {
        let (region_id, start_indices) = self.validate_merge(pipeline_ids)?;
        let region = self.regions.remove(&region_id).expect("validated region");
        let merged = transform::merge_pipelines(region, &start_indices)?;
        self.regions.insert(region_id, merged);
        Ok(self.regions.get(&region_id).expect("region just inserted"))
    }

    fn validate_merge(
        &self,
        pipeline_ids: &[PipelineId],
    ) -> Result<(u32, Vec<usize>), EngineError> {
        if pipeline_ids.len() < 2 {
            return Err(EngineError::InvalidMerge {
                reason: format!("need at least two pipelines, got {pipeline_ids:?}"),
            });
        }
        let mut sorted = pipeline_ids.to_vec();
        sorted.sort();
        let region_id = sorted[0].region_id;
        if sorted.iter().any(|id| id.region_id != region_id) {
            return Err(EngineError::InvalidMerge {
                reason: format!("multiple region ids in {pipeline_ids:?}"),
            });
        }
        if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(EngineError::InvalidMerge {
                reason: format!("duplicate pipeline ids in {pipeline_ids:?}"),
            });
        }
        let region = self
            .regions
            .get(&region_id)
            .ok_or(EngineError::RegionNotFound { region_id })?;
        let start_indices: Vec<usize> =
            sorted.iter().map(|id| id.pipeline_start_index).collect();
        let all = region.plan().pipeline_start_indices();
        let position = all
            .iter()
            .position(|&start| start == start_indices[0])
            .ok_or_else(|| EngineError::InvalidMerge {
                reason: format!("unknown pipeline start index {}", start_indices[0]),
            })?;
        let contiguous = all
            .get(position..position + start_indices.len())
            .map_or(false, |window| window == start_indices.as_slice());
        if !contiguous {
            return Err(EngineError::InvalidMerge {
                reason: format!(
                    "pipelines {start_indices:?} are not contiguous in {all:?} of region {region_id}"
                ),
            });
        }
        Ok((region_id, start_indices))
    }

    /// Splits one pipeline at the given in-pipeline operator indices.
    pub fn split_pipeline(
        &mut self,
        pipeline_id: PipelineId,
        operator_indices: &[usize],
    ) -> Result<&Region, EngineError> {
        let region_id = pipeline_id.region_id;
        {
            let region = self
                .regions
                .get(&region_id)
                .ok_or(EngineError::RegionNotFound { region_id })?;
            let pipeline_index = region
                .plan()
                .pipeline_index(pipeline_id.pipeline_start_index)
                .map_err(|_| EngineError::InvalidSplit {
                    pipeline: pipeline_id.to_string(),
                    reason: "no such pipeline".to_string(),
                })?;
            let operator_count = region.plan().operator_count_by_pipeline_index(pipeline_index);
            if operator_indices.is_empty() {
                return Err(EngineError::InvalidSplit {
                    pipeline: pipeline_id.to_string(),
                    reason: "no split indices given".to_string(),
                });
            }
            let mut previous = 0;
            for &index in operator_indices {
                if index <= previous || index >= operator_count {
                    return Err(EngineError::InvalidSplit {
                        pipeline: pipeline_id.to_string(),
                        reason: format!(
                            "split indices {operator_indices:?} must be strictly increasing and inside (0, {operator_count})"
                        ),
                    });
                }
                previous = index;
            }
        }
        let region = self.regions.remove(&region_id).expect("validated region");
        let split = transform::split_pipeline(&self.config, region, pipeline_id, operator_indices)?;
        self.regions.insert(region_id, split);
        Ok(self.regions.get(&region_id).expect("region just inserted"))
    }

    /// Changes a partitioned-stateful region's replica count from N to M,
    /// preserving every buffered tuple and all partitioned state.
    ///
    /// Callers must quiesce the region first (runners paused or not yet
    /// started); the manager never races live replica threads.
    pub fn rebalance_region(
        &mut self,
        flow: &FlowDef,
        region_id: u32,
        new_replica_count: usize,
    ) -> Result<&Region, EngineError> {
        if new_replica_count == 0 {
            return Err(EngineError::InvalidRebalance {
                region_id,
                reason: "replica count must be positive".to_string(),
            });
        }
        {
            let region = self
                .regions
                .get(&region_id)
                .ok_or(EngineError::RegionNotFound { region_id })?;
            let region_type = region.plan().region_def().region_type();
            if region_type != OperatorType::PartitionedStateful {
                return Err(EngineError::InvalidRebalance {
                    region_id,
                    reason: format!("cannot rebalance a {region_type:?} region"),
                });
            }
            if region.plan().replica_count() == new_replica_count {
                warn!(
                    region_id,
                    new_replica_count, "no rebalance, region already has this replica count"
                );
                return Ok(self.regions.get(&region_id).expect("region present"));
            }
        }

        let mut region = self.regions.remove(&region_id).expect("validated region");
        let plan = region.plan().clone();
        let current_count = plan.replica_count();
        info!(
            region_id,
            current_count, new_replica_count, "rebalancing region"
        );

        // Phase 1: no tuple may be stranded between the pipeline-level and
        // operator-level buffers while the structure changes underneath.
        Self::drain_pipeline_queues(&mut region);

        // Phase 2: reassign partition ownership and relocate the partition
        // containers intact.
        let (old_distribution, new_distribution) =
            self.partition_service.rebalance(region_id, new_replica_count)?;
        let migrations = old_distribution.migrations(&new_distribution);
        let mut staged: StagedContainers = HashMap::new();
        let mut stateless_buffers: HashMap<(usize, usize), Vec<TupleBatch>> = HashMap::new();
        let region_extractor =
            PartitionKeyExtractor::new(plan.region_def().partition_field_names().to_vec());

        for pipeline_index in 0..plan.pipeline_count() {
            let defs = plan.operator_defs_by_pipeline_index(pipeline_index).to_vec();
            for (operator_index, def) in defs.iter().enumerate() {
                match def.operator_type() {
                    OperatorType::PartitionedStateful => Self::migrate_partitioned_operator(
                        &mut region,
                        pipeline_index,
                        operator_index,
                        &migrations,
                        current_count.min(new_replica_count),
                        &mut staged,
                    ),
                    // Phase 3: stateless operators follow the region's
                    // keying for data locality; buffered tuples are
                    // re-hashed against the new distribution.
                    OperatorType::Stateless => {
                        let buffers = Self::drain_stateless_operator(
                            &mut region,
                            pipeline_index,
                            operator_index,
                            def,
                            &region_extractor,
                            &new_distribution,
                            current_count,
                        );
                        stateless_buffers.insert((pipeline_index, operator_index), buffers);
                    }
                    OperatorType::Stateful => {
                        unreachable!("stateful operator in a partitioned-stateful region")
                    }
                }
            }
        }

        // Phase 4: physically extend or shrink the replica matrix.
        let new_plan = plan.with_replica_count(new_replica_count)?;
        let (_, mut matrix) = region.into_parts();
        if new_replica_count > current_count {
            self.extend_replicas(
                flow,
                &new_plan,
                &mut matrix,
                current_count,
                &new_distribution,
                &mut staged,
            )?;
        } else {
            Self::shrink_replicas(&mut matrix, new_replica_count, region_id);
        }
        debug_assert!(staged.is_empty(), "staged partitions left unacquired");

        // Re-offer the re-hashed stateless backlog, extending capacity so
        // the burst is never rejected.
        for ((pipeline_index, operator_index), buffers) in stateless_buffers {
            for (replica_index, mut batch) in buffers.into_iter().enumerate() {
                let mut replica = matrix[pipeline_index][replica_index]
                    .lock()
                    .expect("replica lock");
                let queue = replica.operator_mut(operator_index).queue_mut();
                let largest_port = (0..batch.port_count())
                    .map(|port| batch.tuple_count(port))
                    .max()
                    .unwrap_or(0);
                queue.ensure_capacity(self.config.tuple_queue.capacity.max(largest_port));
                for port in 0..batch.port_count() {
                    let tuples = batch.take(port);
                    if !tuples.is_empty() {
                        queue.force_offer(port, tuples);
                    }
                }
            }
        }

        let new_region = Region::new(new_plan, matrix);
        self.regions.insert(region_id, new_region);
        info!(region_id, new_replica_count, "region rebalanced");
        Ok(self.regions.get(&region_id).expect("region just inserted"))
    }

    /// Drains every pipeline's own queue into its head operator's queue.
    fn drain_pipeline_queues(region: &mut Region) {
        let plan = region.plan().clone();
        for pipeline_index in 0..plan.pipeline_count() {
            for replica_index in 0..plan.replica_count() {
                let mut replica = region
                    .replica(pipeline_index, replica_index)
                    .lock()
                    .expect("replica lock");
                let mut drainer = Drainer::Greedy(GreedyDrainer::new());
                replica.self_queue_mut().drain(&mut drainer);
                if let Some((_, mut batch)) = drainer.take_result() {
                    info!(replica = %replica.id(), "draining pipeline tuple queue");
                    for port in 0..batch.port_count() {
                        let tuples = batch.take(port);
                        if !tuples.is_empty() {
                            replica.operator_mut(0).queue_mut().force_offer(port, tuples);
                        }
                    }
                }
            }
        }
    }

    /// Relocates one partitioned operator's queue and state containers per
    /// the migration set. Containers whose target replica does not exist
    /// yet are staged for the extend phase.
    fn migrate_partitioned_operator(
        region: &mut Region,
        pipeline_index: usize,
        operator_index: usize,
        migrations: &[PartitionMigration],
        retained_count: usize,
        staged: &mut StagedContainers,
    ) {
        for migration in migrations {
            let (queue_container, kv_container) = {
                let mut replica = region
                    .replica(pipeline_index, migration.source_replica)
                    .lock()
                    .expect("replica lock");
                let operator = replica.operator_mut(operator_index);
                let queue_container = operator
                    .queue_mut()
                    .as_partitioned_mut()
                    .expect("partitioned operator queue")
                    .release_partitions(&[migration.partition_id])
                    .pop()
                    .expect("released partition");
                let kv_container = operator
                    .kv_store_mut()
                    .as_partitioned_mut()
                    .expect("partitioned operator store")
                    .release_partitions(&[migration.partition_id])
                    .pop()
                    .expect("released partition state");
                (queue_container, kv_container)
            };
            if migration.target_replica < retained_count {
                let mut replica = region
                    .replica(pipeline_index, migration.target_replica)
                    .lock()
                    .expect("replica lock");
                let operator = replica.operator_mut(operator_index);
                operator
                    .queue_mut()
                    .as_partitioned_mut()
                    .expect("partitioned operator queue")
                    .acquire_partitions(vec![queue_container]);
                operator
                    .kv_store_mut()
                    .as_partitioned_mut()
                    .expect("partitioned operator store")
                    .acquire_partitions(vec![kv_container]);
            } else {
                let slot = staged
                    .entry((pipeline_index, operator_index, migration.target_replica))
                    .or_default();
                slot.0.push(queue_container);
                slot.1.push(kv_container);
            }
        }
    }

    /// Greedily drains one stateless operator's queues across all current
    /// replicas and re-hashes every buffered tuple against the new
    /// distribution.
    fn drain_stateless_operator(
        region: &mut Region,
        pipeline_index: usize,
        operator_index: usize,
        def: &OperatorDef,
        region_extractor: &PartitionKeyExtractor,
        new_distribution: &PartitionDistribution,
        current_count: usize,
    ) -> Vec<TupleBatch> {
        let partition_count = new_distribution.partition_count();
        let mut buffers: Vec<TupleBatch> = (0..new_distribution.replica_count())
            .map(|_| TupleBatch::new(def.input_port_count()))
            .collect();
        let mut drainer = Drainer::Greedy(GreedyDrainer::new());
        for replica_index in 0..current_count {
            let mut replica = region
                .replica(pipeline_index, replica_index)
                .lock()
                .expect("replica lock");
            let queue = replica.operator_mut(operator_index).queue_mut();
            loop {
                queue.drain(&mut drainer);
                let Some((_, mut batch)) = drainer.take_result() else {
                    break;
                };
                for port in 0..batch.port_count() {
                    for tuple in batch.take(port) {
                        let partition = partition_id(
                            region_extractor.partition_hash(&tuple),
                            partition_count,
                        );
                        buffers[new_distribution.replica_index(partition)].add(port, tuple);
                    }
                }
            }
        }
        buffers
    }

    /// Clones the per-pipeline template for the additional replicas,
    /// handing them the staged partition containers.
    fn extend_replicas(
        &self,
        flow: &FlowDef,
        new_plan: &RegionExecutionPlan,
        matrix: &mut [Vec<SharedPipelineReplica>],
        current_count: usize,
        new_distribution: &PartitionDistribution,
        staged: &mut StagedContainers,
    ) -> Result<(), EngineError> {
        let region_id = new_plan.region_id();
        for pipeline_index in 0..new_plan.pipeline_count() {
            let pipeline_id =
                PipelineId::new(region_id, new_plan.pipeline_start_index(pipeline_index));
            let defs = new_plan
                .operator_defs_by_pipeline_index(pipeline_index)
                .to_vec();
            for replica_index in current_count..new_plan.replica_count() {
                let replica_id = PipelineReplicaId::new(pipeline_id, replica_index);
                info!(%replica_id, "initializing additional pipeline replica");
                let meter = Arc::new(PipelineReplicaMeter::new(&replica_id));
                let mut operators = Vec::with_capacity(defs.len());
                for (operator_index, def) in defs.iter().enumerate() {
                    let is_first = operator_index == 0;
                    let is_last = operator_index == defs.len() - 1;
                    let (queue, kv_store) = self.build_extended_operator_queue(
                        flow,
                        new_plan,
                        def,
                        is_first,
                        replica_index,
                        new_distribution,
                        staged.remove(&(pipeline_index, operator_index, replica_index)),
                    );
                    let pool = self.build_drainer_pool(def, is_first);
                    let supplier = self.build_output_supplier(def, is_last);
                    operators.push(OperatorReplica::new(
                        replica_id.clone(),
                        def.clone(),
                        queue,
                        kv_store,
                        pool,
                        supplier,
                    ));
                }
                let self_queue = self.build_pipeline_self_queue(flow, &defs[0]);
                matrix[pipeline_index].push(
                    PipelineReplica::new(replica_id, operators, self_queue, meter).into_shared(),
                );
            }
        }
        Ok(())
    }

    /// Shuts down and discards the replicas beyond the retained range. All
    /// of their partitions must have migrated off already; shutdown
    /// failures are collected and logged, never aborting the shrink, since
    /// the structural swap is already committed.
    fn shrink_replicas(matrix: &mut [Vec<SharedPipelineReplica>], new_count: usize, region_id: u32) {
        for row in matrix.iter_mut() {
            while row.len() > new_count {
                let replica = row.pop().expect("replica beyond retained range");
                assert_eq!(
                    Arc::strong_count(&replica),
                    1,
                    "shrunk replica of region {region_id} is still referenced by a runner"
                );
                let mut replica = replica.lock().expect("replica lock");
                for operator_index in 0..replica.operator_count() {
                    let operator = replica.operator_mut(operator_index);
                    if let Some(queue) = operator.queue_mut().as_partitioned_mut() {
                        assert!(
                            queue.owned_partition_ids().is_empty(),
                            "replica still owns partitions while shrinking region {region_id}",
                        );
                    }
                }
                info!(replica = %replica.id(), "shutting down shrunk pipeline replica");
                for failure in replica.shutdown() {
                    error!(
                        region_id,
                        operator_id = %failure.operator_id,
                        error = %failure.error,
                        "operator failed to shut down while shrinking"
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_extended_operator_queue(
        &self,
        flow: &FlowDef,
        plan: &RegionExecutionPlan,
        def: &OperatorDef,
        is_first: bool,
        replica_index: usize,
        distribution: &PartitionDistribution,
        staged: Option<(Vec<TupleQueueContainer>, Vec<KvStoreContainer>)>,
    ) -> (OperatorQueue, OperatorKvStore) {
        if def.operator_type() == OperatorType::PartitionedStateful {
            let mut queue = PartitionedOperatorQueue::new_empty(
                def.id(),
                def.input_port_count(),
                self.operator_extractor(plan, def),
                replica_index,
                distribution.partition_count(),
                self.config.tuple_queue.max_drainable_key_count,
            );
            let mut kv_store = PartitionedOperatorKvStore::new_empty(
                def.id(),
                replica_index,
                distribution.partition_count(),
            );
            if let Some((queue_containers, kv_containers)) = staged {
                queue.acquire_partitions(queue_containers);
                kv_store.acquire_partitions(kv_containers);
            }
            (
                OperatorQueue::Partitioned(queue),
                OperatorKvStore::Partitioned(kv_store),
            )
        } else {
            let queue = if flow.has_no_upstream(def.id()) {
                OperatorQueue::Empty(EmptyOperatorQueue::new(def.id(), def.input_port_count()))
            } else {
                let mode = if is_first {
                    ThreadingMode::MultiThreaded
                } else {
                    ThreadingMode::SingleThreaded
                };
                OperatorQueue::Default(Arc::new(DefaultOperatorQueue::new(
                    def.id(),
                    def.input_port_count(),
                    mode,
                    self.config.tuple_queue.capacity,
                )))
            };
            (queue, OperatorKvStore::Empty)
        }
    }

    /// Releases a region: every replica's queues and state are torn down
    /// and its operators shut down, best-effort.
    pub fn release_region(
        &mut self,
        region_id: u32,
    ) -> Result<Vec<OperatorShutdownFailure>, EngineError> {
        let region = self
            .regions
            .remove(&region_id)
            .ok_or(EngineError::RegionNotFound { region_id })?;
        if region.plan().region_def().region_type() == OperatorType::PartitionedStateful {
            self.partition_service.release(region_id);
        }
        let (_, mut matrix) = region.into_parts();
        let mut failures = Vec::new();
        for row in &mut matrix {
            for replica in row.iter_mut() {
                failures.extend(replica.lock().expect("replica lock").shutdown());
            }
        }
        for failure in &failures {
            error!(
                region_id,
                operator_id = %failure.operator_id,
                error = %failure.error,
                "operator failed to shut down while releasing region"
            );
        }
        info!(region_id, "region released");
        Ok(failures)
    }
}
