use anyhow::Result;
use sluice_api::{
    InitContext, InvocationContext, Operator, SchedulingStrategy, Tuple, DEFAULT_PORT_INDEX,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Generator function producing the `n`-th tuple of a beacon.
pub type TupleGenerator = Arc<dyn Fn(u64) -> Tuple + Send + Sync>;

/// Source operator emitting generated tuples, a fixed number per
/// invocation, optionally bounded by a total count.
///
/// Emitted tuples carry sequence numbers and ingestion timestamps. Once the
/// bound is reached the beacon declares itself done.
pub struct BeaconOperator {
    generator: TupleGenerator,
    tuples_per_invocation: usize,
    limit: Option<u64>,
    emitted: u64,
}

impl BeaconOperator {
    pub fn new(generator: TupleGenerator, tuples_per_invocation: usize) -> Self {
        assert!(tuples_per_invocation > 0, "beacon must emit at least one tuple");
        Self {
            generator,
            tuples_per_invocation,
            limit: None,
            emitted: 0,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Operator for BeaconOperator {
    fn init(&mut self, _ctx: &InitContext) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::WhenAvailable)
    }

    fn invoke(&mut self, ctx: &mut InvocationContext) -> Result<()> {
        let remaining = self
            .limit
            .map_or(self.tuples_per_invocation as u64, |limit| {
                limit.saturating_sub(self.emitted)
            })
            .min(self.tuples_per_invocation as u64);

        let now = Instant::now();
        for _ in 0..remaining {
            let mut tuple = (self.generator)(self.emitted);
            tuple.set_sequence_number(self.emitted);
            tuple.set_ingestion_time(now);
            ctx.output().add(DEFAULT_PORT_INDEX, tuple);
            self.emitted += 1;
        }

        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            debug!(emitted = self.emitted, "beacon exhausted its limit");
            ctx.set_next_strategy(SchedulingStrategy::Never);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_api::{InvocationReason, PortState, SchedulingStrategySlot, TupleBatch};

    fn invoke_once(beacon: &mut BeaconOperator) -> (TupleBatch, Option<SchedulingStrategy>) {
        let input = TupleBatch::new(0);
        let mut output = TupleBatch::new(1);
        let mut slot = SchedulingStrategySlot::new();
        let states: [PortState; 0] = [];
        let mut ctx = InvocationContext::new(
            InvocationReason::Success,
            &input,
            &mut output,
            None,
            None,
            &states,
            &mut slot,
        );
        beacon.invoke(&mut ctx).unwrap();
        (output, slot.take())
    }

    #[test]
    fn emits_batches_up_to_the_limit() {
        let mut beacon =
            BeaconOperator::new(Arc::new(|n| Tuple::of("n", n as i64)), 4).with_limit(10);

        let (first, next) = invoke_once(&mut beacon);
        assert_eq!(first.tuple_count(0), 4);
        assert!(next.is_none());
        assert_eq!(first.tuples(0)[0].sequence_number(), Some(0));

        invoke_once(&mut beacon);
        let (last, next) = invoke_once(&mut beacon);
        assert_eq!(last.tuple_count(0), 2);
        assert_eq!(next, Some(SchedulingStrategy::Never));
    }
}
