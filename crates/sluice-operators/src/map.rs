use anyhow::Result;
use sluice_api::{
    InitContext, InvocationContext, Operator, SchedulingStrategy, Tuple, DEFAULT_PORT_INDEX,
};
use std::sync::Arc;

/// Mapping function applied to every input tuple.
pub type MapFn = Arc<dyn Fn(&Tuple) -> Tuple + Send + Sync>;

/// One-to-one transform over the default port.
pub struct MapOperator {
    map: MapFn,
    batch_size: usize,
}

impl MapOperator {
    pub fn new(map: MapFn) -> Self {
        Self { map, batch_size: 1 }
    }

    /// Requires `batch_size` tuples per invocation instead of one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        self.batch_size = batch_size;
        self
    }
}

impl Operator for MapOperator {
    fn init(&mut self, _ctx: &InitContext) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::at_least(self.batch_size))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext) -> Result<()> {
        for tuple in ctx.input().tuples(DEFAULT_PORT_INDEX) {
            let mapped = (self.map)(tuple);
            ctx.output().add(DEFAULT_PORT_INDEX, mapped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_api::{InvocationReason, PortState, SchedulingStrategySlot, TupleBatch};

    #[test]
    fn maps_every_input_tuple() {
        let mut operator = MapOperator::new(Arc::new(|tuple| {
            Tuple::of("doubled", tuple.get("n").unwrap().as_int().unwrap() * 2)
        }));
        let mut input = TupleBatch::new(1);
        input.add(0, Tuple::of("n", 3i64));
        input.add(0, Tuple::of("n", 4i64));
        let mut output = TupleBatch::new(1);
        let mut slot = SchedulingStrategySlot::new();
        let states = [PortState::Open];
        let mut ctx = InvocationContext::new(
            InvocationReason::Success,
            &input,
            &mut output,
            None,
            None,
            &states,
            &mut slot,
        );
        operator.invoke(&mut ctx).unwrap();
        let values: Vec<i64> = output
            .tuples(0)
            .iter()
            .map(|tuple| tuple.get("doubled").unwrap().as_int().unwrap())
            .collect();
        assert_eq!(values, vec![6, 8]);
    }
}
