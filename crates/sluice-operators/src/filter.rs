use anyhow::Result;
use sluice_api::{
    InitContext, InvocationContext, Operator, SchedulingStrategy, Tuple, DEFAULT_PORT_INDEX,
};
use std::sync::Arc;

/// Predicate deciding which tuples pass through.
pub type FilterPredicate = Arc<dyn Fn(&Tuple) -> bool + Send + Sync>;

/// Forwards only the tuples matching the predicate.
pub struct FilterOperator {
    predicate: FilterPredicate,
}

impl FilterOperator {
    pub fn new(predicate: FilterPredicate) -> Self {
        Self { predicate }
    }
}

impl Operator for FilterOperator {
    fn init(&mut self, _ctx: &InitContext) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::at_least(1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext) -> Result<()> {
        for tuple in ctx.input().tuples(DEFAULT_PORT_INDEX) {
            if (self.predicate)(tuple) {
                ctx.output().add(DEFAULT_PORT_INDEX, tuple.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_api::{InvocationReason, PortState, SchedulingStrategySlot, TupleBatch};

    #[test]
    fn drops_non_matching_tuples() {
        let mut operator = FilterOperator::new(Arc::new(|tuple| {
            tuple.get("n").unwrap().as_int().unwrap() % 2 == 0
        }));
        let mut input = TupleBatch::new(1);
        for n in 0..5i64 {
            input.add(0, Tuple::of("n", n));
        }
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
        assert_eq!(output.tuple_count(0), 3);
    }
}
