use anyhow::Result;
use sluice_api::{
    InitContext, InvocationContext, Operator, SchedulingStrategy, Tuple, DEFAULT_PORT_INDEX,
};
use std::sync::Arc;

/// Callback run for every consumed tuple.
pub type ForEachFn = Arc<dyn Fn(&Tuple) + Send + Sync>;

/// Terminal consumer: runs a callback per tuple and emits nothing.
pub struct ForEachOperator {
    consumer: ForEachFn,
}

impl ForEachOperator {
    pub fn new(consumer: ForEachFn) -> Self {
        Self { consumer }
    }
}

impl Operator for ForEachOperator {
    fn init(&mut self, _ctx: &InitContext) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::at_least(1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext) -> Result<()> {
        for tuple in ctx.input().tuples(DEFAULT_PORT_INDEX) {
            (self.consumer)(tuple);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_api::{InvocationReason, PortState, SchedulingStrategySlot, TupleBatch};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn consumes_every_tuple() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut operator = ForEachOperator::new(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        let mut input = TupleBatch::new(1);
        input.add(0, Tuple::of("n", 1i64));
        input.add(0, Tuple::of("n", 2i64));
        let mut output = TupleBatch::new(0);
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
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
