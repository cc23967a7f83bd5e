use crate::tuplequeue::{
    Drainer, GreedyDrainer, MultiPortConjunctiveDrainer, MultiPortDisjunctiveDrainer,
    SinglePortDrainer,
};
use sluice_api::{PortCondition, SchedulingStrategy};
use std::time::Duration;

/// Per-replica pool of drainer instances, reconfigured (not reallocated)
/// when the operator's strategy changes between invocations.
///
/// Blocking pools are created only for the head operator of a pipeline when
/// it has input ports; only the thread driving a pipeline's head may block
/// waiting on its own queue. Interior operators get non-blocking pools.
#[derive(Debug)]
pub struct DrainerPool {
    input_port_count: usize,
    block: Option<Duration>,
    current: Drainer,
    forced: Drainer,
}

impl DrainerPool {
    pub fn new_blocking(input_port_count: usize, timeout: Duration) -> Self {
        Self {
            input_port_count,
            block: Some(timeout),
            current: Drainer::Nop,
            forced: Drainer::Greedy(GreedyDrainer::new()),
        }
    }

    pub fn new_non_blocking(input_port_count: usize) -> Self {
        Self {
            input_port_count,
            block: None,
            current: Drainer::Nop,
            forced: Drainer::Greedy(GreedyDrainer::new()),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.block.is_some()
    }

    /// Converts the pool to the non-blocking discipline. Used when a merge
    /// turns a pipeline head into an interior operator.
    pub fn make_non_blocking(&mut self) {
        self.block = None;
        self.current = Drainer::Nop;
    }

    /// Converts the pool to the blocking discipline. Used when a split
    /// turns an interior operator into a pipeline head.
    pub fn make_blocking(&mut self, timeout: Duration) {
        self.block = Some(timeout);
        self.current = Drainer::Nop;
    }

    /// Returns the drainer matching `strategy`, reconfiguring the pooled
    /// instance in place when its shape already matches.
    pub fn acquire(&mut self, strategy: &SchedulingStrategy) -> &mut Drainer {
        match strategy {
            SchedulingStrategy::Never => {
                if !matches!(self.current, Drainer::Nop) {
                    self.current = Drainer::Nop;
                }
            }
            SchedulingStrategy::WhenAvailable => {
                if !matches!(self.current, Drainer::Greedy(_)) {
                    self.current = Drainer::Greedy(GreedyDrainer::new());
                }
            }
            SchedulingStrategy::WhenTuplesAvailable {
                counts,
                by_count,
                by_port,
            } => {
                assert_eq!(
                    counts.len(),
                    self.input_port_count,
                    "strategy does not cover all input ports"
                );
                if self.input_port_count == 1 {
                    match &mut self.current {
                        Drainer::SinglePort(drainer) => drainer.reconfigure(counts[0], *by_count),
                        _ => {
                            self.current = Drainer::SinglePort(match self.block {
                                Some(timeout) => {
                                    SinglePortDrainer::new_blocking(counts[0], *by_count, timeout)
                                }
                                None => SinglePortDrainer::new(counts[0], *by_count),
                            });
                        }
                    }
                } else {
                    match by_port {
                        PortCondition::AllPorts => match &mut self.current {
                            Drainer::MultiPortConjunctive(drainer) => {
                                drainer.reconfigure(counts.clone(), *by_count)
                            }
                            _ => {
                                self.current =
                                    Drainer::MultiPortConjunctive(match self.block {
                                        Some(timeout) => MultiPortConjunctiveDrainer::new_blocking(
                                            counts.clone(),
                                            *by_count,
                                            timeout,
                                        ),
                                        None => MultiPortConjunctiveDrainer::new(
                                            counts.clone(),
                                            *by_count,
                                        ),
                                    });
                            }
                        },
                        PortCondition::AnyPort => match &mut self.current {
                            Drainer::MultiPortDisjunctive(drainer) => {
                                drainer.reconfigure(counts.clone(), *by_count)
                            }
                            _ => {
                                self.current =
                                    Drainer::MultiPortDisjunctive(match self.block {
                                        Some(timeout) => MultiPortDisjunctiveDrainer::new_blocking(
                                            counts.clone(),
                                            *by_count,
                                            timeout,
                                        ),
                                        None => MultiPortDisjunctiveDrainer::new(
                                            counts.clone(),
                                            *by_count,
                                        ),
                                    });
                            }
                        },
                    }
                }
            }
        }
        self.current.reset();
        &mut self.current
    }

    /// The greedy drainer used by migration and shutdown paths, regardless
    /// of the operator's declared strategy.
    pub fn greedy(&mut self) -> &mut Drainer {
        self.forced.reset();
        &mut self.forced
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_api::CountCondition;

    #[test]
    fn acquire_maps_strategy_shapes() {
        let mut pool = DrainerPool::new_non_blocking(2);
        assert!(matches!(
            pool.acquire(&SchedulingStrategy::WhenAvailable),
            Drainer::Greedy(_)
        ));
        assert!(matches!(
            pool.acquire(&SchedulingStrategy::WhenTuplesAvailable {
                counts: vec![1, 1],
                by_count: CountCondition::AtLeast,
                by_port: PortCondition::AllPorts,
            }),
            Drainer::MultiPortConjunctive(_)
        ));
        assert!(matches!(
            pool.acquire(&SchedulingStrategy::WhenTuplesAvailable {
                counts: vec![1, 1],
                by_count: CountCondition::AtLeast,
                by_port: PortCondition::AnyPort,
            }),
            Drainer::MultiPortDisjunctive(_)
        ));
        assert!(matches!(
            pool.acquire(&SchedulingStrategy::Never),
            Drainer::Nop
        ));
    }

    #[test]
    fn single_port_pool_reuses_the_instance() {
        let mut pool = DrainerPool::new_non_blocking(1);
        let first = pool.acquire(&SchedulingStrategy::exactly(3)) as *const Drainer;
        let second = pool.acquire(&SchedulingStrategy::at_least(5)) as *const Drainer;
        assert_eq!(first, second);
    }
}
