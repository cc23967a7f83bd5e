use serde::{Deserialize, Serialize};

/// How per-port tuple counts are interpreted by a
/// [`SchedulingStrategy::WhenTuplesAvailable`] declaration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountCondition {
    /// Drain exactly the declared count per port.
    Exact,
    /// Require at least the declared count per port; drain everything that is
    /// buffered.
    AtLeast,
}

/// Which ports must satisfy their count for the strategy to trigger.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortCondition {
    /// Every port with a non-zero count must satisfy it.
    AllPorts,
    /// Any single port satisfying its count triggers a drain across all
    /// ports present.
    AnyPort,
}

/// An operator's declared condition for when it should next be invoked.
///
/// Declared by [`Operator::init`](crate::Operator::init) and re-declared
/// through the invocation context after every invocation; the engine drains
/// input accordingly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// The operator is done and must not be invoked again.
    Never,
    /// Invoke whenever the engine gets to it, with whatever input happens to
    /// be buffered (sources run on this).
    WhenAvailable,
    /// Invoke once the declared per-port tuple counts are satisfied.
    WhenTuplesAvailable {
        /// Minimum tuple count per input port. Ports with count 0 do not
        /// participate in the condition but are still drained.
        counts: Vec<usize>,
        by_count: CountCondition,
        by_port: PortCondition,
    },
}

impl SchedulingStrategy {
    /// Shorthand for a single-port threshold with [`CountCondition::Exact`].
    pub fn exactly(count: usize) -> Self {
        SchedulingStrategy::WhenTuplesAvailable {
            counts: vec![count],
            by_count: CountCondition::Exact,
            by_port: PortCondition::AllPorts,
        }
    }

    /// Shorthand for a single-port threshold with [`CountCondition::AtLeast`].
    pub fn at_least(count: usize) -> Self {
        SchedulingStrategy::WhenTuplesAvailable {
            counts: vec![count],
            by_count: CountCondition::AtLeast,
            by_port: PortCondition::AllPorts,
        }
    }

    /// Multi-port variant of [`SchedulingStrategy::at_least`].
    pub fn at_least_on_all(counts: Vec<usize>) -> Self {
        SchedulingStrategy::WhenTuplesAvailable {
            counts,
            by_count: CountCondition::AtLeast,
            by_port: PortCondition::AllPorts,
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, SchedulingStrategy::Never)
    }
}
