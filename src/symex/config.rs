//! Exploration options

use crate::ir::Endianness;
use crate::symex::policy::InterleavingPolicy;

/// Bounds and checks for one exploration
#[derive(Debug, Clone)]
pub struct ExploreConfig {
    /// Loop and recursion unwinding bound (None = unbounded)
    pub unwind: Option<u32>,
    /// Maximum number of steps along one path
    pub max_steps: Option<usize>,
    /// Maximum number of context switches along one path
    pub context_bound: Option<usize>,
    pub policy: InterleavingPolicy,
    /// Byte order used by `byte` extraction
    pub endianness: Endianness,
    pub div_by_zero_check: bool,
    pub overflow_check: bool,
    /// Assert instead of assume when a loop is cut by the unwind bound
    pub unwinding_assertions: bool,
    pub data_races_check: bool,
    pub deadlock_check: bool,
    /// Only treat globals reachable from several threads as switch points
    pub por: bool,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            unwind: None,
            max_steps: Some(100_000),
            context_bound: None,
            policy: InterleavingPolicy::default(),
            endianness: Endianness::default(),
            div_by_zero_check: true,
            overflow_check: false,
            unwinding_assertions: false,
            data_races_check: false,
            deadlock_check: false,
            por: true,
        }
    }
}

impl ExploreConfig {
    pub fn with_unwind(mut self, unwind: u32) -> Self {
        self.unwind = Some(unwind);
        self
    }

    pub fn with_max_steps(mut self, max_steps: Option<usize>) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_context_bound(mut self, bound: usize) -> Self {
        self.context_bound = Some(bound);
        self
    }

    pub fn with_policy(mut self, policy: InterleavingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_div_by_zero_check(mut self, enabled: bool) -> Self {
        self.div_by_zero_check = enabled;
        self
    }

    pub fn with_overflow_check(mut self, enabled: bool) -> Self {
        self.overflow_check = enabled;
        self
    }

    pub fn with_unwinding_assertions(mut self, enabled: bool) -> Self {
        self.unwinding_assertions = enabled;
        self
    }

    pub fn with_data_races_check(mut self, enabled: bool) -> Self {
        self.data_races_check = enabled;
        self
    }

    pub fn with_deadlock_check(mut self, enabled: bool) -> Self {
        self.deadlock_check = enabled;
        self
    }

    pub fn with_por(mut self, enabled: bool) -> Self {
        self.por = enabled;
        self
    }
}
