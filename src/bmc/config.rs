//! Configuration of a verification run

use crate::smt::portfolio::PortfolioConfig;
use crate::smt::select::SelectionStrategy;
use crate::smt::{BackendKind, SolverConfig};
use crate::symex::ExploreConfig;

/// Everything [`super::Bmc`] needs besides the program
#[derive(Debug, Clone)]
pub struct BmcConfig {
    pub explore: ExploreConfig,
    pub solver: SolverConfig,
    /// Backends in preference order
    pub backends: Vec<BackendKind>,
    pub portfolio: PortfolioConfig,
    pub selection: SelectionStrategy,
    /// Keep exploring interleavings after the first counterexample
    pub all_runs: bool,
    /// Stop after this many interleavings
    pub max_interleavings: Option<usize>,
    /// Drop assignments no claim depends on before solving
    pub slice: bool,
    /// Print each equation before solving
    pub show_program: bool,
    /// Print the SMT-LIB2 script instead of solving
    pub smt_formula_only: bool,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            explore: ExploreConfig::default(),
            solver: SolverConfig::default(),
            backends: BackendKind::DEFAULT_ORDER.to_vec(),
            portfolio: PortfolioConfig::default(),
            selection: SelectionStrategy::default(),
            all_runs: false,
            max_interleavings: None,
            slice: true,
            show_program: false,
            smt_formula_only: false,
        }
    }
}

impl BmcConfig {
    pub fn with_explore(mut self, explore: ExploreConfig) -> Self {
        self.explore = explore;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_backends(mut self, backends: Vec<BackendKind>) -> Self {
        if !backends.is_empty() {
            self.backends = backends;
        }
        self
    }

    pub fn with_portfolio(mut self, portfolio: PortfolioConfig) -> Self {
        self.portfolio = portfolio;
        self
    }

    pub fn with_selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_all_runs(mut self, all_runs: bool) -> Self {
        self.all_runs = all_runs;
        self
    }

    pub fn with_max_interleavings(mut self, limit: Option<usize>) -> Self {
        self.max_interleavings = limit;
        self
    }

    pub fn with_slice(mut self, slice: bool) -> Self {
        self.slice = slice;
        self
    }

    pub fn with_show_program(mut self, show: bool) -> Self {
        self.show_program = show;
        self
    }

    pub fn with_smt_formula_only(mut self, only: bool) -> Self {
        self.smt_formula_only = only;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BmcConfig::default();
        assert_eq!(config.backends, vec![BackendKind::Z3]);
        assert!(config.slice);
        assert!(!config.all_runs);
    }

    #[test]
    fn test_empty_backend_list_keeps_default() {
        let config = BmcConfig::default().with_backends(Vec::new());
        assert_eq!(config.backends, vec![BackendKind::Z3]);
    }
}
