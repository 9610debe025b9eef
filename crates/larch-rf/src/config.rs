//! Configuration builder for forest training.

use crate::error::ForestError;
use crate::tree::TreeConfig;

/// Where tree growth runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Execution {
    /// One tree at a time on the calling thread, in index order.
    Serial,
    /// A dedicated worker pool of `threads` threads.
    Parallel {
        /// Worker count; must be at least 1.
        threads: usize,
    },
}

/// Configuration for forest training.
///
/// Construct via [`ForestConfig::new`], then chain `with_*` methods.
///
/// # Defaults
///
/// | Parameter           | Default     |
/// |---------------------|-------------|
/// | `mtry`              | `None` (all covariates) |
/// | `node_size`         | 5           |
/// | `max_node_depth`    | `None`      |
/// | `number_of_splits`  | 0           |
/// | `check_node_purity` | `false`     |
/// | `seed`              | 42          |
/// | `execution`         | `Serial`    |
/// | `display_progress`  | `false`     |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForestConfig {
    pub(crate) n_trees: usize,
    pub(crate) mtry: Option<usize>,
    pub(crate) node_size: usize,
    pub(crate) max_node_depth: Option<usize>,
    pub(crate) number_of_splits: usize,
    pub(crate) check_node_purity: bool,
    pub(crate) seed: u64,
    pub(crate) execution: Execution,
    pub(crate) display_progress: bool,
}

impl ForestConfig {
    /// Create a new config with the given number of trees.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::InvalidTreeCount`] if `n_trees` is zero.
    pub fn new(n_trees: usize) -> Result<Self, ForestError> {
        if n_trees == 0 {
            return Err(ForestError::InvalidTreeCount { n_trees });
        }
        Ok(Self {
            n_trees,
            mtry: None,
            node_size: 5,
            max_node_depth: None,
            number_of_splits: 0,
            check_node_purity: false,
            seed: 42,
            execution: Execution::Serial,
            display_progress: false,
        })
    }

    // --- Setters ---

    /// Set the number of covariates sampled at each node. `None` means all.
    #[must_use]
    pub fn with_mtry(mut self, mtry: Option<usize>) -> Self {
        self.mtry = mtry;
        self
    }

    /// Set the node size; nodes with fewer than `2 * node_size` rows are terminal.
    #[must_use]
    pub fn with_node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }

    /// Set the maximum tree depth. `None` means unlimited.
    #[must_use]
    pub fn with_max_node_depth(mut self, max_node_depth: Option<usize>) -> Self {
        self.max_node_depth = max_node_depth;
        self
    }

    /// Set the number of random split points tried per covariate; 0 tries all.
    #[must_use]
    pub fn with_number_of_splits(mut self, number_of_splits: usize) -> Self {
        self.number_of_splits = number_of_splits;
        self
    }

    /// Stop splitting nodes whose responses are all equal.
    #[must_use]
    pub fn with_check_node_purity(mut self, check_node_purity: bool) -> Self {
        self.check_node_purity = check_node_purity;
        self
    }

    /// Set the random seed for reproducibility.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set serial or parallel execution.
    #[must_use]
    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    /// Log one line per completed tree at `info` level.
    #[must_use]
    pub fn with_display_progress(mut self, display_progress: bool) -> Self {
        self.display_progress = display_progress;
        self
    }

    /// Set the number of trees.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::InvalidTreeCount`] if `n_trees` is zero.
    pub fn with_n_trees(mut self, n_trees: usize) -> Result<Self, ForestError> {
        if n_trees == 0 {
            return Err(ForestError::InvalidTreeCount { n_trees });
        }
        self.n_trees = n_trees;
        Ok(self)
    }

    // --- Getters ---

    /// Return the number of trees.
    #[must_use]
    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    /// Return the covariates sampled per node, if limited.
    #[must_use]
    pub fn mtry(&self) -> Option<usize> {
        self.mtry
    }

    /// Return the node size.
    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Return the maximum depth limit, if any.
    #[must_use]
    pub fn max_node_depth(&self) -> Option<usize> {
        self.max_node_depth
    }

    /// Return the number of split points tried per covariate.
    #[must_use]
    pub fn number_of_splits(&self) -> usize {
        self.number_of_splits
    }

    /// Return whether pure nodes stop splitting.
    #[must_use]
    pub fn check_node_purity(&self) -> bool {
        self.check_node_purity
    }

    /// Return the random seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Return the execution mode.
    #[must_use]
    pub fn execution(&self) -> Execution {
        self.execution
    }

    /// Return whether per-tree progress is logged.
    #[must_use]
    pub fn display_progress(&self) -> bool {
        self.display_progress
    }

    /// The per-tree settings implied by this config.
    #[must_use]
    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig::new()
            .with_mtry(self.mtry)
            .with_node_size(self.node_size)
            .with_max_node_depth(self.max_node_depth)
            .with_number_of_splits(self.number_of_splits)
            .with_check_node_purity(self.check_node_purity)
    }

    /// Check every parameter range.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::InvalidThreadCount`] | parallel execution with 0 threads |
    /// | any error from [`TreeConfig::validate`] | |
    pub fn validate(&self) -> Result<(), ForestError> {
        if let Execution::Parallel { threads: 0 } = self.execution {
            return Err(ForestError::InvalidThreadCount { threads: 0 });
        }
        self.tree_config().validate()
    }
}

/// Build a dedicated worker pool.
pub(crate) fn build_pool(threads: usize) -> Result<rayon::ThreadPool, ForestError> {
    if threads == 0 {
        return Err(ForestError::InvalidThreadCount { threads });
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|source| ForestError::ThreadPool { threads, source })
}
