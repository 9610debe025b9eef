//! Permutation variable importance.
//!
//! For every tree, the rows it is scored on (its OOB rows, or all rows) are
//! evaluated once as-is and once per covariate with that covariate's values
//! shuffled among those rows. The importance of a covariate for a tree is the
//! permuted error minus the baseline error.

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use crate::combiner::EnsembleCombiner;
use crate::config::{Execution, build_pool};
use crate::covariate::{Covariate, CovariateValue, Row, validate_rows};
use crate::error::ForestError;
use crate::error_rate::ErrorCalculator;
use crate::forest::Forest;
use crate::tree::Tree;

/// Settings for permutation importance.
///
/// # Defaults
///
/// | Parameter   | Default  |
/// |-------------|----------|
/// | `oob`       | `true`   |
/// | `seed`      | 42       |
/// | `execution` | `Serial` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportanceConfig {
    oob: bool,
    seed: u64,
    execution: Execution,
}

impl ImportanceConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            oob: true,
            seed: 42,
            execution: Execution::Serial,
        }
    }

    /// Score each tree only on rows outside its bootstrap sample.
    #[must_use]
    pub fn with_oob(mut self, oob: bool) -> Self {
        self.oob = oob;
        self
    }

    /// Set the seed for the permutations.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Permute covariates serially or on a worker pool.
    #[must_use]
    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    /// Return whether only OOB rows are scored.
    #[must_use]
    pub fn oob(&self) -> bool {
        self.oob
    }

    /// Return the permutation seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Return the execution mode.
    #[must_use]
    pub fn execution(&self) -> Execution {
        self.execution
    }
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Permutation importance of one covariate.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableImportance {
    /// Covariate name.
    pub name: String,
    /// Covariate index.
    pub covariate: usize,
    /// Raw importance for every tree that had rows to score, in tree order.
    pub per_tree: Vec<f64>,
    /// Mean of `per_tree`.
    pub mean: f64,
    /// Sample standard deviation of `per_tree` (n - 1 denominator); 0 for a single tree.
    pub std: f64,
    /// `mean / (std / sqrt(n))`; 0 when `std` is 0.
    pub z_score: f64,
    /// Rank by descending mean (1 = most important).
    pub rank: usize,
}

/// Error of one tree on `rows`, with covariate `permuted` replaced by `values` when given.
fn tree_error<Y, O, C, E>(
    tree: &Tree<O>,
    combiner: &C,
    calculator: &E,
    rows: &[&Row<Y>],
    permuted: Option<(usize, &[CovariateValue])>,
) -> f64
where
    C: EnsembleCombiner<O>,
    E: ErrorCalculator<Y, C::Output>,
{
    let predictions: Vec<C::Output> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let output = match permuted {
                None => tree.evaluate(*row),
                Some((covariate, values)) => {
                    let mut row_values = row.values().to_vec();
                    row_values[covariate] = values[i];
                    tree.evaluate(&Row::new(row.id(), row_values, ()))
                }
            };
            combiner.combine(&[output])
        })
        .collect();
    let responses: Vec<&Y> = rows.iter().map(|r| r.response()).collect();
    let predictions: Vec<&C::Output> = predictions.iter().collect();
    calculator.error(&responses, &predictions)
}

impl<O, C> Forest<O, C>
where
    O: Clone + DeserializeOwned + Sync,
    C: EnsembleCombiner<O>,
{
    /// Permutation importance of every covariate, sorted by descending mean.
    ///
    /// Trees with no row to score are left out of every covariate's `per_tree`.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::EmptyForest`] | the forest has no trees |
    /// | [`ForestError::NoOutOfBagRows`] | no tree has a row to score |
    /// | [`ForestError::ThreadPool`] | the worker pool cannot be built |
    /// | any error from row validation or reading on-disk trees | |
    #[instrument(skip_all, fields(n_rows = rows.len(), n_covariates = covariates.len(), oob = config.oob))]
    pub fn variable_importance<Y, E>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
        calculator: &E,
        config: &ImportanceConfig,
    ) -> Result<Vec<VariableImportance>, ForestError>
    where
        Y: Sync,
        E: ErrorCalculator<Y, C::Output>,
    {
        validate_rows(rows, covariates)?;
        if self.n_trees() == 0 {
            return Err(ForestError::EmptyForest);
        }
        let pool = match config.execution {
            Execution::Serial => None,
            Execution::Parallel { threads } => Some(build_pool(threads)?),
        };
        let n_covariates = covariates.len();
        let mut per_covariate: Vec<Vec<f64>> = vec![Vec::new(); n_covariates];

        for (tree_index, tree) in self.trees().enumerate() {
            let tree = tree?;
            let scored: Vec<&Row<Y>> = rows
                .iter()
                .filter(|r| !config.oob || !tree.in_bootstrap(r.id()))
                .collect();
            if scored.is_empty() {
                debug!(tree_index, "tree has no rows to score");
                continue;
            }

            let baseline = tree_error(&tree, &self.combiner, calculator, &scored, None);
            let permute = |c: usize| {
                let seed = config
                    .seed
                    .wrapping_add((tree_index as u64).wrapping_mul(n_covariates as u64))
                    .wrapping_add(c as u64);
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut values: Vec<CovariateValue> = scored.iter().map(|r| r.value(c)).collect();
                values.shuffle(&mut rng);
                tree_error(&tree, &self.combiner, calculator, &scored, Some((c, &values))) - baseline
            };
            let drops: Vec<f64> = match &pool {
                None => (0..n_covariates).map(permute).collect(),
                Some(pool) => pool.install(|| (0..n_covariates).into_par_iter().map(permute).collect()),
            };

            debug!(tree_index, n_scored = scored.len(), baseline, "tree importance computed");
            for (slot, drop) in per_covariate.iter_mut().zip(drops) {
                slot.push(drop);
            }
        }

        if per_covariate.first().is_none_or(Vec::is_empty) {
            return Err(ForestError::NoOutOfBagRows { n_rows: rows.len() });
        }

        let mut results: Vec<VariableImportance> = covariates
            .iter()
            .zip(per_covariate)
            .map(|(covariate, per_tree)| {
                let (mean, std, z_score) = summarize(&per_tree);
                VariableImportance {
                    name: covariate.name().to_string(),
                    covariate: covariate.index(),
                    per_tree,
                    mean,
                    std,
                    z_score,
                    rank: 0,
                }
            })
            .collect();

        results.sort_by(|a, b| b.mean.total_cmp(&a.mean));
        for (i, result) in results.iter_mut().enumerate() {
            result.rank = i + 1;
        }

        info!(
            n_trees = results[0].per_tree.len(),
            top = %results[0].name,
            "variable importance computed"
        );
        Ok(results)
    }
}

/// Mean, sample standard deviation and z-score of per-tree importances.
fn summarize(per_tree: &[f64]) -> (f64, f64, f64) {
    let n = per_tree.len() as f64;
    let mean = per_tree.iter().sum::<f64>() / n;
    if per_tree.len() < 2 {
        return (mean, 0.0, 0.0);
    }
    let variance = per_tree.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    let z_score = if std > 0.0 { mean / (std / n.sqrt()) } else { 0.0 };
    (mean, std, z_score)
}
