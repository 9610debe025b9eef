//! Forest evaluation, over every tree or only the trees a row was left out of.

use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::combiner::{Accumulator, EnsembleCombiner};
use crate::config::{Execution, build_pool};
use crate::covariate::Row;
use crate::error::ForestError;
use crate::forest::{Forest, TreeStorage};

impl<O, C> Forest<O, C>
where
    O: Clone + DeserializeOwned + Sync,
    C: EnsembleCombiner<O>,
{
    /// Combine the outputs of every tree for one row.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::EmptyForest`] | the forest has no trees |
    /// | [`ForestError::ReadTree`] / [`ForestError::DeserializeTree`] | an on-disk tree cannot be read |
    pub fn evaluate<Y: Sync>(&self, row: &Row<Y>) -> Result<C::Output, ForestError> {
        self.evaluate_rows(std::slice::from_ref(row), Execution::Serial, false)?
            .pop()
            .flatten()
            .ok_or(ForestError::EmptyForest)
    }

    /// Combine the outputs of the trees whose bootstrap sample excluded `row`.
    ///
    /// Returns `None` when every tree was grown on `row`.
    ///
    /// # Errors
    ///
    /// Same as [`Forest::evaluate`].
    pub fn evaluate_oob<Y: Sync>(&self, row: &Row<Y>) -> Result<Option<C::Output>, ForestError> {
        Ok(self
            .evaluate_rows(std::slice::from_ref(row), Execution::Serial, true)?
            .pop()
            .flatten())
    }

    /// [`Forest::evaluate`] for many rows, in row order.
    ///
    /// # Errors
    ///
    /// Same as [`Forest::evaluate`], plus [`ForestError::ThreadPool`] when the
    /// worker pool cannot be built.
    pub fn evaluate_batch<Y: Sync>(
        &self,
        rows: &[Row<Y>],
        execution: Execution,
    ) -> Result<Vec<C::Output>, ForestError> {
        self.evaluate_rows(rows, execution, false)?
            .into_iter()
            .map(|p| p.ok_or(ForestError::EmptyForest))
            .collect()
    }

    /// [`Forest::evaluate_oob`] for many rows, in row order.
    ///
    /// # Errors
    ///
    /// Same as [`Forest::evaluate_batch`].
    pub fn evaluate_oob_batch<Y: Sync>(
        &self,
        rows: &[Row<Y>],
        execution: Execution,
    ) -> Result<Vec<Option<C::Output>>, ForestError> {
        self.evaluate_rows(rows, execution, true)
    }

    /// In-memory forests combine every row's outputs at once. On-disk forests
    /// read each tree once and fold it into one accumulator per row.
    #[instrument(skip_all, fields(n_rows = rows.len(), n_trees = self.n_trees(), oob = oob))]
    fn evaluate_rows<Y: Sync>(
        &self,
        rows: &[Row<Y>],
        execution: Execution,
        oob: bool,
    ) -> Result<Vec<Option<C::Output>>, ForestError> {
        if self.n_trees() == 0 {
            return Err(ForestError::EmptyForest);
        }
        let pool = match execution {
            Execution::Serial => None,
            Execution::Parallel { threads } => Some(build_pool(threads)?),
        };

        match &self.storage {
            TreeStorage::InMemory(trees) => {
                let one = |row: &Row<Y>| -> Option<C::Output> {
                    let outputs: Vec<&O> = trees
                        .iter()
                        .filter(|t| !oob || !t.in_bootstrap(row.id()))
                        .map(|t| t.evaluate(row))
                        .collect();
                    (!outputs.is_empty()).then(|| self.combiner.combine(&outputs))
                };
                Ok(match pool {
                    None => rows.iter().map(one).collect(),
                    Some(pool) => pool.install(|| rows.par_iter().map(one).collect()),
                })
            }
            TreeStorage::OnDisk(directory) => {
                let mut accumulators: Vec<C::Accumulator> = rows
                    .iter()
                    .map(|_| self.combiner.accumulator(directory.len()))
                    .collect();

                for (tree_index, tree) in directory.iter::<O>().enumerate() {
                    let tree = tree?;
                    let fold = |(accumulator, row): (&mut C::Accumulator, &Row<Y>)| {
                        if !oob || !tree.in_bootstrap(row.id()) {
                            accumulator.add(tree.evaluate(row));
                        }
                    };
                    match &pool {
                        None => accumulators.iter_mut().zip(rows).for_each(fold),
                        Some(pool) => pool.install(|| {
                            accumulators.par_iter_mut().zip(rows.par_iter()).for_each(fold);
                        }),
                    }
                    debug!(tree_index, "tree folded");
                }

                Ok(accumulators.into_iter().map(Accumulator::finish).collect())
            }
        }
    }
}
