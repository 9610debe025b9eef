//! Out-of-bag (OOB) and held-out error rates for a trained forest.

use serde::de::DeserializeOwned;
use tracing::{info, instrument};

use crate::combiner::EnsembleCombiner;
use crate::config::Execution;
use crate::covariate::Row;
use crate::error::ForestError;
use crate::error_rate::ErrorCalculator;
use crate::forest::Forest;

/// Out-of-bag evaluation result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OobError {
    /// Error over the rows that had at least one OOB tree.
    pub error: f64,
    /// Number of rows that had at least one OOB tree.
    pub n_oob_rows: usize,
}

impl<O, C> Forest<O, C>
where
    O: Clone + DeserializeOwned + Sync,
    C: EnsembleCombiner<O>,
{
    /// Error of each row's OOB prediction.
    ///
    /// Rows that every tree was grown on are skipped.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::NoOutOfBagRows`] | no row has an OOB tree |
    /// | any error from [`Forest::evaluate_oob_batch`] | |
    #[instrument(skip_all, fields(n_rows = rows.len()))]
    pub fn oob_error<Y, E>(
        &self,
        rows: &[Row<Y>],
        calculator: &E,
        execution: Execution,
    ) -> Result<OobError, ForestError>
    where
        Y: Sync,
        E: ErrorCalculator<Y, C::Output>,
    {
        let predictions = self.evaluate_oob_batch(rows, execution)?;
        let (responses, predictions): (Vec<&Y>, Vec<&C::Output>) = rows
            .iter()
            .zip(&predictions)
            .filter_map(|(row, p)| p.as_ref().map(|p| (row.response(), p)))
            .unzip();

        if responses.is_empty() {
            return Err(ForestError::NoOutOfBagRows { n_rows: rows.len() });
        }

        let error = calculator.error(&responses, &predictions);
        info!(error, n_oob_rows = responses.len(), "out-of-bag error computed");
        Ok(OobError {
            error,
            n_oob_rows: responses.len(),
        })
    }

    /// Error of the full-forest prediction on every row, for held-out or in-sample data.
    ///
    /// # Errors
    ///
    /// Any error from [`Forest::evaluate_batch`].
    #[instrument(skip_all, fields(n_rows = rows.len()))]
    pub fn error_rate<Y, E>(
        &self,
        rows: &[Row<Y>],
        calculator: &E,
        execution: Execution,
    ) -> Result<f64, ForestError>
    where
        Y: Sync,
        E: ErrorCalculator<Y, C::Output>,
    {
        let predictions = self.evaluate_batch(rows, execution)?;
        let responses: Vec<&Y> = rows.iter().map(Row::response).collect();
        let predictions: Vec<&C::Output> = predictions.iter().collect();
        Ok(calculator.error(&responses, &predictions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiner::MeanCombiner;
    use crate::config::ForestConfig;
    use crate::covariate::{Covariate, CovariateValue};
    use crate::error_rate::MeanSquaredError;
    use crate::forest::ForestTrainer;
    use crate::scorer::WeightedVarianceScorer;
    use crate::tree::TreeConfig;

    fn rows() -> Vec<Row<f64>> {
        (0..40)
            .map(|i| {
                let x = f64::from(i);
                let y = if i < 20 { 1.0 } else { 3.0 };
                Row::new(i as usize, vec![CovariateValue::Numeric(x)], y)
            })
            .collect()
    }

    #[test]
    fn oob_error_on_step_data_is_small() {
        let rows = rows();
        let config = ForestConfig::new(25).unwrap().with_node_size(2).with_seed(11);
        let forest = ForestTrainer::new(config, WeightedVarianceScorer, MeanCombiner, MeanCombiner)
            .train(&rows, &[Covariate::numeric("x", 0)])
            .unwrap();

        let oob = forest
            .oob_error(&rows, &MeanSquaredError, Execution::Serial)
            .unwrap();
        assert!(oob.n_oob_rows > rows.len() / 2);
        assert!(oob.error < 0.2, "oob error = {}", oob.error);

        let in_sample = forest
            .error_rate(&rows, &MeanSquaredError, Execution::Serial)
            .unwrap();
        assert!(in_sample < 0.2, "in-sample error = {in_sample}");
    }

    #[test]
    fn no_oob_rows_error() {
        let rows = rows();
        let tree = TreeConfig::new()
            .fit(
                &rows,
                &[Covariate::numeric("x", 0)],
                &WeightedVarianceScorer,
                &MeanCombiner,
                1,
            )
            .unwrap();
        let forest = Forest::from_trees(vec![tree], MeanCombiner);
        let err = forest
            .oob_error(&rows, &MeanSquaredError, Execution::Serial)
            .unwrap_err();
        assert!(matches!(err, ForestError::NoOutOfBagRows { n_rows: 40 }));
    }
}
