//! Combiners that turn responses into leaf outputs and leaf outputs into forest predictions.

/// Summarises the responses that reach a terminal node.
pub trait ResponseCombiner<Y, O>: Send + Sync {
    /// Combine a non-empty set of responses into a leaf output.
    fn combine(&self, responses: &[&Y]) -> O;
}

/// Aggregates per-tree outputs into a forest prediction.
///
/// `combine` sees every tree output at once. The accumulator form receives
/// outputs one at a time so a forest streamed from disk never holds more than
/// one tree in memory.
pub trait EnsembleCombiner<O>: Send + Sync {
    /// Forest-level prediction type.
    type Output: Send;

    /// Streaming form of this combiner.
    type Accumulator: Accumulator<O, Output = Self::Output> + Send;

    /// Combine a set of tree outputs.
    fn combine(&self, outputs: &[&O]) -> Self::Output;

    /// Start a streaming combination that expects `expected` outputs.
    ///
    /// Each output may be pre-scaled by `1 / expected`; [`Accumulator::finish`]
    /// corrects for fewer outputs than expected.
    fn accumulator(&self, expected: usize) -> Self::Accumulator;
}

/// Incremental combination state.
pub trait Accumulator<O> {
    /// Forest-level prediction type.
    type Output;

    /// Fold one tree output in.
    fn add(&mut self, output: &O);

    /// Number of outputs folded in so far.
    fn count(&self) -> usize;

    /// Produce the prediction, or `None` if nothing was added.
    fn finish(self) -> Option<Self::Output>;
}

/// Arithmetic mean, used both for regression leaves and for averaging tree predictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeanCombiner;

impl ResponseCombiner<f64, f64> for MeanCombiner {
    fn combine(&self, responses: &[&f64]) -> f64 {
        mean(responses)
    }
}

impl EnsembleCombiner<f64> for MeanCombiner {
    type Output = f64;
    type Accumulator = MeanAccumulator;

    fn combine(&self, outputs: &[&f64]) -> f64 {
        mean(outputs)
    }

    fn accumulator(&self, expected: usize) -> MeanAccumulator {
        MeanAccumulator {
            expected: expected.max(1),
            count: 0,
            scaled_sum: 0.0,
        }
    }
}

fn mean(values: &[&f64]) -> f64 {
    values.iter().copied().sum::<f64>() / values.len() as f64
}

/// Streaming state for [`MeanCombiner`].
#[derive(Debug, Clone)]
pub struct MeanAccumulator {
    expected: usize,
    count: usize,
    scaled_sum: f64,
}

impl Accumulator<f64> for MeanAccumulator {
    type Output = f64;

    fn add(&mut self, output: &f64) {
        self.scaled_sum += output / self.expected as f64;
        self.count += 1;
    }

    fn count(&self) -> usize {
        self.count
    }

    fn finish(self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.scaled_sum * self.expected as f64 / self.count as f64)
    }
}
