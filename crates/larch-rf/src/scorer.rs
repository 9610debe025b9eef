//! Split scoring strategies.
//!
//! A scorer rates a candidate partition of a node's responses into a left and
//! a right group; higher is better. Scores that are not finite (an empty side,
//! a zero variance) mark the candidate as unusable.
//!
//! Numeric covariates are swept in sorted order, so every scorer also offers
//! an incremental form: start with every response on the right and move rows
//! left one at a time.

/// Rates a left/right partition of responses.
pub trait SplitScorer<Y>: Send + Sync {
    /// Incremental scoring state for a sweep over one node.
    type State: IncrementalScore<Y>;

    /// Score a complete partition.
    fn score(&self, left: &[&Y], right: &[&Y]) -> f64;

    /// Begin a sweep with all of `responses` on the right.
    fn start(&self, responses: &[&Y]) -> Self::State;
}

/// Scoring state that is updated as rows move from right to left.
pub trait IncrementalScore<Y> {
    /// Move one response from the right group to the left group.
    fn move_left(&mut self, response: &Y);

    /// Score the current partition.
    fn score(&self) -> f64;
}

/// Regression scorer: negated pooled within-group sum of squares per row.
///
/// Maximising this score minimises the weighted average variance of the two
/// children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeightedVarianceScorer;

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    n: usize,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn of(responses: &[&f64]) -> Self {
        responses.iter().fold(Self::default(), |m, &&y| m.push(y))
    }

    fn push(self, y: f64) -> Self {
        Self {
            n: self.n + 1,
            sum: self.sum + y,
            sum_sq: self.sum_sq + y * y,
        }
    }

    fn pop(self, y: f64) -> Self {
        Self {
            n: self.n - 1,
            sum: self.sum - y,
            sum_sq: self.sum_sq - y * y,
        }
    }

    fn sum_of_squares(&self) -> f64 {
        // guard tiny negative values from cancellation
        (self.sum_sq - self.sum * self.sum / self.n as f64).max(0.0)
    }
}

fn variance_score(left: Moments, right: Moments) -> f64 {
    if left.n == 0 || right.n == 0 {
        return f64::NAN;
    }
    let n = (left.n + right.n) as f64;
    -(left.sum_of_squares() + right.sum_of_squares()) / n
}

/// Sweep state for [`WeightedVarianceScorer`].
#[derive(Debug, Clone)]
pub struct VarianceState {
    left: Moments,
    right: Moments,
}

impl IncrementalScore<f64> for VarianceState {
    fn move_left(&mut self, response: &f64) {
        self.left = self.left.push(*response);
        self.right = self.right.pop(*response);
    }

    fn score(&self) -> f64 {
        variance_score(self.left, self.right)
    }
}

impl SplitScorer<f64> for WeightedVarianceScorer {
    type State = VarianceState;

    fn score(&self, left: &[&f64], right: &[&f64]) -> f64 {
        variance_score(Moments::of(left), Moments::of(right))
    }

    fn start(&self, responses: &[&f64]) -> VarianceState {
        VarianceState {
            left: Moments::default(),
            right: Moments::of(responses),
        }
    }
}
