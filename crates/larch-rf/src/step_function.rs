//! Piecewise-constant real functions over ordered time points.
//!
//! Survival, cumulative hazard and cumulative incidence curves are all
//! represented as a [`StepFunction`]: a sorted list of `(time, value)` points
//! and a default value that applies before the first point.

/// An immutable right-continuous step function.
///
/// Invariant: `times` is strictly increasing and `values.len() == times.len()`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepFunction {
    times: Vec<f64>,
    values: Vec<f64>,
    default_value: f64,
}

impl StepFunction {
    /// Create a step function from parallel time/value vectors.
    ///
    /// # Panics
    ///
    /// Panics when the vectors differ in length or `times` is not strictly
    /// increasing; a NaN anywhere in `times` fails that check. Every caller
    /// inside this crate builds its points from sorted, deduplicated, finite
    /// times.
    #[must_use]
    pub fn new(times: Vec<f64>, values: Vec<f64>, default_value: f64) -> Self {
        assert_eq!(
            times.len(),
            values.len(),
            "step function needs one value per time point"
        );
        assert!(
            times.windows(2).all(|w| w[0] < w[1]),
            "step function times must be strictly increasing"
        );
        Self {
            times,
            values,
            default_value,
        }
    }

    /// A function with no points that evaluates to `value` everywhere.
    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self {
            times: Vec::new(),
            values: Vec::new(),
            default_value: value,
        }
    }

    /// Value at the latest point `<= time`, or the default before the first point.
    #[must_use]
    pub fn evaluate(&self, time: f64) -> f64 {
        let idx = self.times.partition_point(|&t| t <= time);
        if idx == 0 {
            self.default_value
        } else {
            self.values[idx - 1]
        }
    }

    /// Value at the latest point strictly before `time` (the left limit).
    #[must_use]
    pub fn evaluate_previous(&self, time: f64) -> f64 {
        let idx = self.times.partition_point(|&t| t < time);
        if idx == 0 {
            self.default_value
        } else {
            self.values[idx - 1]
        }
    }

    /// Exact area under the curve between `from` and `to`.
    ///
    /// Bounds may lie outside the point range; `integrate(a, b)` equals
    /// `-integrate(b, a)`.
    #[must_use]
    pub fn integrate(&self, from: f64, to: f64) -> f64 {
        if from > to {
            return -self.integrate(to, from);
        }
        if from == to {
            return 0.0;
        }

        let mut area = 0.0;
        let mut cursor = from;
        let mut current = self.evaluate(from);
        let start = self.times.partition_point(|&t| t <= from);

        for (&time, &value) in self.times[start..].iter().zip(&self.values[start..]) {
            if time >= to {
                break;
            }
            area += current * (time - cursor);
            cursor = time;
            current = value;
        }

        area + current * (to - cursor)
    }

    /// Apply `op` to every value (and the default), keeping the time points.
    #[must_use]
    pub fn unary_operation(&self, op: impl Fn(f64) -> f64) -> Self {
        Self {
            times: self.times.clone(),
            values: self.values.iter().map(|&v| op(v)).collect(),
            default_value: op(self.default_value),
        }
    }

    /// Combine two functions pointwise over the union of their time points.
    ///
    /// Runs as a single merge over both point lists.
    #[must_use]
    pub fn bi_operation(a: &Self, b: &Self, op: impl Fn(f64, f64) -> f64) -> Self {
        let mut times = Vec::with_capacity(a.times.len() + b.times.len());
        let mut values = Vec::with_capacity(a.times.len() + b.times.len());

        let (mut i, mut j) = (0, 0);
        let (mut current_a, mut current_b) = (a.default_value, b.default_value);

        while i < a.times.len() || j < b.times.len() {
            let next_a = a.times.get(i).copied().unwrap_or(f64::INFINITY);
            let next_b = b.times.get(j).copied().unwrap_or(f64::INFINITY);
            let time = next_a.min(next_b);

            if next_a == time {
                current_a = a.values[i];
                i += 1;
            }
            if next_b == time {
                current_b = b.values[j];
                j += 1;
            }

            times.push(time);
            values.push(op(current_a, current_b));
        }

        Self {
            times,
            values,
            default_value: op(a.default_value, b.default_value),
        }
    }

    /// Evaluate this function on a sorted grid, producing a function with exactly those points.
    ///
    /// Duplicate grid times are collapsed.
    #[must_use]
    pub fn resample(&self, grid: &[f64]) -> Self {
        let mut times: Vec<f64> = Vec::with_capacity(grid.len());
        for &t in grid {
            if times.last().is_none_or(|&last| last < t) {
                times.push(t);
            }
        }
        let values = times.iter().map(|&t| self.evaluate(t)).collect();
        Self {
            times,
            values,
            default_value: self.default_value,
        }
    }

    /// Time points in increasing order.
    #[must_use]
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Values at each time point.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value before the first time point.
    #[must_use]
    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    /// Number of time points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Return `true` if the function has no time points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Iterate over `(time, value)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.times.iter().copied().zip(self.values.iter().copied())
    }
}
