//! Error calculators comparing observed responses with forest predictions.
//!
//! Every calculator returns a loss where lower is better, so that permutation
//! importance is always "permuted error minus baseline error".

use crate::competing_risk::CompetingRiskFunctions;
use crate::response::CompetingRiskOutcome;
use crate::step_function::StepFunction;

/// Scores a set of predictions against their responses.
pub trait ErrorCalculator<Y, P>: Send + Sync {
    /// Error over paired `responses` and `predictions`; `NaN` when undefined.
    fn error(&self, responses: &[&Y], predictions: &[&P]) -> f64;
}

/// Mean squared error for regression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeanSquaredError;

impl ErrorCalculator<f64, f64> for MeanSquaredError {
    fn error(&self, responses: &[&f64], predictions: &[&f64]) -> f64 {
        if responses.is_empty() {
            return f64::NAN;
        }
        let sum: f64 = responses
            .iter()
            .zip(predictions)
            .map(|(&&y, &&p)| (y - p).powi(2))
            .sum();
        sum / responses.len() as f64
    }
}

/// Kaplan-Meier estimate of the censoring distribution `G(t) = P(C > t)`.
///
/// Censored observations are the "events"; an event of any type at the same
/// time counts as still at risk of censoring.
#[must_use]
pub fn censoring_survival_function<Y: CompetingRiskOutcome>(responses: &[&Y]) -> StepFunction {
    let mut all_times: Vec<f64> = responses.iter().map(|y| y.time()).collect();
    all_times.sort_unstable_by(f64::total_cmp);
    let mut censored: Vec<f64> = responses
        .iter()
        .filter(|y| y.is_censored())
        .map(|y| y.time())
        .collect();
    censored.sort_unstable_by(f64::total_cmp);

    let n = all_times.len();
    let mut times = Vec::new();
    let mut values = Vec::new();
    let mut survival = 1.0;
    let mut start = 0;
    while start < censored.len() {
        let t = censored[start];
        let end = start + censored[start..].partition_point(|&c| c <= t);
        let at_risk = n - all_times.partition_point(|&x| x < t);
        survival *= 1.0 - (end - start) as f64 / at_risk as f64;
        times.push(t);
        values.push(survival);
        start = end;
    }

    StepFunction::new(times, values, 1.0)
}

/// `1 / g`, or 0 where the censoring survival has reached 0.
fn inverse_weight(g: f64) -> f64 {
    if g > 0.0 { 1.0 / g } else { 0.0 }
}

/// One minus the competing-risk concordance index for one event.
///
/// A row's risk is its predicted cumulative incidence integrated from 0 to
/// the largest observed time. A row `i` with the event is comparable with
/// row `j` when `u_i < u_j`, or when `u_i >= u_j` and `j` had a competing
/// event. With a censoring distribution `G` the first kind of pair is
/// weighted by `1 / (G(u_i-) G(u_i))` and the second by `1 / (G(u_i-) G(u_j-))`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcordanceError {
    event: u32,
    censoring: Option<StepFunction>,
}

impl ConcordanceError {
    /// Unweighted concordance for `event`.
    #[must_use]
    pub fn naive(event: u32) -> Self {
        Self {
            event,
            censoring: None,
        }
    }

    /// Inverse-probability-of-censoring weighted concordance for `event`.
    #[must_use]
    pub fn ipcw(event: u32, censoring: StepFunction) -> Self {
        Self {
            event,
            censoring: Some(censoring),
        }
    }

    /// Event of interest.
    #[must_use]
    pub fn event(&self) -> u32 {
        self.event
    }

    fn pair_weight(&self, u_i: f64, u_j: f64, same_order: bool) -> f64 {
        let Some(g) = &self.censoring else {
            return 1.0;
        };
        let g_i = g.evaluate_previous(u_i);
        if same_order {
            1.0 / (g_i * g.evaluate(u_i))
        } else {
            1.0 / (g_i * g.evaluate_previous(u_j))
        }
    }
}

impl<Y: CompetingRiskOutcome + Sync> ErrorCalculator<Y, CompetingRiskFunctions> for ConcordanceError {
    fn error(&self, responses: &[&Y], predictions: &[&CompetingRiskFunctions]) -> f64 {
        let Some(tau) = responses.iter().map(|y| y.time()).max_by(f64::total_cmp) else {
            return f64::NAN;
        };
        let risks: Vec<f64> = predictions
            .iter()
            .map(|p| {
                p.cumulative_incidence(self.event)
                    .map_or(0.0, |cif| cif.integrate(0.0, tau))
            })
            .collect();

        let mut concordant = 0.0;
        let mut total = 0.0;
        for (i, y_i) in responses.iter().enumerate() {
            if y_i.delta() != self.event {
                continue;
            }
            let u_i = y_i.time();
            for (j, y_j) in responses.iter().enumerate() {
                if i == j {
                    continue;
                }
                let u_j = y_j.time();
                let weight = if u_i < u_j {
                    self.pair_weight(u_i, u_j, true)
                } else if y_j.delta() != 0 && y_j.delta() != self.event {
                    self.pair_weight(u_i, u_j, false)
                } else {
                    continue;
                };
                if !weight.is_finite() {
                    continue;
                }

                total += weight;
                if risks[i] > risks[j] {
                    concordant += weight;
                } else if risks[i] == risks[j] {
                    concordant += 0.5 * weight;
                }
            }
        }

        if total == 0.0 {
            f64::NAN
        } else {
            1.0 - concordant / total
        }
    }
}

/// Integrated Brier score of a cumulative incidence curve for one event.
///
/// For a row, integrates `(1{delta = event, u <= t} - F(t))^2` over
/// `[0, upper_bound]`. With a censoring distribution `G` the integrand is
/// weighted by `1 / G(t)` before `u`, by `1 / G(u-)` after an event at `u`,
/// and the integral stops at `u` for censored rows.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratedBrierScore {
    event: u32,
    upper_bound: f64,
    censoring: Option<StepFunction>,
}

impl IntegratedBrierScore {
    /// Unweighted score for `event` over `[0, upper_bound]`.
    #[must_use]
    pub fn new(event: u32, upper_bound: f64) -> Self {
        Self {
            event,
            upper_bound,
            censoring: None,
        }
    }

    /// Weight by the inverse of the censoring survival function.
    #[must_use]
    pub fn with_censoring(mut self, censoring: StepFunction) -> Self {
        self.censoring = Some(censoring);
        self
    }

    /// Event of interest.
    #[must_use]
    pub fn event(&self) -> u32 {
        self.event
    }

    /// Upper integration bound.
    #[must_use]
    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    /// Score one row's predicted cumulative incidence curve.
    #[must_use]
    pub fn score<Y: CompetingRiskOutcome>(&self, response: &Y, cif: &StepFunction) -> f64 {
        let u = response.time();
        let indicator = if response.delta() == self.event {
            StepFunction::new(vec![u], vec![1.0], 0.0)
        } else {
            StepFunction::constant(0.0)
        };
        let squared = StepFunction::bi_operation(&indicator, cif, |i, f| (i - f).powi(2));

        let Some(g) = &self.censoring else {
            return squared.integrate(0.0, self.upper_bound);
        };

        let mut times = Vec::new();
        let mut weights = Vec::new();
        for (t, value) in g.points().take_while(|&(t, _)| t < u) {
            times.push(t);
            weights.push(inverse_weight(value));
        }
        let bound = if response.is_censored() {
            self.upper_bound.min(u)
        } else {
            times.push(u);
            weights.push(inverse_weight(g.evaluate_previous(u)));
            self.upper_bound
        };
        let weight = StepFunction::new(times, weights, inverse_weight(g.default_value()));

        StepFunction::bi_operation(&squared, &weight, |s, w| s * w).integrate(0.0, bound)
    }
}

impl<Y: CompetingRiskOutcome + Sync> ErrorCalculator<Y, CompetingRiskFunctions> for IntegratedBrierScore {
    fn error(&self, responses: &[&Y], predictions: &[&CompetingRiskFunctions]) -> f64 {
        if responses.is_empty() {
            return f64::NAN;
        }
        let zero = StepFunction::constant(0.0);
        let sum: f64 = responses
            .iter()
            .zip(predictions)
            .map(|(y, p)| {
                let cif = p.cumulative_incidence(self.event).unwrap_or(&zero);
                self.score(*y, cif)
            })
            .sum();
        sum / responses.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::CompetingRiskResponse;

    fn cif() -> StepFunction {
        StepFunction::new(vec![1.0, 2.0, 3.0, 4.0], vec![0.1, 0.2, 0.3, 0.8], 0.0)
    }

    /// Curves where only the incidence of `event` 1 matters.
    fn functions(cif_value: f64) -> CompetingRiskFunctions {
        CompetingRiskFunctions::new(
            vec![1, 2],
            StepFunction::constant(1.0 - cif_value),
            vec![StepFunction::constant(0.0), StepFunction::constant(0.0)],
            vec![
                StepFunction::new(vec![0.5], vec![cif_value], 0.0),
                StepFunction::constant(0.0),
            ],
        )
    }

    #[test]
    fn mean_squared_error() {
        let ys = [1.0, 2.0, 3.0];
        let ps = [1.0, 3.0, 5.0];
        let ys: Vec<&f64> = ys.iter().collect();
        let ps: Vec<&f64> = ps.iter().collect();
        assert!((MeanSquaredError.error(&ys, &ps) - 5.0 / 3.0).abs() < 1e-12);
        assert!(MeanSquaredError.error(&[], &[]).is_nan());
    }

    #[test]
    fn brier_score_known_values() {
        let response = CompetingRiskResponse::new(1, 2.0);
        let other_event = IntegratedBrierScore::new(2, 5.0).score(&response, &cif());
        let same_event = IntegratedBrierScore::new(1, 5.0).score(&response, &cif());
        assert!((other_event - 0.78).abs() < 1e-6, "{other_event}");
        assert!((same_event - 1.18).abs() < 1e-6, "{same_event}");
    }

    #[test]
    fn brier_score_with_flat_censoring_matches_unweighted() {
        let response = CompetingRiskResponse::new(1, 2.0);
        let weighted = IntegratedBrierScore::new(1, 5.0)
            .with_censoring(StepFunction::constant(1.0))
            .score(&response, &cif());
        assert!((weighted - 1.18).abs() < 1e-9);
    }

    #[test]
    fn brier_score_stops_at_censoring() {
        // Censored at 2: only [0, 2] contributes, 0.1^2 over [1, 2].
        let response = CompetingRiskResponse::new(0, 2.0);
        let score = IntegratedBrierScore::new(1, 5.0)
            .with_censoring(StepFunction::constant(1.0))
            .score(&response, &cif());
        assert!((score - 0.01).abs() < 1e-9);
    }

    #[test]
    fn brier_score_weights_by_censoring_survival() {
        // G = 0.5 from t = 1, event at 3: weight 1 on [0, 1), 2 afterwards.
        let g = StepFunction::new(vec![1.0], vec![0.5], 1.0);
        let response = CompetingRiskResponse::new(1, 3.0);
        let score = IntegratedBrierScore::new(1, 4.0)
            .with_censoring(g)
            .score(&response, &cif());
        let expected = 2.0 * (0.01 + 0.04 + 0.49);
        assert!((score - expected).abs() < 1e-9, "{score}");
    }

    #[test]
    fn censoring_km_by_hand() {
        // Times 1 (event), 2 (censored), 3 (event), 4 (censored), 4 (event).
        let responses = [
            CompetingRiskResponse::new(1, 1.0),
            CompetingRiskResponse::new(0, 2.0),
            CompetingRiskResponse::new(2, 3.0),
            CompetingRiskResponse::new(0, 4.0),
            CompetingRiskResponse::new(1, 4.0),
        ];
        let refs: Vec<&CompetingRiskResponse> = responses.iter().collect();
        let g = censoring_survival_function(&refs);
        assert_eq!(g.times(), &[2.0, 4.0]);
        assert!((g.evaluate(2.0) - 0.75).abs() < 1e-12);
        assert!((g.evaluate(4.0) - 0.375).abs() < 1e-12);
        assert_eq!(g.evaluate(1.5), 1.0);
    }

    #[test]
    fn concordance_perfect_and_reversed() {
        let responses = [
            CompetingRiskResponse::new(1, 1.0),
            CompetingRiskResponse::new(1, 2.0),
            CompetingRiskResponse::new(0, 3.0),
            CompetingRiskResponse::new(2, 0.5),
        ];
        let refs: Vec<&CompetingRiskResponse> = responses.iter().collect();

        let good = [functions(0.9), functions(0.6), functions(0.1), functions(0.2)];
        let good: Vec<&CompetingRiskFunctions> = good.iter().collect();
        assert!(ConcordanceError::naive(1).error(&refs, &good).abs() < 1e-12);

        let bad = [functions(0.1), functions(0.5), functions(0.9), functions(0.95)];
        let bad: Vec<&CompetingRiskFunctions> = bad.iter().collect();
        assert!((ConcordanceError::naive(1).error(&refs, &bad) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn concordance_ties_count_half() {
        let responses = [CompetingRiskResponse::new(1, 1.0), CompetingRiskResponse::new(0, 2.0)];
        let refs: Vec<&CompetingRiskResponse> = responses.iter().collect();
        let same = [functions(0.5), functions(0.5)];
        let same: Vec<&CompetingRiskFunctions> = same.iter().collect();
        assert!((ConcordanceError::naive(1).error(&refs, &same) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn ipcw_concordance_with_flat_censoring_matches_naive() {
        let responses = [
            CompetingRiskResponse::new(1, 1.0),
            CompetingRiskResponse::new(2, 1.5),
            CompetingRiskResponse::new(1, 2.0),
            CompetingRiskResponse::new(0, 3.0),
        ];
        let refs: Vec<&CompetingRiskResponse> = responses.iter().collect();
        let predictions = [functions(0.7), functions(0.8), functions(0.3), functions(0.2)];
        let predictions: Vec<&CompetingRiskFunctions> = predictions.iter().collect();

        let naive = ConcordanceError::naive(1).error(&refs, &predictions);
        let weighted =
            ConcordanceError::ipcw(1, StepFunction::constant(1.0)).error(&refs, &predictions);
        assert!((naive - weighted).abs() < 1e-12);
    }

    #[test]
    fn concordance_without_comparable_pairs_is_nan() {
        let responses = [CompetingRiskResponse::new(0, 1.0), CompetingRiskResponse::new(0, 2.0)];
        let refs: Vec<&CompetingRiskResponse> = responses.iter().collect();
        let predictions = [functions(0.1), functions(0.2)];
        let predictions: Vec<&CompetingRiskFunctions> = predictions.iter().collect();
        assert!(ConcordanceError::naive(1).error(&refs, &predictions).is_nan());
    }
}
