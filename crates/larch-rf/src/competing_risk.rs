//! Competing-risk estimators for terminal nodes and for whole forests.
//!
//! A leaf summarises its rows with the Kaplan-Meier survival curve, the
//! Nelson-Aalen cause-specific cumulative hazards and the Aalen-Johansen
//! cumulative incidence functions. A forest averages these curves pointwise.

use crate::combiner::{Accumulator, EnsembleCombiner, ResponseCombiner};
use crate::response::{CompetingRiskOutcome, distinct_event_times};
use crate::risk_set::{CompetingRiskSets, RiskSetKind};
use crate::step_function::StepFunction;

/// Survival, cause-specific hazard and cumulative incidence curves.
///
/// Hazards and incidences are stored in the order of [`Self::events`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompetingRiskFunctions {
    events: Vec<u32>,
    survival: StepFunction,
    cause_specific_hazards: Vec<StepFunction>,
    cumulative_incidence: Vec<StepFunction>,
}

impl CompetingRiskFunctions {
    /// Assemble the curves for `events`.
    ///
    /// # Panics
    ///
    /// Panics when the hazard or incidence lists do not have one curve per event.
    #[must_use]
    pub fn new(
        events: Vec<u32>,
        survival: StepFunction,
        cause_specific_hazards: Vec<StepFunction>,
        cumulative_incidence: Vec<StepFunction>,
    ) -> Self {
        assert_eq!(events.len(), cause_specific_hazards.len());
        assert_eq!(events.len(), cumulative_incidence.len());
        Self {
            events,
            survival,
            cause_specific_hazards,
            cumulative_incidence,
        }
    }

    /// Event types covered.
    #[must_use]
    pub fn events(&self) -> &[u32] {
        &self.events
    }

    /// Probability of remaining event-free.
    #[must_use]
    pub fn survival(&self) -> &StepFunction {
        &self.survival
    }

    /// Nelson-Aalen cumulative hazard of `event`.
    #[must_use]
    pub fn cause_specific_hazard(&self, event: u32) -> Option<&StepFunction> {
        let pos = self.events.iter().position(|&e| e == event)?;
        self.cause_specific_hazards.get(pos)
    }

    /// Cumulative incidence of `event`.
    #[must_use]
    pub fn cumulative_incidence(&self, event: u32) -> Option<&StepFunction> {
        let pos = self.events.iter().position(|&e| e == event)?;
        self.cumulative_incidence.get(pos)
    }

    /// All cause-specific hazards, in event order.
    #[must_use]
    pub fn cause_specific_hazards(&self) -> &[StepFunction] {
        &self.cause_specific_hazards
    }

    /// All cumulative incidences, in event order.
    #[must_use]
    pub fn cumulative_incidences(&self) -> &[StepFunction] {
        &self.cumulative_incidence
    }

    fn curves(&self) -> impl Iterator<Item = &StepFunction> {
        std::iter::once(&self.survival)
            .chain(&self.cause_specific_hazards)
            .chain(&self.cumulative_incidence)
    }
}

/// Leaf combiner producing [`CompetingRiskFunctions`] from the rows in a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetingRiskResponseCombiner {
    events: Vec<u32>,
}

impl CompetingRiskResponseCombiner {
    /// Estimate curves for `events`.
    #[must_use]
    pub fn new(events: Vec<u32>) -> Self {
        Self { events }
    }

    /// Event types estimated.
    #[must_use]
    pub fn events(&self) -> &[u32] {
        &self.events
    }
}

impl<Y: CompetingRiskOutcome + Sync> ResponseCombiner<Y, CompetingRiskFunctions>
    for CompetingRiskResponseCombiner
{
    fn combine(&self, responses: &[&Y]) -> CompetingRiskFunctions {
        let times = distinct_event_times(responses);
        let sets = CompetingRiskSets::from_responses(
            RiskSetKind::LogRank,
            times.clone(),
            self.events.clone(),
            responses,
        );
        let at_risk = sets.risk_set(0);
        let any_events = sets.number_of_any_events();
        let n_events = self.events.len();

        let mut survival = Vec::with_capacity(times.len());
        let mut hazards = vec![Vec::with_capacity(times.len()); n_events];
        let mut incidences = vec![Vec::with_capacity(times.len()); n_events];

        let mut s = 1.0;
        let mut hazard = vec![0.0; n_events];
        let mut incidence = vec![0.0; n_events];

        for j in 0..times.len() {
            let y = at_risk[j] as f64;
            let s_before = s;
            if y > 0.0 {
                s *= 1.0 - any_events[j] as f64 / y;
                for pos in 0..n_events {
                    let rate = sets.number_of_events(pos)[j] as f64 / y;
                    hazard[pos] += rate;
                    incidence[pos] += s_before * rate;
                }
            }
            survival.push(s);
            for pos in 0..n_events {
                hazards[pos].push(hazard[pos]);
                incidences[pos].push(incidence[pos]);
            }
        }

        CompetingRiskFunctions {
            events: self.events.clone(),
            survival: StepFunction::new(times.clone(), survival, 1.0),
            cause_specific_hazards: hazards
                .into_iter()
                .map(|values| StepFunction::new(times.clone(), values, 0.0))
                .collect(),
            cumulative_incidence: incidences
                .into_iter()
                .map(|values| StepFunction::new(times.clone(), values, 0.0))
                .collect(),
        }
    }
}

/// Forest combiner averaging [`CompetingRiskFunctions`] pointwise.
///
/// With a time grid the averaged curves have exactly the grid's points;
/// without one they have every time point of every tree's curves.
#[derive(Debug, Clone, PartialEq)]
pub struct CompetingRiskFunctionCombiner {
    events: Vec<u32>,
    times: Option<Vec<f64>>,
}

impl CompetingRiskFunctionCombiner {
    /// Average curves for `events`, optionally restricted to `times`.
    #[must_use]
    pub fn new(events: Vec<u32>, times: Option<Vec<f64>>) -> Self {
        let times = times.map(|mut grid| {
            grid.sort_unstable_by(f64::total_cmp);
            grid.dedup();
            grid
        });
        Self { events, times }
    }

    /// Event types averaged.
    #[must_use]
    pub fn events(&self) -> &[u32] {
        &self.events
    }

    /// Time grid, if restricted.
    #[must_use]
    pub fn times(&self) -> Option<&[f64]> {
        self.times.as_deref()
    }

    fn empty_sum(&self) -> CurveSum {
        match &self.times {
            Some(grid) => CurveSum::Grid {
                values: vec![0.0; grid.len()],
                times: grid.clone(),
                default_value: 0.0,
            },
            None => CurveSum::Merged(StepFunction::constant(0.0)),
        }
    }
}

fn union_of_times(outputs: &[&CompetingRiskFunctions]) -> Vec<f64> {
    let mut grid: Vec<f64> = outputs
        .iter()
        .flat_map(|o| o.curves())
        .flat_map(|f| f.times().iter().copied())
        .collect();
    grid.sort_unstable_by(f64::total_cmp);
    grid.dedup();
    grid
}

fn average_on_grid<'a>(
    curves: impl Iterator<Item = &'a StepFunction>,
    grid: &[f64],
    n: usize,
) -> StepFunction {
    let mut values = vec![0.0; grid.len()];
    let mut default_value = 0.0;
    for curve in curves {
        default_value += curve.default_value();
        for (slot, &t) in values.iter_mut().zip(grid) {
            *slot += curve.evaluate(t);
        }
    }
    let n = n as f64;
    StepFunction::new(
        grid.to_vec(),
        values.into_iter().map(|v| v / n).collect(),
        default_value / n,
    )
}

impl EnsembleCombiner<CompetingRiskFunctions> for CompetingRiskFunctionCombiner {
    type Output = CompetingRiskFunctions;
    type Accumulator = CompetingRiskAccumulator;

    fn combine(&self, outputs: &[&CompetingRiskFunctions]) -> CompetingRiskFunctions {
        let grid = match &self.times {
            Some(grid) => grid.clone(),
            None => union_of_times(outputs),
        };
        let n = outputs.len();

        let survival = average_on_grid(outputs.iter().map(|o| &o.survival), &grid, n);
        let cause_specific_hazards = (0..self.events.len())
            .map(|pos| {
                average_on_grid(
                    outputs.iter().map(|o| &o.cause_specific_hazards[pos]),
                    &grid,
                    n,
                )
            })
            .collect();
        let cumulative_incidence = (0..self.events.len())
            .map(|pos| {
                average_on_grid(
                    outputs.iter().map(|o| &o.cumulative_incidence[pos]),
                    &grid,
                    n,
                )
            })
            .collect();

        CompetingRiskFunctions {
            events: self.events.clone(),
            survival,
            cause_specific_hazards,
            cumulative_incidence,
        }
    }

    fn accumulator(&self, expected: usize) -> CompetingRiskAccumulator {
        CompetingRiskAccumulator {
            events: self.events.clone(),
            expected: expected.max(1),
            count: 0,
            survival: self.empty_sum(),
            hazards: (0..self.events.len()).map(|_| self.empty_sum()).collect(),
            incidences: (0..self.events.len()).map(|_| self.empty_sum()).collect(),
        }
    }
}

/// Running pointwise sum of weighted curves.
#[derive(Debug, Clone)]
enum CurveSum {
    Grid {
        times: Vec<f64>,
        values: Vec<f64>,
        default_value: f64,
    },
    Merged(StepFunction),
}

impl CurveSum {
    fn add(&mut self, curve: &StepFunction, weight: f64) {
        match self {
            CurveSum::Grid {
                times,
                values,
                default_value,
            } => {
                *default_value += curve.default_value() * weight;
                for (slot, &t) in values.iter_mut().zip(times.iter()) {
                    *slot += curve.evaluate(t) * weight;
                }
            }
            CurveSum::Merged(sum) => {
                *sum = StepFunction::bi_operation(sum, curve, |a, b| a + b * weight);
            }
        }
    }

    fn finish(self, scale: f64) -> StepFunction {
        match self {
            CurveSum::Grid {
                times,
                values,
                default_value,
            } => StepFunction::new(
                times,
                values.into_iter().map(|v| v * scale).collect(),
                default_value * scale,
            ),
            CurveSum::Merged(sum) => sum.unary_operation(|v| v * scale),
        }
    }
}

/// Streaming state for [`CompetingRiskFunctionCombiner`].
#[derive(Debug, Clone)]
pub struct CompetingRiskAccumulator {
    events: Vec<u32>,
    expected: usize,
    count: usize,
    survival: CurveSum,
    hazards: Vec<CurveSum>,
    incidences: Vec<CurveSum>,
}

impl Accumulator<CompetingRiskFunctions> for CompetingRiskAccumulator {
    type Output = CompetingRiskFunctions;

    fn add(&mut self, output: &CompetingRiskFunctions) {
        let weight = 1.0 / self.expected as f64;
        self.survival.add(&output.survival, weight);
        for (sum, curve) in self.hazards.iter_mut().zip(&output.cause_specific_hazards) {
            sum.add(curve, weight);
        }
        for (sum, curve) in self.incidences.iter_mut().zip(&output.cumulative_incidence) {
            sum.add(curve, weight);
        }
        self.count += 1;
    }

    fn count(&self) -> usize {
        self.count
    }

    fn finish(self) -> Option<CompetingRiskFunctions> {
        if self.count == 0 {
            return None;
        }
        let scale = self.expected as f64 / self.count as f64;
        Some(CompetingRiskFunctions {
            events: self.events,
            survival: self.survival.finish(scale),
            cause_specific_hazards: self.hazards.into_iter().map(|s| s.finish(scale)).collect(),
            cumulative_incidence: self
                .incidences
                .into_iter()
                .map(|s| s.finish(scale))
                .collect(),
        })
    }
}
