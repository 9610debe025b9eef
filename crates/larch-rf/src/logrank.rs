//! Log-rank split scores for competing-risk outcomes.
//!
//! The single-event variant tests one event of interest; the multiple-event
//! variant pools numerators and variances over every listed event. Both come
//! in a plain flavour and in Gray's flavour, which keeps rows with a
//! competing event in the risk set until their censoring time.

use crate::response::{CompetingRiskOutcome, HasCensorTime, distinct_event_times};
use crate::risk_set::{CompetingRiskSets, RiskSetKind};
use crate::scorer::{IncrementalScore, SplitScorer};

/// Which events a log-rank score tests.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Focus {
    Single,
    Multiple,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogRankTest {
    events: Vec<u32>,
    focus: Focus,
    kind: RiskSetKind,
}

/// Sum of log-rank numerators and variances for one event.
#[derive(Debug, Clone, Copy, Default)]
struct LogRankTerm {
    numerator: f64,
    variance: f64,
}

fn log_rank_term(left: &CompetingRiskSets, total: &CompetingRiskSets, pos: usize) -> LogRankTerm {
    let left_at_risk = left.risk_set(pos);
    let total_at_risk = total.risk_set(pos);
    let left_events = left.number_of_events(pos);
    let total_events = total.number_of_events(pos);

    let mut term = LogRankTerm::default();
    for j in 0..total_events.len() {
        let d = total_events[j] as f64;
        let y = total_at_risk[j] as f64;
        if d == 0.0 || y == 0.0 {
            continue;
        }
        let d_left = left_events[j] as f64;
        let share = left_at_risk[j] as f64 / y;

        term.numerator += d_left - d * share;

        // undefined when only one row is at risk
        let variance = share * (1.0 - share) * d * (y - d) / (y - 1.0);
        if variance.is_finite() {
            term.variance += variance;
        }
    }
    term
}

impl LogRankTest {
    fn score_sets(&self, left: &CompetingRiskSets, total: &CompetingRiskSets) -> f64 {
        let (numerator, variance) = match self.focus {
            Focus::Single => {
                let term = log_rank_term(left, total, 0);
                (term.numerator, term.variance)
            }
            Focus::Multiple => (0..self.events.len())
                .map(|pos| log_rank_term(left, total, pos))
                .fold((0.0, 0.0), |(n, v), t| (n + t.numerator, v + t.variance)),
        };
        if variance <= 0.0 {
            return f64::NAN;
        }
        numerator.abs() / variance.sqrt()
    }

    fn empty_sets(&self, times: Vec<f64>) -> CompetingRiskSets {
        CompetingRiskSets::empty(self.kind, times, self.events.clone())
    }

    fn score<Y: CompetingRiskOutcome>(&self, left: &[&Y], right: &[&Y]) -> f64 {
        if left.is_empty() || right.is_empty() {
            return f64::NAN;
        }
        let all: Vec<&Y> = left.iter().chain(right).copied().collect();
        let mut state = self.start(&all);
        for &y in left {
            state.left.add(y);
        }
        state.current()
    }

    fn start<Y: CompetingRiskOutcome>(&self, responses: &[&Y]) -> LogRankState {
        let times = distinct_event_times(responses);
        let left = self.empty_sets(times.clone());
        let total = CompetingRiskSets::from_responses(self.kind, times, self.events.clone(), responses);
        LogRankState {
            test: self.clone(),
            left,
            total,
        }
    }
}

/// Sweep state shared by every log-rank scorer.
#[derive(Debug, Clone)]
pub struct LogRankState {
    test: LogRankTest,
    left: CompetingRiskSets,
    total: CompetingRiskSets,
}

impl LogRankState {
    fn current(&self) -> f64 {
        let n_left = self.left.n_rows();
        if n_left == 0 || n_left == self.total.n_rows() {
            return f64::NAN;
        }
        self.test.score_sets(&self.left, &self.total)
    }
}

impl<Y: CompetingRiskOutcome> IncrementalScore<Y> for LogRankState {
    fn move_left(&mut self, response: &Y) {
        self.left.add(response);
    }

    fn score(&self) -> f64 {
        self.current()
    }
}

/// Log-rank scorer with plain risk sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRankScorer {
    test: LogRankTest,
}

impl LogRankScorer {
    /// Test only `event`.
    #[must_use]
    pub fn single(event: u32) -> Self {
        Self {
            test: LogRankTest {
                events: vec![event],
                focus: Focus::Single,
                kind: RiskSetKind::LogRank,
            },
        }
    }

    /// Pool the test over all `events`.
    #[must_use]
    pub fn multiple(events: Vec<u32>) -> Self {
        Self {
            test: LogRankTest {
                events,
                focus: Focus::Multiple,
                kind: RiskSetKind::LogRank,
            },
        }
    }
}

impl<Y: CompetingRiskOutcome + Sync> SplitScorer<Y> for LogRankScorer {
    type State = LogRankState;

    fn score(&self, left: &[&Y], right: &[&Y]) -> f64 {
        self.test.score(left, right)
    }

    fn start(&self, responses: &[&Y]) -> LogRankState {
        self.test.start(responses)
    }
}

/// Log-rank scorer with Gray's risk sets; requires known censoring times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayLogRankScorer {
    test: LogRankTest,
}

impl GrayLogRankScorer {
    /// Test only `event`.
    #[must_use]
    pub fn single(event: u32) -> Self {
        Self {
            test: LogRankTest {
                events: vec![event],
                focus: Focus::Single,
                kind: RiskSetKind::Gray,
            },
        }
    }

    /// Pool the test over all `events`.
    #[must_use]
    pub fn multiple(events: Vec<u32>) -> Self {
        Self {
            test: LogRankTest {
                events,
                focus: Focus::Multiple,
                kind: RiskSetKind::Gray,
            },
        }
    }
}

impl<Y: HasCensorTime + Sync> SplitScorer<Y> for GrayLogRankScorer {
    type State = LogRankState;

    fn score(&self, left: &[&Y], right: &[&Y]) -> f64 {
        self.test.score(left, right)
    }

    fn start(&self, responses: &[&Y]) -> LogRankState {
        self.test.start(responses)
    }
}
