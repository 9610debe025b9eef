//! Competing-risk outcome types.
//!
//! `delta == 0` marks a censored observation; any positive `delta` names the
//! event type that ended follow-up at time `u`.

/// An observation with an event indicator and an observed time.
pub trait CompetingRiskOutcome {
    /// Event type, `0` when censored.
    fn delta(&self) -> u32;

    /// Observed time (event or censoring).
    fn time(&self) -> f64;

    /// Censoring time, when the outcome records one.
    fn censor_time(&self) -> Option<f64> {
        None
    }

    /// Return `true` when no event was observed.
    fn is_censored(&self) -> bool {
        self.delta() == 0
    }
}

/// Marker for outcomes whose [`CompetingRiskOutcome::censor_time`] is always `Some`.
///
/// Gray's test only accepts these outcomes.
pub trait HasCensorTime: CompetingRiskOutcome {}

/// A competing-risk outcome without censoring time.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompetingRiskResponse {
    /// Event type, `0` when censored.
    pub delta: u32,
    /// Observed time.
    pub u: f64,
}

impl CompetingRiskResponse {
    /// Create a response.
    #[must_use]
    pub fn new(delta: u32, u: f64) -> Self {
        Self { delta, u }
    }
}

impl CompetingRiskOutcome for CompetingRiskResponse {
    fn delta(&self) -> u32 {
        self.delta
    }

    fn time(&self) -> f64 {
        self.u
    }
}

/// A competing-risk outcome that also records its censoring time `c >= u`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompetingRiskResponseWithCensorTime {
    /// Event type, `0` when censored.
    pub delta: u32,
    /// Observed time.
    pub u: f64,
    /// Censoring time.
    pub c: f64,
}

impl CompetingRiskResponseWithCensorTime {
    /// Create a response.
    #[must_use]
    pub fn new(delta: u32, u: f64, c: f64) -> Self {
        Self { delta, u, c }
    }
}

impl CompetingRiskOutcome for CompetingRiskResponseWithCensorTime {
    fn delta(&self) -> u32 {
        self.delta
    }

    fn time(&self) -> f64 {
        self.u
    }

    fn censor_time(&self) -> Option<f64> {
        Some(self.c)
    }
}

impl HasCensorTime for CompetingRiskResponseWithCensorTime {}

/// Sorted distinct finite times at which any event (not censoring) occurred.
pub(crate) fn distinct_event_times<Y: CompetingRiskOutcome>(responses: &[&Y]) -> Vec<f64> {
    let mut times: Vec<f64> = responses
        .iter()
        .filter(|y| !y.is_censored())
        .map(|y| y.time())
        .filter(|t| t.is_finite())
        .collect();
    times.sort_unstable_by(f64::total_cmp);
    times.dedup();
    times
}
