//! Per-event risk sets and event counts over a fixed time grid.
//!
//! A row stays in the risk set of event `k` at every grid time up to and
//! including its exit time. The exit time is the observed time `u`, except
//! for Gray's variant where a row that experienced a different event stays
//! at risk until its censoring time `c`. A row without a censoring time
//! leaves at `u` in both variants.
//!
//! Counts are stored as exits per grid slot so adding a row is a binary
//! search and two increments; the at-risk curve is recovered with one
//! cumulative sweep.

use crate::response::CompetingRiskOutcome;

/// How a row's exit from the risk set is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskSetKind {
    /// Rows leave every risk set at their observed time.
    LogRank,
    /// Rows with a competing event stay in the risk set until their censoring time.
    Gray,
}

/// Risk-set and event-count tables for a group of rows.
#[derive(Debug, Clone)]
pub struct CompetingRiskSets {
    kind: RiskSetKind,
    times: Vec<f64>,
    events: Vec<u32>,
    n_rows: usize,
    // exits[slot][i]: rows whose last at-risk grid index is i - 1
    exits: Vec<Vec<usize>>,
    event_counts: Vec<Vec<usize>>,
    any_event_counts: Vec<usize>,
}

impl CompetingRiskSets {
    /// Create empty tables over `times` (sorted, distinct) for the listed `events`.
    #[must_use]
    pub fn empty(kind: RiskSetKind, times: Vec<f64>, events: Vec<u32>) -> Self {
        let m = times.len();
        let n_slots = match kind {
            RiskSetKind::LogRank => 1,
            RiskSetKind::Gray => events.len(),
        };
        Self {
            kind,
            exits: vec![vec![0; m + 1]; n_slots],
            event_counts: vec![vec![0; m]; events.len()],
            any_event_counts: vec![0; m],
            times,
            events,
            n_rows: 0,
        }
    }

    /// Build the tables for `responses` in one pass.
    #[must_use]
    pub fn from_responses<Y: CompetingRiskOutcome>(
        kind: RiskSetKind,
        times: Vec<f64>,
        events: Vec<u32>,
        responses: &[&Y],
    ) -> Self {
        let mut sets = Self::empty(kind, times, events);
        for &y in responses {
            sets.add(y);
        }
        sets
    }

    /// Add one row to the tables.
    pub fn add<Y: CompetingRiskOutcome>(&mut self, response: &Y) {
        let delta = response.delta();
        let u = response.time();
        let u_slot = self.grid_slot(u);

        match self.kind {
            RiskSetKind::LogRank => self.exits[0][u_slot] += 1,
            RiskSetKind::Gray => {
                for (pos, &event) in self.events.iter().enumerate() {
                    let exit = if delta != 0 && delta != event {
                        self.grid_slot(response.censor_time().unwrap_or(u))
                    } else {
                        u_slot
                    };
                    self.exits[pos][exit] += 1;
                }
            }
        }

        if delta != 0 && u_slot > 0 && self.times[u_slot - 1] == u {
            self.any_event_counts[u_slot - 1] += 1;
            if let Some(pos) = self.events.iter().position(|&e| e == delta) {
                self.event_counts[pos][u_slot - 1] += 1;
            }
        }

        self.n_rows += 1;
    }

    // Number of grid times <= `time`; a row is at risk at grid index j iff j < slot.
    fn grid_slot(&self, time: f64) -> usize {
        self.times.partition_point(|&t| t <= time)
    }

    /// Number of rows at risk for the event at position `event_pos`, per grid time.
    #[must_use]
    pub fn risk_set(&self, event_pos: usize) -> Vec<usize> {
        let slot = match self.kind {
            RiskSetKind::LogRank => 0,
            RiskSetKind::Gray => event_pos,
        };
        let exits = &self.exits[slot];
        let mut remaining = self.n_rows;
        let mut curve = Vec::with_capacity(self.times.len());
        for &left in &exits[..self.times.len()] {
            remaining -= left;
            curve.push(remaining);
        }
        curve
    }

    /// Number of events of the type at `event_pos`, per grid time.
    #[must_use]
    pub fn number_of_events(&self, event_pos: usize) -> &[usize] {
        &self.event_counts[event_pos]
    }

    /// Number of events of any type (including unlisted ones), per grid time.
    #[must_use]
    pub fn number_of_any_events(&self) -> &[usize] {
        &self.any_event_counts
    }

    /// Grid position of `time`, if it is one of the grid times.
    #[must_use]
    pub fn time_index(&self, time: f64) -> Option<usize> {
        self.times
            .binary_search_by(|t| t.total_cmp(&time))
            .ok()
    }

    /// Number at risk for `event` at exactly grid time `time`.
    #[must_use]
    pub fn at_risk(&self, event: u32, time: f64) -> Option<usize> {
        let pos = self.events.iter().position(|&e| e == event)?;
        let idx = self.time_index(time)?;
        self.risk_set(pos).get(idx).copied()
    }

    /// Grid times.
    #[must_use]
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Event types tracked, in position order.
    #[must_use]
    pub fn events(&self) -> &[u32] {
        &self.events
    }

    /// Number of rows added.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Risk-set kind.
    #[must_use]
    pub fn kind(&self) -> RiskSetKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{
        CompetingRiskResponse, CompetingRiskResponseWithCensorTime, distinct_event_times,
    };

    fn data() -> Vec<CompetingRiskResponseWithCensorTime> {
        [
            (1, 1.0, 3.0),
            (1, 1.0, 3.0),
            (0, 1.0, 1.0),
            (1, 2.0, 2.5),
            (2, 3.0, 4.0),
            (0, 3.0, 3.0),
            (1, 4.0, 4.0),
            (0, 5.0, 5.0),
            (2, 6.0, 7.0),
        ]
        .into_iter()
        .map(|(d, u, c)| CompetingRiskResponseWithCensorTime::new(d, u, c))
        .collect()
    }

    #[test]
    fn plain_risk_set_counts_rows_still_followed() {
        let data = data();
        let refs: Vec<_> = data.iter().collect();
        let times = distinct_event_times(&refs);
        let sets = CompetingRiskSets::from_responses(RiskSetKind::LogRank, times, vec![1, 2], &refs);

        assert_eq!(sets.at_risk(1, 2.0), Some(6));
        assert_eq!(sets.at_risk(2, 2.0), Some(6));
        assert_eq!(sets.at_risk(1, 1.0), Some(9));
        assert_eq!(sets.at_risk(2, 6.0), Some(1));
    }

    #[test]
    fn gray_risk_set_keeps_competing_events_until_censoring() {
        let data = data();
        let refs: Vec<_> = data.iter().collect();
        let times = distinct_event_times(&refs);
        let sets = CompetingRiskSets::from_responses(RiskSetKind::Gray, times, vec![1, 2], &refs);

        // event-1 rows (censored at 3.0) remain in event 2's risk set
        assert_eq!(sets.at_risk(2, 2.0), Some(8));
        // the event-2 row at u = 3 (c = 4) remains in event 1's risk set at t = 4
        assert_eq!(sets.at_risk(1, 4.0), Some(4));
    }

    #[test]
    fn gray_without_censor_time_exits_at_observed_time() {
        let data: Vec<CompetingRiskResponse> = data()
            .iter()
            .map(|r| CompetingRiskResponse::new(r.delta, r.u))
            .collect();
        let refs: Vec<_> = data.iter().collect();
        let times = distinct_event_times(&refs);
        let plain =
            CompetingRiskSets::from_responses(RiskSetKind::LogRank, times.clone(), vec![1, 2], &refs);
        let gray = CompetingRiskSets::from_responses(RiskSetKind::Gray, times, vec![1, 2], &refs);

        assert_eq!(gray.risk_set(0), plain.risk_set(0));
        assert_eq!(gray.risk_set(1), plain.risk_set(0));
    }

    #[test]
    fn event_counts_are_per_type() {
        let data = data();
        let refs: Vec<_> = data.iter().collect();
        let times = distinct_event_times(&refs);
        let sets = CompetingRiskSets::from_responses(RiskSetKind::LogRank, times, vec![1, 2], &refs);

        assert_eq!(sets.times(), &[1.0, 2.0, 3.0, 4.0, 6.0]);
        assert_eq!(sets.number_of_events(0), &[2, 1, 0, 1, 0]);
        assert_eq!(sets.number_of_events(1), &[0, 0, 1, 0, 1]);
        assert_eq!(sets.number_of_any_events(), &[2, 1, 1, 1, 1]);
    }

    #[test]
    fn incremental_add_matches_batch_build() {
        let data: Vec<CompetingRiskResponse> = data()
            .iter()
            .map(|r| CompetingRiskResponse::new(r.delta, r.u))
            .collect();
        let refs: Vec<_> = data.iter().collect();
        let times = distinct_event_times(&refs);

        let batch =
            CompetingRiskSets::from_responses(RiskSetKind::LogRank, times.clone(), vec![1], &refs[..4]);
        let mut incremental = CompetingRiskSets::empty(RiskSetKind::LogRank, times, vec![1]);
        for y in &refs[..4] {
            incremental.add(*y);
        }

        assert_eq!(batch.risk_set(0), incremental.risk_set(0));
        assert_eq!(batch.number_of_events(0), incremental.number_of_events(0));
        assert_eq!(incremental.n_rows(), 4);
    }

    #[test]
    fn rows_past_the_grid_stay_at_risk_throughout() {
        let y = CompetingRiskResponse::new(0, 10.0);
        let mut sets = CompetingRiskSets::empty(RiskSetKind::LogRank, vec![1.0, 2.0], vec![1]);
        sets.add(&y);
        assert_eq!(sets.risk_set(0), vec![1, 1]);
    }
}
