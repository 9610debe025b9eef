use rand::Rng;
use rand::seq::index;

use crate::covariate::{Covariate, CovariateKind, CovariateValue, Row};
use crate::error::ForestError;
use crate::scorer::{IncrementalScore, SplitScorer};

/// Most levels a factor may have when every partition is requested.
pub(crate) const MAX_EXHAUSTIVE_FACTOR_LEVELS: usize = 16;

/// Partitions of a factor with [`MAX_EXHAUSTIVE_FACTOR_LEVELS`] levels; also caps random draws.
const MAX_FACTOR_PARTITIONS: usize = (1 << (MAX_EXHAUSTIVE_FACTOR_LEVELS - 1)) - 1;

/// A rule sending a row to the left or right child.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SplitRule {
    /// `value <= threshold` goes left.
    Numeric {
        /// Covariate index.
        covariate: usize,
        /// Largest value sent left.
        threshold: f64,
    },
    /// `false` goes left.
    Boolean {
        /// Covariate index.
        covariate: usize,
    },
    /// Levels in `left_levels` go left.
    Factor {
        /// Covariate index.
        covariate: usize,
        /// Sorted level positions sent left.
        left_levels: Vec<u32>,
    },
}

impl SplitRule {
    /// Index of the covariate this rule reads.
    #[must_use]
    pub fn covariate(&self) -> usize {
        match self {
            SplitRule::Numeric { covariate, .. }
            | SplitRule::Boolean { covariate }
            | SplitRule::Factor { covariate, .. } => *covariate,
        }
    }

    /// Side for `value`: `Some(true)` for left, `None` when the value is
    /// missing or of a different type than the rule.
    #[must_use]
    pub fn goes_left(&self, value: CovariateValue) -> Option<bool> {
        match (self, value) {
            (SplitRule::Numeric { threshold, .. }, CovariateValue::Numeric(x)) => {
                Some(x <= *threshold)
            }
            (SplitRule::Boolean { .. }, CovariateValue::Boolean(b)) => Some(!b),
            (SplitRule::Factor { left_levels, .. }, CovariateValue::Factor(level)) => {
                Some(left_levels.binary_search(&level).is_ok())
            }
            _ => None,
        }
    }
}

/// A scored partition of a node's rows.
#[derive(Debug)]
pub(crate) struct Split<'r, Y> {
    pub(crate) rule: SplitRule,
    pub(crate) score: f64,
    pub(crate) left: Vec<&'r Row<Y>>,
    pub(crate) right: Vec<&'r Row<Y>>,
    pub(crate) missing: Vec<&'r Row<Y>>,
}

impl<'r, Y> Split<'r, Y> {
    /// Fraction of non-missing rows sent left.
    pub(crate) fn probability_na_left(&self) -> f64 {
        self.left.len() as f64 / (self.left.len() + self.right.len()) as f64
    }

    /// Rescore with missing rows assigned at random and keep the worse score.
    ///
    /// A covariate with many missing values cannot look better than it would
    /// once those rows are placed.
    pub(crate) fn penalize_missing<S: SplitScorer<Y>>(&mut self, scorer: &S, rng: &mut impl Rng) {
        if self.missing.is_empty() {
            return;
        }
        let p = self.probability_na_left();
        let mut left: Vec<&Y> = self.left.iter().map(|r| r.response()).collect();
        let mut right: Vec<&Y> = self.right.iter().map(|r| r.response()).collect();
        for row in &self.missing {
            if rng.r#gen::<f64>() < p {
                left.push(row.response());
            } else {
                right.push(row.response());
            }
        }
        self.score = self.score.min(scorer.score(&left, &right));
    }

    /// Final child row sets with every missing row placed by its own draw.
    pub(crate) fn into_children(
        self,
        rng: &mut impl Rng,
    ) -> (SplitRule, f64, Vec<&'r Row<Y>>, Vec<&'r Row<Y>>) {
        let p = self.probability_na_left();
        let (mut left, mut right) = (self.left, self.right);
        for row in self.missing {
            if rng.r#gen::<f64>() < p {
                left.push(row);
            } else {
                right.push(row);
            }
        }
        (self.rule, p, left, right)
    }
}

/// A numeric boundary reached by [`NumericSplitCursor::advance`].
pub(crate) struct NumericBoundary<'a, 'r, Y> {
    pub(crate) position: usize,
    pub(crate) threshold: f64,
    /// Rows moved from right to left since the previous boundary.
    pub(crate) moved: &'a [&'r Row<Y>],
}

/// Walks the distinct-value boundaries of a numeric covariate in sorted order.
pub(crate) struct NumericSplitCursor<'r, Y> {
    covariate: usize,
    values: Vec<f64>,
    rows: Vec<&'r Row<Y>>,
    missing: Vec<&'r Row<Y>>,
    boundaries: Vec<usize>,
    next: usize,
    moved: usize,
}

impl<'r, Y> NumericSplitCursor<'r, Y> {
    /// Sort `rows` by the covariate and pick the boundaries to visit.
    ///
    /// `number_of_splits == 0` visits every boundary; otherwise at most that
    /// many are drawn at random.
    pub(crate) fn new(
        covariate: usize,
        rows: &[&'r Row<Y>],
        number_of_splits: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let mut present: Vec<(f64, &'r Row<Y>)> = Vec::with_capacity(rows.len());
        let mut missing = Vec::new();
        for &row in rows {
            match row.value(covariate) {
                CovariateValue::Numeric(x) => present.push((x, row)),
                _ => missing.push(row),
            }
        }
        present.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (values, rows): (Vec<f64>, Vec<&'r Row<Y>>) = present.into_iter().unzip();
        let mut boundaries: Vec<usize> = (1..values.len())
            .filter(|&p| values[p - 1] < values[p])
            .collect();
        if number_of_splits > 0 && number_of_splits < boundaries.len() {
            let mut picked: Vec<usize> = index::sample(rng, boundaries.len(), number_of_splits)
                .into_iter()
                .map(|i| boundaries[i])
                .collect();
            picked.sort_unstable();
            boundaries = picked;
        }

        Self {
            covariate,
            values,
            rows,
            missing,
            boundaries,
            next: 0,
            moved: 0,
        }
    }

    /// Rows with a value for the covariate, in sorted order.
    pub(crate) fn present_rows(&self) -> &[&'r Row<Y>] {
        &self.rows
    }

    /// Number of boundaries this cursor will visit.
    pub(crate) fn n_boundaries(&self) -> usize {
        self.boundaries.len()
    }

    /// Step to the next boundary.
    pub(crate) fn advance(&mut self) -> Option<NumericBoundary<'_, 'r, Y>> {
        let position = *self.boundaries.get(self.next)?;
        self.next += 1;
        let start = std::mem::replace(&mut self.moved, position);
        Some(NumericBoundary {
            position,
            threshold: self.values[position - 1],
            moved: &self.rows[start..position],
        })
    }

    /// Split at a boundary previously returned by [`Self::advance`].
    pub(crate) fn into_split(self, position: usize, threshold: f64, score: f64) -> Split<'r, Y> {
        let mut left = self.rows;
        let right = left.split_off(position);
        Split {
            rule: SplitRule::Numeric {
                covariate: self.covariate,
                threshold,
            },
            score,
            left,
            right,
            missing: self.missing,
        }
    }
}

/// Left-level sets to try for a factor with `n_levels` levels.
///
/// Level `0` always stays right, so every partition is listed once. A budget
/// of `0`, or one covering all `2^(L-1) - 1` partitions, enumerates them;
/// otherwise up to `min(budget, MAX_FACTOR_PARTITIONS)` distinct partitions
/// are drawn at random.
pub(crate) fn factor_partitions(
    n_levels: usize,
    number_of_splits: usize,
    rng: &mut impl Rng,
) -> Vec<Vec<u32>> {
    if n_levels < 2 {
        return Vec::new();
    }
    let free = n_levels - 1;
    let total = u32::try_from(free)
        .ok()
        .and_then(|free| 1usize.checked_shl(free))
        .map_or(usize::MAX, |count| count - 1);

    let enumerate_all = number_of_splits == 0 || total <= number_of_splits;
    if enumerate_all && total <= MAX_FACTOR_PARTITIONS {
        return (1..=total)
            .map(|mask| {
                (0..free)
                    .filter(|bit| mask & (1 << bit) != 0)
                    .map(|bit| bit as u32 + 1)
                    .collect()
            })
            .collect();
    }

    let budget = if number_of_splits == 0 {
        MAX_FACTOR_PARTITIONS
    } else {
        number_of_splits.min(total).min(MAX_FACTOR_PARTITIONS)
    };
    let mut seen = std::collections::BTreeSet::new();
    let mut partitions = Vec::with_capacity(budget);
    let max_attempts = budget.saturating_mul(16);
    let mut attempts = 0usize;
    while partitions.len() < budget && attempts < max_attempts {
        attempts += 1;
        let levels: Vec<u32> = (1..n_levels as u32).filter(|_| rng.gen_bool(0.5)).collect();
        if !levels.is_empty() && seen.insert(levels.clone()) {
            partitions.push(levels);
        }
    }
    partitions
}

/// Reject factors too wide to enumerate when `number_of_splits` asks for every partition.
///
/// # Errors
///
/// | Variant | When |
/// |---------|------|
/// | [`ForestError::TooManyFactorLevels`] | `number_of_splits == 0` and a factor has more than 16 levels |
pub(crate) fn check_factor_levels(
    covariates: &[Covariate],
    number_of_splits: usize,
) -> Result<(), ForestError> {
    if number_of_splits > 0 {
        return Ok(());
    }
    for covariate in covariates {
        if let CovariateKind::Factor { levels } = covariate.kind()
            && levels.len() > MAX_EXHAUSTIVE_FACTOR_LEVELS
        {
            return Err(ForestError::TooManyFactorLevels {
                covariate: covariate.name().to_string(),
                levels: levels.len(),
                max: MAX_EXHAUSTIVE_FACTOR_LEVELS,
            });
        }
    }
    Ok(())
}

fn partition_by_rule<'r, Y>(rule: SplitRule, rows: &[&'r Row<Y>]) -> Split<'r, Y> {
    let mut split = Split {
        score: f64::NAN,
        left: Vec::new(),
        right: Vec::new(),
        missing: Vec::new(),
        rule,
    };
    for &row in rows {
        match split.rule.goes_left(row.value(split.rule.covariate())) {
            Some(true) => split.left.push(row),
            Some(false) => split.right.push(row),
            None => split.missing.push(row),
        }
    }
    split
}

fn best_rule_split<'r, Y, S: SplitScorer<Y>>(
    rules: impl IntoIterator<Item = SplitRule>,
    rows: &[&'r Row<Y>],
    scorer: &S,
) -> Option<Split<'r, Y>> {
    let mut best: Option<Split<'r, Y>> = None;
    for rule in rules {
        let mut split = partition_by_rule(rule, rows);
        if split.left.is_empty() || split.right.is_empty() {
            continue;
        }
        let left: Vec<&Y> = split.left.iter().map(|r| r.response()).collect();
        let right: Vec<&Y> = split.right.iter().map(|r| r.response()).collect();
        split.score = scorer.score(&left, &right);
        if split.score.is_finite() && best.as_ref().is_none_or(|b| split.score > b.score) {
            best = Some(split);
        }
    }
    best
}

fn best_numeric_split<'r, Y, S: SplitScorer<Y>>(
    covariate: usize,
    rows: &[&'r Row<Y>],
    scorer: &S,
    number_of_splits: usize,
    rng: &mut impl Rng,
) -> Option<Split<'r, Y>> {
    let mut cursor = NumericSplitCursor::new(covariate, rows, number_of_splits, rng);
    if cursor.n_boundaries() == 0 {
        return None;
    }

    let responses: Vec<&'r Y> = cursor.present_rows().iter().map(|&r| r.response()).collect();
    let mut state = scorer.start(&responses);
    let mut best: Option<(f64, usize, f64)> = None;

    while let Some(boundary) = cursor.advance() {
        for row in boundary.moved {
            state.move_left(row.response());
        }
        let score = state.score();
        if score.is_finite() && best.is_none_or(|(b, _, _)| score > b) {
            best = Some((score, boundary.position, boundary.threshold));
        }
    }

    let (score, position, threshold) = best?;
    Some(cursor.into_split(position, threshold, score))
}

/// Best split of `rows` on one covariate, or `None` if no candidate separates them.
///
/// Ties keep the first candidate visited.
pub(crate) fn best_split<'r, Y, S: SplitScorer<Y>>(
    covariate: &Covariate,
    rows: &[&'r Row<Y>],
    scorer: &S,
    number_of_splits: usize,
    rng: &mut impl Rng,
) -> Option<Split<'r, Y>> {
    let index = covariate.index();
    match covariate.kind() {
        CovariateKind::Numeric => best_numeric_split(index, rows, scorer, number_of_splits, rng),
        CovariateKind::Boolean => {
            best_rule_split([SplitRule::Boolean { covariate: index }], rows, scorer)
        }
        CovariateKind::Factor { levels } => {
            let rules = factor_partitions(levels.len(), number_of_splits, rng)
                .into_iter()
                .map(|left_levels| SplitRule::Factor {
                    covariate: index,
                    left_levels,
                });
            best_rule_split(rules, rows, scorer)
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::scorer::WeightedVarianceScorer;

    fn numeric_rows(points: &[(Option<f64>, f64)]) -> Vec<Row<f64>> {
        points
            .iter()
            .enumerate()
            .map(|(id, &(x, y))| {
                let value = x.map_or(CovariateValue::Missing, CovariateValue::Numeric);
                Row::new(id, vec![value], y)
            })
            .collect()
    }

    #[test]
    fn numeric_rule_sends_threshold_left() {
        let rule = SplitRule::Numeric {
            covariate: 0,
            threshold: 2.0,
        };
        assert_eq!(rule.goes_left(CovariateValue::Numeric(2.0)), Some(true));
        assert_eq!(rule.goes_left(CovariateValue::Numeric(2.5)), Some(false));
        assert_eq!(rule.goes_left(CovariateValue::Missing), None);
    }

    #[test]
    fn boolean_and_factor_rules() {
        let rule = SplitRule::Boolean { covariate: 1 };
        assert_eq!(rule.goes_left(CovariateValue::Boolean(false)), Some(true));
        assert_eq!(rule.goes_left(CovariateValue::Boolean(true)), Some(false));

        let rule = SplitRule::Factor {
            covariate: 0,
            left_levels: vec![1, 3],
        };
        assert_eq!(rule.goes_left(CovariateValue::Factor(3)), Some(true));
        assert_eq!(rule.goes_left(CovariateValue::Factor(0)), Some(false));
        assert_eq!(rule.goes_left(CovariateValue::Numeric(1.0)), None);
    }

    #[test]
    fn separable_data_finds_correct_split() {
        let rows = numeric_rows(&[
            (Some(1.0), 0.0),
            (Some(2.0), 0.1),
            (Some(3.0), 0.0),
            (Some(10.0), 5.0),
            (Some(11.0), 5.1),
            (Some(12.0), 5.0),
        ]);
        let refs: Vec<_> = rows.iter().collect();
        let covariate = Covariate::numeric("x", 0);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let split = best_split(&covariate, &refs, &WeightedVarianceScorer, 0, &mut rng)
            .expect("should find a split");
        assert_eq!(
            split.rule,
            SplitRule::Numeric {
                covariate: 0,
                threshold: 3.0
            }
        );
        assert_eq!(split.left.len(), 3);
        assert_eq!(split.right.len(), 3);
    }

    #[test]
    fn constant_covariate_returns_none() {
        let rows = numeric_rows(&[(Some(5.0), 0.0), (Some(5.0), 1.0), (Some(5.0), 2.0)]);
        let refs: Vec<_> = rows.iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let split = best_split(
            &Covariate::numeric("x", 0),
            &refs,
            &WeightedVarianceScorer,
            0,
            &mut rng,
        );
        assert!(split.is_none());
    }

    #[test]
    fn cursor_skips_tied_values() {
        let rows = numeric_rows(&[
            (Some(2.0), 0.0),
            (Some(1.0), 0.0),
            (Some(2.0), 0.0),
            (Some(1.0), 0.0),
            (None, 0.0),
        ]);
        let refs: Vec<_> = rows.iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut cursor = NumericSplitCursor::new(0, &refs, 0, &mut rng);

        assert_eq!(cursor.n_boundaries(), 1);
        let boundary = cursor.advance().unwrap();
        assert_eq!(boundary.position, 2);
        assert_eq!(boundary.threshold, 1.0);
        assert_eq!(boundary.moved.len(), 2);
        assert!(cursor.advance().is_none());
    }

    #[test]
    fn bounded_cursor_moves_every_row_once() {
        let rows = numeric_rows(
            &(0..50)
                .map(|i| (Some(f64::from(i)), f64::from(i)))
                .collect::<Vec<_>>(),
        );
        let refs: Vec<_> = rows.iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut cursor = NumericSplitCursor::new(0, &refs, 5, &mut rng);
        assert_eq!(cursor.n_boundaries(), 5);

        let mut last = 0;
        let mut moved = 0;
        while let Some(b) = cursor.advance() {
            assert!(b.position > last);
            moved += b.moved.len();
            last = b.position;
            assert_eq!(moved, b.position);
        }
    }

    #[test]
    fn missing_rows_are_held_aside() {
        let rows = numeric_rows(&[
            (Some(1.0), 0.0),
            (None, 3.0),
            (Some(2.0), 0.0),
            (Some(8.0), 4.0),
            (Some(9.0), 4.0),
        ]);
        let refs: Vec<_> = rows.iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let split = best_split(
            &Covariate::numeric("x", 0),
            &refs,
            &WeightedVarianceScorer,
            0,
            &mut rng,
        )
        .unwrap();
        assert_eq!(split.missing.len(), 1);
        assert_eq!(split.missing[0].id(), 1);
        assert!((split.probability_na_left() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn missing_penalty_never_improves_score() {
        let rows = numeric_rows(&[
            (Some(1.0), 0.0),
            (None, 10.0),
            (None, -10.0),
            (Some(2.0), 0.0),
            (Some(8.0), 4.0),
            (Some(9.0), 4.0),
        ]);
        let refs: Vec<_> = rows.iter().collect();
        for seed in 0..10 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut split = best_split(
                &Covariate::numeric("x", 0),
                &refs,
                &WeightedVarianceScorer,
                0,
                &mut rng,
            )
            .unwrap();
            let before = split.score;
            split.penalize_missing(&WeightedVarianceScorer, &mut rng);
            assert!(split.score <= before);
        }
    }

    #[test]
    fn into_children_places_every_missing_row() {
        let rows = numeric_rows(&[
            (Some(1.0), 0.0),
            (None, 1.0),
            (None, 2.0),
            (Some(9.0), 4.0),
        ]);
        let refs: Vec<_> = rows.iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let split = best_split(
            &Covariate::numeric("x", 0),
            &refs,
            &WeightedVarianceScorer,
            0,
            &mut rng,
        )
        .unwrap();
        let (_, p, left, right) = split.into_children(&mut rng);
        assert!((p - 0.5).abs() < 1e-12);
        assert_eq!(left.len() + right.len(), 4);
    }

    #[test]
    fn factor_partitions_enumerate_when_small() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let partitions = factor_partitions(3, 0, &mut rng);
        assert_eq!(partitions, vec![vec![1], vec![2], vec![1, 2]]);
        assert!(factor_partitions(1, 0, &mut rng).is_empty());
    }

    #[test]
    fn factor_partitions_sample_distinct_when_bounded() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let partitions = factor_partitions(12, 5, &mut rng);
        assert_eq!(partitions.len(), 5);
        let unique: std::collections::BTreeSet<_> = partitions.iter().collect();
        assert_eq!(unique.len(), 5);
        assert!(partitions.iter().all(|p| !p.contains(&0) && !p.is_empty()));
    }

    #[test]
    fn factor_partitions_zero_budget_lists_all() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(factor_partitions(11, 0, &mut rng).len(), 1023);
    }

    #[test]
    fn factor_partitions_huge_budget_on_wide_factor() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let partitions = factor_partitions(70, usize::MAX / 8, &mut rng);
        assert_eq!(partitions.len(), MAX_FACTOR_PARTITIONS);
        let unique: std::collections::BTreeSet<_> = partitions.iter().collect();
        assert_eq!(unique.len(), partitions.len());
        assert!(partitions.iter().all(|p| p.iter().all(|&l| (1..70).contains(&l))));
    }

    #[test]
    fn wide_factor_needs_split_budget() {
        let levels: Vec<String> = (0..20).map(|l| format!("l{l}")).collect();
        let covariates = vec![Covariate::factor("site", 0, levels).unwrap()];
        let err = check_factor_levels(&covariates, 0).unwrap_err();
        assert!(matches!(err, ForestError::TooManyFactorLevels { levels: 20, .. }));
        assert!(check_factor_levels(&covariates, 64).is_ok());
    }

    #[test]
    fn factor_split_groups_levels() {
        let covariate = Covariate::factor(
            "colour",
            0,
            vec!["red".into(), "green".into(), "blue".into()],
        )
        .unwrap();
        let rows: Vec<Row<f64>> = [(0, 1.0), (1, 9.0), (2, 1.0), (0, 1.2), (1, 9.1), (2, 0.9)]
            .iter()
            .enumerate()
            .map(|(id, &(level, y))| Row::new(id, vec![CovariateValue::Factor(level)], y))
            .collect();
        let refs: Vec<_> = rows.iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let split = best_split(&covariate, &refs, &WeightedVarianceScorer, 0, &mut rng).unwrap();
        assert_eq!(
            split.rule,
            SplitRule::Factor {
                covariate: 0,
                left_levels: vec![1]
            }
        );
    }

    #[test]
    fn boolean_split_with_one_side_empty_is_none() {
        let covariate = Covariate::boolean("flag", 0);
        let rows: Vec<Row<f64>> = (0..4)
            .map(|id| Row::new(id, vec![CovariateValue::Boolean(true)], id as f64))
            .collect();
        let refs: Vec<_> = rows.iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        assert!(best_split(&covariate, &refs, &WeightedVarianceScorer, 0, &mut rng).is_none());
    }
}
