use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, instrument};

use crate::{
    ForestError,
    combiner::ResponseCombiner,
    covariate::{Covariate, Row, validate_rows},
    node::{Node, NodeId},
    scorer::SplitScorer,
    split::{self, Split, check_factor_levels},
};

/// Multiplier decorrelating row ids before they are mixed into a tree seed.
const ROW_SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Configuration for growing a single tree.
///
/// Construct via [`TreeConfig::new`], then chain `with_*` methods.
///
/// # Defaults
///
/// | Parameter           | Default             |
/// |---------------------|---------------------|
/// | `mtry`              | `None` (all covariates) |
/// | `node_size`         | 5                   |
/// | `max_node_depth`    | `None` (unlimited)  |
/// | `number_of_splits`  | 0 (every candidate) |
/// | `check_node_purity` | `false`             |
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeConfig {
    pub(crate) mtry: Option<usize>,
    pub(crate) node_size: usize,
    pub(crate) max_node_depth: Option<usize>,
    pub(crate) number_of_splits: usize,
    pub(crate) check_node_purity: bool,
}

impl TreeConfig {
    /// Create a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mtry: None,
            node_size: 5,
            max_node_depth: None,
            number_of_splits: 0,
            check_node_purity: false,
        }
    }

    /// Set the number of covariates sampled at each node.
    ///
    /// `None`, or a value at least the number of covariates, considers all of them.
    #[must_use]
    pub fn with_mtry(mut self, mtry: Option<usize>) -> Self {
        self.mtry = mtry;
        self
    }

    /// Set the node size: a node with fewer than `2 * node_size` rows is terminal.
    #[must_use]
    pub fn with_node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }

    /// Set the maximum depth; the root is at depth 0.
    #[must_use]
    pub fn with_max_node_depth(mut self, max_node_depth: Option<usize>) -> Self {
        self.max_node_depth = max_node_depth;
        self
    }

    /// Set the number of random split points tried per covariate; 0 tries all.
    #[must_use]
    pub fn with_number_of_splits(mut self, number_of_splits: usize) -> Self {
        self.number_of_splits = number_of_splits;
        self
    }

    /// Stop splitting nodes whose responses are all equal.
    #[must_use]
    pub fn with_check_node_purity(mut self, check_node_purity: bool) -> Self {
        self.check_node_purity = check_node_purity;
        self
    }

    // --- Getters ---

    /// Return the covariates sampled per node, if limited.
    #[must_use]
    pub fn mtry(&self) -> Option<usize> {
        self.mtry
    }

    /// Return the node size.
    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Return the maximum depth, if limited.
    #[must_use]
    pub fn max_node_depth(&self) -> Option<usize> {
        self.max_node_depth
    }

    /// Return the number of split points tried per covariate.
    #[must_use]
    pub fn number_of_splits(&self) -> usize {
        self.number_of_splits
    }

    /// Return whether pure nodes stop splitting.
    #[must_use]
    pub fn check_node_purity(&self) -> bool {
        self.check_node_purity
    }

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::InvalidNodeSize`] | `node_size` is 0 |
    /// | [`ForestError::InvalidMaxNodeDepth`] | `max_node_depth` is `Some(0)` |
    /// | [`ForestError::InvalidMtry`] | `mtry` is `Some(0)` |
    pub fn validate(&self) -> Result<(), ForestError> {
        if self.node_size == 0 {
            return Err(ForestError::InvalidNodeSize { node_size: 0 });
        }
        if self.max_node_depth == Some(0) {
            return Err(ForestError::InvalidMaxNodeDepth { max_node_depth: 0 });
        }
        if self.mtry == Some(0) {
            return Err(ForestError::InvalidMtry { mtry: 0 });
        }
        Ok(())
    }

    /// Grow one tree on every row of `rows`.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::EmptyDataset`] | `rows` is empty |
    /// | [`ForestError::NoCovariates`] | `covariates` is empty |
    /// | [`ForestError::CovariateIndexMismatch`] | a covariate's index differs from its position |
    /// | [`ForestError::ValueCountMismatch`] | a row's value count differs from the covariate count |
    /// | [`ForestError::TooManyFactorLevels`] | `number_of_splits == 0` and a factor has more than 16 levels |
    /// | any error from [`TreeConfig::validate`] | |
    #[instrument(skip_all, fields(n_rows = rows.len(), seed = seed))]
    pub fn fit<Y, O, S, R>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
        scorer: &S,
        combiner: &R,
        seed: u64,
    ) -> Result<Tree<O>, ForestError>
    where
        Y: PartialEq,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
    {
        validate_rows(rows, covariates)?;
        self.validate()?;
        check_factor_levels(covariates, self.number_of_splits)?;

        let has_missing = missing_flags(rows, covariates);
        let grower = TreeGrower {
            config: self,
            covariates,
            has_missing: &has_missing,
            scorer,
            combiner,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(grower.grow(rows.iter().collect(), seed, &mut rng))
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per covariate: whether any value is missing in `rows` or was seen missing while parsing.
pub(crate) fn missing_flags<Y>(rows: &[Row<Y>], covariates: &[Covariate]) -> Vec<bool> {
    covariates
        .iter()
        .map(|c| c.has_missing() || rows.iter().any(|r| r.value(c.index()).is_missing()))
        .collect()
}

/// Shared, read-only inputs for growing trees.
pub(crate) struct TreeGrower<'a, S, R> {
    pub(crate) config: &'a TreeConfig,
    pub(crate) covariates: &'a [Covariate],
    pub(crate) has_missing: &'a [bool],
    pub(crate) scorer: &'a S,
    pub(crate) combiner: &'a R,
}

impl<S, R> TreeGrower<'_, S, R> {
    /// Grow a tree on `rows`, recording their ids as the tree's bootstrap set.
    pub(crate) fn grow<Y, O>(&self, rows: Vec<&Row<Y>>, seed: u64, rng: &mut ChaCha8Rng) -> Tree<O>
    where
        Y: PartialEq,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
    {
        let mut bootstrap_ids: Vec<usize> = rows.iter().map(|r| r.id()).collect();
        bootstrap_ids.sort_unstable();
        bootstrap_ids.dedup();

        let mut arena: Vec<Node<O>> = Vec::new();
        let (_, depth) = self.build(rows, 0, rng, &mut arena);
        debug!(n_nodes = arena.len(), depth, "tree grown");

        Tree {
            nodes: arena,
            depth,
            bootstrap_ids,
            seed,
        }
    }

    fn terminal<Y, O>(&self, rows: &[&Row<Y>], arena: &mut Vec<Node<O>>) -> (NodeId, usize)
    where
        R: ResponseCombiner<Y, O>,
    {
        let responses: Vec<&Y> = rows.iter().map(|r| r.response()).collect();
        let id = NodeId::next(arena);
        arena.push(Node::Terminal {
            value: self.combiner.combine(&responses),
            n_rows: rows.len(),
        });
        (id, 0)
    }

    /// Recursively build the arena, returning the new node and the height of its subtree.
    fn build<Y, O>(
        &self,
        rows: Vec<&Row<Y>>,
        depth: usize,
        rng: &mut ChaCha8Rng,
        arena: &mut Vec<Node<O>>,
    ) -> (NodeId, usize)
    where
        Y: PartialEq,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
    {
        let n_rows = rows.len();
        let too_few = n_rows < 2 * self.config.node_size;
        let too_deep = self.config.max_node_depth.is_some_and(|d| depth >= d);
        let pure = self.config.check_node_purity
            && rows.windows(2).all(|w| w[0].response() == w[1].response());

        if too_few || too_deep || pure {
            return self.terminal(&rows, arena);
        }

        let Some(split) = self.best_split(&rows, rng) else {
            return self.terminal(&rows, arena);
        };
        let score = split.score;
        let (rule, probability_na_left, left_rows, right_rows) = split.into_children(rng);

        // Children are patched in once they exist.
        let id = NodeId::next(arena);
        arena.push(Node::Split {
            rule,
            left: id,
            right: id,
            probability_na_left,
            score,
            n_rows,
        });

        let ((left_id, left_height), (right_id, right_height)) =
            if left_rows.len() <= right_rows.len() {
                let l = self.build(left_rows, depth + 1, rng, arena);
                let r = self.build(right_rows, depth + 1, rng, arena);
                (l, r)
            } else {
                let r = self.build(right_rows, depth + 1, rng, arena);
                let l = self.build(left_rows, depth + 1, rng, arena);
                (l, r)
            };

        if let Node::Split { left, right, .. } = &mut arena[id.get()] {
            *left = left_id;
            *right = right_id;
        }

        (id, 1 + left_height.max(right_height))
    }

    /// Best split over a random subset of `mtry` covariates.
    fn best_split<'r, Y>(&self, rows: &[&'r Row<Y>], rng: &mut ChaCha8Rng) -> Option<Split<'r, Y>>
    where
        S: SplitScorer<Y>,
    {
        let n_covariates = self.covariates.len();
        let mtry = self.config.mtry.map_or(n_covariates, |m| m.min(n_covariates));
        let selected: Vec<usize> = if mtry >= n_covariates {
            (0..n_covariates).collect()
        } else {
            index::sample(rng, n_covariates, mtry).into_vec()
        };

        let mut best: Option<Split<'r, Y>> = None;
        for c in selected {
            let covariate = &self.covariates[c];
            let Some(mut candidate) = split::best_split(
                covariate,
                rows,
                self.scorer,
                self.config.number_of_splits,
                rng,
            ) else {
                continue;
            };
            if self.has_missing.get(c).copied().unwrap_or(false) {
                candidate.penalize_missing(self.scorer, rng);
            }
            if candidate.score.is_finite()
                && best.as_ref().is_none_or(|b| candidate.score > b.score)
            {
                best = Some(candidate);
            }
        }
        best
    }
}

/// A grown tree.
///
/// Stored as an arena-based `Vec<Node>` with the root at index 0, plus the
/// ids of the rows it was grown on and the seed that grew it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tree<O> {
    pub(crate) nodes: Vec<Node<O>>,
    pub(crate) depth: usize,
    pub(crate) bootstrap_ids: Vec<usize>,
    pub(crate) seed: u64,
}

impl<O> Tree<O> {
    /// Output of the terminal node `row` reaches.
    ///
    /// At a split on a covariate the row is missing, the row goes left with
    /// the node's `probability_na_left`. The draw is seeded from the tree seed
    /// and the row id, so repeated evaluation of the same row is stable.
    pub fn evaluate<Y>(&self, row: &Row<Y>) -> &O {
        let id = self.terminal_index(row);
        match &self.nodes[id.get()] {
            Node::Terminal { value, .. } => value,
            Node::Split { .. } => unreachable!("traversal always ends at a terminal node"),
        }
    }

    /// Arena index of the terminal node `row` reaches.
    pub fn terminal_index<Y>(&self, row: &Row<Y>) -> NodeId {
        let mut rng: Option<ChaCha8Rng> = None;
        let mut id = NodeId::ROOT;
        loop {
            match &self.nodes[id.get()] {
                Node::Terminal { .. } => return id,
                Node::Split {
                    rule,
                    left,
                    right,
                    probability_na_left,
                    ..
                } => {
                    let goes_left = match rule.goes_left(row.value(rule.covariate())) {
                        Some(side) => side,
                        None => {
                            let rng = rng.get_or_insert_with(|| {
                                let mixed = (row.id() as u64).wrapping_mul(ROW_SEED_MIX);
                                ChaCha8Rng::seed_from_u64(self.seed ^ mixed)
                            });
                            rng.r#gen::<f64>() < *probability_na_left
                        }
                    };
                    id = if goes_left { *left } else { *right };
                }
            }
        }
    }

    /// Return `true` if the row with `id` was used to grow this tree.
    #[must_use]
    pub fn in_bootstrap(&self, id: usize) -> bool {
        self.bootstrap_ids.binary_search(&id).is_ok()
    }

    /// Sorted, distinct ids of the rows used to grow this tree.
    #[must_use]
    pub fn bootstrap_ids(&self) -> &[usize] {
        &self.bootstrap_ids
    }

    /// Seed this tree was grown with.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// All nodes; the root is at index 0.
    #[must_use]
    pub fn nodes(&self) -> &[Node<O>] {
        &self.nodes
    }

    /// Return the total number of nodes in the tree.
    #[must_use]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Return the number of terminal nodes.
    #[must_use]
    pub fn n_terminals(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_terminal()).count()
    }

    /// Number of split nodes per covariate index, for `n_covariates` covariates.
    #[must_use]
    pub fn split_counts(&self, n_covariates: usize) -> Vec<usize> {
        let mut counts = vec![0; n_covariates];
        for node in &self.nodes {
            if let Node::Split { rule, .. } = node
                && let Some(slot) = counts.get_mut(rule.covariate())
            {
                *slot += 1;
            }
        }
        counts
    }

    /// Length of the longest root-to-terminal path; a single-node tree has depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }
}
