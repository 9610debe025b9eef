//! Forest training with bootstrap resampling and serial or pooled tree growth.

use std::borrow::Cow;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, instrument};

use crate::combiner::ResponseCombiner;
use crate::config::{Execution, ForestConfig, build_pool};
use crate::covariate::{Covariate, Row, validate_rows};
use crate::error::ForestError;
use crate::scorer::SplitScorer;
use crate::serialize::{self, TreeDirectory};
use crate::split::check_factor_levels;
use crate::tree::{Tree, TreeGrower, missing_flags};

/// A trained ensemble and the combiner that merges its trees' outputs.
///
/// Trees live either in memory or as one file per tree in a directory; an
/// on-disk forest reads one tree at a time whenever it is evaluated.
#[derive(Debug)]
pub struct Forest<O, C> {
    pub(crate) storage: TreeStorage<O>,
    pub(crate) combiner: C,
}

#[derive(Debug)]
pub(crate) enum TreeStorage<O> {
    InMemory(Vec<Tree<O>>),
    OnDisk(TreeDirectory),
}

impl<O, C> Forest<O, C> {
    /// Wrap already-grown trees.
    #[must_use]
    pub fn from_trees(trees: Vec<Tree<O>>, combiner: C) -> Self {
        Self {
            storage: TreeStorage::InMemory(trees),
            combiner,
        }
    }

    /// Return the number of trees.
    #[must_use]
    pub fn n_trees(&self) -> usize {
        match &self.storage {
            TreeStorage::InMemory(trees) => trees.len(),
            TreeStorage::OnDisk(directory) => directory.len(),
        }
    }

    /// Return `true` when trees are read from disk on demand.
    #[must_use]
    pub fn is_on_disk(&self) -> bool {
        matches!(self.storage, TreeStorage::OnDisk(_))
    }

    /// Directory backing an on-disk forest.
    #[must_use]
    pub fn directory(&self) -> Option<&Path> {
        match &self.storage {
            TreeStorage::InMemory(_) => None,
            TreeStorage::OnDisk(directory) => Some(directory.path()),
        }
    }

    /// Trees of an in-memory forest.
    #[must_use]
    pub fn in_memory_trees(&self) -> Option<&[Tree<O>]> {
        match &self.storage {
            TreeStorage::InMemory(trees) => Some(trees),
            TreeStorage::OnDisk(_) => None,
        }
    }

    /// Return the combiner merging per-tree outputs.
    #[must_use]
    pub fn combiner(&self) -> &C {
        &self.combiner
    }
}

impl<O: Clone + DeserializeOwned, C> Forest<O, C> {
    /// Iterate over the trees in order, reading on-disk trees one at a time.
    pub fn trees(&self) -> Box<dyn Iterator<Item = Result<Cow<'_, Tree<O>>, ForestError>> + '_> {
        match &self.storage {
            TreeStorage::InMemory(trees) => Box::new(trees.iter().map(|t| Ok(Cow::Borrowed(t)))),
            TreeStorage::OnDisk(directory) => Box::new(directory.iter().map(|t| t.map(Cow::Owned))),
        }
    }

    /// Load every tree of an on-disk forest into memory.
    ///
    /// # Errors
    ///
    /// Any error from reading a tree file.
    pub fn into_in_memory(self) -> Result<Self, ForestError> {
        match self.storage {
            TreeStorage::InMemory(_) => Ok(self),
            TreeStorage::OnDisk(directory) => {
                let trees = directory.iter().collect::<Result<Vec<_>, _>>()?;
                Ok(Self::from_trees(trees, self.combiner))
            }
        }
    }
}

/// Per-tree seeds drawn from a master generator.
///
/// Tree `i` always gets the same seed for a given master seed, however many
/// trees are grown and in whatever order.
pub(crate) fn tree_seeds(seed: u64, n_trees: usize) -> Vec<u64> {
    let mut master_rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n_trees).map(|_| master_rng.r#gen()).collect()
}

/// Draw `rows.len()` rows with replacement and grow a tree on them.
fn grow_tree<Y, O, S, R>(grower: &TreeGrower<'_, S, R>, rows: &[Row<Y>], seed: u64) -> Tree<O>
where
    Y: PartialEq,
    S: SplitScorer<Y>,
    R: ResponseCombiner<Y, O>,
{
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n_rows = rows.len();
    let sample: Vec<&Row<Y>> = (0..n_rows)
        .map(|_| &rows[rng.gen_range(0..n_rows)])
        .collect();
    grower.grow(sample, seed, &mut rng)
}

struct Progress {
    total: usize,
    completed: AtomicUsize,
    display: bool,
}

impl Progress {
    fn new(total: usize, already: usize, display: bool) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(already),
            display,
        }
    }

    fn tree_done(&self, index: usize) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.display {
            info!(tree = index, completed, total = self.total, "tree trained");
        } else {
            debug!(tree = index, completed, total = self.total, "tree trained");
        }
    }
}

/// Grows forests from a config, a split scorer, a leaf combiner and a forest combiner.
///
/// The scorer and combiners are shared read-only by every tree and worker.
#[derive(Debug, Clone)]
pub struct ForestTrainer<S, R, C> {
    config: ForestConfig,
    scorer: S,
    node_combiner: R,
    forest_combiner: C,
}

impl<S, R, C> ForestTrainer<S, R, C> {
    /// Create a trainer.
    #[must_use]
    pub fn new(config: ForestConfig, scorer: S, node_combiner: R, forest_combiner: C) -> Self {
        Self {
            config,
            scorer,
            node_combiner,
            forest_combiner,
        }
    }

    /// Return the training configuration.
    #[must_use]
    pub fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Return the forest combiner given to trained forests.
    #[must_use]
    pub fn forest_combiner(&self) -> &C {
        &self.forest_combiner
    }

    fn prepare<Y>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
    ) -> Result<(Vec<u64>, Vec<bool>), ForestError> {
        validate_rows(rows, covariates)?;
        self.config.validate()?;
        check_factor_levels(covariates, self.config.number_of_splits)?;
        Ok((
            tree_seeds(self.config.seed, self.config.n_trees),
            missing_flags(rows, covariates),
        ))
    }

    fn check_resume(&self, existing: usize) -> Result<(), ForestError> {
        if existing > self.config.n_trees {
            return Err(ForestError::NothingToResume {
                existing,
                requested: self.config.n_trees,
            });
        }
        Ok(())
    }

    /// Train a forest held in memory.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::EmptyDataset`] | `rows` is empty |
    /// | [`ForestError::NoCovariates`] | `covariates` is empty |
    /// | [`ForestError::CovariateIndexMismatch`] | a covariate's index differs from its position |
    /// | [`ForestError::ValueCountMismatch`] | a row's value count differs from the covariate count |
    /// | [`ForestError::ThreadPool`] | the worker pool cannot be built |
    /// | any error from [`ForestConfig::validate`] | |
    pub fn train<Y, O>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
    ) -> Result<Forest<O, C>, ForestError>
    where
        Y: PartialEq + Sync,
        O: Send,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
        C: Clone,
    {
        self.grow_in_memory(rows, covariates, Vec::new())
    }

    /// Continue training from `initial`, keeping its trees and growing the rest.
    ///
    /// An on-disk `initial` continues in its own directory.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::NothingToResume`] | `initial` has more trees than configured |
    /// | [`ForestError::ResumeMismatch`] | the directory of an on-disk `initial` changed since it was opened |
    /// | any error from [`ForestTrainer::train`] or [`ForestTrainer::train_on_disk`] | |
    pub fn train_from<Y, O>(
        &self,
        initial: Forest<O, C>,
        rows: &[Row<Y>],
        covariates: &[Covariate],
    ) -> Result<Forest<O, C>, ForestError>
    where
        Y: PartialEq + Sync,
        O: Send + Serialize + DeserializeOwned,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
        C: Clone,
    {
        match initial.storage {
            TreeStorage::InMemory(trees) => self.grow_in_memory(rows, covariates, trees),
            TreeStorage::OnDisk(directory) => {
                self.grow_on_disk(rows, covariates, directory.path(), Some(directory.len()))
            }
        }
    }

    /// Train a forest whose trees are written to `directory` as soon as they are grown.
    ///
    /// Without `initial` the directory must hold no tree files. With `initial`
    /// the directory must hold exactly `initial.n_trees()` tree files, and only
    /// the remaining trees are grown.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::CreateDirectory`] | `directory` cannot be created |
    /// | [`ForestError::TreeDirectoryNotEmpty`] | no `initial` but tree files exist |
    /// | [`ForestError::ResumeMismatch`] | `initial` disagrees with the file count |
    /// | [`ForestError::WriteTree`] / [`ForestError::SerializeTree`] | a tree cannot be persisted |
    /// | any error from [`ForestTrainer::train`] | |
    pub fn train_on_disk<Y, O>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
        directory: impl AsRef<Path>,
        initial: Option<&Forest<O, C>>,
    ) -> Result<Forest<O, C>, ForestError>
    where
        Y: PartialEq + Sync,
        O: Send + Serialize + DeserializeOwned,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
        C: Clone,
    {
        self.grow_on_disk(rows, covariates, directory.as_ref(), initial.map(Forest::n_trees))
    }

    /// Continue on-disk training in `directory`, using the tree count recorded there.
    ///
    /// Every on-disk run records how many trees it has written. A directory
    /// without a record must hold no tree files, and training starts fresh.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::ResumeMismatch`] | the recorded count differs from the tree files present |
    /// | [`ForestError::TreeDirectoryNotEmpty`] | tree files exist without a record |
    /// | [`ForestError::ReadTree`] | the record cannot be read |
    /// | any error from [`ForestTrainer::train_on_disk`] | |
    pub fn resume_on_disk<Y, O>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
        directory: impl AsRef<Path>,
    ) -> Result<Forest<O, C>, ForestError>
    where
        Y: PartialEq + Sync,
        O: Send + Serialize + DeserializeOwned,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
        C: Clone,
    {
        let directory = directory.as_ref();
        let recorded = serialize::read_tree_count(directory)?;
        self.grow_on_disk(rows, covariates, directory, recorded)
    }

    #[instrument(skip_all, fields(n_trees = self.config.n_trees, n_rows = rows.len(), existing = trees.len()))]
    fn grow_in_memory<Y, O>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
        mut trees: Vec<Tree<O>>,
    ) -> Result<Forest<O, C>, ForestError>
    where
        Y: PartialEq + Sync,
        O: Send,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
        C: Clone,
    {
        let (seeds, has_missing) = self.prepare(rows, covariates)?;
        let start = trees.len();
        self.check_resume(start)?;
        let n_trees = self.config.n_trees;

        info!(
            n_trees,
            start,
            n_rows = rows.len(),
            n_covariates = covariates.len(),
            execution = ?self.config.execution,
            "training forest in memory"
        );

        let tree_config = self.config.tree_config();
        let grower = TreeGrower {
            config: &tree_config,
            covariates,
            has_missing: &has_missing,
            scorer: &self.scorer,
            combiner: &self.node_combiner,
        };
        let progress = Progress::new(n_trees, start, self.config.display_progress);

        let grow = |index: usize| {
            let tree = grow_tree(&grower, rows, seeds[index]);
            progress.tree_done(index);
            tree
        };

        let grown: Vec<Tree<O>> = match self.config.execution {
            Execution::Serial => (start..n_trees).map(grow).collect(),
            Execution::Parallel { threads } => {
                build_pool(threads)?.install(|| (start..n_trees).into_par_iter().map(grow).collect())
            }
        };
        trees.extend(grown);

        info!(n_trees = trees.len(), "forest training complete");
        Ok(Forest::from_trees(trees, self.forest_combiner.clone()))
    }

    #[instrument(skip_all, fields(n_trees = self.config.n_trees, path = %directory.display()))]
    fn grow_on_disk<Y, O>(
        &self,
        rows: &[Row<Y>],
        covariates: &[Covariate],
        directory: &Path,
        expected_existing: Option<usize>,
    ) -> Result<Forest<O, C>, ForestError>
    where
        Y: PartialEq + Sync,
        O: Send + Serialize + DeserializeOwned,
        S: SplitScorer<Y>,
        R: ResponseCombiner<Y, O>,
        C: Clone,
    {
        let (seeds, has_missing) = self.prepare(rows, covariates)?;

        std::fs::create_dir_all(directory).map_err(|source| ForestError::CreateDirectory {
            path: directory.to_path_buf(),
            source,
        })?;
        let existing = serialize::list_tree_files(directory)?;
        let found = existing.len();
        let start = match expected_existing {
            None if found > 0 => {
                return Err(ForestError::TreeDirectoryNotEmpty {
                    path: directory.to_path_buf(),
                    found,
                });
            }
            None => 0,
            Some(expected) if expected != found => {
                return Err(ForestError::ResumeMismatch {
                    path: directory.to_path_buf(),
                    expected,
                    found,
                });
            }
            Some(expected) => expected,
        };
        self.check_resume(start)?;
        let n_trees = self.config.n_trees;

        // Parallel runs can stop with gaps, so grow whichever indices have no file.
        let present: HashSet<_> = existing.iter().filter_map(|path| path.file_name()).collect();
        let pending: Vec<usize> = (0..n_trees)
            .filter(|&index| !present.contains(OsStr::new(&serialize::tree_file_name(index))))
            .collect();

        info!(
            n_trees,
            start,
            pending = pending.len(),
            n_rows = rows.len(),
            execution = ?self.config.execution,
            "training forest on disk"
        );

        let tree_config = self.config.tree_config();
        let grower = TreeGrower {
            config: &tree_config,
            covariates,
            has_missing: &has_missing,
            scorer: &self.scorer,
            combiner: &self.node_combiner,
        };
        let progress = Progress::new(n_trees, start, self.config.display_progress);
        serialize::write_tree_count(directory, start)?;
        let written = Mutex::new(start);

        let grow = |index: usize| -> Result<(), ForestError> {
            let tree: Tree<O> = grow_tree(&grower, rows, seeds[index]);
            serialize::write_tree(directory, index, &tree)?;
            let mut count = written.lock().unwrap_or_else(PoisonError::into_inner);
            *count += 1;
            serialize::write_tree_count(directory, *count)?;
            drop(count);
            progress.tree_done(index);
            Ok(())
        };

        match self.config.execution {
            Execution::Serial => pending.into_iter().try_for_each(grow)?,
            Execution::Parallel { threads } => {
                build_pool(threads)?.install(|| pending.into_par_iter().try_for_each(grow))?;
            }
        }

        info!("forest training complete");
        Forest::open_directory(directory, self.forest_combiner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiner::MeanCombiner;
    use crate::covariate::CovariateValue;
    use crate::scorer::WeightedVarianceScorer;

    /// Three flat steps in x0, noise in x1.
    fn make_step_data() -> (Vec<Row<f64>>, Vec<Covariate>) {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let rows = (0..60)
            .map(|i| {
                let x0 = i as f64 * 0.5;
                let y = match i / 20 {
                    0 => 0.0,
                    1 => 5.0,
                    _ => 10.0,
                } + rng.gen_range(-0.1..0.1);
                let x1: f64 = rng.gen_range(0.0..1.0);
                Row::new(
                    i,
                    vec![CovariateValue::Numeric(x0), CovariateValue::Numeric(x1)],
                    y,
                )
            })
            .collect();
        let covariates = vec![Covariate::numeric("x0", 0), Covariate::numeric("x1", 1)];
        (rows, covariates)
    }

    fn trainer(
        n_trees: usize,
        execution: Execution,
    ) -> ForestTrainer<WeightedVarianceScorer, MeanCombiner, MeanCombiner> {
        let config = ForestConfig::new(n_trees)
            .unwrap()
            .with_node_size(2)
            .with_seed(42)
            .with_execution(execution);
        ForestTrainer::new(config, WeightedVarianceScorer, MeanCombiner, MeanCombiner)
    }

    #[test]
    fn step_function_is_recovered() {
        let (rows, covariates) = make_step_data();
        let forest = trainer(30, Execution::Serial)
            .train(&rows, &covariates)
            .unwrap();
        assert_eq!(forest.n_trees(), 30);

        let mse: f64 = rows
            .iter()
            .map(|r| (forest.evaluate(r).unwrap() - r.response()).powi(2))
            .sum::<f64>()
            / rows.len() as f64;
        assert!(mse < 0.5, "mse = {mse}");
    }

    #[test]
    fn serial_and_parallel_grow_the_same_trees() {
        let (rows, covariates) = make_step_data();
        let serial = trainer(8, Execution::Serial).train(&rows, &covariates).unwrap();
        let parallel = trainer(8, Execution::Parallel { threads: 3 })
            .train(&rows, &covariates)
            .unwrap();

        for row in &rows {
            let a = serial.evaluate(row).unwrap();
            let b = parallel.evaluate(row).unwrap();
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn trees_keep_their_bootstrap_ids() {
        let (rows, covariates) = make_step_data();
        let forest = trainer(3, Execution::Serial).train(&rows, &covariates).unwrap();
        for tree in forest.in_memory_trees().unwrap() {
            let ids = tree.bootstrap_ids();
            assert!(!ids.is_empty() && ids.len() < rows.len());
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn resume_reuses_initial_trees() {
        let (rows, covariates) = make_step_data();
        let initial = trainer(4, Execution::Serial).train(&rows, &covariates).unwrap();
        let first_seed = initial.in_memory_trees().unwrap()[0].seed();

        let resumed = trainer(7, Execution::Serial)
            .train_from(initial, &rows, &covariates)
            .unwrap();
        assert_eq!(resumed.n_trees(), 7);
        assert_eq!(resumed.in_memory_trees().unwrap()[0].seed(), first_seed);
    }

    #[test]
    fn resume_with_too_many_trees_errors() {
        let (rows, covariates) = make_step_data();
        let initial = trainer(5, Execution::Serial).train(&rows, &covariates).unwrap();
        let err = trainer(3, Execution::Serial)
            .train_from(initial, &rows, &covariates)
            .unwrap_err();
        assert!(matches!(
            err,
            ForestError::NothingToResume {
                existing: 5,
                requested: 3
            }
        ));
    }

    #[test]
    fn empty_dataset_error() {
        let covariates = vec![Covariate::numeric("x0", 0)];
        let err = trainer(2, Execution::Serial)
            .train::<f64, f64>(&[], &covariates)
            .unwrap_err();
        assert!(matches!(err, ForestError::EmptyDataset));
    }

    #[test]
    fn tree_seeds_are_prefix_stable() {
        let five = tree_seeds(9, 5);
        let ten = tree_seeds(9, 10);
        assert_eq!(five[..], ten[..5]);
    }
}
