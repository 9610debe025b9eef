use std::path::PathBuf;

/// Errors from forest training, evaluation and persistence.
#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    /// Returned when n_trees is zero.
    #[error("n_trees must be at least 1, got {n_trees}")]
    InvalidTreeCount {
        /// The invalid n_trees value provided.
        n_trees: usize,
    },

    /// Returned when node_size is zero.
    #[error("node_size must be at least 1, got {node_size}")]
    InvalidNodeSize {
        /// The invalid node_size value provided.
        node_size: usize,
    },

    /// Returned when max_node_depth is zero.
    #[error("max_node_depth must be at least 1, got {max_node_depth}")]
    InvalidMaxNodeDepth {
        /// The invalid max_node_depth value provided.
        max_node_depth: usize,
    },

    /// Returned when mtry is zero.
    #[error("mtry must be at least 1, got {mtry}")]
    InvalidMtry {
        /// The invalid mtry value provided.
        mtry: usize,
    },

    /// Returned when a parallel execution requests zero threads.
    #[error("thread count must be at least 1, got {threads}")]
    InvalidThreadCount {
        /// The invalid thread count provided.
        threads: usize,
    },

    /// Returned when the training dataset has zero rows.
    #[error("training dataset has zero rows")]
    EmptyDataset,

    /// Returned when no covariates were supplied.
    #[error("at least one covariate is required")]
    NoCovariates,

    /// Returned when a covariate's index does not match its position in the table.
    #[error("covariate \"{name}\" declares index {declared} but sits at position {position}")]
    CovariateIndexMismatch {
        /// Name of the offending covariate.
        name: String,
        /// Index stored on the covariate.
        declared: usize,
        /// Position of the covariate in the supplied slice.
        position: usize,
    },

    /// Returned when a row carries a different number of values than there are covariates.
    #[error("row {row_id} has {got} covariate values, expected {expected}")]
    ValueCountMismatch {
        /// Id of the offending row.
        row_id: usize,
        /// Number of covariates.
        expected: usize,
        /// Number of values in the row.
        got: usize,
    },

    /// Returned when every factor partition is requested for a factor too wide to enumerate.
    #[error(
        "factor \"{covariate}\" has {levels} levels; number_of_splits = 0 enumerates at most {max}"
    )]
    TooManyFactorLevels {
        /// Name of the factor covariate.
        covariate: String,
        /// Number of levels the factor declares.
        levels: usize,
        /// Largest level count that can be enumerated.
        max: usize,
    },

    /// Returned when a numeric covariate cannot parse a raw value.
    #[error("covariate \"{covariate}\" cannot parse \"{raw}\" as a number")]
    UnparsableNumber {
        /// Name of the covariate.
        covariate: String,
        /// The raw text that failed to parse.
        raw: String,
    },

    /// Returned when a boolean covariate cannot parse a raw value.
    #[error("covariate \"{covariate}\" cannot parse \"{raw}\" as a boolean")]
    UnparsableBoolean {
        /// Name of the covariate.
        covariate: String,
        /// The raw text that failed to parse.
        raw: String,
    },

    /// Returned when a factor value was not declared among the covariate's levels.
    #[error("covariate \"{covariate}\" has no declared level \"{level}\"")]
    UnknownLevel {
        /// Name of the covariate.
        covariate: String,
        /// The undeclared level.
        level: String,
    },

    /// Returned when a factor covariate declares the same level twice.
    #[error("covariate \"{covariate}\" declares level \"{level}\" more than once")]
    DuplicateLevel {
        /// Name of the covariate.
        covariate: String,
        /// The repeated level.
        level: String,
    },

    /// Returned when a factor covariate declares no levels.
    #[error("covariate \"{covariate}\" declares no levels")]
    NoLevels {
        /// Name of the covariate.
        covariate: String,
    },

    /// Returned when an on-disk forest being resumed disagrees with its directory.
    #[error("cannot resume training in {path}: expected {expected} trees but directory holds {found} tree files")]
    ResumeMismatch {
        /// The tree directory.
        path: PathBuf,
        /// Tree count the directory should hold.
        expected: usize,
        /// Number of tree files found in the directory.
        found: usize,
    },

    /// Returned when on-disk training starts fresh in a directory that already holds trees.
    #[error("tree directory {path} already holds {found} tree files; supply the initial forest to resume")]
    TreeDirectoryNotEmpty {
        /// The tree directory.
        path: PathBuf,
        /// Number of tree files found.
        found: usize,
    },

    /// Returned when an initial forest already holds more trees than requested.
    #[error("initial forest already has {existing} trees, more than the {requested} requested")]
    NothingToResume {
        /// Trees in the initial forest.
        existing: usize,
        /// Trees requested by the configuration.
        requested: usize,
    },

    /// Returned when a forest with no trees is asked for a prediction.
    #[error("forest has no trees")]
    EmptyForest,

    /// Returned when no row has any tree that left it out of its bootstrap sample.
    #[error("none of the {n_rows} rows is out-of-bag for any tree")]
    NoOutOfBagRows {
        /// Number of rows evaluated.
        n_rows: usize,
    },

    /// Returned when the worker pool cannot be created.
    #[error("failed to build a worker pool with {threads} threads")]
    ThreadPool {
        /// Requested number of threads.
        threads: usize,
        /// The underlying rayon error.
        source: rayon::ThreadPoolBuildError,
    },

    /// Returned when tree serialization fails.
    #[error("failed to serialize tree {tree_index}")]
    SerializeTree {
        /// Index of the tree within its forest.
        tree_index: usize,
        /// The underlying bincode error.
        source: Box<bincode::ErrorKind>,
    },

    /// Returned when tree deserialization fails.
    #[error("failed to deserialize tree from {path}")]
    DeserializeTree {
        /// Path to the tree file that could not be deserialized.
        path: PathBuf,
        /// The underlying bincode error.
        source: Box<bincode::ErrorKind>,
    },

    /// Returned when writing a tree file fails.
    #[error("failed to write tree to {path}")]
    WriteTree {
        /// Path to the file that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when reading a tree file or listing a tree directory fails.
    #[error("failed to read trees from {path}")]
    ReadTree {
        /// Path to the file or directory that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when the tree directory cannot be created.
    #[error("cannot create tree directory {path}")]
    CreateDirectory {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when loading a tree file with an incompatible format version.
    #[error("incompatible tree file version in {path}: expected {expected}, found {found}")]
    IncompatibleTreeVersion {
        /// The tree format version this build expects.
        expected: u32,
        /// The tree format version found in the file.
        found: u32,
        /// Path to the tree file with the incompatible version.
        path: PathBuf,
    },
}
