//! Random forests for regression and competing-risk outcomes.
//!
//! Provides step-function curves, typed covariates with missing-value aware
//! split rules, log-rank and Gray's-test split scores over incrementally
//! maintained risk sets, Kaplan-Meier / Nelson-Aalen / cumulative incidence
//! leaf combiners, arena-based trees, serial or pooled forest training held in
//! memory or streamed to disk, out-of-bag evaluation, error calculators and
//! permutation variable importance.

mod combiner;
mod competing_risk;
mod config;
mod covariate;
mod error;
mod error_rate;
mod forest;
mod importance;
mod logrank;
mod node;
mod oob;
mod predict;
mod response;
mod risk_set;
mod scorer;
mod serialize;
mod split;
mod step_function;
mod tree;

pub use combiner::{Accumulator, EnsembleCombiner, MeanAccumulator, MeanCombiner, ResponseCombiner};
pub use competing_risk::{
    CompetingRiskAccumulator, CompetingRiskFunctionCombiner, CompetingRiskFunctions,
    CompetingRiskResponseCombiner,
};
pub use config::{Execution, ForestConfig};
pub use covariate::{Covariate, CovariateKind, CovariateValue, Row};
pub use error::ForestError;
pub use error_rate::{
    ConcordanceError, ErrorCalculator, IntegratedBrierScore, MeanSquaredError,
    censoring_survival_function,
};
pub use forest::{Forest, ForestTrainer};
pub use importance::{ImportanceConfig, VariableImportance};
pub use logrank::{GrayLogRankScorer, LogRankScorer, LogRankState};
pub use node::{Node, NodeId};
pub use oob::OobError;
pub use response::{CompetingRiskOutcome, CompetingRiskResponse, CompetingRiskResponseWithCensorTime, HasCensorTime};
pub use risk_set::{CompetingRiskSets, RiskSetKind};
pub use scorer::{IncrementalScore, SplitScorer, VarianceState, WeightedVarianceScorer};
pub use serialize::{
    TREE_COUNT_FILE, TREE_FILE_EXTENSION, TreeDirectory, read_tree, read_tree_count, tree_file_name,
};
pub use split::SplitRule;
pub use step_function::StepFunction;
pub use tree::{Tree, TreeConfig};
