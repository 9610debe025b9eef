//! Declarative forest settings with a lossless JSON round-trip.

use std::path::{Path, PathBuf};

use larch_rf::{Covariate, Execution, ForestConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::IoError;

/// One covariate column: its CSV header name and value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum CovariateSettings {
    /// Real-valued column.
    Numeric {
        /// Column name.
        name: String,
    },
    /// `true`/`false` column.
    Boolean {
        /// Column name.
        name: String,
    },
    /// Categorical column with every level declared ahead of time.
    Factor {
        /// Column name.
        name: String,
        /// Level names, in split order.
        levels: Vec<String>,
    },
}

impl CovariateSettings {
    /// Return the column name.
    pub fn name(&self) -> &str {
        match self {
            Self::Numeric { name } | Self::Boolean { name } | Self::Factor { name, .. } => name,
        }
    }
}

/// The response type and the columns it is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ResponseSettings {
    /// Real-valued response.
    Regression {
        /// Response column.
        column: String,
    },
    /// Event code plus observed time, with an optional censoring time.
    CompetingRisk {
        /// Event code column (0 = censored).
        delta_column: String,
        /// Observed time column.
        time_column: String,
        /// Censoring time column, required by Gray's test.
        #[serde(default)]
        censor_time_column: Option<String>,
        /// Event codes of interest, ascending.
        events: Vec<u32>,
    },
}

/// Split scoring strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum SplitFinderSettings {
    /// Size-weighted variance reduction, for regression.
    WeightedVariance,
    /// Log-rank test for one event.
    LogRankSingle {
        /// Event code.
        event: u32,
    },
    /// Composite log-rank test over several events.
    LogRankMultiple {
        /// Event codes.
        events: Vec<u32>,
    },
    /// Gray's test for one event.
    GrayLogRankSingle {
        /// Event code.
        event: u32,
    },
    /// Composite Gray's test over several events.
    GrayLogRankMultiple {
        /// Event codes.
        events: Vec<u32>,
    },
}

impl SplitFinderSettings {
    fn needs_censor_time(&self) -> bool {
        matches!(
            self,
            Self::GrayLogRankSingle { .. } | Self::GrayLogRankMultiple { .. }
        )
    }

    fn events(&self) -> &[u32] {
        match self {
            Self::WeightedVariance => &[],
            Self::LogRankSingle { event } | Self::GrayLogRankSingle { event } => {
                std::slice::from_ref(event)
            }
            Self::LogRankMultiple { events } | Self::GrayLogRankMultiple { events } => events,
        }
    }
}

/// How tree outputs are merged into the forest prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum CombinerSettings {
    /// Arithmetic mean of tree predictions.
    Mean,
    /// Pointwise average of each tree's survival, hazards and incidence curves.
    CompetingRiskFunctions {
        /// Fixed time grid; the union of tree jump times when absent.
        #[serde(default)]
        times: Option<Vec<f64>>,
    },
}

fn default_n_trees() -> usize {
    500
}

fn default_node_size() -> usize {
    5
}

fn default_seed() -> u64 {
    42
}

/// Everything needed to read a dataset and train a forest on it.
///
/// # Defaults
///
/// | Field                | Default |
/// |----------------------|---------|
/// | `n_trees`            | 500     |
/// | `mtry`               | `None` (all covariates) |
/// | `node_size`          | 5       |
/// | `max_node_depth`     | `None`  |
/// | `number_of_splits`   | 0 (every candidate) |
/// | `check_node_purity`  | `false` |
/// | `seed`               | 42      |
/// | `threads`            | `None` (serial) |
/// | `display_progress`   | `false` |
/// | `save_progress`      | `false` |
/// | `save_tree_location` | `None`  |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForestSettings {
    /// Covariate columns, in row-value order.
    pub covariates: Vec<CovariateSettings>,
    /// Response type and columns.
    pub response: ResponseSettings,
    /// Split scoring strategy.
    pub split_finder: SplitFinderSettings,
    /// Forest-level combiner.
    pub combiner: CombinerSettings,
    /// Number of trees.
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,
    /// Covariates sampled per split.
    #[serde(default)]
    pub mtry: Option<usize>,
    /// Minimum rows in a splittable node.
    #[serde(default = "default_node_size")]
    pub node_size: usize,
    /// Maximum tree depth.
    #[serde(default)]
    pub max_node_depth: Option<usize>,
    /// Candidate split values per numeric covariate; 0 tries all.
    #[serde(default)]
    pub number_of_splits: usize,
    /// Stop at nodes whose responses are all equal.
    #[serde(default)]
    pub check_node_purity: bool,
    /// Master seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Worker count; serial training when absent.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Log one line per finished tree.
    #[serde(default)]
    pub display_progress: bool,
    /// Write each tree to `save_tree_location` as it finishes.
    #[serde(default)]
    pub save_progress: bool,
    /// Directory for on-disk trees.
    #[serde(default)]
    pub save_tree_location: Option<PathBuf>,
}

impl ForestSettings {
    /// Create settings with default knobs.
    pub fn new(
        covariates: Vec<CovariateSettings>,
        response: ResponseSettings,
        split_finder: SplitFinderSettings,
        combiner: CombinerSettings,
    ) -> Self {
        Self {
            covariates,
            response,
            split_finder,
            combiner,
            n_trees: default_n_trees(),
            mtry: None,
            node_size: default_node_size(),
            max_node_depth: None,
            number_of_splits: 0,
            check_node_purity: false,
            seed: default_seed(),
            threads: None,
            display_progress: false,
            save_progress: false,
            save_tree_location: None,
        }
    }

    /// Parse settings from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::SettingsParse`] on malformed JSON, an unknown
    /// field, or an unknown strategy name.
    pub fn from_json(json: &str) -> Result<Self, IoError> {
        serde_json::from_str(json).map_err(|source| IoError::SettingsParse { source })
    }

    /// Encode settings as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::SettingsEncode`] if encoding fails.
    pub fn to_json(&self) -> Result<String, IoError> {
        serde_json::to_string_pretty(self).map_err(|source| IoError::SettingsEncode { source })
    }

    /// Read and validate settings from a JSON file.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::FileNotFound`] | File doesn't exist or is unreadable |
    /// | [`IoError::SettingsParse`] | Malformed JSON or unknown name |
    /// | [`IoError::InvalidSettings`] | Strategies do not fit together |
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, IoError> {
        let json = std::fs::read_to_string(path).map_err(|e| IoError::FileNotFound {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings = Self::from_json(&json)?;
        settings.validate()?;
        info!(
            n_covariates = settings.covariates.len(),
            n_trees = settings.n_trees,
            "settings loaded"
        );
        Ok(settings)
    }

    /// Write settings as JSON, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::SettingsEncode`] | Encoding fails |
    /// | [`IoError::WriteFile`] | Filesystem write fails |
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn save(&self, path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IoError::WriteFile {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(path, self.to_json()?).map_err(|e| IoError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        info!("settings saved");
        Ok(())
    }

    /// Check that the strategies fit the response and each other.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::InvalidSettings`] | no covariates, duplicate column, a strategy mismatched with the response, or `save_progress` without a location |
    pub fn validate(&self) -> Result<(), IoError> {
        let invalid = |field: &'static str, reason: String| -> Result<(), IoError> {
            Err(IoError::InvalidSettings { field, reason })
        };

        if self.covariates.is_empty() {
            return invalid("covariates", "at least one covariate is required".into());
        }
        for (i, covariate) in self.covariates.iter().enumerate() {
            if self.covariates[..i].iter().any(|c| c.name() == covariate.name()) {
                return invalid("covariates", format!("duplicate column \"{}\"", covariate.name()));
            }
        }

        match &self.response {
            ResponseSettings::Regression { .. } => {
                if self.split_finder != SplitFinderSettings::WeightedVariance {
                    return invalid(
                        "split_finder",
                        "a regression response requires weighted-variance".into(),
                    );
                }
                if self.combiner != CombinerSettings::Mean {
                    return invalid("combiner", "a regression response requires mean".into());
                }
            }
            ResponseSettings::CompetingRisk {
                censor_time_column,
                events,
                ..
            } => {
                if events.is_empty() {
                    return invalid("response", "at least one event code is required".into());
                }
                if events.contains(&0) {
                    return invalid("response", "event code 0 is reserved for censoring".into());
                }
                if self.split_finder == SplitFinderSettings::WeightedVariance {
                    return invalid(
                        "split_finder",
                        "a competing-risk response requires a log-rank split finder".into(),
                    );
                }
                if let Some(unknown) = self
                    .split_finder
                    .events()
                    .iter()
                    .find(|e| !events.contains(e))
                {
                    return invalid(
                        "split_finder",
                        format!("event {unknown} is not a response event"),
                    );
                }
                if self.split_finder.needs_censor_time() && censor_time_column.is_none() {
                    return invalid(
                        "split_finder",
                        "Gray's test requires response.censor_time_column".into(),
                    );
                }
                if self.combiner == CombinerSettings::Mean {
                    return invalid(
                        "combiner",
                        "a competing-risk response requires competing-risk-functions".into(),
                    );
                }
            }
        }

        if self.save_progress && self.save_tree_location.is_none() {
            return invalid(
                "save_tree_location",
                "save_progress requires a tree directory".into(),
            );
        }
        Ok(())
    }

    /// Build covariates in row-value order.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Forest`] for a factor with no or duplicate levels.
    pub fn build_covariates(&self) -> Result<Vec<Covariate>, IoError> {
        self.covariates
            .iter()
            .enumerate()
            .map(|(index, c)| -> Result<Covariate, IoError> {
                Ok(match c {
                    CovariateSettings::Numeric { name } => Covariate::numeric(name.clone(), index),
                    CovariateSettings::Boolean { name } => Covariate::boolean(name.clone(), index),
                    CovariateSettings::Factor { name, levels } => {
                        Covariate::factor(name.clone(), index, levels.clone())?
                    }
                })
            })
            .collect()
    }

    /// Return the execution mode implied by `threads`.
    pub fn execution(&self) -> Execution {
        match self.threads {
            None => Execution::Serial,
            Some(threads) => Execution::Parallel { threads },
        }
    }

    /// Build the core training configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Forest`] when a knob is out of range.
    pub fn forest_config(&self) -> Result<ForestConfig, IoError> {
        let config = ForestConfig::new(self.n_trees)?
            .with_mtry(self.mtry)
            .with_node_size(self.node_size)
            .with_max_node_depth(self.max_node_depth)
            .with_number_of_splits(self.number_of_splits)
            .with_check_node_purity(self.check_node_purity)
            .with_seed(self.seed)
            .with_execution(self.execution())
            .with_display_progress(self.display_progress);
        config.validate()?;
        Ok(config)
    }
}
