use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use larch_io::{CombinerSettings, ForestSettings, ResponseSettings, RowReader, SplitFinderSettings};
use larch_rf::{
    CompetingRiskFunctionCombiner, CompetingRiskFunctions, CompetingRiskOutcome,
    CompetingRiskResponseCombiner, CompetingRiskResponseWithCensorTime, ConcordanceError,
    Covariate, EnsembleCombiner, ErrorCalculator, Execution, Forest, ForestTrainer,
    GrayLogRankScorer, ImportanceConfig, LogRankScorer, MeanCombiner, MeanSquaredError,
    ResponseCombiner, Row, SplitScorer, WeightedVarianceScorer,
    censoring_survival_function,
};

/// Settings copy written next to the tree files of every trained forest.
const SETTINGS_FILE: &str = "settings.json";

#[derive(Parser)]
#[command(name = "larch")]
#[command(about = "Random forests for regression and competing-risk outcomes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose (debug-level) logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Worker threads, overriding the settings file (1 = serial)
    #[arg(long, global = true)]
    threads: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Train a forest and write its trees to a directory
    Train {
        /// Path to the JSON settings file
        #[arg(long)]
        settings: PathBuf,

        /// Path to the training CSV file
        #[arg(long)]
        data: PathBuf,

        /// Forest directory (defaults to save_tree_location from the settings)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Continue a streamed forest from the tree count recorded in its directory
        #[arg(long, default_value_t = false)]
        resume: bool,
    },

    /// Predict rows with a trained forest
    Predict {
        /// Forest directory written by `larch train`
        #[arg(long)]
        forest: PathBuf,

        /// Path to the CSV file of rows to predict
        #[arg(long)]
        data: PathBuf,

        /// Times at which competing-risk curves are reported (comma-separated)
        #[arg(long, value_delimiter = ',')]
        times: Vec<f64>,

        /// Use only trees whose bootstrap sample excluded each row
        #[arg(long, default_value_t = false)]
        oob: bool,
    },

    /// Rank covariates by permutation importance
    Importance {
        /// Forest directory written by `larch train`
        #[arg(long)]
        forest: PathBuf,

        /// Path to the CSV file of rows with known responses
        #[arg(long)]
        data: PathBuf,

        /// Event scored by concordance (defaults to the first response event)
        #[arg(long)]
        event: Option<u32>,

        /// Weight concordance pairs by the inverse probability of censoring
        #[arg(long, default_value_t = false)]
        ipcw: bool,

        /// Score every row with every tree instead of out-of-bag rows only
        #[arg(long, default_value_t = false)]
        in_sample: bool,

        /// RNG seed for the permutations
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

// --- JSON stdout output structs ---

#[derive(Serialize)]
struct TrainOutput {
    forest: PathBuf,
    n_rows: usize,
    n_covariates: usize,
    n_trees: usize,
    on_disk: bool,
    oob: Vec<OobOutput>,
}

#[derive(Serialize)]
struct OobOutput {
    measure: &'static str,
    event: Option<u32>,
    error: f64,
    n_oob_rows: usize,
}

#[derive(Serialize)]
struct RegressionPrediction {
    id: usize,
    value: f64,
}

#[derive(Serialize)]
struct CompetingRiskPrediction {
    id: usize,
    survival: Vec<f64>,
    cumulative_incidence: BTreeMap<u32, Vec<f64>>,
}

#[derive(Serialize)]
struct PredictOutput<P> {
    times: Option<Vec<f64>>,
    n_rows: usize,
    predictions: Vec<P>,
}

#[derive(Serialize)]
struct ImportanceOutput {
    name: String,
    rank: usize,
    mean: f64,
    std: f64,
    z_score: f64,
    n_trees: usize,
}

/// How trained trees reach the forest directory.
struct StoragePlan {
    directory: PathBuf,
    stream: bool,
    resume: bool,
}

fn load_forest_settings(forest: &Path, threads: Option<usize>) -> Result<ForestSettings> {
    let path = forest.join(SETTINGS_FILE);
    let mut settings = ForestSettings::load(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    apply_threads(&mut settings, threads);
    Ok(settings)
}

fn apply_threads(settings: &mut ForestSettings, threads: Option<usize>) {
    match threads {
        Some(1) => settings.threads = None,
        Some(n) => settings.threads = Some(n),
        None => {}
    }
}

fn forest_times(settings: &ForestSettings) -> Option<Vec<f64>> {
    match &settings.combiner {
        CombinerSettings::CompetingRiskFunctions { times } => times.clone(),
        CombinerSettings::Mean => None,
    }
}

/// Train in memory and save, stream to disk, or resume a streamed forest.
fn fit<Y, O, S, R, C>(
    trainer: &ForestTrainer<S, R, C>,
    rows: &[Row<Y>],
    covariates: &[Covariate],
    plan: &StoragePlan,
) -> Result<Forest<O, C>>
where
    Y: PartialEq + Sync,
    O: Send + Serialize + DeserializeOwned + Clone,
    S: SplitScorer<Y>,
    R: ResponseCombiner<Y, O>,
    C: Clone,
{
    if !plan.stream {
        let forest = trainer.train(rows, covariates).context("training failed")?;
        forest
            .save_to_directory(&plan.directory)
            .context("failed to save forest")?;
        return Ok(forest);
    }

    if plan.resume {
        info!(path = %plan.directory.display(), "resuming forest");
        return trainer
            .resume_on_disk(rows, covariates, &plan.directory)
            .context("resumed training failed");
    }

    trainer
        .train_on_disk(rows, covariates, &plan.directory, None)
        .context("on-disk training failed")
}

fn oob_output<Y, O, C, E>(
    forest: &Forest<O, C>,
    rows: &[Row<Y>],
    calculator: &E,
    execution: Execution,
    measure: &'static str,
    event: Option<u32>,
) -> Option<OobOutput>
where
    Y: Sync,
    O: Clone + DeserializeOwned + Sync,
    C: EnsembleCombiner<O>,
    E: ErrorCalculator<Y, C::Output>,
{
    match forest.oob_error(rows, calculator, execution) {
        Ok(oob) => Some(OobOutput {
            measure,
            event,
            error: oob.error,
            n_oob_rows: oob.n_oob_rows,
        }),
        Err(e) => {
            warn!(error = %e, measure, "out-of-bag error unavailable");
            None
        }
    }
}

fn train_competing_risk<Y, S>(
    settings: &ForestSettings,
    rows: &[Row<Y>],
    covariates: &[Covariate],
    scorer: S,
    events: &[u32],
    plan: &StoragePlan,
) -> Result<TrainOutput>
where
    Y: CompetingRiskOutcome + PartialEq + Sync,
    S: SplitScorer<Y>,
{
    let trainer = ForestTrainer::new(
        settings.forest_config()?,
        scorer,
        CompetingRiskResponseCombiner::new(events.to_vec()),
        CompetingRiskFunctionCombiner::new(events.to_vec(), forest_times(settings)),
    );
    let forest: Forest<CompetingRiskFunctions, _> = fit(&trainer, rows, covariates, plan)?;
    let oob = events
        .iter()
        .filter_map(|&event| {
            oob_output(
                &forest,
                rows,
                &ConcordanceError::naive(event),
                settings.execution(),
                "concordance",
                Some(event),
            )
        })
        .collect();
    Ok(TrainOutput {
        forest: plan.directory.clone(),
        n_rows: rows.len(),
        n_covariates: covariates.len(),
        n_trees: forest.n_trees(),
        on_disk: forest.is_on_disk(),
        oob,
    })
}

/// Rows for Gray's test, which needs each individual's censoring time.
fn read_with_censor_time(
    reader: &RowReader,
    covariates: &[Covariate],
    response: &ResponseSettings,
) -> Result<Vec<Row<CompetingRiskResponseWithCensorTime>>> {
    let ResponseSettings::CompetingRisk {
        delta_column,
        time_column,
        censor_time_column: Some(censor_time_column),
        ..
    } = response
    else {
        bail!("Gray's test requires response.censor_time_column");
    };
    reader
        .read_competing_risk_with_censor_time(
            covariates,
            delta_column,
            time_column,
            censor_time_column,
        )
        .context("failed to read training CSV")
}

fn run_train(settings: &ForestSettings, data: &Path, plan: &StoragePlan) -> Result<TrainOutput> {
    let covariates = settings.build_covariates()?;
    let reader = RowReader::new(data);

    match &settings.response {
        ResponseSettings::Regression { column } => {
            let rows = reader
                .read_regression(&covariates, column)
                .context("failed to read training CSV")?;
            let trainer = ForestTrainer::new(
                settings.forest_config()?,
                WeightedVarianceScorer,
                MeanCombiner,
                MeanCombiner,
            );
            let forest: Forest<f64, _> = fit(&trainer, &rows, &covariates, plan)?;
            let oob = oob_output(
                &forest,
                &rows,
                &MeanSquaredError,
                settings.execution(),
                "mse",
                None,
            );
            Ok(TrainOutput {
                forest: plan.directory.clone(),
                n_rows: rows.len(),
                n_covariates: covariates.len(),
                n_trees: forest.n_trees(),
                on_disk: forest.is_on_disk(),
                oob: oob.into_iter().collect(),
            })
        }
        ResponseSettings::CompetingRisk {
            delta_column,
            time_column,
            events,
            ..
        } => match &settings.split_finder {
            SplitFinderSettings::LogRankSingle { event } => {
                let rows = reader
                    .read_competing_risk(&covariates, delta_column, time_column)
                    .context("failed to read training CSV")?;
                let scorer = LogRankScorer::single(*event);
                train_competing_risk(settings, &rows, &covariates, scorer, events, plan)
            }
            SplitFinderSettings::LogRankMultiple { events: scored } => {
                let rows = reader
                    .read_competing_risk(&covariates, delta_column, time_column)
                    .context("failed to read training CSV")?;
                let scorer = LogRankScorer::multiple(scored.clone());
                train_competing_risk(settings, &rows, &covariates, scorer, events, plan)
            }
            SplitFinderSettings::GrayLogRankSingle { event } => {
                let rows = read_with_censor_time(&reader, &covariates, &settings.response)?;
                let scorer = GrayLogRankScorer::single(*event);
                train_competing_risk(settings, &rows, &covariates, scorer, events, plan)
            }
            SplitFinderSettings::GrayLogRankMultiple { events: scored } => {
                let rows = read_with_censor_time(&reader, &covariates, &settings.response)?;
                let scorer = GrayLogRankScorer::multiple(scored.clone());
                train_competing_risk(settings, &rows, &covariates, scorer, events, plan)
            }
            SplitFinderSettings::WeightedVariance => {
                bail!("weighted-variance cannot split a competing-risk response")
            }
        },
    }
}

/// Predict every row, or only rows with at least one out-of-bag tree.
fn predict_rows<O, C>(
    forest: &Forest<O, C>,
    rows: &[Row<()>],
    oob: bool,
    execution: Execution,
) -> Result<Vec<(usize, C::Output)>>
where
    O: Clone + DeserializeOwned + Sync,
    C: EnsembleCombiner<O>,
{
    let ids = rows.iter().map(Row::id);
    if !oob {
        let predictions = forest.evaluate_batch(rows, execution)?;
        return Ok(ids.zip(predictions).collect());
    }
    let predictions = forest.evaluate_oob_batch(rows, execution)?;
    let kept: Vec<(usize, C::Output)> = ids
        .zip(predictions)
        .filter_map(|(id, p)| p.map(|p| (id, p)))
        .collect();
    if kept.len() < rows.len() {
        warn!(
            skipped = rows.len() - kept.len(),
            "rows without an out-of-bag tree were skipped"
        );
    }
    Ok(kept)
}

fn importance_output<Y, O, C, E>(
    forest: &Forest<O, C>,
    rows: &[Row<Y>],
    covariates: &[Covariate],
    calculator: &E,
    config: &ImportanceConfig,
) -> Result<Vec<ImportanceOutput>>
where
    Y: Sync,
    O: Clone + DeserializeOwned + Sync,
    C: EnsembleCombiner<O>,
    E: ErrorCalculator<Y, C::Output>,
{
    let importance = forest
        .variable_importance(rows, covariates, calculator, config)
        .context("variable importance failed")?;
    Ok(importance
        .into_iter()
        .map(|v| ImportanceOutput {
            n_trees: v.per_tree.len(),
            name: v.name,
            rank: v.rank,
            mean: v.mean,
            std: v.std,
            z_score: v.z_score,
        })
        .collect())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match (cli.verbose, cli.quiet) {
        (true, _) => "debug",
        (_, true) => "error",
        _ => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Train {
            settings,
            data,
            output,
            resume,
        } => {
            let mut settings = ForestSettings::load(&settings)
                .with_context(|| format!("failed to load settings from {}", settings.display()))?;
            apply_threads(&mut settings, cli.threads);

            let directory = output
                .or_else(|| settings.save_tree_location.clone())
                .context("no forest directory: pass --output or set save_tree_location")?;
            if resume && !settings.save_progress {
                bail!("--resume requires save_progress in the settings");
            }
            let plan = StoragePlan {
                directory,
                stream: settings.save_progress,
                resume,
            };

            let output = run_train(&settings, &data, &plan)?;
            settings
                .save(&plan.directory.join(SETTINGS_FILE))
                .context("failed to save settings next to the forest")?;
            info!(n_trees = output.n_trees, forest = %plan.directory.display(), "forest trained");
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Command::Predict {
            forest,
            data,
            times,
            oob,
        } => {
            let settings = load_forest_settings(&forest, cli.threads)?;
            let covariates = settings.build_covariates()?;
            let rows = RowReader::new(&data)
                .read_covariates(&covariates)
                .context("failed to read prediction CSV")?;
            let execution = settings.execution();

            match &settings.response {
                ResponseSettings::Regression { .. } => {
                    let model: Forest<f64, _> = Forest::open_directory(&forest, MeanCombiner)
                        .context("failed to open forest")?;
                    let predictions = predict_rows(&model, &rows, oob, execution)?
                        .into_iter()
                        .map(|(id, value)| RegressionPrediction { id, value })
                        .collect();
                    let output = PredictOutput {
                        times: None,
                        n_rows: rows.len(),
                        predictions,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                ResponseSettings::CompetingRisk { events, .. } => {
                    let grid = if times.is_empty() {
                        forest_times(&settings)
                            .context("no report times: pass --times or set combiner.times")?
                    } else {
                        times
                    };
                    let model: Forest<CompetingRiskFunctions, _> = Forest::open_directory(
                        &forest,
                        CompetingRiskFunctionCombiner::new(events.clone(), forest_times(&settings)),
                    )
                    .context("failed to open forest")?;
                    let predictions = predict_rows(&model, &rows, oob, execution)?
                        .into_iter()
                        .map(|(id, functions)| CompetingRiskPrediction {
                            id,
                            survival: grid.iter().map(|&t| functions.survival().evaluate(t)).collect(),
                            cumulative_incidence: events
                                .iter()
                                .filter_map(|&event| {
                                    functions.cumulative_incidence(event).map(|cif| {
                                        (event, grid.iter().map(|&t| cif.evaluate(t)).collect())
                                    })
                                })
                                .collect(),
                        })
                        .collect();
                    let output = PredictOutput {
                        times: Some(grid),
                        n_rows: rows.len(),
                        predictions,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }

        Command::Importance {
            forest,
            data,
            event,
            ipcw,
            in_sample,
            seed,
        } => {
            let settings = load_forest_settings(&forest, cli.threads)?;
            let covariates = settings.build_covariates()?;
            let reader = RowReader::new(&data);
            let config = ImportanceConfig::new()
                .with_oob(!in_sample)
                .with_seed(seed)
                .with_execution(settings.execution());

            let output = match &settings.response {
                ResponseSettings::Regression { column } => {
                    let rows = reader
                        .read_regression(&covariates, column)
                        .context("failed to read importance CSV")?;
                    let model: Forest<f64, _> = Forest::open_directory(&forest, MeanCombiner)
                        .context("failed to open forest")?;
                    importance_output(&model, &rows, &covariates, &MeanSquaredError, &config)?
                }
                ResponseSettings::CompetingRisk {
                    delta_column,
                    time_column,
                    events,
                    ..
                } => {
                    let event = match event {
                        Some(event) if events.contains(&event) => event,
                        Some(event) => bail!("event {event} is not a response event"),
                        None => *events.first().context("settings declare no events")?,
                    };
                    let rows = reader
                        .read_competing_risk(&covariates, delta_column, time_column)
                        .context("failed to read importance CSV")?;
                    let model: Forest<CompetingRiskFunctions, _> = Forest::open_directory(
                        &forest,
                        CompetingRiskFunctionCombiner::new(events.clone(), forest_times(&settings)),
                    )
                    .context("failed to open forest")?;
                    let calculator = if ipcw {
                        let responses: Vec<_> = rows.iter().map(Row::response).collect();
                        ConcordanceError::ipcw(event, censoring_survival_function(&responses))
                    } else {
                        ConcordanceError::naive(event)
                    };
                    importance_output(&model, &rows, &covariates, &calculator, &config)?
                }
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
