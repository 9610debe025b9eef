//! End-to-end integration tests: settings JSON -> CSV rows -> forest -> predictions.

use std::path::{Path, PathBuf};

use larch_io::{
    CombinerSettings, CovariateSettings, ForestSettings, IoError, ResponseSettings, RowReader,
    SplitFinderSettings,
};
use larch_rf::{
    CompetingRiskFunctionCombiner, CompetingRiskFunctions, CompetingRiskResponseCombiner,
    ConcordanceError, Execution, Forest, ForestError, ForestTrainer, GrayLogRankScorer,
    LogRankScorer, MeanCombiner, MeanSquaredError, TreeDirectory, WeightedVarianceScorer,
    read_tree_count, tree_file_name,
};
use tempfile::TempDir;

/// Path to the test fixture directory.
fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn competing_risk_settings() -> ForestSettings {
    let mut settings = ForestSettings::new(
        vec![
            CovariateSettings::Numeric { name: "age".into() },
            CovariateSettings::Boolean {
                name: "treated".into(),
            },
            CovariateSettings::Factor {
                name: "grade".into(),
                levels: vec!["low".into(), "mid".into(), "high".into()],
            },
        ],
        ResponseSettings::CompetingRisk {
            delta_column: "delta".into(),
            time_column: "time".into(),
            censor_time_column: Some("censor".into()),
            events: vec![1, 2],
        },
        SplitFinderSettings::LogRankMultiple { events: vec![1, 2] },
        CombinerSettings::CompetingRiskFunctions { times: None },
    );
    settings.n_trees = 30;
    settings.node_size = 5;
    settings.number_of_splits = 8;
    settings.seed = 11;
    settings
}

#[test]
fn competing_risk_round_trip() {
    // 1. Settings survive a JSON round trip on disk.
    let dir = TempDir::new().unwrap();
    let settings_path = dir.path().join("settings.json");
    competing_risk_settings().save(&settings_path).unwrap();
    let settings = ForestSettings::load(&settings_path).unwrap();
    assert_eq!(settings, competing_risk_settings());

    // 2. Read rows declared by the settings.
    let covariates = settings.build_covariates().unwrap();
    let rows = RowReader::new(&fixture_path("competing_risk_80.csv"))
        .read_competing_risk(&covariates, "delta", "time")
        .expect("fixture should parse");
    assert_eq!(rows.len(), 80);
    assert!(covariates[0].has_missing());
    assert!(covariates[2].has_missing());
    assert!(!covariates[1].has_missing());

    // 3. Train and predict.
    let trainer = ForestTrainer::new(
        settings.forest_config().unwrap(),
        LogRankScorer::multiple(vec![1, 2]),
        CompetingRiskResponseCombiner::new(vec![1, 2]),
        CompetingRiskFunctionCombiner::new(vec![1, 2], None),
    );
    let forest: Forest<CompetingRiskFunctions, _> = trainer.train(&rows, &covariates).unwrap();
    assert_eq!(forest.n_trees(), 30);

    let predictions = forest.evaluate_batch(&rows, Execution::Serial).unwrap();
    for prediction in &predictions {
        for t in [0.25, 1.0, 2.5] {
            let total = prediction.survival().evaluate(t)
                + prediction.cumulative_incidence(1).unwrap().evaluate(t)
                + prediction.cumulative_incidence(2).unwrap().evaluate(t);
            assert!((total - 1.0).abs() < 1e-9, "S + CIF = {total} at t = {t}");
        }
    }

    // 4. OOB concordance is computable and better than chance.
    let oob = forest
        .oob_error(&rows, &ConcordanceError::naive(1), Execution::Serial)
        .unwrap();
    assert!(oob.n_oob_rows > 40);
    assert!(oob.error < 0.5, "oob concordance error = {}", oob.error);
}

#[test]
fn prediction_rows_without_response() {
    let settings = competing_risk_settings();
    let covariates = settings.build_covariates().unwrap();
    let reader = RowReader::new(&fixture_path("competing_risk_80.csv"));
    let rows = reader
        .read_competing_risk(&covariates, "delta", "time")
        .unwrap();
    let unlabeled = reader.read_covariates(&covariates).unwrap();

    let forest: Forest<CompetingRiskFunctions, _> = ForestTrainer::new(
        settings.forest_config().unwrap(),
        LogRankScorer::multiple(vec![1, 2]),
        CompetingRiskResponseCombiner::new(vec![1, 2]),
        CompetingRiskFunctionCombiner::new(vec![1, 2], Some(vec![0.5, 1.0, 2.0])),
    )
    .train(&rows, &covariates)
    .unwrap();

    let labeled = forest.evaluate_batch(&rows, Execution::Serial).unwrap();
    let unlabeled = forest
        .evaluate_batch(&unlabeled, Execution::Parallel { threads: 2 })
        .unwrap();
    assert_eq!(labeled, unlabeled);
}

#[test]
fn gray_forest_on_disk_from_settings() {
    let dir = TempDir::new().unwrap();
    let mut settings = competing_risk_settings();
    settings.split_finder = SplitFinderSettings::GrayLogRankSingle { event: 1 };
    settings.n_trees = 6;
    settings.threads = Some(2);
    settings.save_progress = true;
    settings.save_tree_location = Some(dir.path().join("trees"));
    settings.validate().unwrap();

    let covariates = settings.build_covariates().unwrap();
    let rows = RowReader::new(&fixture_path("competing_risk_80.csv"))
        .read_competing_risk_with_censor_time(&covariates, "delta", "time", "censor")
        .unwrap();

    let trainer = ForestTrainer::new(
        settings.forest_config().unwrap(),
        GrayLogRankScorer::single(1),
        CompetingRiskResponseCombiner::new(vec![1, 2]),
        CompetingRiskFunctionCombiner::new(vec![1, 2], None),
    );
    let location = settings.save_tree_location.clone().unwrap();
    let forest: Forest<CompetingRiskFunctions, _> = trainer
        .train_on_disk(&rows, &covariates, &location, None)
        .unwrap();
    assert!(forest.is_on_disk());
    assert_eq!(TreeDirectory::open(&location).unwrap().len(), 6);
    assert_eq!(read_tree_count(&location).unwrap(), Some(6));

    let reopened: Forest<CompetingRiskFunctions, _> = Forest::open_directory(
        &location,
        CompetingRiskFunctionCombiner::new(vec![1, 2], None),
    )
    .unwrap();
    assert_eq!(
        forest.evaluate_batch(&rows, Execution::Serial).unwrap(),
        reopened.evaluate_batch(&rows, Execution::Serial).unwrap()
    );
}

fn on_disk_trainer(
    settings: &ForestSettings,
) -> ForestTrainer<LogRankScorer, CompetingRiskResponseCombiner, CompetingRiskFunctionCombiner> {
    ForestTrainer::new(
        settings.forest_config().unwrap(),
        LogRankScorer::multiple(vec![1, 2]),
        CompetingRiskResponseCombiner::new(vec![1, 2]),
        CompetingRiskFunctionCombiner::new(vec![1, 2], None),
    )
}

#[test]
fn resume_continues_recorded_forest() {
    let dir = TempDir::new().unwrap();
    let location = dir.path().join("trees");
    let mut settings = competing_risk_settings();
    settings.n_trees = 4;
    let covariates = settings.build_covariates().unwrap();
    let rows = RowReader::new(&fixture_path("competing_risk_80.csv"))
        .read_competing_risk(&covariates, "delta", "time")
        .unwrap();

    let _: Forest<CompetingRiskFunctions, _> = on_disk_trainer(&settings)
        .train_on_disk(&rows, &covariates, &location, None)
        .unwrap();

    settings.n_trees = 7;
    let resumed: Forest<CompetingRiskFunctions, _> = on_disk_trainer(&settings)
        .resume_on_disk(&rows, &covariates, &location)
        .unwrap();
    assert_eq!(resumed.n_trees(), 7);
    assert_eq!(read_tree_count(&location).unwrap(), Some(7));
}

#[test]
fn resume_after_tree_file_deleted_fails() {
    let dir = TempDir::new().unwrap();
    let location = dir.path().join("trees");
    let mut settings = competing_risk_settings();
    settings.n_trees = 5;
    let covariates = settings.build_covariates().unwrap();
    let rows = RowReader::new(&fixture_path("competing_risk_80.csv"))
        .read_competing_risk(&covariates, "delta", "time")
        .unwrap();

    let _: Forest<CompetingRiskFunctions, _> = on_disk_trainer(&settings)
        .train_on_disk(&rows, &covariates, &location, None)
        .unwrap();
    std::fs::remove_file(location.join(tree_file_name(2))).unwrap();

    settings.n_trees = 8;
    let err = on_disk_trainer(&settings)
        .resume_on_disk::<_, CompetingRiskFunctions>(&rows, &covariates, &location)
        .unwrap_err();
    assert!(matches!(
        err,
        ForestError::ResumeMismatch {
            expected: 5,
            found: 4,
            ..
        }
    ));
}

#[test]
fn regression_round_trip() {
    let mut settings = ForestSettings::new(
        vec![
            CovariateSettings::Numeric { name: "x".into() },
            CovariateSettings::Numeric {
                name: "noise".into(),
            },
        ],
        ResponseSettings::Regression { column: "y".into() },
        SplitFinderSettings::WeightedVariance,
        CombinerSettings::Mean,
    );
    settings.n_trees = 25;
    settings.node_size = 3;
    settings.validate().unwrap();
    let settings = ForestSettings::from_json(&settings.to_json().unwrap()).unwrap();

    let covariates = settings.build_covariates().unwrap();
    let rows = RowReader::new(&fixture_path("regression_60.csv"))
        .read_regression(&covariates, "y")
        .unwrap();

    let forest: Forest<f64, _> = ForestTrainer::new(
        settings.forest_config().unwrap(),
        WeightedVarianceScorer,
        MeanCombiner,
        MeanCombiner,
    )
    .train(&rows, &covariates)
    .unwrap();

    let oob = forest
        .oob_error(&rows, &MeanSquaredError, Execution::Serial)
        .unwrap();
    assert!(oob.error < 1.0, "oob mse = {}", oob.error);
}

#[test]
fn settings_naming_absent_column_fails_on_read() {
    let mut settings = competing_risk_settings();
    settings.covariates.push(CovariateSettings::Numeric {
        name: "weight".into(),
    });
    let covariates = settings.build_covariates().unwrap();
    let err = RowReader::new(&fixture_path("competing_risk_80.csv"))
        .read_competing_risk(&covariates, "delta", "time")
        .unwrap_err();
    assert!(matches!(err, IoError::MissingColumn { column, .. } if column == "weight"));
}
