//! Criterion benchmarks for larch-rf: competing-risk training, prediction and split scoring.

use criterion::{Criterion, criterion_group, criterion_main};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use larch_rf::{
    CompetingRiskFunctionCombiner, CompetingRiskResponse, CompetingRiskResponseCombiner,
    Covariate, CovariateValue, Execution, ForestConfig, ForestTrainer, LogRankScorer, Row,
    SplitScorer, TreeConfig,
};

fn make_competing_risk(
    n_rows: usize,
    n_covariates: usize,
    seed: u64,
) -> (Vec<Row<CompetingRiskResponse>>, Vec<Covariate>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let rows = (0..n_rows)
        .map(|i| {
            let values: Vec<f64> = (0..n_covariates).map(|_| rng.r#gen::<f64>()).collect();
            let rate = 0.5 + 2.0 * values[0];
            let event_time = -(1.0 - rng.r#gen::<f64>()).ln() / rate;
            let censor_time = rng.gen_range(0.5..3.0);
            let event = if rng.r#gen::<f64>() < values[0] { 1 } else { 2 };
            let response = if event_time <= censor_time {
                CompetingRiskResponse::new(event, event_time)
            } else {
                CompetingRiskResponse::new(0, censor_time)
            };
            Row::new(
                i,
                values.into_iter().map(CovariateValue::Numeric).collect(),
                response,
            )
        })
        .collect();
    let covariates = (0..n_covariates)
        .map(|c| Covariate::numeric(format!("x{c}"), c))
        .collect();
    (rows, covariates)
}

fn trainer(
    n_trees: usize,
    execution: Execution,
) -> ForestTrainer<LogRankScorer, CompetingRiskResponseCombiner, CompetingRiskFunctionCombiner> {
    let config = ForestConfig::new(n_trees)
        .unwrap()
        .with_node_size(5)
        .with_number_of_splits(10)
        .with_seed(42)
        .with_execution(execution);
    ForestTrainer::new(
        config,
        LogRankScorer::multiple(vec![1, 2]),
        CompetingRiskResponseCombiner::new(vec![1, 2]),
        CompetingRiskFunctionCombiner::new(vec![1, 2], None),
    )
}

fn bench_forest_train(c: &mut Criterion) {
    let (rows, covariates) = make_competing_risk(500, 10, 42);
    let serial = trainer(20, Execution::Serial);
    let parallel = trainer(20, Execution::Parallel { threads: 4 });

    c.bench_function("cr_train_500x10_20trees_serial", |b| {
        b.iter(|| serial.train(&rows, &covariates).unwrap());
    });
    c.bench_function("cr_train_500x10_20trees_4threads", |b| {
        b.iter(|| parallel.train(&rows, &covariates).unwrap());
    });
}

fn bench_forest_evaluate_batch(c: &mut Criterion) {
    let (rows, covariates) = make_competing_risk(500, 10, 42);
    let forest = trainer(20, Execution::Serial).train(&rows, &covariates).unwrap();

    c.bench_function("cr_evaluate_batch_500x10_20trees", |b| {
        b.iter(|| forest.evaluate_batch(&rows, Execution::Serial).unwrap());
    });
}

fn bench_single_tree(c: &mut Criterion) {
    let (rows, covariates) = make_competing_risk(500, 10, 42);
    let config = TreeConfig::new().with_node_size(5);
    let scorer = LogRankScorer::multiple(vec![1, 2]);
    let combiner = CompetingRiskResponseCombiner::new(vec![1, 2]);

    c.bench_function("cr_single_tree_500x10", |b| {
        b.iter(|| {
            config
                .fit::<_, larch_rf::CompetingRiskFunctions, _, _>(&rows, &covariates, &scorer, &combiner, 7)
                .unwrap()
        });
    });
}

fn bench_log_rank_score(c: &mut Criterion) {
    let (rows, _) = make_competing_risk(1000, 1, 42);
    let responses: Vec<&CompetingRiskResponse> = rows.iter().map(Row::response).collect();
    let (left, right) = responses.split_at(500);
    let scorer = LogRankScorer::multiple(vec![1, 2]);

    c.bench_function("log_rank_multiple_500v500", |b| {
        b.iter(|| scorer.score(left, right));
    });
}

criterion_group!(
    benches,
    bench_forest_train,
    bench_forest_evaluate_batch,
    bench_single_tree,
    bench_log_rank_score
);
criterion_main!(benches);
