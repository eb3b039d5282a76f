use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use irrimap::calibrate::ensemble::{EnsembleConfig, train_ensemble};
use irrimap::calibrate::learners::{BoostingSpec, ForestSpec, LearnerSpec, LogisticSpec};
use irrimap::calibrate::model::TrainedEnsemble;
use irrimap::map::grid::{DEFAULT_NODATA, Grid, GridGeometry, RasterStack};
use irrimap::map::progress::NoopScoreProgress;
use irrimap::map::scorer::{ScoreOptions, score_stack};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BANDS: [&str; 3] = ["ndvi_dry", "ndvi_wet", "dist_water"];

fn ensemble() -> TrainedEnsemble {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let features = Array2::from_shape_fn((400, BANDS.len()), |_| rng.gen_range(-1.0..1.0));
    let labels: Array1<f64> = features
        .rows()
        .into_iter()
        .map(|r| if r[1] - r[0] - 0.5 * r[2] > 0.0 { 1.0 } else { 0.0 })
        .collect();
    let names: Vec<String> = BANDS.iter().map(|s| s.to_string()).collect();
    let config = EnsembleConfig {
        folds: 5,
        learners: vec![
            LearnerSpec::RegularizedLogistic(LogisticSpec::default()),
            LearnerSpec::BaggedTrees(ForestSpec {
                trees: 100,
                ..ForestSpec::default()
            }),
            LearnerSpec::BoostedTrees(BoostingSpec {
                rounds_grid: vec![100],
                ..BoostingSpec::default()
            }),
        ],
        ..EnsembleConfig::default()
    };
    train_ensemble(features.view(), labels.view(), &names, &config)
        .unwrap_or_else(|e| panic!("benchmark ensemble failed to train: {e}"))
}

fn stack(side: usize) -> RasterStack {
    let geometry = GridGeometry {
        ncols: side,
        nrows: side,
        xll: 0.0,
        yll: 0.0,
        cellsize: 250.0,
        nodata: DEFAULT_NODATA,
    };
    let mut rng = StdRng::seed_from_u64(side as u64);
    let bands = BANDS
        .iter()
        .map(|name| {
            let values = Array2::from_shape_fn((side, side), |_| rng.gen_range(-1.0..1.0));
            Grid::new(geometry, values).map(|grid| (name.to_string(), grid))
        })
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|e| panic!("benchmark grid failed: {e}"));
    RasterStack::from_bands(bands).unwrap_or_else(|e| panic!("benchmark stack failed: {e}"))
}

fn benchmark_scoring(c: &mut Criterion) {
    let ensemble = ensemble();
    let stacks: Vec<(usize, RasterStack)> = [100_usize, 250, 500]
        .iter()
        .map(|&side| (side, stack(side)))
        .collect();

    let mut group = c.benchmark_group("score_stack");
    group.sample_size(10);
    for (side, raster) in &stacks {
        group.throughput(Throughput::Elements((side * side) as u64));
        for block_rows in [16_usize, 128] {
            let options = ScoreOptions {
                block_rows,
                ..ScoreOptions::default()
            };
            group.bench_with_input(
                BenchmarkId::new(format!("block_rows_{block_rows}"), side),
                raster,
                |b, input| {
                    b.iter(|| {
                        let surfaces =
                            score_stack(&ensemble, black_box(input), None, options, &mut NoopScoreProgress);
                        black_box(surfaces.map(|s| s.summary.scored_cells).unwrap_or(0));
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(scoring, benchmark_scoring);
criterion_main!(scoring);
