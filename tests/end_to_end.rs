use irrimap::calibrate::ensemble::{EnsembleConfig, train_ensemble};
use irrimap::calibrate::learners::{BoostingSpec, ForestSpec, LearnerSpec, LogisticSpec};
use irrimap::calibrate::model::TrainedEnsemble;
use irrimap::map::grid::{DEFAULT_NODATA, Grid, GridGeometry, RasterStack};
use irrimap::map::mask::RoiMask;
use irrimap::map::progress::NoopScoreProgress;
use irrimap::map::scorer::{ScoreOptions, score_stack};
use irrimap::map::zonal::zonal_summary;
use irrimap::mrp::hierarchical::{AreaDesign, RandomEffects, fit_hierarchical};
use irrimap::mrp::poststrat::{
    AdjustmentMethod, CoefficientSource, PoststratConfig, PoststratRow, PoststratTable, Weighting,
    poststratify,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tempfile::tempdir;

fn inv_logit(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn quick_config() -> EnsembleConfig {
    EnsembleConfig {
        seed: 11,
        folds: 5,
        learners: vec![
            LearnerSpec::RegularizedLogistic(LogisticSpec::default()),
            LearnerSpec::BaggedTrees(ForestSpec {
                trees: 40,
                ..ForestSpec::default()
            }),
            LearnerSpec::BoostedTrees(BoostingSpec {
                rounds_grid: vec![20, 50],
                ..BoostingSpec::default()
            }),
        ],
        ..EnsembleConfig::default()
    }
}

/// Cropland is irrigated where the wet-season greenness outweighs the dry-season one.
fn training_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let features = Array2::from_shape_fn((n, 2), |_| rng.gen_range(-2.0..2.0));
    let labels = features
        .rows()
        .into_iter()
        .map(|r| if r[0] + r[1] > 0.0 { 1.0 } else { 0.0 })
        .collect();
    (features, labels)
}

fn trained() -> TrainedEnsemble {
    let (features, labels) = training_data(200, 5);
    let names = vec!["ndvi_wet".to_string(), "ndvi_dry".to_string()];
    train_ensemble(features.view(), labels.view(), &names, &quick_config()).unwrap()
}

fn geometry() -> GridGeometry {
    GridGeometry {
        ncols: 10,
        nrows: 10,
        xll: 0.0,
        yll: 0.0,
        cellsize: 1000.0,
        nodata: DEFAULT_NODATA,
    }
}

#[test]
fn stacked_model_discriminates_on_held_out_units() {
    let ensemble = trained();
    let stacked = ensemble.validation.last().unwrap();
    assert_eq!(stacked.name, "stacked");
    let auc = stacked.auc.unwrap();
    assert!(auc > 0.9, "stacked validation AUC {auc}");
    let roc = ensemble.validation_roc();
    let corner = roc.last().unwrap();
    assert_eq!((corner.true_positive_rate, corner.false_positive_rate), (1.0, 1.0));
    assert!(roc.windows(2).all(|w| w[1].true_positive_rate >= w[0].true_positive_rate));

    let dir = tempdir().unwrap();
    let path = dir.path().join("ensemble.toml");
    ensemble.save(&path).unwrap();
    let reloaded = TrainedEnsemble::load(&path).unwrap();
    let (unseen, _) = training_data(30, 77);
    let a = ensemble.predict(unseen.view()).unwrap().stacked;
    let b = reloaded.predict(unseen.view()).unwrap().stacked;
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-9);
    }
}

#[test]
fn perfectly_predictive_covariate_is_recovered_by_the_stack() {
    // 50 irrigated units with positive greenness anomaly, 50 without.
    let features = Array2::from_shape_fn((100, 1), |(i, _)| {
        let magnitude = ((i / 2) as f64 + 0.5) / 50.0;
        if i % 2 == 0 { magnitude } else { -magnitude }
    });
    let labels: Array1<f64> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
    let names = vec!["ndvi_anomaly".to_string()];
    let ensemble = train_ensemble(features.view(), labels.view(), &names, &quick_config()).unwrap();
    assert_eq!(ensemble.meta_labels.len(), 20);
    assert_eq!(ensemble.meta_labels.sum(), 10.0);
    let auc = ensemble.validation.last().unwrap().auc.unwrap();
    assert!(auc > 0.95, "stacked validation AUC {auc}");
}

#[test]
fn surfaces_and_zonal_means_follow_the_covariates() {
    let ensemble = trained();
    let geometry = geometry();
    // Bands are listed in the reverse of the training order to exercise name alignment.
    let dry = Grid::new(
        geometry,
        Array2::from_shape_fn((10, 10), |(row, _)| -1.8 + 0.4 * row as f64),
    )
    .unwrap();
    let mut wet_values = Array2::from_shape_fn((10, 10), |(_, col)| -1.8 + 0.4 * col as f64);
    wet_values[[0, 0]] = f64::NAN;
    let wet = Grid::new(geometry, wet_values).unwrap();
    let stack = RasterStack::from_bands(vec![
        ("ndvi_dry".to_string(), dry),
        ("ndvi_wet".to_string(), wet),
    ])
    .unwrap();

    let mut mask_values = Array2::ones((10, 10));
    mask_values[[9, 0]] = 0.0;
    let mask = RoiMask::from_grid(&Grid::new(geometry, mask_values).unwrap());
    let surfaces = score_stack(
        &ensemble,
        &stack,
        Some(&mask),
        ScoreOptions::default(),
        &mut NoopScoreProgress,
    )
    .unwrap();
    assert_eq!(surfaces.names.len(), 4);
    assert_eq!(surfaces.summary.nodata_cells, 1);
    assert_eq!(surfaces.summary.masked_cells, 1);
    assert_eq!(surfaces.summary.scored_cells, 98);

    let stacked = surfaces.stacked().unwrap();
    assert!(stacked.values[[0, 0]].is_nan());
    assert!(stacked.values[[9, 0]].is_nan());
    assert!(stacked.values[[9, 9]] > 0.7);
    assert!(stacked.values[[0, 1]] < 0.3);

    // Zone 1 is the low-greenness western half, zone 2 the eastern half.
    let zones = Grid::new(
        geometry,
        Array2::from_shape_fn((10, 10), |(_, col)| if col < 5 { 1.0 } else { 2.0 }),
    )
    .unwrap();
    let cropland = RoiMask::full(geometry);
    let summaries = zonal_summary(&zones, &cropland, stacked, None).unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].zone, "1");
    assert_eq!(summaries[0].cropland_area, 50.0 * 1.0e6);
    let west = summaries[0].mean_score.unwrap();
    let east = summaries[1].mean_score.unwrap();
    assert!(east > west, "east {east} west {west}");
}

#[test]
fn multilevel_poststratification_recovers_known_area_rates() {
    let rates = [0.1, 0.2, 0.3, 0.4, 0.5];
    let cropland = [100.0, 300.0, 200.0, 250.0, 150.0];
    let rows = rates
        .iter()
        .zip(cropland)
        .enumerate()
        .map(|(i, (&p, area))| PoststratRow {
            area_id: format!("D{i}"),
            name: format!("District {i}"),
            land_area: area * 3.0,
            cropland_area: area,
            mean_score: 0.25 + 0.1 * i as f64,
            irrigated: 2 + i,
            not_irrigated: 8,
            irrigated_area: None,
            intercept: Some(logit(p)),
            slope: Some(0.0),
        })
        .collect();
    let table = PoststratTable::new(rows).unwrap();
    let config = PoststratConfig {
        weighting: Weighting::AreaWeighted,
        ..PoststratConfig::default()
    };
    let report = poststratify(
        &table,
        AdjustmentMethod::Multilevel(CoefficientSource::Table),
        None,
        &config,
    )
    .unwrap();
    let truth = rates.iter().zip(cropland).map(|(p, a)| p * a).sum::<f64>() / 1000.0;
    assert!((report.estimate - truth).abs() < 1e-9);
    assert!((report.total - truth * 1000.0).abs() < 1e-6);
    assert_eq!(report.areas.len(), 5);
    assert!(report.omissions.is_empty());
    for (area, &p) in report.areas.iter().zip(&rates) {
        assert!((area.adjusted - p).abs() < 1e-9);
    }
}

#[test]
fn fitted_model_feeds_poststratification() {
    let mut rng = StdRng::seed_from_u64(2024);
    let effect = Normal::new(0.0, 0.5).unwrap();
    let (beta0, beta1) = (-0.5, 2.0);
    let areas = 8;
    let per_area = 40;
    let offsets: Vec<f64> = (0..areas).map(|_| effect.sample(&mut rng)).collect();

    let mut ids = Vec::new();
    let mut labels = Vec::new();
    let mut scores = Vec::new();
    for (a, u) in offsets.iter().enumerate() {
        for _ in 0..per_area {
            let s: f64 = rng.gen_range(0.0..1.0);
            let p = inv_logit(beta0 + u + beta1 * s);
            ids.push(format!("A{a}"));
            scores.push(s);
            labels.push(if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 });
        }
    }
    let labels = Array1::from_vec(labels);
    let design = AreaDesign::new(&ids, labels.view(), Array1::from_vec(scores).view()).unwrap();
    let model = fit_hierarchical(&design, RandomEffects::Intercept, &Default::default()).unwrap();
    assert!((model.slope.value - beta1).abs() < 1.0, "slope {}", model.slope.value);

    let rows = (0..areas)
        .map(|a| {
            let id = format!("A{a}");
            let members: Vec<f64> = ids
                .iter()
                .zip(labels.iter())
                .filter(|(i, _)| **i == id)
                .map(|(_, &l)| l)
                .collect();
            let irrigated = members.iter().filter(|&&l| l == 1.0).count();
            PoststratRow {
                name: id.clone(),
                area_id: id,
                land_area: 400.0,
                cropland_area: 100.0,
                mean_score: 0.5,
                irrigated,
                not_irrigated: members.len() - irrigated,
                irrigated_area: None,
                intercept: None,
                slope: None,
            }
        })
        .collect();
    let table = PoststratTable::new(rows).unwrap();
    let report = poststratify(
        &table,
        AdjustmentMethod::Multilevel(CoefficientSource::Model),
        Some(&model),
        &PoststratConfig::default(),
    )
    .unwrap();
    let truth = offsets
        .iter()
        .map(|u| inv_logit(beta0 + u + beta1 * 0.5))
        .sum::<f64>()
        / areas as f64;
    assert!((report.estimate - truth).abs() < 0.1, "{} vs {truth}", report.estimate);
    assert!(report.lower < report.estimate && report.estimate < report.upper);
    assert_eq!(report.surveyed_units, areas * per_area);
}
