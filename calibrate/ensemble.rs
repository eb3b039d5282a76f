//! # Stacked Generalization
//!
//! Training proceeds in explicit stages, each consuming only what the previous
//! stage returned:
//!
//! 1. A label-stratified, seeded split of the labeled rows into a calibration
//!    set and a validation set.
//! 2. Every configured base learner is fit on the calibration set, in
//!    parallel, sharing one stratified k-fold plan for its internal
//!    hyperparameter search.
//! 3. Each fitted learner scores the validation set; the probability columns
//!    become the meta-features.
//! 4. A ridge logistic meta-learner is fit on the meta-features against the
//!    validation labels, with its own cross-validated penalty.
//!
//! A single failing learner aborts the run: the meta-learner's coefficients
//! only mean something when every column is present.

use crate::calibrate::data::{DataError, LabeledSet, validate_binary_labels};
use crate::calibrate::diagnostics::LearnerDiagnostics;
use crate::calibrate::folds::{Folds, stratified_split};
use crate::calibrate::learners::{
    LearnerError, LearnerSpec, LogisticSpec, ProbabilisticClassifier, ProbabilityModel,
};
use crate::calibrate::model::{NamedLearner, TrainedEnsemble};
use ahash::AHashMap;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub seed: u64,
    pub folds: usize,
    /// Share of each class assigned to the calibration set.
    pub calibration_fraction: f64,
    pub learners: Vec<LearnerSpec>,
    pub meta: LogisticSpec,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            folds: 10,
            calibration_fraction: 0.8,
            learners: LearnerSpec::default_set(),
            meta: LogisticSpec::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Base learner '{learner}' failed to fit: {source}")]
    LearnerFailed {
        learner: String,
        #[source]
        source: LearnerError,
    },

    #[error("The stacking meta-learner failed to fit: {0}")]
    MetaLearnerFailed(#[source] LearnerError),

    #[error("No base learners are configured.")]
    NoLearners,

    #[error("{names} covariate names were given for {columns} feature columns.")]
    FeatureNameMismatch { names: usize, columns: usize },

    #[error(
        "The validation split holds only {minority} unit(s) of its rarer class; at least 2 are needed to cross-validate the meta-learner."
    )]
    ValidationTooSmall { minority: usize },
}

/// Column names for the configured learners; repeated kinds get a numeric suffix.
fn learner_names(learners: &[LearnerSpec]) -> Vec<String> {
    let mut seen: AHashMap<&'static str, usize> = AHashMap::new();
    learners
        .iter()
        .map(|spec| {
            let count = seen.entry(spec.name()).or_insert(0);
            *count += 1;
            if *count == 1 {
                spec.name().to_string()
            } else {
                format!("{}_{}", spec.name(), count)
            }
        })
        .collect()
}

/// Trains the full stacked ensemble on labeled rows.
///
/// `features` columns must follow `feature_names`. All partitioning and
/// resampling derives from `config.seed`.
pub fn train_ensemble(
    features: ArrayView2<f64>,
    labels: ArrayView1<f64>,
    feature_names: &[String],
    config: &EnsembleConfig,
) -> Result<TrainedEnsemble, EnsembleError> {
    if config.learners.is_empty() {
        return Err(EnsembleError::NoLearners);
    }
    if feature_names.len() != features.ncols() {
        return Err(EnsembleError::FeatureNameMismatch {
            names: feature_names.len(),
            columns: features.ncols(),
        });
    }
    if features.nrows() != labels.len() {
        return Err(DataError::ShapeMismatch(format!(
            "{} feature rows against {} labels",
            features.nrows(),
            labels.len()
        ))
        .into());
    }
    validate_binary_labels(labels)?;

    let features = features.to_owned();
    let labels = labels.to_owned();
    let (calibration_rows, validation_rows) =
        stratified_split(labels.view(), config.calibration_fraction, config.seed)?;
    let calibration = LabeledSet::from_rows(&features, &labels, calibration_rows);
    let validation = LabeledSet::from_rows(&features, &labels, validation_rows);
    validate_binary_labels(calibration.labels.view())?;
    let (val_pos, val_neg) = validate_binary_labels(validation.labels.view())?;
    log::info!(
        "Calibration set: {} units; validation set: {} units ({} present, {} absent)",
        calibration.len(),
        validation.len(),
        val_pos,
        val_neg
    );

    let folds = Folds::stratified(
        calibration.labels.view(),
        config.folds.min(calibration.len()),
        config.seed.wrapping_add(1),
    )?;

    let names = learner_names(&config.learners);
    let fitted: Vec<_> = config
        .learners
        .par_iter()
        .enumerate()
        .map(|(i, spec)| {
            spec.fit(
                calibration.features.view(),
                calibration.labels.view(),
                &folds,
                config.seed.wrapping_add(100 + i as u64),
            )
        })
        .collect();

    let mut base_learners = Vec::with_capacity(fitted.len());
    for (name, outcome) in names.into_iter().zip(fitted) {
        match outcome {
            Ok(model) => base_learners.push(NamedLearner { name, model }),
            Err(source) => {
                log::error!("Base learner '{name}' failed: {source}");
                return Err(EnsembleError::LearnerFailed {
                    learner: name,
                    source,
                });
            }
        }
    }

    let mut meta_features = Array2::zeros((validation.len(), base_learners.len()));
    for (j, learner) in base_learners.iter().enumerate() {
        meta_features
            .column_mut(j)
            .assign(&learner.model.predict_proba(validation.features.view()));
    }

    let minority = val_pos.min(val_neg);
    if minority < 2 {
        return Err(EnsembleError::ValidationTooSmall { minority });
    }
    let meta_folds = Folds::stratified(
        validation.labels.view(),
        config.folds.min(minority),
        config.seed.wrapping_add(2),
    )?;
    let meta_learner = config
        .meta
        .fit_model(meta_features.view(), validation.labels.view(), &meta_folds)
        .map_err(EnsembleError::MetaLearnerFailed)?;

    let mut diagnostics: Vec<LearnerDiagnostics> = base_learners
        .iter()
        .enumerate()
        .map(|(j, learner)| {
            LearnerDiagnostics::evaluate(&learner.name, validation.labels.view(), meta_features.column(j))
        })
        .collect();
    let stacked = meta_learner.predict_proba(meta_features.view());
    diagnostics.push(LearnerDiagnostics::evaluate(
        "stacked",
        validation.labels.view(),
        stacked.view(),
    ));
    for d in &diagnostics {
        match d.auc {
            Some(auc) => log::info!(
                "Validation {}: AUC {auc:.3}, log-loss {:.4}, Brier {:.4}",
                d.name,
                d.log_loss,
                d.brier
            ),
            None => log::info!("Validation {}: AUC undefined", d.name),
        }
    }

    let ensemble = TrainedEnsemble {
        feature_names: feature_names.to_vec(),
        seed: config.seed,
        base_learners,
        meta_learner,
        validation: diagnostics,
        meta_features,
        meta_labels: validation.labels,
    };
    for (name, weight) in ensemble.meta_weights() {
        log::info!("Meta-learner weight for {name}: {weight:.4}");
    }
    Ok(ensemble)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::learners::{BoostingSpec, ForestSpec};
    use crate::calibrate::learners::test_support::noisy_linear;

    fn quick_config() -> EnsembleConfig {
        EnsembleConfig {
            folds: 5,
            learners: vec![
                LearnerSpec::RegularizedLogistic(LogisticSpec::default()),
                LearnerSpec::BaggedTrees(ForestSpec {
                    trees: 30,
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

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn stacked_probabilities_stay_in_unit_interval() {
        let (x, y) = noisy_linear(150, 31);
        let ensemble = train_ensemble(x.view(), y.view(), &names(), &quick_config()).unwrap();
        assert_eq!(ensemble.base_learners.len(), 3);
        assert_eq!(ensemble.validation.len(), 4);
        assert_eq!(ensemble.meta_features.nrows(), 30);
        let prediction = ensemble.predict(x.view()).unwrap();
        assert!(prediction.stacked.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(prediction.base.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn training_is_reproducible_for_a_seed() {
        let (x, y) = noisy_linear(100, 13);
        let a = train_ensemble(x.view(), y.view(), &names(), &quick_config()).unwrap();
        let b = train_ensemble(x.view(), y.view(), &names(), &quick_config()).unwrap();
        assert_eq!(a.meta_labels, b.meta_labels);
        assert_eq!(
            a.predict(x.view()).unwrap().stacked,
            b.predict(x.view()).unwrap().stacked
        );
    }

    #[test]
    fn failing_learner_is_named() {
        let (x, y) = noisy_linear(80, 2);
        let config = EnsembleConfig {
            folds: 4,
            learners: vec![
                LearnerSpec::BaggedTrees(ForestSpec {
                    trees: 5,
                    ..ForestSpec::default()
                }),
                LearnerSpec::RegularizedLogistic(LogisticSpec {
                    penalties: Vec::new(),
                    ..LogisticSpec::default()
                }),
            ],
            ..EnsembleConfig::default()
        };
        match train_ensemble(x.view(), y.view(), &names(), &config) {
            Err(EnsembleError::LearnerFailed { learner, .. }) => {
                assert_eq!(learner, "regularized_logistic")
            }
            other => panic!("expected LearnerFailed, got {other:?}"),
        }
    }

    #[test]
    fn unconverged_base_learner_aborts_training() {
        let (x, y) = noisy_linear(120, 7);
        let config = EnsembleConfig {
            folds: 4,
            learners: vec![LearnerSpec::RegularizedLogistic(LogisticSpec {
                penalties: vec![1e-6],
                max_iterations: 1,
                ..LogisticSpec::default()
            })],
            ..EnsembleConfig::default()
        };
        match train_ensemble(x.view(), y.view(), &names(), &config) {
            Err(EnsembleError::LearnerFailed { learner, source }) => {
                assert_eq!(learner, "regularized_logistic");
                assert!(matches!(source, LearnerError::DidNotConverge { .. }));
            }
            other => panic!("expected LearnerFailed, got {other:?}"),
        }
    }

    #[test]
    fn unconverged_meta_learner_aborts_training() {
        let (x, y) = noisy_linear(120, 7);
        let config = EnsembleConfig {
            meta: LogisticSpec {
                penalties: vec![1e-6],
                max_iterations: 1,
                ..LogisticSpec::default()
            },
            ..quick_config()
        };
        assert!(matches!(
            train_ensemble(x.view(), y.view(), &names(), &config),
            Err(EnsembleError::MetaLearnerFailed(LearnerError::DidNotConverge { .. }))
        ));
    }

    #[test]
    fn duplicate_learner_kinds_get_distinct_names() {
        let specs = vec![
            LearnerSpec::BaggedTrees(ForestSpec::default()),
            LearnerSpec::BaggedTrees(ForestSpec::default()),
            LearnerSpec::BoostedTrees(BoostingSpec::default()),
        ];
        assert_eq!(
            learner_names(&specs),
            vec!["bagged_trees", "bagged_trees_2", "boosted_trees"]
        );
    }

    #[test]
    fn single_class_input_is_rejected() {
        let (x, _) = noisy_linear(40, 2);
        let y = ndarray::Array1::ones(40);
        assert!(matches!(
            train_ensemble(x.view(), y.view(), &names(), &quick_config()),
            Err(EnsembleError::Data(DataError::SingleClass(_)))
        ));
    }
}
