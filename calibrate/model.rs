use crate::calibrate::diagnostics::{LearnerDiagnostics, RocPoint, roc_curve};
use crate::calibrate::learners::{FittedLearner, LogisticModel, ProbabilityModel};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// A base learner together with the name its probability column carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedLearner {
    pub name: String,
    pub model: FittedLearner,
}

/// The complete, self-contained stacked ensemble.
///
/// Produced once by [`crate::calibrate::ensemble::train_ensemble`] and applied
/// read-only afterwards. The column order of `meta_features` is the order of
/// `base_learners`, which is also the order the meta-learner expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedEnsemble {
    /// Covariate names in the column order every feature matrix must follow.
    pub feature_names: Vec<String>,
    pub seed: u64,
    pub base_learners: Vec<NamedLearner>,
    pub meta_learner: LogisticModel,
    /// Validation metrics per base learner, followed by the stacked model.
    pub validation: Vec<LearnerDiagnostics>,
    /// Base-learner probabilities on the validation rows; the meta-learner's training data.
    pub meta_features: Array2<f64>,
    pub meta_labels: Array1<f64>,
}

/// Per-learner and stacked probabilities for a block of rows.
#[derive(Debug, Clone)]
pub struct EnsemblePrediction {
    pub learner_names: Vec<String>,
    /// Shape: [n_rows, n_learners].
    pub base: Array2<f64>,
    pub stacked: Array1<f64>,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("The model requires the covariate '{0}', which the input does not provide.")]
    MissingFeature(String),
}

impl TrainedEnsemble {
    /// Scores `features` with every base learner and the meta-learner.
    pub fn predict(&self, features: ArrayView2<f64>) -> Result<EnsemblePrediction, ModelError> {
        if features.ncols() != self.feature_names.len() {
            return Err(ModelError::MismatchedFeatureCount {
                found: features.ncols(),
                expected: self.feature_names.len(),
            });
        }
        let mut base = Array2::zeros((features.nrows(), self.base_learners.len()));
        for (j, learner) in self.base_learners.iter().enumerate() {
            base.column_mut(j)
                .assign(&learner.model.predict_proba(features));
        }
        let stacked = self.meta_learner.predict_proba(base.view());
        Ok(EnsemblePrediction {
            learner_names: self.learner_names(),
            base,
            stacked,
        })
    }

    pub fn learner_names(&self) -> Vec<String> {
        self.base_learners.iter().map(|l| l.name.clone()).collect()
    }

    /// Positions of the model's features within `available`, by name.
    pub fn column_order<S: AsRef<str>>(&self, available: &[S]) -> Result<Vec<usize>, ModelError> {
        self.feature_names
            .iter()
            .map(|name| {
                available
                    .iter()
                    .position(|a| a.as_ref() == name)
                    .ok_or_else(|| ModelError::MissingFeature(name.clone()))
            })
            .collect()
    }

    /// Reorders the columns of `features` (named by `available`) into model order.
    pub fn align_features<S: AsRef<str>>(
        &self,
        features: ArrayView2<f64>,
        available: &[S],
    ) -> Result<Array2<f64>, ModelError> {
        if features.ncols() != available.len() {
            return Err(ModelError::MismatchedFeatureCount {
                found: features.ncols(),
                expected: available.len(),
            });
        }
        let order = self.column_order(available)?;
        Ok(features.select(Axis(1), &order))
    }

    /// Meta-learner weight of each base learner on the original probability scale.
    pub fn meta_weights(&self) -> Vec<(String, f64)> {
        self.learner_names()
            .into_iter()
            .zip(self.meta_learner.raw_coefficients())
            .collect()
    }

    /// ROC curve of the stacked model on the held-out validation rows.
    pub fn validation_roc(&self) -> Vec<RocPoint> {
        let stacked = self.meta_learner.predict_proba(self.meta_features.view());
        roc_curve(self.meta_labels.view(), stacked.view())
    }

    /// Saves the trained ensemble to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained ensemble from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::learners::logistic::fit_ridge_logistic;
    use crate::calibrate::learners::test_support::noisy_linear;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn tiny_ensemble() -> TrainedEnsemble {
        let (x, y) = noisy_linear(60, 21);
        let base = fit_ridge_logistic(x.view(), y.view(), 0.1, 50, 1e-8).unwrap();
        let meta_features = base.predict_proba(x.view()).insert_axis(Axis(1));
        let meta = fit_ridge_logistic(meta_features.view(), y.view(), 0.1, 50, 1e-8).unwrap();
        TrainedEnsemble {
            feature_names: vec!["ndvi".to_string(), "slope".to_string()],
            seed: 1,
            base_learners: vec![NamedLearner {
                name: "regularized_logistic".to_string(),
                model: FittedLearner::RegularizedLogistic(base),
            }],
            meta_learner: meta,
            validation: vec![LearnerDiagnostics::evaluate(
                "stacked",
                y.view(),
                meta_features.column(0),
            )],
            meta_features,
            meta_labels: y,
        }
    }

    #[test]
    fn save_and_load_preserve_predictions() {
        let ensemble = tiny_ensemble();
        let file = NamedTempFile::new().unwrap();
        ensemble.save(file.path()).unwrap();
        let loaded = TrainedEnsemble::load(file.path()).unwrap();
        let rows = array![[0.5, -1.0], [-1.5, 0.2]];
        let before = ensemble.predict(rows.view()).unwrap();
        let after = loaded.predict(rows.view()).unwrap();
        for (a, b) in before.stacked.iter().zip(after.stacked.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert_eq!(after.learner_names, vec!["regularized_logistic".to_string()]);
    }

    #[test]
    fn wrong_feature_count_is_rejected() {
        let ensemble = tiny_ensemble();
        let rows = array![[0.5], [1.0]];
        assert!(matches!(
            ensemble.predict(rows.view()),
            Err(ModelError::MismatchedFeatureCount { found: 1, expected: 2 })
        ));
    }

    #[test]
    fn features_are_aligned_by_name() {
        let ensemble = tiny_ensemble();
        let shuffled = array![[7.0, 1.0, 2.0]];
        let aligned = ensemble
            .align_features(shuffled.view(), &["slope", "elevation", "ndvi"])
            .unwrap();
        assert_eq!(aligned, array![[2.0, 7.0]]);
        match ensemble.column_order(&["ndvi"]) {
            Err(ModelError::MissingFeature(name)) => assert_eq!(name, "slope"),
            other => panic!("expected MissingFeature, got {other:?}"),
        }
    }
}
