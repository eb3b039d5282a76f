//! Discrimination and calibration metrics for binary probability predictions.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

const PROB_EPS: f64 = 1e-15;

/// One operating point of a ROC curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f64,
    pub true_positive_rate: f64,
    pub false_positive_rate: f64,
}

/// Validation metrics for one learner (or the stacked model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerDiagnostics {
    pub name: String,
    pub auc: Option<f64>,
    pub log_loss: f64,
    pub brier: f64,
}

impl LearnerDiagnostics {
    pub fn evaluate(name: &str, labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> Self {
        Self {
            name: name.to_string(),
            auc: auc(labels, probabilities),
            log_loss: log_loss(labels, probabilities),
            brier: brier_score(labels, probabilities),
        }
    }
}

/// Area under the ROC curve via the Mann–Whitney statistic with midranks for
/// ties. `None` when either class is absent.
pub fn auc(labels: ArrayView1<f64>, scores: ArrayView1<f64>) -> Option<f64> {
    let n = labels.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let midrank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = midrank;
        }
        i = j + 1;
    }

    let positives = labels.iter().filter(|&&v| v > 0.5).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(y, _)| **y > 0.5)
        .map(|(_, r)| r)
        .sum();
    let u = rank_sum - (positives * (positives + 1)) as f64 / 2.0;
    Some(u / (positives as f64 * negatives as f64))
}

/// Empirical ROC curve, one point per distinct score, from (0,0) to (1,1).
pub fn roc_curve(labels: ArrayView1<f64>, scores: ArrayView1<f64>) -> Vec<RocPoint> {
    let positives = labels.iter().filter(|&&v| v > 0.5).count() as f64;
    let negatives = labels.len() as f64 - positives;
    let mut order: Vec<usize> = (0..labels.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut curve = vec![RocPoint {
        threshold: f64::INFINITY,
        true_positive_rate: 0.0,
        false_positive_rate: 0.0,
    }];
    let (mut tp, mut fp) = (0.0, 0.0);
    for (pos, &idx) in order.iter().enumerate() {
        if labels[idx] > 0.5 {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        let last_of_tie = order
            .get(pos + 1)
            .is_none_or(|&next| scores[next] != scores[idx]);
        if last_of_tie {
            curve.push(RocPoint {
                threshold: scores[idx],
                true_positive_rate: if positives > 0.0 { tp / positives } else { 0.0 },
                false_positive_rate: if negatives > 0.0 { fp / negatives } else { 0.0 },
            });
        }
    }
    curve
}

/// Mean binomial log-loss with probabilities clamped away from 0 and 1.
pub fn log_loss(labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    log_loss_sum(labels, probabilities) / labels.len() as f64
}

pub(crate) fn log_loss_sum(labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> f64 {
    labels
        .iter()
        .zip(probabilities)
        .map(|(&y, &p)| {
            let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum()
}

pub fn brier_score(labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    labels
        .iter()
        .zip(probabilities)
        .map(|(&y, &p)| (p - y).powi(2))
        .sum::<f64>()
        / labels.len() as f64
}
