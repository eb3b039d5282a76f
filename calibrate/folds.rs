//! Seeded, label-stratified partitioning: the calibration/validation split and
//! the k-fold plans used for hyperparameter selection.

use crate::calibrate::data::DataError;
use ndarray::ArrayView1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

fn class_members(labels: ArrayView1<f64>) -> [Vec<usize>; 2] {
    let mut classes = [Vec::new(), Vec::new()];
    for (i, &v) in labels.iter().enumerate() {
        classes[usize::from(v > 0.5)].push(i);
    }
    classes
}

/// Splits row positions into `(calibration, validation)` so that each class
/// contributes `round(fraction * class_size)` rows to calibration. A class with
/// at least two members always keeps one member on each side.
pub fn stratified_split(
    labels: ArrayView1<f64>,
    fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), DataError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(DataError::InvalidFraction(fraction));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut calibration = Vec::new();
    let mut validation = Vec::new();
    for mut members in class_members(labels) {
        members.shuffle(&mut rng);
        let n = members.len();
        let mut take = (fraction * n as f64).round() as usize;
        if n >= 2 {
            take = take.clamp(1, n - 1);
        }
        calibration.extend_from_slice(&members[..take]);
        validation.extend_from_slice(&members[take..]);
    }
    calibration.sort_unstable();
    validation.sort_unstable();
    Ok((calibration, validation))
}

/// Stratified k-fold assignment over a fixed set of rows.
#[derive(Debug, Clone)]
pub struct Folds {
    assignment: Vec<usize>,
    k: usize,
}

impl Folds {
    /// Deals each class round-robin over the folds after a seeded shuffle, so
    /// every fold receives an almost equal share of both classes.
    pub fn stratified(labels: ArrayView1<f64>, k: usize, seed: u64) -> Result<Self, DataError> {
        let n = labels.len();
        if k < 2 || k > n {
            return Err(DataError::InvalidFoldCount { k, n });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut assignment = vec![0; n];
        let mut next = 0;
        for mut members in class_members(labels) {
            members.shuffle(&mut rng);
            for row in members {
                assignment[row] = next % k;
                next += 1;
            }
        }
        Ok(Self { assignment, k })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// `(training rows, held-out rows)` for `fold`.
    pub fn split(&self, fold: usize) -> (Vec<usize>, Vec<usize>) {
        let mut train = Vec::with_capacity(self.assignment.len());
        let mut test = Vec::new();
        for (row, &f) in self.assignment.iter().enumerate() {
            if f == fold {
                test.push(row);
            } else {
                train.push(row);
            }
        }
        (train, test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn labels(n_pos: usize, n_neg: usize) -> Array1<f64> {
        let mut v = vec![1.0; n_pos];
        v.extend(std::iter::repeat_n(0.0, n_neg));
        Array1::from_vec(v)
    }

    #[test]
    fn split_preserves_class_balance_and_is_disjoint() {
        let y = labels(40, 60);
        let (cal, val) = stratified_split(y.view(), 0.8, 7).unwrap();
        assert_eq!(cal.len(), 80);
        assert_eq!(val.len(), 20);
        let cal_pos = cal.iter().filter(|&&r| y[r] == 1.0).count();
        let val_pos = val.iter().filter(|&&r| y[r] == 1.0).count();
        assert_eq!(cal_pos, 32);
        assert_eq!(val_pos, 8);
        assert!(cal.iter().all(|r| !val.contains(r)));
    }

    #[test]
    fn split_is_reproducible_for_a_seed() {
        let y = labels(25, 25);
        let first = stratified_split(y.view(), 0.8, 42).unwrap();
        let second = stratified_split(y.view(), 0.8, 42).unwrap();
        let other = stratified_split(y.view(), 0.8, 43).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let y = labels(5, 5);
        assert!(matches!(
            stratified_split(y.view(), 1.0, 1),
            Err(DataError::InvalidFraction(_))
        ));
    }

    #[test]
    fn folds_cover_every_row_once_with_both_classes() {
        let y = labels(30, 50);
        let folds = Folds::stratified(y.view(), 10, 3).unwrap();
        let mut seen = vec![0; y.len()];
        for fold in 0..folds.k() {
            let (train, test) = folds.split(fold);
            assert_eq!(train.len() + test.len(), y.len());
            assert_eq!(test.len(), 8);
            assert!(test.iter().any(|&r| y[r] == 1.0));
            assert!(test.iter().any(|&r| y[r] == 0.0));
            for r in test {
                seen[r] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn fold_count_must_fit_the_data() {
        let y = labels(2, 2);
        assert!(matches!(
            Folds::stratified(y.view(), 5, 0),
            Err(DataError::InvalidFoldCount { k: 5, n: 4 })
        ));
    }
}
