//! # Cube Method
//!
//! Balanced sampling after Deville and Tillé, with the fast flight phase of
//! Chauvet and Tillé. Every unit starts with its inclusion probability. The
//! flight phase moves the probability vector along directions in the kernel of
//! the balancing constraints, restricted to a working set of `q + 1`
//! undecided units, until each move rounds at least one unit to 0 or 1. When
//! fewer undecided units remain than constraints, the landing phase drops
//! constraints from the last one backwards and continues. Units still
//! undecided once no constraint is left are drawn independently.
//!
//! The random choice between the two extreme points of each move keeps every
//! unit's expected final value equal to its starting probability.

use crate::frame::SamplingError;
use crate::shared::faer_ndarray::null_vector;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Probabilities this close to 0 or 1 count as decided.
const DECIDED: f64 = 1e-9;

/// Outcome of one cube draw.
#[derive(Debug, Clone, PartialEq)]
pub struct CubeSample {
    /// Indices of selected units, ascending.
    pub selected: Vec<usize>,
    pub flight_steps: usize,
    pub landing_steps: usize,
    /// Units left undecided after the landing phase and drawn independently.
    pub independent_draws: usize,
}

fn is_undecided(p: f64) -> bool {
    p > DECIDED && p < 1.0 - DECIDED
}

fn snap(p: &mut f64) {
    if *p <= DECIDED {
        *p = 0.0;
    } else if *p >= 1.0 - DECIDED {
        *p = 1.0;
    }
}

/// Balancing matrix: one row per constraint, one column per unit, `a_k = x_k / π_k`.
///
/// The first constraint is `π_k / π_k = 1`, which fixes the sample size.
/// Auxiliary variables are standardized first so that constraints measured
/// in metres and counts are comparable.
pub fn balancing_matrix(probabilities: &[f64], auxiliary: ArrayView2<f64>) -> Array2<f64> {
    let n = probabilities.len();
    let q = auxiliary.ncols();
    let mut a = Array2::zeros((q + 1, n));
    for (k, &p) in probabilities.iter().enumerate() {
        if p > 0.0 {
            a[[0, k]] = 1.0;
        }
    }
    for (j, column) in auxiliary.axis_iter(Axis(1)).enumerate() {
        let mean = column.mean().unwrap_or(0.0);
        let sd = column.std(0.0);
        let scale = if sd > 0.0 { sd } else { 1.0 };
        for (k, &p) in probabilities.iter().enumerate() {
            if p > 0.0 {
                a[[j + 1, k]] = (column[k] - mean) / scale / p;
            }
        }
    }
    a
}

/// One random step along a kernel direction of `constraints` restricted to `units`.
///
/// Returns `false` when the constraints leave no free direction.
fn step(
    probabilities: &mut [f64],
    constraints: ArrayView2<f64>,
    units: &[usize],
    rng: &mut StdRng,
) -> Result<bool, SamplingError> {
    if constraints.nrows() >= units.len() {
        return Ok(false);
    }
    let local = constraints.select(Axis(1), units);
    let direction: Array1<f64> = null_vector(&local)?;
    let mut up = f64::INFINITY;
    let mut down = f64::INFINITY;
    for (&k, &u) in units.iter().zip(direction.iter()) {
        let p = probabilities[k];
        if u > 1e-12 {
            up = up.min((1.0 - p) / u);
            down = down.min(p / u);
        } else if u < -1e-12 {
            up = up.min(p / -u);
            down = down.min((1.0 - p) / -u);
        }
    }
    if !up.is_finite() || !down.is_finite() {
        return Ok(false);
    }
    let lambda = if rng.gen_range(0.0..1.0) * (up + down) < down {
        up
    } else {
        -down
    };
    for (&k, &u) in units.iter().zip(direction.iter()) {
        probabilities[k] = (probabilities[k] + lambda * u).clamp(0.0, 1.0);
        snap(&mut probabilities[k]);
    }
    Ok(true)
}

/// Draws a balanced sample.
///
/// `probabilities` holds each unit's target inclusion probability; `auxiliary`
/// holds one row per unit and one column per balancing variable.
pub fn cube_sample(
    probabilities: &[f64],
    auxiliary: ArrayView2<f64>,
    rng: &mut StdRng,
) -> Result<CubeSample, SamplingError> {
    let n = probabilities.len();
    if auxiliary.nrows() != n {
        return Err(SamplingError::ShapeMismatch {
            units: n,
            auxiliary_rows: auxiliary.nrows(),
        });
    }
    if let Some(&bad) = probabilities.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(SamplingError::InvalidProbability(bad));
    }
    let a = balancing_matrix(probabilities, auxiliary);
    let mut pi = probabilities.to_vec();
    pi.iter_mut().for_each(snap);

    // Visiting units in random order spreads the working sets over the region.
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let mut flight_steps = 0;
    let mut landing_steps = 0;
    let mut active_constraints = a.nrows();
    let mut cursor = 0;
    loop {
        let mut undecided: Vec<usize> = Vec::with_capacity(active_constraints + 1);
        let mut scan = cursor;
        while scan < order.len() && undecided.len() <= active_constraints {
            if is_undecided(pi[order[scan]]) {
                undecided.push(order[scan]);
            } else if undecided.is_empty() {
                cursor = scan + 1;
            }
            scan += 1;
        }
        if undecided.is_empty() || active_constraints == 0 {
            break;
        }
        let constraints = a.slice(s![..active_constraints, ..]);
        if step(&mut pi, constraints, &undecided, rng)? {
            if active_constraints == a.nrows() {
                flight_steps += 1;
            } else {
                landing_steps += 1;
            }
        } else {
            active_constraints -= 1;
        }
    }

    let mut independent_draws = 0;
    for p in pi.iter_mut().filter(|p| is_undecided(**p)) {
        independent_draws += 1;
        *p = if rng.gen_range(0.0..1.0) < *p { 1.0 } else { 0.0 };
    }

    let selected: Vec<usize> = (0..n).filter(|&k| pi[k] > 0.5).collect();
    log::info!(
        "Cube method: {flight_steps} flight steps, {landing_steps} landing steps, {independent_draws} independent draws; {} of {n} units selected",
        selected.len()
    );
    Ok(CubeSample {
        selected,
        flight_steps,
        landing_steps,
        independent_draws,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn lattice(side: usize) -> Array2<f64> {
        Array2::from_shape_fn((side * side, 2), |(k, j)| {
            if j == 0 { (k % side) as f64 } else { (k / side) as f64 }
        })
    }

    #[test]
    fn fixed_size_and_coordinate_balance_across_seeds() {
        let coords = lattice(30);
        let n = 60;
        let p = vec![n as f64 / 900.0; 900];
        for seed in 0..5 {
            let mut rng = StdRng::seed_from_u64(seed);
            let sample = cube_sample(&p, coords.view(), &mut rng).unwrap();
            let size = sample.selected.len();
            assert!((n - 1..=n + 1).contains(&size), "seed {seed}: {size}");
            let picked = coords.select(Axis(0), &sample.selected);
            let mean = picked.mean_axis(Axis(0)).unwrap();
            assert_abs_diff_eq!(mean[0], 14.5, epsilon = 1.5);
            assert_abs_diff_eq!(mean[1], 14.5, epsilon = 1.5);
            let mut distinct = sample.selected.clone();
            distinct.dedup();
            assert_eq!(distinct.len(), size);
        }
    }

    #[test]
    fn same_seed_same_sample() {
        let coords = lattice(10);
        let p = vec![0.2; 100];
        let a = cube_sample(&p, coords.view(), &mut StdRng::seed_from_u64(11)).unwrap();
        let b = cube_sample(&p, coords.view(), &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn inclusion_frequencies_match_probabilities() {
        let coords = lattice(4);
        let p = vec![0.25; 16];
        let mut counts = [0usize; 16];
        let runs = 400;
        for seed in 0..runs {
            let sample = cube_sample(&p, coords.view(), &mut StdRng::seed_from_u64(seed)).unwrap();
            for k in sample.selected {
                counts[k] += 1;
            }
        }
        for (k, &c) in counts.iter().enumerate() {
            let freq = c as f64 / runs as f64;
            assert!((freq - 0.25).abs() < 0.1, "unit {k}: {freq}");
        }
    }

    #[test]
    fn certain_and_impossible_units_are_respected() {
        let coords = lattice(3);
        let mut p = vec![0.5; 9];
        p[0] = 1.0;
        p[8] = 0.0;
        let sample = cube_sample(&p, coords.view(), &mut StdRng::seed_from_u64(5)).unwrap();
        assert!(sample.selected.contains(&0));
        assert!(!sample.selected.contains(&8));
        assert!(matches!(
            cube_sample(&[1.5], Array2::zeros((1, 2)).view(), &mut StdRng::seed_from_u64(0)),
            Err(SamplingError::InvalidProbability(_))
        ));
    }
}
