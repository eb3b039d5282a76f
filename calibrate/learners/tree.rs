//! Least-squares regression trees, grown greedily on squared-error reduction.
//!
//! The same tree serves bagging (target is the 0/1 label, leaves hold the
//! class frequency) and boosting (target is the gradient, leaves hold a
//! Newton step supplied by the caller).

use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_leaf: usize,
    /// Features examined per split; `None` examines all of them.
    pub max_features: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct Grower<'a, 't, 'f> {
    features: ArrayView2<'a, f64>,
    target: &'t [f64],
    params: TreeParams,
    leaf_value: &'f (dyn Fn(&[usize]) -> f64 + 'f),
    nodes: Vec<Node>,
}

impl RegressionTree {
    /// Grows a tree on `rows` (indices into `features`, repeats allowed).
    pub fn fit(
        features: ArrayView2<f64>,
        target: &[f64],
        rows: Vec<usize>,
        params: TreeParams,
        rng: &mut StdRng,
        leaf_value: &dyn Fn(&[usize]) -> f64,
    ) -> Self {
        let mut grower = Grower {
            features,
            target,
            params,
            leaf_value,
            nodes: Vec::new(),
        };
        grower.grow(rows, 0, rng);
        Self { nodes: grower.nodes }
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut at = 0;
        loop {
            match self.nodes[at] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    // NaN goes right
                    at = if row[feature] <= threshold { left } else { right };
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Grower<'_, '_, '_> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let at = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: (self.leaf_value)(&rows),
        });
        if depth >= self.params.max_depth || rows.len() < 2 * self.params.min_leaf {
            return at;
        }
        let Some(split) = self.best_split(&rows, rng) else {
            return at;
        };
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.features[[r, split.feature]] <= split.threshold);
        let left = self.grow(left_rows, depth + 1, rng);
        let right = self.grow(right_rows, depth + 1, rng);
        self.nodes[at] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        at
    }

    fn best_split(&self, rows: &[usize], rng: &mut StdRng) -> Option<SplitCandidate> {
        let n_features = self.features.ncols();
        let candidates: Vec<usize> = match self.params.max_features {
            Some(m) if m < n_features => index::sample(rng, n_features, m.max(1)).into_vec(),
            _ => (0..n_features).collect(),
        };

        let n = rows.len();
        let total: f64 = rows.iter().map(|&r| self.target[r]).sum();
        let total_sq: f64 = rows.iter().map(|&r| self.target[r].powi(2)).sum();
        let parent_sse = total_sq - total * total / n as f64;
        let min_leaf = self.params.min_leaf.max(1);

        let mut best: Option<SplitCandidate> = None;
        let mut sorted = rows.to_vec();
        for feature in candidates {
            sorted.sort_by(|&a, &b| {
                self.features[[a, feature]].total_cmp(&self.features[[b, feature]])
            });
            let (mut left_sum, mut left_sq) = (0.0, 0.0);
            for i in 1..n {
                let y = self.target[sorted[i - 1]];
                left_sum += y;
                left_sq += y * y;
                if i < min_leaf || n - i < min_leaf {
                    continue;
                }
                let lo = self.features[[sorted[i - 1], feature]];
                let hi = self.features[[sorted[i], feature]];
                if lo >= hi {
                    continue;
                }
                let right_sum = total - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / i as f64)
                    + (right_sq - right_sum * right_sum / (n - i) as f64);
                let gain = parent_sse - sse;
                if gain > MIN_GAIN && best.as_ref().is_none_or(|b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: 0.5 * (lo + hi),
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Leaf value for bagged classification trees: the mean target.
pub fn mean_leaf(target: &[f64]) -> impl Fn(&[usize]) -> f64 + '_ {
    move |rows: &[usize]| {
        if rows.is_empty() {
            return 0.0;
        }
        rows.iter().map(|&r| target[r]).sum::<f64>() / rows.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn single_split_separates_a_step_function() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [10.0], [11.0], [12.0], [13.0]];
        let y = [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let mut rng = StdRng::seed_from_u64(0);
        let params = TreeParams {
            max_depth: 3,
            min_leaf: 1,
            max_features: None,
        };
        let tree = RegressionTree::fit(x.view(), &y, (0..8).collect(), params, &mut rng, &mean_leaf(&y));
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.predict_row(array![2.5].view()), 0.0);
        assert_eq!(tree.predict_row(array![12.5].view()), 1.0);
        assert_eq!(tree.predict_row(array![6.5].view()), 0.0);
        assert_eq!(tree.predict_row(array![7.0].view()), 1.0);
    }

    #[test]
    fn depth_zero_is_a_single_leaf() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = [0.0, 1.0, 0.0, 1.0];
        let mut rng = StdRng::seed_from_u64(0);
        let params = TreeParams {
            max_depth: 0,
            min_leaf: 1,
            max_features: None,
        };
        let tree = RegressionTree::fit(x.view(), &y, (0..4).collect(), params, &mut rng, &mean_leaf(&y));
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.predict_row(array![1.0].view()), 0.5);
    }

    #[test]
    fn min_leaf_blocks_small_children() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
        let y = [1.0, 0.0, 0.0, 0.0, 0.0];
        let mut rng = StdRng::seed_from_u64(0);
        let params = TreeParams {
            max_depth: 5,
            min_leaf: 2,
            max_features: None,
        };
        let tree = RegressionTree::fit(x.view(), &y, (0..5).collect(), params, &mut rng, &mean_leaf(&y));
        // the lone positive cannot be isolated
        assert!(tree.predict_row(array![0.0].view()) < 1.0);
    }
}
