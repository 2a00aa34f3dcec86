//! A single randomized isolation tree.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Euler–Mascheroni constant.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful search in a binary search tree of
/// `n` nodes: `2·H(n−1) − 2(n−1)/n`, and 0 for `n <= 1`.
pub fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let m = (n - 1) as f64;
    2.0 * harmonic(n - 1) - 2.0 * m / n as f64
}

/// Exact harmonic number for small `n`, asymptotic expansion above.
fn harmonic(n: usize) -> f64 {
    if n <= 4096 {
        (1..=n).map(|i| 1.0 / i as f64).sum()
    } else {
        let x = n as f64;
        x.ln() + EULER_GAMMA + 1.0 / (2.0 * x) - 1.0 / (12.0 * x * x)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    /// Grow a tree over `sample` (indices into `data`) up to `max_depth`.
    pub fn grow<R: Rng>(data: &[Vec<f64>], sample: Vec<usize>, max_depth: usize, rng: &mut R) -> Self {
        Self {
            root: grow_node(data, sample, 0, max_depth, rng),
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Highest feature index any split in the tree reads, if it has splits.
    pub fn max_split_feature(&self) -> Option<usize> {
        let mut max = None;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if let Node::Split {
                feature, left, right, ..
            } = node
            {
                max = max.max(Some(*feature));
                stack.push(left);
                stack.push(right);
            }
        }
        max
    }

    /// Depth at which `x` lands, plus the expected remaining depth for the
    /// samples sharing its leaf.
    pub fn path_length(&self, x: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                Node::Leaf { size } => return depth as f64 + average_path_length(*size),
                Node::Split {
                    feature,
                    value,
                    left,
                    right,
                } => {
                    node = if x[*feature] < *value { left } else { right };
                    depth += 1;
                }
            }
        }
    }
}

fn grow_node<R: Rng>(
    data: &[Vec<f64>],
    sample: Vec<usize>,
    depth: usize,
    max_depth: usize,
    rng: &mut R,
) -> Node {
    if depth >= max_depth || sample.len() <= 1 {
        return Node::Leaf { size: sample.len() };
    }

    // Only features that still vary inside this node can separate anything.
    let n_features = data[sample[0]].len();
    let mut candidates = Vec::with_capacity(n_features);
    for f in 0..n_features {
        let (lo, hi) = sample.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
            (lo.min(data[i][f]), hi.max(data[i][f]))
        });
        if hi > lo {
            candidates.push((f, lo, hi));
        }
    }
    if candidates.is_empty() {
        return Node::Leaf { size: sample.len() };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    let value = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) =
        sample.into_iter().partition(|&i| data[i][feature] < value);

    Node::Split {
        feature,
        value,
        left: Box::new(grow_node(data, left, depth + 1, max_depth, rng)),
        right: Box::new(grow_node(data, right, depth + 1, max_depth, rng)),
    }
}
