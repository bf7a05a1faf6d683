use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Arena node; children always sit at larger indices than their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    /// True when every path terminates in a leaf and only reads features below `width`.
    pub fn is_well_formed(&self, width: usize) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().enumerate().all(|(i, node)| match node {
                TreeNode::Leaf { value } => value.is_finite(),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    *feature < width
                        && threshold.is_finite()
                        && *left > i
                        && *right > i
                        && *left < self.nodes.len()
                        && *right < self.nodes.len()
                }
            })
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match &nodes[idx] {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }
}

/// Node statistics are two additive sums per sample: weighted class mass
/// `[negative, positive]` for classification, `[gradient, hessian]` for boosting.
pub(crate) type NodeStats = [f64; 2];

pub(crate) trait SplitCriterion {
    fn sample_stats(&self, sample: usize) -> NodeStats;

    fn leaf_value(&self, stats: NodeStats) -> f64;

    /// Node quality; a split's gain is `score(left) + score(right) - score(parent)`.
    fn score(&self, stats: NodeStats) -> f64;

    fn worth_splitting(&self, stats: NodeStats) -> bool;

    fn child_allowed(&self, stats: NodeStats) -> bool;
}

#[derive(Debug, Clone)]
pub(crate) struct GrowParams {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    /// Features considered per split; `None` considers all of them.
    pub max_features: Option<usize>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

/// Greedy exact-split grower shared by the forest and the boosted ensemble.
pub(crate) struct TreeGrower<'a, C: SplitCriterion> {
    records: &'a Array2<f64>,
    criterion: &'a C,
    params: &'a GrowParams,
    nodes: Vec<TreeNode>,
    /// Total gain credited to each feature.
    pub importances: Vec<f64>,
}

impl<'a, C: SplitCriterion> TreeGrower<'a, C> {
    pub fn new(records: &'a Array2<f64>, criterion: &'a C, params: &'a GrowParams) -> Self {
        Self {
            records,
            criterion,
            params,
            nodes: Vec::new(),
            importances: vec![0.0; records.ncols()],
        }
    }

    /// Grow one tree over `samples` (indices may repeat, as in a bootstrap draw).
    pub fn grow(mut self, samples: Vec<usize>, rng: &mut StdRng) -> (DecisionTree, Vec<f64>) {
        self.build(samples, 0, rng);
        (DecisionTree { nodes: self.nodes }, self.importances)
    }

    fn build(&mut self, samples: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let stats = self.sum_stats(&samples);
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::Leaf {
            value: self.criterion.leaf_value(stats),
        });

        let depth_left = self.params.max_depth.map_or(true, |d| depth < d);
        if !depth_left
            || samples.len() < self.params.min_samples_split.max(2)
            || !self.criterion.worth_splitting(stats)
        {
            return idx;
        }

        let Some(best) = self.best_split(&samples, stats, rng) else {
            return idx;
        };

        self.importances[best.feature] += best.gain;
        let left = self.build(best.left, depth + 1, rng);
        let right = self.build(best.right, depth + 1, rng);
        self.nodes[idx] = TreeNode::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        idx
    }

    fn sum_stats(&self, samples: &[usize]) -> NodeStats {
        samples.iter().fold([0.0, 0.0], |acc, &s| {
            let st = self.criterion.sample_stats(s);
            [acc[0] + st[0], acc[1] + st[1]]
        })
    }

    fn candidate_features(&self, rng: &mut StdRng) -> Vec<usize> {
        let p = self.records.ncols();
        let mut features: Vec<usize> = (0..p).collect();
        match self.params.max_features {
            Some(k) if k < p => {
                features.shuffle(rng);
                features.truncate(k.max(1));
                features
            }
            _ => features,
        }
    }

    fn best_split(&self, samples: &[usize], parent: NodeStats, rng: &mut StdRng) -> Option<BestSplit> {
        let parent_score = self.criterion.score(parent);
        let mut best: Option<(usize, f64, f64)> = None;

        for feature in self.candidate_features(rng) {
            let mut ordered: Vec<(f64, usize)> = samples
                .iter()
                .map(|&s| (self.records[(s, feature)], s))
                .collect();
            ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left = [0.0, 0.0];
            for i in 0..ordered.len() - 1 {
                let st = self.criterion.sample_stats(ordered[i].1);
                left = [left[0] + st[0], left[1] + st[1]];
                let (value, next) = (ordered[i].0, ordered[i + 1].0);
                if value == next {
                    continue;
                }
                let right = [parent[0] - left[0], parent[1] - left[1]];
                if !self.criterion.child_allowed(left) || !self.criterion.child_allowed(right) {
                    continue;
                }
                let gain = self.criterion.score(left) + self.criterion.score(right) - parent_score;
                if gain > best.map_or(1e-12, |b| b.2 + 1e-12) {
                    best = Some((feature, value + (next - value) / 2.0, gain));
                }
            }
        }

        let (feature, threshold, gain) = best?;
        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&s| self.records[(s, feature)] <= threshold);
        Some(BestSplit {
            feature,
            threshold,
            gain,
            left,
            right,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Plain unweighted Gini over 0/1 labels.
    struct Gini(Vec<usize>);

    impl SplitCriterion for Gini {
        fn sample_stats(&self, sample: usize) -> NodeStats {
            if self.0[sample] == 1 {
                [0.0, 1.0]
            } else {
                [1.0, 0.0]
            }
        }

        fn leaf_value(&self, s: NodeStats) -> f64 {
            s[1] / (s[0] + s[1])
        }

        fn score(&self, s: NodeStats) -> f64 {
            let w = s[0] + s[1];
            (s[0] * s[0] + s[1] * s[1]) / w - w
        }

        fn worth_splitting(&self, s: NodeStats) -> bool {
            s[0] > 0.0 && s[1] > 0.0
        }

        fn child_allowed(&self, s: NodeStats) -> bool {
            s[0] + s[1] > 0.0
        }
    }

    #[test]
    fn threshold_falls_between_classes() {
        let x = ndarray::array![[1.0], [2.0], [3.0], [10.0], [11.0]];
        let criterion = Gini(vec![0, 0, 0, 1, 1]);
        let params = GrowParams {
            max_depth: None,
            min_samples_split: 2,
            max_features: None,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (tree, importances) = TreeGrower::new(&x, &criterion, &params).grow((0..5).collect(), &mut rng);

        assert_eq!(tree.depth(), 1);
        assert!(matches!(tree.nodes[0], TreeNode::Split { threshold, .. } if threshold == 6.5));
        assert_eq!(tree.predict_row(ndarray::array![2.5].view()), 0.0);
        assert_eq!(tree.predict_row(ndarray::array![9.0].view()), 1.0);
        assert!(importances[0] > 0.0);
        assert!(tree.is_well_formed(1));
        assert!(!tree.is_well_formed(0));
    }

    #[test]
    fn depth_limit_yields_mixed_leaf() {
        let x = ndarray::array![[1.0], [2.0], [3.0], [4.0]];
        let criterion = Gini(vec![0, 1, 0, 1]);
        let params = GrowParams {
            max_depth: Some(0),
            min_samples_split: 2,
            max_features: None,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (tree, _) = TreeGrower::new(&x, &criterion, &params).grow((0..4).collect(), &mut rng);
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.predict_row(ndarray::array![3.0].view()), 0.5);
    }

    #[test]
    fn constant_feature_cannot_split() {
        let x = ndarray::array![[1.0], [1.0], [1.0]];
        let criterion = Gini(vec![0, 1, 0]);
        let params = GrowParams {
            max_depth: None,
            min_samples_split: 2,
            max_features: None,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (tree, _) = TreeGrower::new(&x, &criterion, &params).grow(vec![0, 1, 2], &mut rng);
        assert_eq!(tree.nodes.len(), 1);
    }

    #[test]
    fn backward_child_index_is_malformed() {
        let tree = DecisionTree {
            nodes: vec![
                TreeNode::Leaf { value: 0.0 },
                TreeNode::Split {
                    feature: 0,
                    threshold: 0.0,
                    left: 0,
                    right: 0,
                },
            ],
        };
        assert!(!tree.is_well_formed(1));
    }
}
