use linfa::traits::Fit;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tree::{DecisionTree, GrowParams, NodeStats, SplitCriterion, TreeGrower};
use super::{balanced_class_weights, class_counts, ModelError, PairDatasetBase};
use crate::config::ForestConfig;

/// Bagged decision trees with balanced class weights.
#[derive(Debug, Clone)]
pub struct RandomForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl From<&ForestConfig> for RandomForestParams {
    fn from(cfg: &ForestConfig) -> Self {
        Self {
            n_estimators: cfg.n_estimators,
            max_depth: cfg.max_depth,
            min_samples_split: cfg.min_samples_split,
            seed: cfg.seed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedForest {
    pub trees: Vec<DecisionTree>,
    pub n_features: usize,
    pub importances: Vec<f64>,
}

impl FittedForest {
    /// Mean of the per-tree weighted positive fractions.
    pub fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64> {
        let n_trees = self.trees.len().max(1) as f64;
        records
            .axis_iter(Axis(0))
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect()
    }
}

/// Weighted Gini impurity over `[negative mass, positive mass]`.
struct WeightedGini<'a> {
    targets: &'a Array1<usize>,
    class_weight: [f64; 2],
}

impl SplitCriterion for WeightedGini<'_> {
    fn sample_stats(&self, sample: usize) -> NodeStats {
        match self.targets[sample] {
            0 => [self.class_weight[0], 0.0],
            _ => [0.0, self.class_weight[1]],
        }
    }

    fn leaf_value(&self, stats: NodeStats) -> f64 {
        let total = stats[0] + stats[1];
        if total > 0.0 {
            stats[1] / total
        } else {
            0.0
        }
    }

    // -W * gini = sum(w_c^2) / W - W
    fn score(&self, stats: NodeStats) -> f64 {
        let total = stats[0] + stats[1];
        if total > 0.0 {
            (stats[0] * stats[0] + stats[1] * stats[1]) / total - total
        } else {
            0.0
        }
    }

    fn worth_splitting(&self, stats: NodeStats) -> bool {
        stats[0] > 0.0 && stats[1] > 0.0
    }

    fn child_allowed(&self, stats: NodeStats) -> bool {
        stats[0] + stats[1] > 0.0
    }
}

impl Fit<Array2<f64>, Array1<usize>, ModelError> for RandomForestParams {
    type Object = FittedForest;

    fn fit(&self, dataset: &PairDatasetBase) -> Result<Self::Object, ModelError> {
        let (positives, negatives) = class_counts(dataset)?;
        let records = dataset.records();
        let (n, p) = records.dim();

        let criterion = WeightedGini {
            targets: dataset.targets(),
            class_weight: balanced_class_weights(positives, negatives),
        };
        let grow = GrowParams {
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            max_features: Some(((p as f64).sqrt() as usize).max(1)),
        };

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut importances = vec![0.0; p];
        let mut trees = Vec::with_capacity(self.n_estimators);
        for _ in 0..self.n_estimators.max(1) {
            let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let (tree, gains) = TreeGrower::new(records, &criterion, &grow).grow(bootstrap, &mut rng);
            for (total, g) in importances.iter_mut().zip(gains) {
                *total += g;
            }
            trees.push(tree);
        }

        debug!(
            trees = trees.len(),
            max_depth = trees.iter().map(DecisionTree::depth).max().unwrap_or(0),
            "random forest fitted"
        );
        Ok(FittedForest {
            trees,
            n_features: p,
            importances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::separable_dataset;

    fn params(n_estimators: usize) -> RandomForestParams {
        RandomForestParams {
            n_estimators,
            ..RandomForestParams::from(&ForestConfig::default())
        }
    }

    #[test]
    fn same_seed_same_forest() {
        let ds = separable_dataset(40);
        let a = params(5).fit(&ds).unwrap();
        let b = params(5).fit(&ds).unwrap();
        assert_eq!(a.trees, b.trees);
    }

    #[test]
    fn probabilities_are_tree_averages() {
        let ds = separable_dataset(40);
        let forest = params(7).fit(&ds).unwrap();
        let probs = forest.predict_proba(ds.records());
        // every tree leaf value is a fraction, so the mean is too
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(forest.trees.len(), 7);
    }

    #[test]
    fn depth_cap_is_respected() {
        let ds = separable_dataset(60);
        let mut p = params(5);
        p.max_depth = Some(2);
        let forest = p.fit(&ds).unwrap();
        assert!(forest.trees.iter().all(|t| t.depth() <= 2));
    }
}
