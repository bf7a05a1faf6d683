use linfa::traits::Fit;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tree::{DecisionTree, GrowParams, NodeStats, SplitCriterion, TreeGrower};
use super::{class_counts, sigmoid, ModelError, PairDatasetBase};
use crate::config::BoostingConfig;

/// Second-order gradient boosted trees on the log-loss.
#[derive(Debug, Clone)]
pub struct GradientBoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub lambda: f64,
    pub min_child_weight: f64,
}

impl From<&BoostingConfig> for GradientBoostingParams {
    fn from(cfg: &BoostingConfig) -> Self {
        Self {
            n_estimators: cfg.n_estimators,
            learning_rate: cfg.learning_rate,
            max_depth: cfg.max_depth,
            lambda: cfg.lambda,
            min_child_weight: cfg.min_child_weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedBoosting {
    pub base_margin: f64,
    pub learning_rate: f64,
    pub trees: Vec<DecisionTree>,
    pub n_features: usize,
    pub importances: Vec<f64>,
}

impl FittedBoosting {
    pub fn margin(&self, row: ndarray::ArrayView1<f64>) -> f64 {
        self.base_margin
            + self.learning_rate * self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }

    pub fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64> {
        records
            .axis_iter(Axis(0))
            .map(|row| sigmoid(self.margin(row)))
            .collect()
    }
}

/// `[sum of gradients, sum of hessians]` with an L2 penalty on leaf weights.
struct NewtonGain<'a> {
    gradient: &'a [f64],
    hessian: &'a [f64],
    lambda: f64,
    min_child_weight: f64,
}

impl SplitCriterion for NewtonGain<'_> {
    fn sample_stats(&self, sample: usize) -> NodeStats {
        [self.gradient[sample], self.hessian[sample]]
    }

    fn leaf_value(&self, stats: NodeStats) -> f64 {
        -stats[0] / (stats[1] + self.lambda)
    }

    fn score(&self, stats: NodeStats) -> f64 {
        stats[0] * stats[0] / (stats[1] + self.lambda)
    }

    fn worth_splitting(&self, stats: NodeStats) -> bool {
        stats[1] >= 2.0 * self.min_child_weight
    }

    fn child_allowed(&self, stats: NodeStats) -> bool {
        stats[1] >= self.min_child_weight
    }
}

impl Fit<Array2<f64>, Array1<usize>, ModelError> for GradientBoostingParams {
    type Object = FittedBoosting;

    fn fit(&self, dataset: &PairDatasetBase) -> Result<Self::Object, ModelError> {
        class_counts(dataset)?;
        let records = dataset.records();
        let (n, p) = records.dim();
        let labels: Vec<f64> = dataset.targets().iter().map(|&t| t as f64).collect();

        let grow = GrowParams {
            max_depth: Some(self.max_depth),
            min_samples_split: 2,
            max_features: None,
        };
        // every feature is considered at every split, so the generator is never drawn from
        let mut rng = StdRng::seed_from_u64(0);

        let base_margin = 0.0;
        let mut margins = vec![base_margin; n];
        let mut importances = vec![0.0; p];
        let mut trees = Vec::with_capacity(self.n_estimators);

        for round in 0..self.n_estimators {
            let prob: Vec<f64> = margins.iter().map(|&m| sigmoid(m)).collect();
            let gradient: Vec<f64> = prob.iter().zip(&labels).map(|(p, y)| p - y).collect();
            let hessian: Vec<f64> = prob.iter().map(|p| (p * (1.0 - p)).max(1e-16)).collect();

            let criterion = NewtonGain {
                gradient: &gradient,
                hessian: &hessian,
                lambda: self.lambda,
                min_child_weight: self.min_child_weight,
            };
            let (tree, gains) = TreeGrower::new(records, &criterion, &grow).grow((0..n).collect(), &mut rng);

            for (margin, row) in margins.iter_mut().zip(records.axis_iter(Axis(0))) {
                *margin += self.learning_rate * tree.predict_row(row);
            }
            for (total, g) in importances.iter_mut().zip(gains) {
                *total += g;
            }
            trees.push(tree);

            if margins.iter().any(|m| !m.is_finite()) {
                return Err(ModelError::Numerical(format!("margin diverged in round {round}")));
            }
        }

        debug!(rounds = trees.len(), "gradient boosting fitted");
        Ok(FittedBoosting {
            base_margin,
            learning_rate: self.learning_rate,
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

    fn log_loss(model: &FittedBoosting, ds: &PairDatasetBase) -> f64 {
        let probs = model.predict_proba(ds.records());
        probs
            .iter()
            .zip(ds.targets())
            .map(|(&p, &y)| {
                let p = p.clamp(1e-12, 1.0 - 1e-12);
                if y == 1 {
                    -p.ln()
                } else {
                    -(1.0 - p).ln()
                }
            })
            .sum::<f64>()
            / probs.len() as f64
    }

    #[test]
    fn more_rounds_lower_training_loss() {
        let ds = separable_dataset(60);
        let base = GradientBoostingParams::from(&BoostingConfig::default());
        let short = GradientBoostingParams { n_estimators: 2, ..base.clone() }.fit(&ds).unwrap();
        let long = GradientBoostingParams { n_estimators: 20, ..base }.fit(&ds).unwrap();
        assert!(log_loss(&long, &ds) < log_loss(&short, &ds));
        assert!(log_loss(&short, &ds) < 2f64.ln());
    }

    #[test]
    fn leaf_weight_is_newton_step() {
        let criterion = NewtonGain {
            gradient: &[0.5, 0.5],
            hessian: &[0.25, 0.25],
            lambda: 1.0,
            min_child_weight: 1.0,
        };
        let stats = [1.0, 0.5];
        assert!((criterion.leaf_value(stats) + 1.0 / 1.5).abs() < 1e-12);
        assert!(!criterion.worth_splitting(stats));
    }
}
