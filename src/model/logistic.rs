use linfa::traits::Fit;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{balanced_class_weights, class_counts, sigmoid, ModelError, PairDatasetBase};
use crate::config::LogisticConfig;

/// L2-penalised logistic regression with balanced class weights.
#[derive(Debug, Clone)]
pub struct LogisticRegressionParams {
    pub c: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl From<&LogisticConfig> for LogisticRegressionParams {
    fn from(cfg: &LogisticConfig) -> Self {
        Self {
            c: cfg.c,
            max_iter: cfg.max_iter,
            tolerance: cfg.tolerance,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedLogistic {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub iterations: usize,
}

impl FittedLogistic {
    pub fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64> {
        let w = Array1::from(self.coefficients.clone());
        records.dot(&w).mapv(|z| sigmoid(z + self.intercept))
    }
}

impl Fit<Array2<f64>, Array1<usize>, ModelError> for LogisticRegressionParams {
    type Object = FittedLogistic;

    // Newton iterations on the penalised, class-weighted log-loss. The intercept
    // is the last coordinate and is not penalised.
    fn fit(&self, dataset: &PairDatasetBase) -> Result<Self::Object, ModelError> {
        let (positives, negatives) = class_counts(dataset)?;
        let class_weight = balanced_class_weights(positives, negatives);

        let x = dataset.records();
        let (n, p) = x.dim();
        let d = p + 1;

        let mut design = Array2::<f64>::ones((n, d));
        design.slice_mut(ndarray::s![.., ..p]).assign(x);
        let y: Array1<f64> = dataset.targets().mapv(|t| t as f64);
        let sample_weight: Array1<f64> = dataset.targets().mapv(|t| class_weight[t.min(1)]);

        let mut beta = Array1::<f64>::zeros(d);
        for iteration in 1..=self.max_iter {
            let prob = design.dot(&beta).mapv(sigmoid);

            let residual = (&prob - &y) * &sample_weight * self.c;
            let mut gradient = design.t().dot(&residual);
            let curvature = (&prob * &prob.mapv(|q| 1.0 - q)) * &sample_weight * self.c;
            let weighted = &design * &curvature.insert_axis(Axis(1));
            let mut hessian = design.t().dot(&weighted);
            for j in 0..p {
                gradient[j] += beta[j];
                hessian[(j, j)] += 1.0;
            }
            hessian[(p, p)] += 1e-10;

            let h = DMatrix::from_fn(d, d, |r, c| hessian[(r, c)]);
            let g = DVector::from_iterator(d, gradient.iter().copied());
            let step = h
                .cholesky()
                .ok_or_else(|| ModelError::Numerical("Hessian is not positive definite".into()))?
                .solve(&g);

            let mut largest = 0.0_f64;
            for j in 0..d {
                beta[j] -= step[j];
                largest = largest.max(step[j].abs());
            }
            if !largest.is_finite() {
                return Err(ModelError::Numerical("Newton step diverged".into()));
            }
            if largest < self.tolerance {
                debug!(iteration, "logistic regression converged");
                return Ok(FittedLogistic {
                    coefficients: beta.iter().take(p).copied().collect(),
                    intercept: beta[p],
                    iterations: iteration,
                });
            }
        }

        Err(ModelError::NotConverged {
            iterations: self.max_iter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::separable_dataset;
    use linfa::Dataset;

    fn params() -> LogisticRegressionParams {
        LogisticRegressionParams::from(&LogisticConfig::default())
    }

    #[test]
    fn converges_quickly_on_separable_data() {
        let fitted = params().fit(&separable_dataset(60)).unwrap();
        assert!(fitted.iterations < 30);
        // positives sit at low x0
        assert!(fitted.coefficients[0] < 0.0);
    }

    #[test]
    fn balanced_weights_centre_an_uninformative_model() {
        // one useless constant feature, 1 positive per 4 rows
        let x = Array2::<f64>::zeros((40, 1));
        let y: Array1<usize> = (0..40).map(|i| usize::from(i % 4 == 0)).collect();
        let fitted = params().fit(&Dataset::new(x.clone(), y)).unwrap();
        let probs = fitted.predict_proba(&x);
        assert!(probs.iter().all(|p| (p - 0.5).abs() < 1e-6));
    }

    #[test]
    fn iteration_budget_exhaustion_is_reported() {
        let mut p = params();
        p.max_iter = 1;
        let err = p.fit(&separable_dataset(60)).unwrap_err();
        assert!(matches!(err, ModelError::NotConverged { iterations: 1 }));
    }
}
