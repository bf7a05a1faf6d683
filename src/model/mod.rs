//! The three classifier configurations compared by the model selector.
//!
//! Each configuration is a parameter struct implementing linfa's [`Fit`] over a
//! [`PairDatasetBase`] with 0/1 targets. The fitted models share the
//! [`FittedClassifier`] wrapper, which serializes into the artifact bundle and
//! predicts positive-class probabilities through linfa's `PredictInplace`.

mod boosting;
mod forest;
mod logistic;
mod tree;

pub use boosting::{FittedBoosting, GradientBoostingParams};
pub use forest::{FittedForest, RandomForestParams};
pub use logistic::{FittedLogistic, LogisticRegressionParams};
pub use tree::{DecisionTree, TreeNode};

use linfa::traits::{Fit, PredictInplace};
use linfa::DatasetBase;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::ModelsConfig;

pub type PairDatasetBase = DatasetBase<Array2<f64>, Array1<usize>>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("training set is empty")]
    EmptyDataset,

    #[error("training set holds a single class")]
    SingleClass,

    #[error("did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("expected {expected} features, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error(transparent)]
    Linfa(#[from] linfa::error::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    LogisticRegression,
    RandomForest,
    GradientBoosting,
}

impl ClassifierKind {
    pub fn display_name(self) -> &'static str {
        match self {
            ClassifierKind::LogisticRegression => "Logistic Regression",
            ClassifierKind::RandomForest => "Random Forest",
            ClassifierKind::GradientBoosting => "Gradient Boosting",
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One classifier configuration, ready to be fitted.
#[derive(Debug, Clone)]
pub enum ClassifierParams {
    Logistic(LogisticRegressionParams),
    Forest(RandomForestParams),
    Boosting(GradientBoostingParams),
}

impl ClassifierParams {
    /// The three configurations in their evaluation order.
    pub fn candidates(cfg: &ModelsConfig) -> Vec<ClassifierParams> {
        vec![
            ClassifierParams::Logistic(LogisticRegressionParams::from(&cfg.logistic)),
            ClassifierParams::Forest(RandomForestParams::from(&cfg.forest)),
            ClassifierParams::Boosting(GradientBoostingParams::from(&cfg.boosting)),
        ]
    }

    pub fn kind(&self) -> ClassifierKind {
        match self {
            ClassifierParams::Logistic(_) => ClassifierKind::LogisticRegression,
            ClassifierParams::Forest(_) => ClassifierKind::RandomForest,
            ClassifierParams::Boosting(_) => ClassifierKind::GradientBoosting,
        }
    }

    pub fn fit(&self, dataset: &PairDatasetBase) -> Result<FittedClassifier, ModelError> {
        Ok(match self {
            ClassifierParams::Logistic(p) => FittedClassifier::LogisticRegression(p.fit(dataset)?),
            ClassifierParams::Forest(p) => FittedClassifier::RandomForest(p.fit(dataset)?),
            ClassifierParams::Boosting(p) => FittedClassifier::GradientBoosting(p.fit(dataset)?),
        })
    }
}

/// A fitted model of any of the three kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedClassifier {
    LogisticRegression(FittedLogistic),
    RandomForest(FittedForest),
    GradientBoosting(FittedBoosting),
}

impl FittedClassifier {
    pub fn kind(&self) -> ClassifierKind {
        match self {
            FittedClassifier::LogisticRegression(_) => ClassifierKind::LogisticRegression,
            FittedClassifier::RandomForest(_) => ClassifierKind::RandomForest,
            FittedClassifier::GradientBoosting(_) => ClassifierKind::GradientBoosting,
        }
    }

    pub fn n_features(&self) -> usize {
        match self {
            FittedClassifier::LogisticRegression(m) => m.coefficients.len(),
            FittedClassifier::RandomForest(m) => m.n_features,
            FittedClassifier::GradientBoosting(m) => m.n_features,
        }
    }

    /// Probability of the positive (overtake) class for every row.
    pub fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64> {
        match self {
            FittedClassifier::LogisticRegression(m) => m.predict_proba(records),
            FittedClassifier::RandomForest(m) => m.predict_proba(records),
            FittedClassifier::GradientBoosting(m) => m.predict_proba(records),
        }
    }

    /// Normalised to sum to 1 (all zeros if the model never used a feature).
    pub fn feature_importances(&self) -> Vec<f64> {
        let raw = match self {
            FittedClassifier::LogisticRegression(m) => m.coefficients.iter().map(|c| c.abs()).collect(),
            FittedClassifier::RandomForest(m) => m.importances.clone(),
            FittedClassifier::GradientBoosting(m) => m.importances.clone(),
        };
        normalise(raw)
    }

    pub fn check_width(&self, width: usize) -> Result<(), ModelError> {
        match self.n_features() {
            expected if expected == width => Ok(()),
            expected => Err(ModelError::ShapeMismatch {
                expected,
                actual: width,
            }),
        }
    }

    /// Structural checks for a model read back from disk.
    pub fn validate(&self) -> Result<(), ModelError> {
        let trees: &[DecisionTree] = match self {
            FittedClassifier::LogisticRegression(m) => {
                if m.coefficients.iter().chain([&m.intercept]).all(|v| v.is_finite()) {
                    return Ok(());
                }
                return Err(ModelError::Numerical("non-finite coefficient".into()));
            }
            FittedClassifier::RandomForest(m) => &m.trees,
            FittedClassifier::GradientBoosting(m) => &m.trees,
        };
        if trees.is_empty() {
            return Err(ModelError::Numerical("ensemble holds no trees".into()));
        }
        let width = self.n_features();
        match trees.iter().find(|t| !t.is_well_formed(width)) {
            Some(_) => Err(ModelError::Numerical("malformed tree".into())),
            None => Ok(()),
        }
    }
}

impl PredictInplace<Array2<f64>, Array1<f64>> for FittedClassifier {
    fn predict_inplace<'a>(&'a self, x: &'a Array2<f64>, y: &mut Array1<f64>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        y.assign(&self.predict_proba(x));
    }

    fn default_target(&self, x: &Array2<f64>) -> Array1<f64> {
        Array1::zeros(x.nrows())
    }
}

fn normalise(values: Vec<f64>) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.into_iter().map(|v| v / total).collect()
    } else {
        values
    }
}

/// Positive and negative row counts, rejecting sets no classifier can learn from.
pub(crate) fn class_counts(dataset: &PairDatasetBase) -> Result<(usize, usize), ModelError> {
    let targets = dataset.targets();
    if targets.is_empty() {
        return Err(ModelError::EmptyDataset);
    }
    let positives = targets.iter().filter(|&&t| t == 1).count();
    let negatives = targets.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(ModelError::SingleClass);
    }
    Ok((positives, negatives))
}

/// `n / (2 * n_class)` per class, indexed by label.
pub(crate) fn balanced_class_weights(positives: usize, negatives: usize) -> [f64; 2] {
    let n = (positives + negatives) as f64;
    [n / (2.0 * negatives as f64), n / (2.0 * positives as f64)]
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
