use serde::{Deserialize, Serialize};

use crate::error::{OvertakeError, Result};

/// Binary confusion counts; the positive class is "overtake".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(truth: &[usize], predicted: &[usize]) -> Self {
        let mut cm = ConfusionMatrix::default();
        for (&t, &p) in truth.iter().zip(predicted) {
            match (t == 1, p == 1) {
                (false, false) => cm.true_negative += 1,
                (false, true) => cm.false_positive += 1,
                (true, false) => cm.false_negative += 1,
                (true, true) => cm.true_positive += 1,
            }
        }
        cm
    }

    pub fn total(&self) -> usize {
        self.true_negative + self.false_positive + self.false_negative + self.true_positive
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positive + self.true_negative, self.total())
    }

    // zero when nothing was predicted positive
    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Area under the ROC curve via the rank-sum statistic, with tied scores sharing
/// their average rank. Undefined unless both classes are present.
pub fn roc_auc(truth: &[usize], scores: &[f64]) -> Result<f64> {
    let positives = truth.iter().filter(|&&t| t == 1).count();
    let negatives = truth.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(OvertakeError::InsufficientData(
            "ROC-AUC is undefined for a single-class test split".into(),
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; the tie group i..=j shares the mean rank
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        positive_rank_sum += order[i..=j].iter().filter(|&&k| truth[k] == 1).count() as f64 * mean_rank;
        i = j + 1;
    }

    let p = positives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

/// Everything reported for one evaluated model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub roc_auc: f64,
    pub confusion_matrix: ConfusionMatrix,
}

/// Scores probabilities against 0/1 truth at `threshold`.
pub fn evaluate(truth: &[usize], probabilities: &[f64], threshold: f64) -> Result<ModelMetrics> {
    let predicted: Vec<usize> = probabilities.iter().map(|&p| usize::from(p >= threshold)).collect();
    let cm = ConfusionMatrix::from_predictions(truth, &predicted);
    Ok(ModelMetrics {
        accuracy: cm.accuracy(),
        precision: cm.precision(),
        recall: cm.recall(),
        f1: cm.f1(),
        roc_auc: roc_auc(truth, probabilities)?,
        confusion_matrix: cm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confusion_counts_and_rates() {
        let truth = [1, 1, 1, 0, 0, 0, 0, 0];
        let pred = [1, 1, 0, 1, 0, 0, 0, 0];
        let cm = ConfusionMatrix::from_predictions(&truth, &pred);
        assert_eq!(
            cm,
            ConfusionMatrix {
                true_negative: 4,
                false_positive: 1,
                false_negative: 1,
                true_positive: 2
            }
        );
        assert!((cm.accuracy() - 0.75).abs() < 1e-12);
        assert!((cm.precision() - 2.0 / 3.0).abs() < 1e-12);
        assert!((cm.recall() - 2.0 / 3.0).abs() < 1e-12);
        assert!((cm.f1() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn no_positive_predictions_score_zero_not_nan() {
        let cm = ConfusionMatrix::from_predictions(&[1, 0, 0], &[0, 0, 0]);
        assert_eq!(cm.precision(), 0.0);
        assert_eq!(cm.f1(), 0.0);
    }

    #[test]
    fn auc_extremes_and_ties() {
        let truth = [0, 0, 1, 1];
        assert!((roc_auc(&truth, &[0.1, 0.2, 0.8, 0.9]).unwrap() - 1.0).abs() < 1e-12);
        assert!(roc_auc(&truth, &[0.9, 0.8, 0.2, 0.1]).unwrap().abs() < 1e-12);
        assert!((roc_auc(&truth, &[0.5, 0.5, 0.5, 0.5]).unwrap() - 0.5).abs() < 1e-12);
        // one discordant pair out of four
        assert!((roc_auc(&truth, &[0.1, 0.6, 0.5, 0.9]).unwrap() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn auc_undefined_for_single_class() {
        assert!(roc_auc(&[0, 0, 0], &[0.1, 0.2, 0.3]).is_err());
        assert!(evaluate(&[1, 1], &[0.4, 0.6], 0.5).is_err());
    }
}
