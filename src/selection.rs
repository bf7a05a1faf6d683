use linfa::traits::Predict;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{info, warn};

use crate::artifact::{ArtifactMetadata, FeatureSpec, RowCounts, TrainingArtifact};
use crate::config::{CompoundRanks, ModelsConfig};
use crate::error::{OvertakeError, Result};
use crate::metrics::{evaluate, ModelMetrics};
use crate::model::{ClassifierKind, ClassifierParams, FittedClassifier};
use crate::preprocess::{OversamplingOutcome, PreparedData};

/// A condition that weakened the run without stopping it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum DegradedCondition {
    MalformedLapsSkipped { count: usize },
    OversamplingSkipped { minority_rows: usize, majority: usize },
    ModelFailed { model: ClassifierKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Evaluated {
        metrics: ModelMetrics,
        feature_importances: Vec<FeatureImportance>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub model: ClassifierKind,
    pub outcome: CandidateOutcome,
}

impl CandidateReport {
    pub fn metrics(&self) -> Option<&ModelMetrics> {
        match &self.outcome {
            CandidateOutcome::Evaluated { metrics, .. } => Some(metrics),
            CandidateOutcome::Failed { .. } => None,
        }
    }
}

/// Every configuration's result plus the winner; the read-only report interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub chosen: ClassifierKind,
    pub threshold: f64,
    pub candidates: Vec<CandidateReport>,
    pub degraded: Vec<DegradedCondition>,
}

impl SelectionReport {
    pub fn chosen_metrics(&self) -> Option<&ModelMetrics> {
        self.candidates
            .iter()
            .find(|c| c.model == self.chosen)
            .and_then(CandidateReport::metrics)
    }

    /// Plain-text metric table, one line per configuration.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:22} {:>8} {:>9} {:>8} {:>8} {:>8}   TP/FP/FN/TN",
            "model", "accuracy", "precision", "recall", "f1", "roc_auc"
        );
        for c in &self.candidates {
            let marker = if c.model == self.chosen { "*" } else { " " };
            match &c.outcome {
                CandidateOutcome::Evaluated { metrics: m, .. } => {
                    let cm = &m.confusion_matrix;
                    let _ = writeln!(
                        out,
                        "{marker}{:21} {:>8.3} {:>9.3} {:>8.3} {:>8.3} {:>8.3}   {}/{}/{}/{}",
                        c.model.display_name(),
                        m.accuracy,
                        m.precision,
                        m.recall,
                        m.f1,
                        m.roc_auc,
                        cm.true_positive,
                        cm.false_positive,
                        cm.false_negative,
                        cm.true_negative
                    );
                }
                CandidateOutcome::Failed { reason } => {
                    let _ = writeln!(out, " {:21} failed: {reason}", c.model.display_name());
                }
            }
        }
        out
    }
}

/// Run facts the selector records alongside its own results.
#[derive(Debug, Clone, Default)]
pub struct TrainingContext {
    pub compound_ranks: CompoundRanks,
    pub pair_count: usize,
    pub degraded: Vec<DegradedCondition>,
}

/// Fits every configuration on the same split and keeps the best by F1, then recall.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    candidates: Vec<ClassifierParams>,
    threshold: f64,
}

impl ModelSelector {
    pub fn new(candidates: Vec<ClassifierParams>, threshold: f64) -> Self {
        Self { candidates, threshold }
    }

    pub fn from_config(models: &ModelsConfig, threshold: f64) -> Self {
        Self::new(ClassifierParams::candidates(models), threshold)
    }

    // every configuration gets the same split. a configuration that errors out is written
    // into the report as failed and we keep going with the others; only when nobody
    // survives does the whole run stop.
    pub fn select(&self, prepared: &PreparedData, context: TrainingContext) -> Result<TrainingArtifact> {
        let mut degraded = context.degraded;
        if let OversamplingOutcome::Skipped {
            minority_rows,
            majority,
            ..
        } = prepared.oversampling
        {
            degraded.push(DegradedCondition::OversamplingSkipped { minority_rows, majority });
        }

        let feature_names = prepared.train.feature_names();
        let mut reports = Vec::with_capacity(self.candidates.len());
        let mut best: Option<(FittedClassifier, ModelMetrics)> = None;

        for params in &self.candidates {
            let kind = params.kind();
            info!(model = %kind, "training");
            let evaluated = params
                .fit(&prepared.train)
                .map_err(OvertakeError::from)
                .and_then(|model| {
                    let metrics = self.evaluate(&model, prepared)?;
                    Ok((model, metrics))
                });

            match evaluated {
                Ok((model, metrics)) => {
                    info!(
                        model = %kind,
                        accuracy = metrics.accuracy,
                        precision = metrics.precision,
                        recall = metrics.recall,
                        f1 = metrics.f1,
                        roc_auc = metrics.roc_auc,
                        "evaluated"
                    );
                    let feature_importances = feature_names
                        .iter()
                        .zip(model.feature_importances())
                        .map(|(feature, importance)| FeatureImportance {
                            feature: feature.clone(),
                            importance,
                        })
                        .collect();
                    reports.push(CandidateReport {
                        model: kind,
                        outcome: CandidateOutcome::Evaluated {
                            metrics: metrics.clone(),
                            feature_importances,
                        },
                    });
                    let better = best.as_ref().map_or(true, |(_, b)| beats(&metrics, b));
                    if better {
                        best = Some((model, metrics));
                    }
                }
                Err(err) => {
                    warn!(model = %kind, error = %err, "model configuration failed");
                    let reason = err.to_string();
                    degraded.push(DegradedCondition::ModelFailed {
                        model: kind,
                        reason: reason.clone(),
                    });
                    reports.push(CandidateReport {
                        model: kind,
                        outcome: CandidateOutcome::Failed { reason },
                    });
                }
            }
        }

        // nothing to publish if all of them failed
        let (model, metrics) = best.ok_or(OvertakeError::AllModelsFailed)?;
        info!(model = %model.kind(), f1 = metrics.f1, recall = metrics.recall, "selected model");

        let report = SelectionReport {
            chosen: model.kind(),
            threshold: self.threshold,
            candidates: reports,
            degraded,
        };
        let rows = RowCounts {
            pairs: context.pair_count,
            train: prepared.train_rows,
            train_after_oversampling: prepared.train.targets().len(),
            test: prepared.test.targets().len(),
        };
        let features = FeatureSpec {
            names: feature_names,
            compound_ranks: context.compound_ranks,
        };
        TrainingArtifact::new(
            model,
            prepared.scaler.clone(),
            features,
            ArtifactMetadata::new(report, rows),
        )
    }

    fn evaluate(&self, model: &FittedClassifier, prepared: &PreparedData) -> Result<ModelMetrics> {
        let probabilities: Array1<f64> = model.predict(prepared.test.records());
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(OvertakeError::InsufficientData("model produced non-finite probabilities".into()));
        }
        let truth = prepared.test.targets().to_vec();
        evaluate(&truth, &probabilities.to_vec(), self.threshold)
    }
}

/// Higher F1 wins; equal F1 falls back to recall; a full tie keeps the earlier model.
fn beats(candidate: &ModelMetrics, incumbent: &ModelMetrics) -> bool {
    candidate.f1 > incumbent.f1 || (candidate.f1 == incumbent.f1 && candidate.recall > incumbent.recall)
}
