use tracing::info;

use crate::artifact::TrainingArtifact;
use crate::config::PipelineConfig;
use crate::data::{LapRecord, LapTableNormalizer};
use crate::error::Result;
use crate::pairs::{PairBuildOutput, RelativePairBuilder};
use crate::preprocess::FeaturePreprocessor;
use crate::selection::{DegradedCondition, ModelSelector, TrainingContext};

/// Normalise raw laps and turn them into labelled pairs.
pub fn build_pairs(records: &[LapRecord], cfg: &PipelineConfig) -> PairBuildOutput {
    let cleaned = LapTableNormalizer::from_config(&cfg.normalizer).normalize(records);
    RelativePairBuilder::new(cfg.features.compound_ranks).build(&cleaned)
}

/// Runs every training stage and returns the winning artifact. Nothing is
/// persisted here; publishing is the caller's decision.
pub fn train(records: &[LapRecord], cfg: &PipelineConfig) -> Result<TrainingArtifact> {
    // A config built in code never went through `load_from`, so check it here too.
    cfg.check()?;
    let pairs = build_pairs(records, cfg);
    let prepared = FeaturePreprocessor::new(&cfg.split, &cfg.oversampling).prepare(&pairs.observations)?;

    let mut degraded = Vec::new();
    if !pairs.skipped_laps.is_empty() {
        degraded.push(DegradedCondition::MalformedLapsSkipped {
            count: pairs.skipped_laps.len(),
        });
    }
    let context = TrainingContext {
        compound_ranks: cfg.features.compound_ranks,
        pair_count: pairs.observations.len(),
        degraded,
    };

    let artifact = ModelSelector::from_config(&cfg.models, cfg.scoring.threshold).select(&prepared, context)?;
    info!(
        version = artifact.version(),
        model = %artifact.model_kind(),
        pairs = artifact.metadata().rows.pairs,
        "training run complete"
    );
    Ok(artifact)
}
