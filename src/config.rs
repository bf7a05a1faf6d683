use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{OvertakeError, Result};

/// Top-level configuration for a pipeline run and for scoring.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub oversampling: OversamplingConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load from `config/default.toml` (if present) and `OVERTAKE__*` env vars.
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    /// Load from a specific file, still letting environment variables override it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            // OVERTAKE__SCORING__THRESHOLD=0.4, OVERTAKE__ARTIFACTS__ROOT=/srv/models, ...
            .add_source(
                Environment::with_prefix("OVERTAKE")
                    .separator("__")
                    .try_parsing(true),
            );

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Validate configuration values, collecting every problem rather than the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Cleaning and splitting
        if !positive(self.normalizer.outlier_sigma) {
            errors.push(format!(
                "normalizer.outlier_sigma must be positive, got {}",
                self.normalizer.outlier_sigma
            ));
        }
        if !(self.split.test_fraction > 0.0 && self.split.test_fraction < 1.0) {
            errors.push(format!(
                "split.test_fraction must lie strictly between 0 and 1, got {}",
                self.split.test_fraction
            ));
        }

        // Models
        let logistic = &self.models.logistic;
        if !positive(logistic.c) || logistic.max_iter == 0 || !positive(logistic.tolerance) {
            errors.push("models.logistic needs c > 0, max_iter >= 1 and tolerance > 0".to_string());
        }
        let forest = &self.models.forest;
        if forest.n_estimators == 0 {
            errors.push("models.forest.n_estimators must be at least 1".to_string());
        }
        if forest.min_samples_split < 2 {
            errors.push("models.forest.min_samples_split must be at least 2".to_string());
        }
        if forest.max_depth == Some(0) {
            errors.push("models.forest.max_depth must be at least 1 when set".to_string());
        }
        let boosting = &self.models.boosting;
        if boosting.n_estimators == 0 {
            errors.push("models.boosting.n_estimators must be at least 1".to_string());
        }
        if boosting.max_depth == 0 {
            errors.push("models.boosting.max_depth must be at least 1".to_string());
        }
        if !positive(boosting.learning_rate) {
            errors.push(format!(
                "models.boosting.learning_rate must be positive, got {}",
                boosting.learning_rate
            ));
        }
        if !non_negative(boosting.lambda) || !non_negative(boosting.min_child_weight) {
            errors.push("models.boosting.lambda and min_child_weight must be non-negative".to_string());
        }

        // Scoring
        if !(0.0..=1.0).contains(&self.scoring.threshold) {
            errors.push(format!(
                "scoring.threshold must lie in [0, 1], got {}",
                self.scoring.threshold
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// [`validate`](Self::validate) folded into the crate error type.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| OvertakeError::Config(config::ConfigError::Message(errors.join("; "))))
    }
}

// NaN fails both
fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    /// Laps further than this many standard deviations from the session mean are dropped.
    #[serde(default = "default_outlier_sigma")]
    pub outlier_sigma: f64,
}

fn default_outlier_sigma() -> f64 {
    2.0
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            outlier_sigma: default_outlier_sigma(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub compound_ranks: CompoundRanks,
}

/// Grip ranking used for `compound_advantage`. Missing compounds rank 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompoundRanks {
    pub soft: i32,
    pub medium: i32,
    pub hard: i32,
}

impl Default for CompoundRanks {
    fn default() -> Self {
        Self {
            soft: 3,
            medium: 2,
            hard: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitConfig {
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_test_fraction() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: default_test_fraction(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OversamplingConfig {
    /// Upper bound on k; the effective k is `min(max_neighbors, m - 1)`.
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_max_neighbors() -> usize {
    5
}

impl Default for OversamplingConfig {
    fn default() -> Self {
        Self {
            max_neighbors: default_max_neighbors(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub logistic: LogisticConfig,
    #[serde(default)]
    pub forest: ForestConfig,
    #[serde(default)]
    pub boosting: BoostingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticConfig {
    /// Inverse L2 regularisation strength.
    #[serde(default = "default_c")]
    pub c: f64,
    #[serde(default = "default_logistic_iters")]
    pub max_iter: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_c() -> f64 {
    1.0
}

fn default_logistic_iters() -> usize {
    100
}

fn default_tolerance() -> f64 {
    1e-6
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            c: default_c(),
            max_iter: default_logistic_iters(),
            tolerance: default_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    #[serde(default = "default_estimators")]
    pub n_estimators: usize,
    /// `None` grows every tree until its leaves are pure.
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_estimators() -> usize {
    100
}

fn default_min_samples_split() -> usize {
    2
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: default_estimators(),
            max_depth: None,
            min_samples_split: default_min_samples_split(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostingConfig {
    #[serde(default = "default_estimators")]
    pub n_estimators: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_boosting_depth")]
    pub max_depth: usize,
    /// L2 penalty on leaf weights.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_min_child_weight")]
    pub min_child_weight: f64,
}

fn default_learning_rate() -> f64 {
    0.3
}

fn default_boosting_depth() -> usize {
    6
}

fn default_lambda() -> f64 {
    1.0
}

fn default_min_child_weight() -> f64 {
    1.0
}

impl Default for BoostingConfig {
    fn default() -> Self {
        Self {
            n_estimators: default_estimators(),
            learning_rate: default_learning_rate(),
            max_depth: default_boosting_depth(),
            lambda: default_lambda(),
            min_child_weight: default_min_child_weight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.5
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_artifact_root")]
    pub root: String,
}

fn default_artifact_root() -> String {
    "models".to_string()
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: default_artifact_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
