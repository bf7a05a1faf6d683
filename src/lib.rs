//! Overtake probability for adjacent Formula 1 drivers.
//!
//! Lap telemetry is cleaned ([`data`]), turned into attacker/defender pairs
//! labelled by whether the pair swapped places on the next lap ([`pairs`]),
//! scaled and rebalanced ([`preprocess`]), and used to train three classifiers
//! of which the best is kept ([`selection`]). The winner is persisted as a
//! versioned bundle ([`artifact`]) and scores hand-entered scenarios
//! ([`scenario`]).

pub mod analysis;
pub mod artifact;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pairs;
pub mod pipeline;
pub mod preprocess;
pub mod scenario;
pub mod selection;

pub use artifact::{ArtifactHandle, ArtifactSlot, ArtifactStore, TrainingArtifact};
pub use config::PipelineConfig;
pub use data::{CleanedLap, Compound, LapRecord, LapTableNormalizer};
pub use error::{OvertakeError, Result};
pub use pairs::{PairObservation, RelativePairBuilder, FEATURE_NAMES};
pub use preprocess::{FeaturePreprocessor, PreparedData, StandardScaler};
pub use scenario::{score_scenario, Orientation, Scenario, ScenarioDriver, ScenarioScore, ScenarioScorer};
pub use selection::{ModelSelector, SelectionReport};
