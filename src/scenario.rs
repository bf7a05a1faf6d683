use linfa::traits::Predict;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::artifact::{ArtifactHandle, TrainingArtifact};
use crate::data::Compound;
use crate::error::{OvertakeError, Result};
use crate::pairs::{DriverState, RelativeFeatures};

/// Which supplied driver plays the attacker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Orientation {
    /// "My" driver attacks the opponent ahead.
    Attack,
    /// The opponent attacks "my" driver.
    Defense,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Orientation::Attack => "ATTACK",
            Orientation::Defense => "DEFENSE",
        })
    }
}

/// One driver as typed in by the caller; the compound stays a string until validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDriver {
    pub lap_time: f64,
    pub tyre_age: u32,
    pub compound: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Running position of whichever driver attacks; there is no lap context to derive it.
    pub attacker_position: u32,
    pub own: ScenarioDriver,
    pub opponent: ScenarioDriver,
    pub orientation: Orientation,
}

/// Display grouping of a probability; decisions use the threshold instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityBand {
    High,
    Uncertain,
    Low,
}

impl ProbabilityBand {
    pub fn from_probability(p: f64) -> Self {
        if p > 0.6 {
            ProbabilityBand::High
        } else if p > 0.4 {
            ProbabilityBand::Uncertain
        } else {
            ProbabilityBand::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioScore {
    pub probability: f64,
    pub predicted_class: u8,
    pub band: ProbabilityBand,
    pub orientation: Orientation,
    /// Unscaled, attacker-oriented feature vector that was scored.
    pub features: RelativeFeatures,
    pub model_version: String,
}

fn driver_state(driver: &ScenarioDriver, role: &str) -> Result<DriverState> {
    if !driver.lap_time.is_finite() || driver.lap_time <= 0.0 {
        return Err(OvertakeError::InvalidScenario(format!(
            "{role} lap time must be a positive number of seconds, got {}",
            driver.lap_time
        )));
    }
    Ok(DriverState {
        lap_time: driver.lap_time,
        tyre_age: driver.tyre_age,
        compound: Some(Compound::from_str(&driver.compound)?),
    })
}

/// Score one scenario against `artifact` at `threshold`.
pub fn score_scenario(artifact: &TrainingArtifact, scenario: &Scenario, threshold: f64) -> Result<ScenarioScore> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(OvertakeError::InvalidScenario(format!(
            "decision threshold must lie in [0, 1], got {threshold}"
        )));
    }
    // the attacker is the trailing car of an adjacent pair, so P1 can't attack
    if scenario.attacker_position < 2 {
        return Err(OvertakeError::InvalidScenario(format!(
            "attacker position must be 2 or higher, got {}",
            scenario.attacker_position
        )));
    }

    let own = driver_state(&scenario.own, "own")?;
    let opponent = driver_state(&scenario.opponent, "opponent")?;
    let (attacker, defender) = match scenario.orientation {
        Orientation::Attack => (own, opponent),
        Orientation::Defense => (opponent, own),
    };

    let features = RelativeFeatures::between(
        scenario.attacker_position,
        &attacker,
        &defender,
        &artifact.features().compound_ranks,
    );
    let scaled = artifact.scaler().transform_row(&features.to_array())?;
    let row = Array2::from_shape_vec((1, scaled.len()), scaled.to_vec())
        .map_err(|e| OvertakeError::InvalidScenario(e.to_string()))?;
    let probabilities: Array1<f64> = artifact.model().predict(&row);
    let probability = probabilities[0].clamp(0.0, 1.0);

    debug!(
        orientation = %scenario.orientation,
        probability,
        version = artifact.version(),
        "scored scenario"
    );
    Ok(ScenarioScore {
        probability,
        predicted_class: u8::from(probability >= threshold),
        band: ProbabilityBand::from_probability(probability),
        orientation: scenario.orientation,
        features,
        model_version: artifact.version().to_string(),
    })
}

/// Scores against a fixed artifact handle; cloning the scorer shares the artifact.
#[derive(Debug, Clone)]
pub struct ScenarioScorer {
    artifact: ArtifactHandle,
    threshold: f64,
}

impl ScenarioScorer {
    pub fn new(artifact: ArtifactHandle, threshold: f64) -> Self {
        Self { artifact, threshold }
    }

    pub fn artifact(&self) -> &ArtifactHandle {
        &self.artifact
    }

    pub fn score(&self, scenario: &Scenario) -> Result<ScenarioScore> {
        score_scenario(&self.artifact, scenario, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::tests::logistic_artifact;
    use std::sync::Arc;

    fn driver(lap_time: f64, tyre_age: u32, compound: &str) -> ScenarioDriver {
        ScenarioDriver {
            lap_time,
            tyre_age,
            compound: compound.to_string(),
        }
    }

    fn scenario(own: ScenarioDriver, opponent: ScenarioDriver, orientation: Orientation) -> Scenario {
        Scenario {
            attacker_position: 2,
            own,
            opponent,
            orientation,
        }
    }

    // identity scaler; weights: position 0.1, delta lap -2.0, delta tyre -0.3, compound 0.8
    fn artifact() -> TrainingArtifact {
        logistic_artifact(vec![0.1, -2.0, -0.3, 0.8, 0.0, 0.0], -0.2)
    }

    #[test]
    fn identical_states_sit_near_even_odds() {
        let a = artifact();
        let s = scenario(driver(90.0, 10, "MEDIUM"), driver(90.0, 10, "MEDIUM"), Orientation::Attack);
        let score = score_scenario(&a, &s, 0.5).unwrap();
        // only the position term (0.1 * 2) and the intercept (-0.2) remain and cancel
        assert!((score.probability - 0.5).abs() < 1e-9);
        assert_eq!(score.band, ProbabilityBand::Uncertain);
        assert_eq!(score.features.delta_lap_time, 0.0);
        assert_eq!(score.features.compound_advantage, 0);
    }

    #[test]
    fn faster_attacker_scores_higher() {
        let a = artifact();
        let fast = scenario(driver(89.0, 10, "SOFT"), driver(90.0, 10, "SOFT"), Orientation::Attack);
        let slow = scenario(driver(91.0, 10, "SOFT"), driver(90.0, 10, "SOFT"), Orientation::Attack);
        let p_fast = score_scenario(&a, &fast, 0.5).unwrap();
        let p_slow = score_scenario(&a, &slow, 0.5).unwrap();
        assert!(p_fast.probability > p_slow.probability);
        assert_eq!(p_fast.predicted_class, 1);
        assert_eq!(p_slow.predicted_class, 0);
        assert_eq!(p_fast.band, ProbabilityBand::High);
        assert_eq!(p_slow.band, ProbabilityBand::Low);
    }

    #[test]
    fn defense_swaps_roles() {
        let a = artifact();
        let own = driver(89.5, 5, "SOFT");
        let opp = driver(90.5, 20, "HARD");
        let attack = score_scenario(&a, &scenario(own.clone(), opp.clone(), Orientation::Attack), 0.5).unwrap();
        let defense = score_scenario(&a, &scenario(own, opp, Orientation::Defense), 0.5).unwrap();

        assert_eq!(attack.features.delta_lap_time, -defense.features.delta_lap_time);
        assert_eq!(attack.features.delta_tyre_age, -defense.features.delta_tyre_age);
        assert_eq!(attack.features.compound_advantage, 2);
        assert_eq!(defense.features.compound_advantage, -2);
        assert_eq!(defense.features.attacker_lap_time, 90.5);
        assert!(attack.probability > defense.probability);
    }

    #[test]
    fn malformed_compound_is_rejected() {
        let a = artifact();
        let s = scenario(driver(90.0, 10, "WET"), driver(90.0, 10, "SOFT"), Orientation::Attack);
        assert!(matches!(score_scenario(&a, &s, 0.5), Err(OvertakeError::InvalidCompound(_))));
        let s = scenario(driver(90.0, 10, "soft"), driver(90.0, 10, ""), Orientation::Attack);
        assert!(matches!(score_scenario(&a, &s, 0.5), Err(OvertakeError::InvalidCompound(_))));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let a = artifact();
        let mut s = scenario(driver(90.0, 10, "SOFT"), driver(90.0, 10, "SOFT"), Orientation::Attack);
        s.attacker_position = 1;
        assert!(matches!(score_scenario(&a, &s, 0.5), Err(OvertakeError::InvalidScenario(_))));
        s.attacker_position = 3;
        s.own.lap_time = f64::NAN;
        assert!(matches!(score_scenario(&a, &s, 0.5), Err(OvertakeError::InvalidScenario(_))));
        s.own.lap_time = 90.0;
        assert!(matches!(score_scenario(&a, &s, 1.5), Err(OvertakeError::InvalidScenario(_))));
    }

    #[test]
    fn threshold_moves_the_class_not_the_probability() {
        let scorer = ScenarioScorer::new(Arc::new(artifact()), 0.9);
        let s = scenario(driver(89.0, 10, "SOFT"), driver(90.0, 10, "SOFT"), Orientation::Attack);
        let strict = scorer.score(&s).unwrap();
        let default = score_scenario(scorer.artifact(), &s, 0.5).unwrap();
        assert_eq!(strict.probability, default.probability);
        assert_eq!(strict.predicted_class, 0);
        assert_eq!(default.predicted_class, 1);
    }

    #[test]
    fn bands_follow_fixed_cutoffs() {
        assert_eq!(ProbabilityBand::from_probability(0.61), ProbabilityBand::High);
        assert_eq!(ProbabilityBand::from_probability(0.6), ProbabilityBand::Uncertain);
        assert_eq!(ProbabilityBand::from_probability(0.41), ProbabilityBand::Uncertain);
        assert_eq!(ProbabilityBand::from_probability(0.4), ProbabilityBand::Low);
    }
}
