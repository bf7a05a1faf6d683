use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use tracing::{info, warn};

use crate::config::CompoundRanks;
use crate::data::{compound_rank, CleanedLap, Compound};
use crate::error::Result;

/// Model input columns, in the order every feature vector uses.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "attacker_position",
    "delta_lap_time",
    "delta_tyre_age",
    "compound_advantage",
    "attacker_lap_time",
    "attacker_tyre_age",
];

pub const FEATURE_COUNT: usize = 6;

/// What the feature vector needs to know about one driver on one lap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverState {
    pub lap_time: f64,
    pub tyre_age: u32,
    pub compound: Option<Compound>,
}

impl From<&CleanedLap> for DriverState {
    fn from(lap: &CleanedLap) -> Self {
        Self {
            lap_time: lap.lap_time,
            tyre_age: lap.tyre_age,
            compound: lap.compound,
        }
    }
}

/// Attacker-minus-defender features for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelativeFeatures {
    pub attacker_position: u32,
    pub delta_lap_time: f64,
    pub delta_tyre_age: i64,
    pub compound_advantage: i32,
    pub attacker_lap_time: f64,
    pub attacker_tyre_age: u32,
}

impl RelativeFeatures {
    pub fn between(
        attacker_position: u32,
        attacker: &DriverState,
        defender: &DriverState,
        ranks: &CompoundRanks,
    ) -> Self {
        Self {
            attacker_position,
            delta_lap_time: attacker.lap_time - defender.lap_time,
            delta_tyre_age: attacker.tyre_age as i64 - defender.tyre_age as i64,
            compound_advantage: compound_rank(attacker.compound, ranks)
                - compound_rank(defender.compound, ranks),
            attacker_lap_time: attacker.lap_time,
            attacker_tyre_age: attacker.tyre_age,
        }
    }

    /// Values in [`FEATURE_NAMES`] order.
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.attacker_position as f64,
            self.delta_lap_time,
            self.delta_tyre_age as f64,
            self.compound_advantage as f64,
            self.attacker_lap_time,
            self.attacker_tyre_age as f64,
        ]
    }
}

/// One (attacker, defender) pair on one lap, labelled from the following lap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairObservation {
    pub session_id: String,
    pub lap_number: u32,
    pub attacker_id: String,
    pub defender_id: String,
    pub attacker_position: u32,
    pub attacker_lap_time: f64,
    pub attacker_tyre_age: u32,
    pub attacker_compound: Option<Compound>,
    pub defender_lap_time: f64,
    pub defender_tyre_age: u32,
    pub defender_compound: Option<Compound>,
    pub delta_lap_time: f64,
    pub delta_tyre_age: i64,
    pub compound_advantage: i32,
    /// Coarse gap proxy; descriptive only, not a model input.
    pub estimated_gap: f64,
    pub is_overtake: u8,
}

impl PairObservation {
    pub fn relative_features(&self) -> RelativeFeatures {
        RelativeFeatures {
            attacker_position: self.attacker_position,
            delta_lap_time: self.delta_lap_time,
            delta_tyre_age: self.delta_tyre_age,
            compound_advantage: self.compound_advantage,
            attacker_lap_time: self.attacker_lap_time,
            attacker_tyre_age: self.attacker_tyre_age,
        }
    }

    pub fn features(&self) -> [f64; FEATURE_COUNT] {
        self.relative_features().to_array()
    }
}

/// A lap left out of pairing because its running order was not well formed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedLap {
    pub session_id: String,
    pub lap_number: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PairBuildOutput {
    pub observations: Vec<PairObservation>,
    pub skipped_laps: Vec<SkippedLap>,
    /// Adjacent pairs dropped because the two drivers were not both on the next lap,
    /// or because the next lap was skipped as malformed.
    pub unlabeled_pairs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassBalance {
    pub total: usize,
    pub overtakes: usize,
    pub overtake_rate: f64,
}

pub fn class_balance(observations: &[PairObservation]) -> ClassBalance {
    let total = observations.len();
    let overtakes = observations.iter().filter(|o| o.is_overtake == 1).count();
    ClassBalance {
        total,
        overtakes,
        overtake_rate: if total == 0 {
            0.0
        } else {
            overtakes as f64 / total as f64
        },
    }
}

/// Turns cleaned laps into labelled attacker/defender pairs.
#[derive(Debug, Clone, Default)]
pub struct RelativePairBuilder {
    ranks: CompoundRanks,
}

impl RelativePairBuilder {
    pub fn new(ranks: CompoundRanks) -> Self {
        Self { ranks }
    }

    // the lap table is lap-based, so we first regroup it per session and per lap to get
    // a running order, then walk neighbouring positions. the label for lap N is read off
    // lap N+1, which means a pair needs both drivers to show up again.
    pub fn build(&self, laps: &[CleanedLap]) -> PairBuildOutput {
        let mut out = PairBuildOutput::default();

        for (session_id, session_laps) in sessions_of(laps) {
            let skipped_before = out.skipped_laps.len();
            let by_lap = running_orders(session_id, session_laps, &mut out.skipped_laps);
            let malformed: HashSet<u32> = out.skipped_laps[skipped_before..]
                .iter()
                .map(|s| s.lap_number)
                .collect();

            for (&lap_number, order) in &by_lap {
                // no successor, no label: the session's last lap never yields pairs
                let Some(next_number) = lap_number.checked_add(1) else {
                    continue;
                };
                let Some(next) = by_lap.get(&next_number) else {
                    // the next lap happened but its order was unusable, so these pairs
                    // exist without a label
                    if malformed.contains(&next_number) {
                        out.unlabeled_pairs += order
                            .windows(2)
                            .filter(|w| is_adjacent(w[0], w[1]))
                            .count();
                    }
                    continue;
                };
                let next_positions: HashMap<&str, u32> = next
                    .iter()
                    .map(|l| (l.driver_id.as_str(), l.position))
                    .collect();

                for window in order.windows(2) {
                    let (defender, attacker) = (window[0], window[1]);
                    // positions can jump where an outlier lap was removed
                    if !is_adjacent(defender, attacker) {
                        continue;
                    }
                    let (Some(&att_next), Some(&def_next)) = (
                        next_positions.get(attacker.driver_id.as_str()),
                        next_positions.get(defender.driver_id.as_str()),
                    ) else {
                        out.unlabeled_pairs += 1;
                        continue;
                    };

                    out.observations.push(self.observation(
                        attacker,
                        defender,
                        u8::from(att_next < def_next),
                    ));
                }
            }
        }

        let balance = class_balance(&out.observations);
        info!(
            pairs = balance.total,
            overtakes = balance.overtakes,
            overtake_rate = balance.overtake_rate,
            unlabeled = out.unlabeled_pairs,
            skipped_laps = out.skipped_laps.len(),
            "built relative pairs"
        );
        out
    }

    fn observation(&self, attacker: &CleanedLap, defender: &CleanedLap, label: u8) -> PairObservation {
        let rel = RelativeFeatures::between(
            attacker.position,
            &DriverState::from(attacker),
            &DriverState::from(defender),
            &self.ranks,
        );
        PairObservation {
            session_id: attacker.session_id.clone(),
            lap_number: attacker.lap_number,
            attacker_id: attacker.driver_id.clone(),
            defender_id: defender.driver_id.clone(),
            attacker_position: attacker.position,
            attacker_lap_time: attacker.lap_time,
            attacker_tyre_age: attacker.tyre_age,
            attacker_compound: attacker.compound,
            defender_lap_time: defender.lap_time,
            defender_tyre_age: defender.tyre_age,
            defender_compound: defender.compound,
            delta_lap_time: rel.delta_lap_time,
            delta_tyre_age: rel.delta_tyre_age,
            compound_advantage: rel.compound_advantage,
            estimated_gap: rel.delta_lap_time.abs() * 0.5,
            is_overtake: label,
        }
    }
}

fn is_adjacent(defender: &CleanedLap, attacker: &CleanedLap) -> bool {
    defender.position.checked_add(1) == Some(attacker.position)
}

fn sessions_of(laps: &[CleanedLap]) -> Vec<(&str, Vec<&CleanedLap>)> {
    let mut order: Vec<&str> = Vec::new();
    let mut grouped: HashMap<&str, Vec<&CleanedLap>> = HashMap::new();
    for lap in laps {
        let id = lap.session_id.as_str();
        if !grouped.contains_key(id) {
            order.push(id);
        }
        grouped.entry(id).or_default().push(lap);
    }
    order
        .into_iter()
        .filter_map(|id| grouped.remove(id).map(|v| (id, v)))
        .collect()
}

/// Per-lap running order sorted by position (driver id breaks ties so the output is
/// deterministic). Laps with a shared position or a repeated driver are dropped.
fn running_orders<'a>(
    session_id: &str,
    laps: Vec<&'a CleanedLap>,
    skipped: &mut Vec<SkippedLap>,
) -> BTreeMap<u32, Vec<&'a CleanedLap>> {
    let mut by_lap: BTreeMap<u32, Vec<&CleanedLap>> = BTreeMap::new();
    for lap in laps {
        by_lap.entry(lap.lap_number).or_default().push(lap);
    }

    by_lap.retain(|&lap_number, order| {
        order.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });

        let reason = if order.windows(2).any(|w| w[0].position == w[1].position) {
            Some("two drivers share a position")
        } else {
            let mut seen = HashSet::new();
            if order.iter().all(|l| seen.insert(l.driver_id.as_str())) {
                None
            } else {
                Some("driver appears more than once")
            }
        };

        match reason {
            None => true,
            Some(reason) => {
                warn!(session = session_id, lap = lap_number, reason, "skipping malformed lap");
                skipped.push(SkippedLap {
                    session_id: session_id.to_string(),
                    lap_number,
                    reason: reason.to_string(),
                });
                false
            }
        }
    });
    by_lap
}

/// Write pair observations as CSV with a header row.
pub fn write_pairs_csv<W: Write>(observations: &[PairObservation], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for obs in observations {
        wtr.serialize(obs)?;
    }
    wtr.flush()?;
    Ok(())
}
