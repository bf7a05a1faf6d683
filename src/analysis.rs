use ndarray::{Array1, Array2, Axis};
use serde::Serialize;
use std::fmt;

use crate::pairs::PairObservation;

pub const TARGET_COLUMN: &str = "is_overtake";

/// Numeric pair columns that the correlation report covers, target last.
pub const ANALYSIS_COLUMNS: [&str; 10] = [
    "attacker_position",
    "attacker_lap_time",
    "attacker_tyre_age",
    "defender_lap_time",
    "defender_tyre_age",
    "delta_lap_time",
    "delta_tyre_age",
    "compound_advantage",
    "estimated_gap",
    TARGET_COLUMN,
];

fn column_values(obs: &PairObservation) -> [f64; 10] {
    [
        obs.attacker_position as f64,
        obs.attacker_lap_time,
        obs.attacker_tyre_age as f64,
        obs.defender_lap_time,
        obs.defender_tyre_age as f64,
        obs.delta_lap_time,
        obs.delta_tyre_age as f64,
        obs.compound_advantage as f64,
        obs.estimated_gap,
        obs.is_overtake as f64,
    ]
}

/// Pearson correlation between every pair of [`ANALYSIS_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedundantPair {
    pub first: String,
    pub second: String,
    pub r: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    Strong,
    Moderate,
    Weak,
}

impl Strength {
    fn from_r(r: f64) -> Self {
        match r.abs() {
            a if a > 0.3 => Strength::Strong,
            a if a > 0.15 => Strength::Moderate,
            _ => Strength::Weak,
        }
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strength::Strong => "strong",
            Strength::Moderate => "moderate",
            Strength::Weak => "weak",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetCorrelation {
    pub feature: String,
    pub r: f64,
    pub strength: Strength,
}

pub fn correlation_matrix(observations: &[PairObservation]) -> CorrelationMatrix {
    let width = ANALYSIS_COLUMNS.len();
    let mut data = Array2::<f64>::zeros((observations.len(), width));
    for (mut row, obs) in data.axis_iter_mut(Axis(0)).zip(observations) {
        row.assign(&Array1::from(column_values(obs).to_vec()));
    }

    let columns: Vec<Array1<f64>> = data.axis_iter(Axis(1)).map(|c| c.to_owned()).collect();
    let mut values = vec![vec![0.0; width]; width];
    for i in 0..width {
        for j in i..width {
            let r = if i == j && std_dev(&columns[i]) > 0.0 {
                1.0
            } else {
                pearson(&columns[i], &columns[j])
            };
            values[i][j] = r;
            values[j][i] = r;
        }
    }

    CorrelationMatrix {
        columns: ANALYSIS_COLUMNS.iter().map(|c| c.to_string()).collect(),
        values,
    }
}

fn std_dev(col: &Array1<f64>) -> f64 {
    if col.is_empty() {
        0.0
    } else {
        col.std(0.0)
    }
}

// constant or empty columns correlate as 0
fn pearson(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let (sa, sb) = (std_dev(a), std_dev(b));
    if sa <= f64::EPSILON || sb <= f64::EPSILON {
        return 0.0;
    }
    let (ma, mb) = (a.mean().unwrap_or(0.0), b.mean().unwrap_or(0.0));
    let cov = ((a - ma) * (b - mb)).mean().unwrap_or(0.0);
    (cov / (sa * sb)).clamp(-1.0, 1.0)
}

impl CorrelationMatrix {
    pub fn get(&self, first: &str, second: &str) -> Option<f64> {
        let i = self.columns.iter().position(|c| c == first)?;
        let j = self.columns.iter().position(|c| c == second)?;
        Some(self.values[i][j])
    }

    /// Distinct column pairs with `|r| > threshold`, strongest first.
    pub fn redundant_pairs(&self, threshold: f64) -> Vec<RedundantPair> {
        let mut pairs = Vec::new();
        for i in 0..self.columns.len() {
            for j in i + 1..self.columns.len() {
                let r = self.values[i][j];
                if r.abs() > threshold {
                    pairs.push(RedundantPair {
                        first: self.columns[i].clone(),
                        second: self.columns[j].clone(),
                        r,
                    });
                }
            }
        }
        pairs.sort_by(|a, b| b.r.abs().total_cmp(&a.r.abs()));
        pairs
    }

    /// Every non-target column against the target, strongest first.
    pub fn target_correlations(&self) -> Vec<TargetCorrelation> {
        let Some(t) = self.columns.iter().position(|c| c == TARGET_COLUMN) else {
            return Vec::new();
        };
        let mut out: Vec<TargetCorrelation> = self
            .columns
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != t)
            .map(|(i, name)| TargetCorrelation {
                feature: name.clone(),
                r: self.values[i][t],
                strength: Strength::from_r(self.values[i][t]),
            })
            .collect();
        out.sort_by(|a, b| b.r.abs().total_cmp(&a.r.abs()));
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationReport {
    pub observations: usize,
    pub matrix: CorrelationMatrix,
    pub redundant_pairs: Vec<RedundantPair>,
    pub target_correlations: Vec<TargetCorrelation>,
}

pub fn analyze(observations: &[PairObservation], redundancy_threshold: f64) -> CorrelationReport {
    let matrix = correlation_matrix(observations);
    CorrelationReport {
        observations: observations.len(),
        redundant_pairs: matrix.redundant_pairs(redundancy_threshold),
        target_correlations: matrix.target_correlations(),
        matrix,
    }
}

impl fmt::Display for CorrelationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Correlation analysis over {} pair observations", self.observations)?;
        writeln!(f)?;
        writeln!(f, "Highly correlated feature pairs:")?;
        if self.redundant_pairs.is_empty() {
            writeln!(f, "  none")?;
        }
        for p in &self.redundant_pairs {
            writeln!(f, "  {} <-> {}: r = {:.3}", p.first, p.second, p.r)?;
        }
        writeln!(f)?;
        writeln!(f, "Correlation with {TARGET_COLUMN}:")?;
        for t in &self.target_correlations {
            writeln!(f, "  {:20} {:>7.3}  ({})", t.feature, t.r, t.strength)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(attacker_lap_time: f64, defender_lap_time: f64, is_overtake: u8) -> PairObservation {
        let delta = attacker_lap_time - defender_lap_time;
        PairObservation {
            session_id: "S".into(),
            lap_number: 1,
            attacker_id: "B".into(),
            defender_id: "A".into(),
            attacker_position: 2,
            attacker_lap_time,
            attacker_tyre_age: 10,
            attacker_compound: None,
            defender_lap_time,
            defender_tyre_age: 10,
            defender_compound: None,
            delta_lap_time: delta,
            delta_tyre_age: 0,
            compound_advantage: 0,
            estimated_gap: delta.abs() * 0.5,
            is_overtake,
        }
    }

    fn sample() -> Vec<PairObservation> {
        vec![
            obs(89.0, 90.0, 1),
            obs(89.5, 90.0, 1),
            obs(90.0, 90.0, 0),
            obs(90.5, 90.0, 0),
            obs(91.0, 90.0, 0),
            obs(89.2, 90.0, 1),
        ]
    }

    #[test]
    fn matrix_is_symmetric_with_unit_diagonal() {
        let m = correlation_matrix(&sample());
        for i in 0..m.columns.len() {
            for j in 0..m.columns.len() {
                assert!((m.values[i][j] - m.values[j][i]).abs() < 1e-12);
            }
        }
        assert_eq!(m.get("delta_lap_time", "delta_lap_time"), Some(1.0));
        // constant columns carry no correlation, not NaN
        assert_eq!(m.get("defender_lap_time", "defender_lap_time"), Some(0.0));
        assert_eq!(m.get("attacker_position", TARGET_COLUMN), Some(0.0));
    }

    #[test]
    fn identical_columns_are_redundant() {
        let m = correlation_matrix(&sample());
        let r = m.get("attacker_lap_time", "delta_lap_time").unwrap();
        assert!((r - 1.0).abs() < 1e-9);
        let pairs = m.redundant_pairs(0.7);
        assert!(pairs
            .iter()
            .any(|p| p.first == "attacker_lap_time" && p.second == "delta_lap_time"));
    }

    #[test]
    fn target_ranking_labels_strength() {
        let m = correlation_matrix(&sample());
        let ranked = m.target_correlations();
        assert_eq!(ranked.len(), ANALYSIS_COLUMNS.len() - 1);
        let top = &ranked[0];
        assert!(top.r < -0.3);
        assert_eq!(top.strength, Strength::Strong);
        assert_eq!(ranked.last().map(|t| t.strength), Some(Strength::Weak));
        assert_eq!(Strength::from_r(0.2), Strength::Moderate);
    }

    #[test]
    fn empty_input_yields_zero_matrix() {
        let report = analyze(&[], 0.7);
        assert!(report.redundant_pairs.is_empty());
        assert!(report.matrix.values.iter().flatten().all(|v| *v == 0.0));
    }
}
