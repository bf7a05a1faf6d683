use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::{CompoundRanks, NormalizerConfig};
use crate::error::{OvertakeError, Result};

// column names follow the canonical telemetry contract; the aliases are the
// headers of a FastF1 lap export so those files load without renaming.
#[derive(Debug, Deserialize)]
struct RawLapRow {
    #[serde(rename = "session_id", alias = "Year", alias = "Session")]
    session_id: Option<String>,
    #[serde(rename = "driver_id", alias = "Driver")]
    driver_id: Option<String>,
    #[serde(rename = "lap_number", alias = "LapNumber")]
    lap_number: Option<f64>,
    #[serde(rename = "lap_time_seconds", alias = "LapTime_Sec", alias = "LapTimeSeconds")]
    lap_time_seconds: Option<f64>,
    #[serde(rename = "position", alias = "Position")]
    position: Option<f64>,
    #[serde(rename = "tyre_age", alias = "TyreLife")]
    tyre_age: Option<f64>,
    #[serde(rename = "compound", alias = "Compound")]
    compound: Option<String>,
}

/// Tyre rubber grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Compound {
    Soft,
    Medium,
    Hard,
}

impl Compound {
    pub fn rank(self, ranks: &CompoundRanks) -> i32 {
        match self {
            Compound::Soft => ranks.soft,
            Compound::Medium => ranks.medium,
            Compound::Hard => ranks.hard,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compound::Soft => "SOFT",
            Compound::Medium => "MEDIUM",
            Compound::Hard => "HARD",
        }
    }
}

impl FromStr for Compound {
    type Err = OvertakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "SOFT" => Ok(Compound::Soft),
            "MEDIUM" => Ok(Compound::Medium),
            "HARD" => Ok(Compound::Hard),
            _ => Err(OvertakeError::InvalidCompound(s.to_string())),
        }
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rank of an optional compound; unknown compounds rank 0 like any other missing value.
pub fn compound_rank(compound: Option<Compound>, ranks: &CompoundRanks) -> i32 {
    compound.map_or(0, |c| c.rank(ranks))
}

/// One driver on one lap of one session, as ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct LapRecord {
    pub session_id: String,
    pub driver_id: String,
    pub lap_number: u32,
    pub lap_time: Option<f64>,
    pub position: u32,
    pub tyre_age: Option<u32>,
    pub compound: Option<Compound>,
}

/// A lap that survived outlier filtering. `lap_time` and `tyre_age` are zero when unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanedLap {
    pub session_id: String,
    pub driver_id: String,
    pub lap_number: u32,
    pub lap_time: f64,
    pub position: u32,
    pub tyre_age: u32,
    pub compound: Option<Compound>,
}

/// Read a lap table from any CSV source. Fails on the first row that breaks the input contract.
pub fn read_lap_records<R: Read>(source: R) -> Result<Vec<LapRecord>> {
    let mut reader = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_reader(source);
    let mut records = Vec::new();

    for (idx, res) in reader.deserialize().enumerate() {
        let raw: RawLapRow = res?;
        records.push(validate_row(idx + 1, raw)?);
    }

    debug!(rows = records.len(), "lap table ingested");
    Ok(records)
}

pub fn load_lap_records<P: AsRef<Path>>(path: P) -> Result<Vec<LapRecord>> {
    let file = std::fs::File::open(path.as_ref())?;
    let records = read_lap_records(file)?;
    info!(path = %path.as_ref().display(), rows = records.len(), "loaded lap records");
    Ok(records)
}

fn validate_row(row: usize, raw: RawLapRow) -> Result<LapRecord> {
    let session_id = require_text(row, "session_id", raw.session_id)?;
    let driver_id = require_text(row, "driver_id", raw.driver_id)?;
    let lap_number = require_count(row, "lap_number", raw.lap_number)?;
    let position = require_count(row, "position", raw.position)?;

    // a lap time that isn't a positive number is as good as no lap time
    let lap_time = raw.lap_time_seconds.filter(|t| t.is_finite() && *t > 0.0);

    let tyre_age = match raw.tyre_age {
        None => None,
        Some(v) if v.is_finite() && v >= 0.0 => Some(v.round() as u32),
        Some(v) => {
            return Err(OvertakeError::InvalidField {
                row,
                field: "tyre_age",
                value: v.to_string(),
            })
        }
    };

    let compound = match raw.compound.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(s.parse::<Compound>()?),
    };

    Ok(LapRecord {
        session_id,
        driver_id,
        lap_number,
        lap_time,
        position,
        tyre_age,
        compound,
    })
}

fn require_text(row: usize, field: &'static str, value: Option<String>) -> Result<String> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(OvertakeError::MissingField { row, field }),
    }
}

// lap numbers and positions arrive as floats in some exports ("12.0"), so accept
// any finite integral value >= 1
fn require_count(row: usize, field: &'static str, value: Option<f64>) -> Result<u32> {
    let v = value.ok_or(OvertakeError::MissingField { row, field })?;
    if !v.is_finite() || v.fract() != 0.0 || v < 1.0 || v > u32::MAX as f64 {
        return Err(OvertakeError::InvalidField {
            row,
            field,
            value: v.to_string(),
        });
    }
    Ok(v as u32)
}

/// Splits records into sessions, keeping the order sessions first appear in.
pub fn group_by_session(records: &[LapRecord]) -> Vec<(String, Vec<LapRecord>)> {
    let mut order: Vec<String> = Vec::new();
    let mut sessions: HashMap<String, Vec<LapRecord>> = HashMap::new();

    for rec in records {
        if !sessions.contains_key(&rec.session_id) {
            order.push(rec.session_id.clone());
        }
        sessions.entry(rec.session_id.clone()).or_default().push(rec.clone());
    }

    order
        .into_iter()
        .filter_map(|id| sessions.remove(&id).map(|laps| (id, laps)))
        .collect()
}

/// Mean and sample standard deviation of the known lap times of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LapTimeStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
}

pub fn lap_time_stats(laps: &[LapRecord]) -> Option<LapTimeStats> {
    let times: Vec<f64> = laps.iter().filter_map(|l| l.lap_time).collect();
    if times.is_empty() {
        return None;
    }
    let n = times.len() as f64;
    let mean = times.iter().sum::<f64>() / n;
    let std = if times.len() < 2 {
        0.0
    } else {
        (times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    };
    Some(LapTimeStats {
        count: times.len(),
        mean,
        std,
    })
}

/// Drops outlier laps (pit stops, safety car) and zero-fills missing numbers.
#[derive(Debug, Clone)]
pub struct LapTableNormalizer {
    outlier_sigma: f64,
}

impl LapTableNormalizer {
    pub fn new(outlier_sigma: f64) -> Self {
        Self { outlier_sigma }
    }

    pub fn from_config(cfg: &NormalizerConfig) -> Self {
        Self::new(cfg.outlier_sigma)
    }

    /// Normalise every session in `records` independently.
    pub fn normalize(&self, records: &[LapRecord]) -> Vec<CleanedLap> {
        group_by_session(records)
            .iter()
            .flat_map(|(_, laps)| self.normalize_session(laps))
            .collect()
    }

    /// Normalise the laps of a single session.
    pub fn normalize_session(&self, laps: &[LapRecord]) -> Vec<CleanedLap> {
        let stats = lap_time_stats(laps);
        let band = stats
            .filter(|s| s.std > 0.0)
            .map(|s| (s.mean, self.outlier_sigma * s.std));

        let is_outlier = |lap: &LapRecord| match (lap.lap_time, band) {
            (Some(t), Some((mean, width))) => (t - mean).abs() > width,
            _ => false,
        };

        let cleaned: Vec<CleanedLap> = laps
            .iter()
            .filter(|lap| !is_outlier(lap))
            .map(|lap| CleanedLap {
                session_id: lap.session_id.clone(),
                driver_id: lap.driver_id.clone(),
                lap_number: lap.lap_number,
                lap_time: lap.lap_time.unwrap_or(0.0),
                position: lap.position,
                tyre_age: lap.tyre_age.unwrap_or(0),
                compound: lap.compound,
            })
            .collect();

        if let Some(session) = laps.first().map(|l| l.session_id.as_str()) {
            info!(
                session,
                kept = cleaned.len(),
                removed = laps.len() - cleaned.len(),
                mean_lap = stats.map_or(0.0, |s| s.mean),
                "normalised session"
            );
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lap(driver: &str, lap_number: u32, lap_time: Option<f64>, position: u32) -> LapRecord {
        LapRecord {
            session_id: "2023".to_string(),
            driver_id: driver.to_string(),
            lap_number,
            lap_time,
            position,
            tyre_age: Some(lap_number),
            compound: Some(Compound::Medium),
        }
    }

    #[test]
    fn parses_canonical_headers() {
        let csv = "session_id,driver_id,lap_number,lap_time_seconds,position,tyre_age,compound\n\
                   2023,VER,1,84.5,1,3,soft\n\
                   2023,LEC,1,,2,,\n";
        let recs = read_lap_records(csv.as_bytes()).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].compound, Some(Compound::Soft));
        assert_eq!(recs[0].lap_time, Some(84.5));
        assert_eq!(recs[1].lap_time, None);
        assert_eq!(recs[1].tyre_age, None);
        assert_eq!(recs[1].compound, None);
    }

    #[test]
    fn parses_fastf1_style_headers_with_float_counts() {
        let csv = "Year,Driver,LapNumber,LapTime_Sec,Position,TyreLife,Compound,Team\n\
                   2022,HAM,12.0,85.1,4.0,7.0,HARD,Mercedes\n";
        let recs = read_lap_records(csv.as_bytes()).unwrap();
        assert_eq!(recs[0].session_id, "2022");
        assert_eq!(recs[0].lap_number, 12);
        assert_eq!(recs[0].position, 4);
        assert_eq!(recs[0].tyre_age, Some(7));
        assert_eq!(recs[0].compound, Some(Compound::Hard));
    }

    #[test]
    fn missing_position_fails_fast() {
        let csv = "session_id,driver_id,lap_number,lap_time_seconds,position,tyre_age,compound\n\
                   2023,VER,1,84.5,,3,SOFT\n";
        let err = read_lap_records(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, OvertakeError::MissingField { row: 1, field: "position" }));
    }

    #[test]
    fn fractional_lap_number_is_rejected() {
        let csv = "session_id,driver_id,lap_number,lap_time_seconds,position,tyre_age,compound\n\
                   2023,VER,1.5,84.5,1,3,SOFT\n";
        let err = read_lap_records(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, OvertakeError::InvalidField { field: "lap_number", .. }));
    }

    #[test]
    fn unknown_compound_is_rejected() {
        let csv = "session_id,driver_id,lap_number,lap_time_seconds,position,tyre_age,compound\n\
                   2023,VER,1,84.5,1,3,SUPERSOFT\n";
        let err = read_lap_records(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, OvertakeError::InvalidCompound(_)));
    }

    #[test]
    fn compound_parsing_and_ranks() {
        let ranks = CompoundRanks::default();
        assert_eq!(" medium ".parse::<Compound>().unwrap(), Compound::Medium);
        assert_eq!(Compound::Soft.rank(&ranks), 3);
        assert_eq!(Compound::Hard.rank(&ranks), 1);
        assert_eq!(compound_rank(None, &ranks), 0);
        assert!("WET".parse::<Compound>().is_err());
    }

    #[test]
    fn empty_input_normalises_to_empty() {
        let normalizer = LapTableNormalizer::new(2.0);
        assert!(normalizer.normalize(&[]).is_empty());
        assert!(normalizer.normalize_session(&[]).is_empty());
    }

    #[test]
    fn zero_variance_session_keeps_every_lap() {
        let laps: Vec<LapRecord> = (1..=5).map(|n| lap("VER", n, Some(90.0), 1)).collect();
        let cleaned = LapTableNormalizer::new(2.0).normalize_session(&laps);
        assert_eq!(cleaned.len(), 5);
    }

    #[test]
    fn slow_lap_is_dropped_and_missing_values_zero_filled() {
        let mut laps: Vec<LapRecord> = (1..=20)
            .map(|n| lap("VER", n, Some(90.0 + n as f64 * 0.05), 1))
            .collect();
        laps.push(lap("VER", 21, Some(120.0), 1));
        let mut unknown = lap("VER", 22, None, 1);
        unknown.tyre_age = None;
        laps.push(unknown);

        let cleaned = LapTableNormalizer::new(2.0).normalize_session(&laps);
        assert_eq!(cleaned.len(), 21);
        assert!(cleaned.iter().all(|l| l.lap_number != 21));

        let filled = cleaned.iter().find(|l| l.lap_number == 22).unwrap();
        assert_eq!(filled.lap_time, 0.0);
        assert_eq!(filled.tyre_age, 0);
        assert!(cleaned.iter().all(|l| l.lap_time >= 0.0 && l.lap_time.is_finite()));
    }

    #[test]
    fn sessions_are_normalised_independently() {
        let mut laps: Vec<LapRecord> = (1..=10).map(|n| lap("VER", n, Some(80.0), 1)).collect();
        laps.extend((1..=10).map(|n| {
            let mut l = lap("VER", n, Some(100.0), 1);
            l.session_id = "2024".to_string();
            l
        }));
        // pooled, these would be two clusters 1 sigma from the mean; separately each has zero spread
        let cleaned = LapTableNormalizer::new(0.5).normalize(&laps);
        assert_eq!(cleaned.len(), 20);
    }

    #[test]
    fn stats_use_sample_deviation() {
        let laps = vec![lap("A", 1, Some(1.0), 1), lap("A", 2, Some(3.0), 1), lap("A", 3, None, 1)];
        let stats = lap_time_stats(&laps).unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 2.0).abs() < 1e-12);
        assert!((stats.std - 2f64.sqrt()).abs() < 1e-12);
    }
}
