use linfa::DatasetBase;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{OversamplingConfig, SplitConfig};
use crate::error::{OvertakeError, Result};
use crate::model::PairDatasetBase;
use crate::pairs::{PairObservation, FEATURE_COUNT, FEATURE_NAMES};

/// Feature matrix plus one 0/1 overtake target per row.
pub type PairDataset = PairDatasetBase;

pub fn observations_to_dataset(observations: &[PairObservation]) -> PairDataset {
    let mut records = Array2::<f64>::zeros((observations.len(), FEATURE_COUNT));
    for (mut row, obs) in records.axis_iter_mut(Axis(0)).zip(observations) {
        row.assign(&ArrayView1::from(&obs.features()[..]));
    }
    let targets: Array1<usize> = observations.iter().map(|o| o.is_overtake as usize).collect();
    DatasetBase::new(records, targets).with_feature_names(FEATURE_NAMES.to_vec())
}

/// Row indices of a class-stratified train/test split.
///
/// Each class sends `round(n_class * test_fraction)` of its rows to the test side,
/// so both sides keep the population ratio up to rounding.
pub fn stratified_split(labels: &[usize], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    let mut classes: Vec<usize> = labels.to_vec();
    classes.sort_unstable();
    classes.dedup();

    for class in classes {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        // a fraction outside [0, 1] still can't slice past the class
        let n_test = (((members.len() as f64) * test_fraction).round() as usize).min(members.len());
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Zero-mean / unit-variance column scaling. Constant columns keep a scale of 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(records: &Array2<f64>) -> Result<Self> {
        let mean = records
            .mean_axis(Axis(0))
            .ok_or_else(|| OvertakeError::InsufficientData("cannot fit a scaler on zero rows".into()))?;
        let scale = records
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });
        Ok(Self {
            mean: mean.to_vec(),
            scale: scale.to_vec(),
        })
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, records: &Array2<f64>) -> Result<Array2<f64>> {
        if records.ncols() != self.width() {
            return Err(OvertakeError::ArtifactMismatch(format!(
                "scaler fitted on {} columns, got {}",
                self.width(),
                records.ncols()
            )));
        }
        let mean = Array1::from(self.mean.clone());
        let scale = Array1::from(self.scale.clone());
        Ok((records - &mean) / &scale)
    }

    pub fn transform_row(&self, row: &[f64]) -> Result<Array1<f64>> {
        let matrix = Array2::from_shape_vec((1, row.len()), row.to_vec())
            .map_err(|e| OvertakeError::InvalidScenario(e.to_string()))?;
        Ok(self.transform(&matrix)?.row(0).to_owned())
    }
}

/// What the oversampler did to the training split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OversamplingOutcome {
    Balanced {
        minority_label: usize,
        minority_before: usize,
        majority: usize,
        neighbors: usize,
        synthesized: usize,
    },
    AlreadyBalanced {
        rows_per_class: usize,
    },
    /// Too few minority rows to interpolate; training continues imbalanced.
    Skipped {
        minority_label: usize,
        minority_rows: usize,
        majority: usize,
    },
}

impl OversamplingOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, OversamplingOutcome::Skipped { .. })
    }
}

/// Synthesises minority rows on the segment between a minority row and one of its
/// `k` nearest minority neighbours until both classes have the same count.
#[derive(Debug, Clone)]
pub struct MinorityOversampler {
    max_neighbors: usize,
    seed: u64,
}

impl MinorityOversampler {
    pub fn new(max_neighbors: usize, seed: u64) -> Self {
        Self { max_neighbors, seed }
    }

    pub fn from_config(cfg: &OversamplingConfig) -> Self {
        Self::new(cfg.max_neighbors, cfg.seed)
    }

    // counting both classes first: whichever is smaller is the one we top up.
    // if there is only a single minority row there is nothing to interpolate towards,
    // so we hand the split back untouched and say so in the outcome.
    pub fn resample(
        &self,
        records: &Array2<f64>,
        targets: &Array1<usize>,
    ) -> (Array2<f64>, Array1<usize>, OversamplingOutcome) {
        let positives = targets.iter().filter(|&&t| t == 1).count();
        let negatives = targets.len() - positives;
        let (minority_label, m, majority) = if positives <= negatives {
            (1, positives, negatives)
        } else {
            (0, negatives, positives)
        };

        if m == majority {
            return (
                records.clone(),
                targets.clone(),
                OversamplingOutcome::AlreadyBalanced { rows_per_class: m },
            );
        }

        let k = self.max_neighbors.min(m.saturating_sub(1));
        if m <= 1 || k == 0 {
            warn!(minority_rows = m, majority, "too few minority rows to oversample; training imbalanced");
            return (
                records.clone(),
                targets.clone(),
                OversamplingOutcome::Skipped {
                    minority_label,
                    minority_rows: m,
                    majority,
                },
            );
        }

        let minority_idx: Vec<usize> = (0..targets.len())
            .filter(|&i| targets[i] == minority_label)
            .collect();
        let minority = records.select(Axis(0), &minority_idx);
        let neighbors = nearest_neighbors(&minority, k);

        let to_make = majority - m;
        let n = records.nrows();
        let mut out_x = Array2::<f64>::zeros((n + to_make, records.ncols()));
        out_x.slice_mut(s![..n, ..]).assign(records);
        let mut out_y = Array1::<usize>::from_elem(n + to_make, minority_label);
        out_y.slice_mut(s![..n]).assign(targets);

        // each synthetic row sits somewhere on the line between a random minority row
        // and one of its neighbours
        let mut rng = StdRng::seed_from_u64(self.seed);
        for r in 0..to_make {
            let base = rng.gen_range(0..m);
            let other = neighbors[base][rng.gen_range(0..k)];
            let gap: f64 = rng.gen();
            let synthetic = &minority.row(base) + &((&minority.row(other) - &minority.row(base)) * gap);
            out_x.row_mut(n + r).assign(&synthetic);
        }

        info!(minority_label, before = m, after = majority, neighbors = k, "oversampled minority class");
        (
            out_x,
            out_y,
            OversamplingOutcome::Balanced {
                minority_label,
                minority_before: m,
                majority,
                neighbors: k,
                synthesized: to_make,
            },
        )
    }
}

// brute force: the minority class is small by definition
fn nearest_neighbors(rows: &Array2<f64>, k: usize) -> Vec<Vec<usize>> {
    (0..rows.nrows())
        .map(|i| {
            let mut dists: Vec<(f64, usize)> = (0..rows.nrows())
                .filter(|&j| j != i)
                .map(|j| {
                    let d = (&rows.row(i) - &rows.row(j)).mapv(|v| v * v).sum();
                    (d, j)
                })
                .collect();
            dists.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            dists.into_iter().take(k).map(|(_, j)| j).collect()
        })
        .collect()
}

/// Scaled train/test splits ready for model fitting.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train: PairDataset,
    pub test: PairDataset,
    pub scaler: StandardScaler,
    pub oversampling: OversamplingOutcome,
    /// Training rows before synthetic rows were added.
    pub train_rows: usize,
}

#[derive(Debug, Clone)]
pub struct FeaturePreprocessor {
    test_fraction: f64,
    split_seed: u64,
    oversampler: MinorityOversampler,
}

impl FeaturePreprocessor {
    pub fn new(split: &SplitConfig, oversampling: &OversamplingConfig) -> Self {
        Self {
            test_fraction: split.test_fraction,
            split_seed: split.seed,
            oversampler: MinorityOversampler::from_config(oversampling),
        }
    }

    /// Split, fit the scaler on train only, scale both sides, then oversample train.
    pub fn prepare(&self, observations: &[PairObservation]) -> Result<PreparedData> {
        let full = observations_to_dataset(observations);
        let labels = full.targets().to_vec();
        let (train_idx, test_idx) = stratified_split(&labels, self.test_fraction, self.split_seed);
        if train_idx.is_empty() || test_idx.is_empty() {
            return Err(OvertakeError::InsufficientData(format!(
                "{} pair observations cannot fill both a train and a test split",
                observations.len()
            )));
        }

        let records = full.records();
        let targets = full.targets();
        let train_x = records.select(Axis(0), &train_idx);
        let test_x = records.select(Axis(0), &test_idx);
        let train_y = targets.select(Axis(0), &train_idx);
        let test_y = targets.select(Axis(0), &test_idx);

        // the scaler only ever sees training rows
        let scaler = StandardScaler::fit(&train_x)?;
        let train_scaled = scaler.transform(&train_x)?;
        let test_scaled = scaler.transform(&test_x)?;

        let (train_x, train_y, oversampling) = self.oversampler.resample(&train_scaled, &train_y);

        info!(
            train = train_idx.len(),
            train_after_oversampling = train_y.len(),
            test = test_idx.len(),
            test_overtakes = test_y.iter().filter(|&&t| t == 1).count(),
            "prepared train/test split"
        );

        Ok(PreparedData {
            train: DatasetBase::new(train_x, train_y).with_feature_names(FEATURE_NAMES.to_vec()),
            test: DatasetBase::new(test_scaled, test_y).with_feature_names(FEATURE_NAMES.to_vec()),
            scaler,
            oversampling,
            train_rows: train_idx.len(),
        })
    }
}
