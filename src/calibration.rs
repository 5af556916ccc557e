//! Calibration Module
//!
//! Maps a raw fused probability onto empirical frequencies measured on held-out data.
//! Tables are versioned data files keyed by modality and signal-set fingerprint; a
//! missing table is never an error, the raw probability passes through unchanged and
//! the caller is told the verdict is uncalibrated.

use crate::error::{DetectionError, Result};
use crate::signals::core::Modality;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

/// Identify a signal set independently of selection order.
///
/// Sorted, de-duplicated names joined with `+`, e.g. `perplexity+zlib_entropy`.
pub fn signal_set_fingerprint<S: AsRef<str>>(names: &[S]) -> String {
    let unique: BTreeSet<&str> = names.iter().map(|name| name.as_ref()).collect();
    unique.into_iter().collect::<Vec<_>>().join("+")
}

/// Piecewise probability mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CalibrationMap {
    /// Monotone knots `[raw, calibrated]`, linearly interpolated and flat beyond the ends
    Piecewise { points: Vec<[f64; 2]> },
    /// `values[i]` applies to raw probabilities in `[edges[i], edges[i + 1])`
    Binned { edges: Vec<f64>, values: Vec<f64> },
}

impl CalibrationMap {
    pub fn identity() -> Self {
        CalibrationMap::Piecewise {
            points: vec![[0.0, 0.0], [1.0, 1.0]],
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);

        match self {
            CalibrationMap::Piecewise { points } => {
                if points.len() < 2 {
                    return Err(invalid("piecewise map needs at least two points"));
                }
                if !points.iter().all(|[x, y]| in_unit(*x) && in_unit(*y)) {
                    return Err(invalid("piecewise points must lie in [0, 1]"));
                }
                for pair in points.windows(2) {
                    if pair[1][0] <= pair[0][0] {
                        return Err(invalid("piecewise x values must be strictly increasing"));
                    }
                    if pair[1][1] < pair[0][1] {
                        return Err(invalid("piecewise y values must be non-decreasing"));
                    }
                }
            }
            CalibrationMap::Binned { edges, values } => {
                if values.is_empty() || edges.len() != values.len() + 1 {
                    return Err(invalid("binned map needs one more edge than values"));
                }
                if !edges.iter().chain(values).all(|v| in_unit(*v)) {
                    return Err(invalid("binned edges and values must lie in [0, 1]"));
                }
                if edges.windows(2).any(|pair| pair[1] <= pair[0]) {
                    return Err(invalid("bin edges must be strictly increasing"));
                }
            }
        }
        Ok(())
    }

    /// Map a raw probability; assumes the map has been validated.
    ///
    /// A NaN input is returned unchanged.
    pub fn apply(&self, raw: f64) -> f64 {
        if raw.is_nan() {
            return raw;
        }
        let raw = raw.clamp(0.0, 1.0);
        let mapped = match self {
            CalibrationMap::Piecewise { points } => interpolate(points, raw),
            CalibrationMap::Binned { edges, values } => {
                // Index of the last edge <= raw, folded into the value range
                let upper = edges.partition_point(|&edge| edge <= raw);
                let bin = upper.saturating_sub(1).min(values.len().saturating_sub(1));
                values.get(bin).copied().unwrap_or(raw)
            }
        };
        mapped.clamp(0.0, 1.0)
    }
}

fn interpolate(points: &[[f64; 2]], x: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return x;
    };
    if x.is_nan() {
        return first[1];
    }
    if x <= first[0] {
        return first[1];
    }
    if x >= last[0] {
        return last[1];
    }

    let upper = points
        .partition_point(|p| p[0] <= x)
        .clamp(1, points.len() - 1);
    let [x0, y0] = points[upper - 1];
    let [x1, y1] = points[upper];
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

fn invalid(message: &str) -> DetectionError {
    DetectionError::InvalidCalibrationTable(message.to_string())
}

/// Versioned calibration table for one modality / signal-set combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub version: String,
    pub modality: Modality,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub map: CalibrationMap,
}

impl CalibrationTable {
    pub fn new(
        version: impl Into<String>,
        modality: Modality,
        fingerprint: impl Into<String>,
        map: CalibrationMap,
    ) -> Result<Self> {
        let table = Self {
            version: version.into(),
            modality,
            fingerprint: fingerprint.into(),
            created_at: None,
            map,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fingerprint.is_empty() {
            return Err(invalid("fingerprint must not be empty"));
        }
        self.map
            .validate()
            .map_err(|e| DetectionError::InvalidCalibrationTable(format!("{}: {}", self.version, e)))
    }

    pub fn apply(&self, raw: f64) -> f64 {
        self.map.apply(raw)
    }

    /// Fit an isotonic table from held-out `(raw_probability, is_ai)` samples.
    ///
    /// Samples are grouped into `bins` equal-width bins; each non-empty bin contributes a
    /// knot at its mean raw probability and observed AI frequency, and the frequencies
    /// are made monotone with pool-adjacent-violators.
    pub fn fit_isotonic(
        version: impl Into<String>,
        modality: Modality,
        fingerprint: impl Into<String>,
        samples: &[(f64, bool)],
        bins: usize,
    ) -> Result<Self> {
        if bins == 0 {
            return Err(invalid("at least one bin is required"));
        }
        if samples.is_empty() {
            return Err(invalid("cannot fit calibration without samples"));
        }

        let mut raw_sums = vec![0.0; bins];
        let mut positives = vec![0.0; bins];
        let mut counts = vec![0.0; bins];
        for &(raw, is_ai) in samples {
            if !raw.is_finite() {
                continue;
            }
            let raw = raw.clamp(0.0, 1.0);
            let bin = ((raw * bins as f64) as usize).min(bins - 1);
            raw_sums[bin] += raw;
            counts[bin] += 1.0;
            if is_ai {
                positives[bin] += 1.0;
            }
        }

        let occupied: Vec<usize> = (0..bins).filter(|&i| counts[i] > 0.0).collect();
        if occupied.is_empty() {
            return Err(invalid("no finite samples to fit"));
        }

        let xs: Vec<f64> = occupied.iter().map(|&i| raw_sums[i] / counts[i]).collect();
        let frequencies: Vec<f64> = occupied.iter().map(|&i| positives[i] / counts[i]).collect();
        let weights: Vec<f64> = occupied.iter().map(|&i| counts[i]).collect();
        let ys = pool_adjacent_violators(&frequencies, &weights);

        let mut points: Vec<[f64; 2]> = xs.into_iter().zip(ys).map(|(x, y)| [x, y]).collect();
        if let Some(&[x, y]) = points.first() {
            if x > 0.0 {
                points.insert(0, [0.0, y]);
            }
        }
        if let Some(&[x, y]) = points.last() {
            if x < 1.0 {
                points.push([1.0, y]);
            }
        }

        let mut table = Self::new(
            version,
            modality,
            fingerprint,
            CalibrationMap::Piecewise { points },
        )?;
        table.created_at = Some(Utc::now());
        info!(
            "Fitted calibration table {} for {}/{} from {} samples",
            table.version,
            table.modality,
            table.fingerprint,
            samples.len()
        );
        Ok(table)
    }
}

/// Weighted isotonic regression; returns one non-decreasing value per input
fn pool_adjacent_violators(values: &[f64], weights: &[f64]) -> Vec<f64> {
    // (mean, total weight, number of inputs pooled)
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(values.len());

    for (&value, &weight) in values.iter().zip(weights) {
        blocks.push((value, weight, 1));
        while let [.., previous, last] = blocks.as_slice() {
            if previous.0 <= last.0 {
                break;
            }
            let (previous, last) = (*previous, *last);
            let total = previous.1 + last.1;
            let mean = if total > 0.0 {
                (previous.0 * previous.1 + last.0 * last.1) / total
            } else {
                (previous.0 + last.0) / 2.0
            };
            blocks.truncate(blocks.len() - 2);
            blocks.push((mean, total, previous.2 + last.2));
        }
    }

    blocks
        .into_iter()
        .flat_map(|(mean, _, len)| std::iter::repeat_n(mean, len))
        .collect()
}

/// Result of a calibration lookup
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    pub probability: f64,
    /// Version of the table applied; `None` when the raw probability passed through
    pub table_version: Option<String>,
}

impl CalibrationOutcome {
    pub fn is_calibrated(&self) -> bool {
        self.table_version.is_some()
    }
}

/// Calibration tables keyed by `(modality, fingerprint)`
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    tables: HashMap<(Modality, String), CalibrationTable>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table after validating it
    pub fn insert(&mut self, table: CalibrationTable) -> Result<()> {
        table.validate()?;
        let key = (table.modality, table.fingerprint.clone());
        if let Some(previous) = self.tables.get(&key) {
            info!(
                "Replacing calibration table {}/{}: {} -> {}",
                table.modality, table.fingerprint, previous.version, table.version
            );
        }
        self.tables.insert(key, table);
        Ok(())
    }

    /// Load every `*.json` table in a directory.
    ///
    /// A missing directory yields an empty store; a malformed table is an error.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut store = Self::new();

        if !dir.is_dir() {
            warn!(
                "Calibration directory {} not found, all verdicts will be uncalibrated",
                dir.display()
            );
            return Ok(store);
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let table: CalibrationTable = serde_json::from_str(&fs::read_to_string(&path)?)?;
            debug!(
                "Loaded calibration table {} ({}/{}) from {}",
                table.version,
                table.modality,
                table.fingerprint,
                path.display()
            );
            store.insert(table)?;
        }

        info!(
            "Loaded {} calibration tables from {}",
            store.len(),
            dir.display()
        );
        Ok(store)
    }

    pub fn get(&self, modality: Modality, fingerprint: &str) -> Option<&CalibrationTable> {
        self.tables.get(&(modality, fingerprint.to_string()))
    }

    /// Calibrate a raw probability, passing it through unchanged when no table exists
    pub fn calibrate(&self, raw: f64, modality: Modality, fingerprint: &str) -> CalibrationOutcome {
        match self.get(modality, fingerprint) {
            Some(table) => CalibrationOutcome {
                probability: table.apply(raw),
                table_version: Some(table.version.clone()),
            },
            None => {
                debug!("No calibration table for {}/{}", modality, fingerprint);
                CalibrationOutcome {
                    probability: raw,
                    table_version: None,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
