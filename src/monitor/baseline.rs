//! Per-(skill, metric) statistical baselines with optional JSON persistence.
//!
//! The snapshot baseline computed at the end of the learning phase is the
//! detection reference; a separate exponential moving average tracks drift
//! so operators can see it, without the reference chasing the anomaly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub percentile_50: f64,
    pub percentile_95: f64,
    pub percentile_99: f64,
    pub sample_count: usize,
    pub last_updated: DateTime<Utc>,
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub fn compute_baseline(values: &[f64], now: DateTime<Utc>) -> Baseline {
    let count = values.len();
    if count == 0 {
        return Baseline {
            mean: 0.0,
            std_dev: 0.0,
            percentile_50: 0.0,
            percentile_95: 0.0,
            percentile_99: 0.0,
            sample_count: 0,
            last_updated: now,
        };
    }

    let mean = values.iter().sum::<f64>() / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Baseline {
        mean,
        std_dev: variance.sqrt(),
        percentile_50: percentile(&sorted, 50.0),
        percentile_95: percentile(&sorted, 95.0),
        percentile_99: percentile(&sorted, 99.0),
        sample_count: count,
        last_updated: now,
    }
}

fn key(skill: &str, metric: &str) -> String {
    format!("{skill}:{metric}")
}

pub struct BaselineStore {
    baselines: BTreeMap<String, Baseline>,
    ema: BTreeMap<String, f64>,
    min_required: usize,
    path: Option<PathBuf>,
}

impl BaselineStore {
    pub fn new(min_required: usize, path: Option<PathBuf>) -> Self {
        Self {
            baselines: BTreeMap::new(),
            ema: BTreeMap::new(),
            min_required,
            path,
        }
    }

    /// Load persisted baselines. A missing or unreadable file is not an
    /// error: it just means a fresh learning cycle.
    pub fn load(&mut self) -> bool {
        let Some(path) = &self.path else { return false };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return false;
        };
        match serde_json::from_str::<BTreeMap<String, Baseline>>(&raw) {
            Ok(baselines) => {
                self.baselines = baselines;
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "discarding corrupt baseline file");
                false
            }
        }
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(&self.baselines)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn set(&mut self, skill: &str, metric: &str, baseline: Baseline) {
        self.baselines.insert(key(skill, metric), baseline);
    }

    /// Baseline usable for anomaly decisions: present and past the minimum
    /// sample count.
    pub fn usable(&self, skill: &str, metric: &str) -> Option<&Baseline> {
        self.baselines
            .get(&key(skill, metric))
            .filter(|b| b.sample_count >= self.min_required)
    }

    pub fn min_required(&self) -> usize {
        self.min_required
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Track drift separately from the detection reference.
    pub fn update_ema(&mut self, skill: &str, metric: &str, value: f64, alpha: f64) {
        let entry = self.ema.entry(key(skill, metric)).or_insert(value);
        *entry = alpha * value + (1.0 - alpha) * *entry;
    }

    pub fn ema(&self, skill: &str, metric: &str) -> Option<f64> {
        self.ema.get(&key(skill, metric)).copied()
    }
}
