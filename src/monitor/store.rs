use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, VecDeque};

/// One observed metric value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Bounded per-(skill, metric) sample histories. Samples older than the
/// window are pruned; insertion order is preserved. Keys iterate in stable
/// (skill, metric) order, which the detector relies on for tie-breaks.
pub struct MetricStore {
    window: ChronoDuration,
    series: BTreeMap<(String, String), VecDeque<MetricSample>>,
}

impl MetricStore {
    pub fn new(history_minutes: u64) -> Self {
        Self {
            window: ChronoDuration::minutes(history_minutes as i64),
            series: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, skill: &str, metric: &str, value: f64, now: DateTime<Utc>) {
        self.series
            .entry((skill.to_string(), metric.to_string()))
            .or_default()
            .push_back(MetricSample {
                timestamp: now,
                value,
            });
    }

    /// Drop samples older than the window. Called once per collection tick.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        for samples in self.series.values_mut() {
            while samples.front().is_some_and(|s| s.timestamp < cutoff) {
                samples.pop_front();
            }
        }
        self.series.retain(|_, samples| !samples.is_empty());
    }

    pub fn values(&self, skill: &str, metric: &str) -> Vec<f64> {
        self.series
            .get(&(skill.to_string(), metric.to_string()))
            .map(|samples| samples.iter().map(|s| s.value).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &(String, String)> {
        self.series.keys()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pruning_preserves_order_and_drops_old_samples() {
        let mut store = MetricStore::new(1);
        let base = Utc::now();
        store.record("runtime", "threads", 1.0, base - ChronoDuration::minutes(5));
        store.record("runtime", "threads", 2.0, base - ChronoDuration::seconds(30));
        store.record("runtime", "threads", 3.0, base);

        store.prune(base);
        assert_eq!(store.values("runtime", "threads"), vec![2.0, 3.0]);
    }

    #[test]
    fn keys_iterate_in_stable_skill_metric_order() {
        let mut store = MetricStore::new(60);
        let now = Utc::now();
        store.record("storage", "total_rows", 1.0, now);
        store.record("runtime", "threads", 1.0, now);
        store.record("runtime", "open_fds", 1.0, now);

        let keys: Vec<_> = store
            .keys()
            .map(|(s, m)| format!("{s}/{m}"))
            .collect();
        assert_eq!(
            keys,
            vec!["runtime/open_fds", "runtime/threads", "storage/total_rows"]
        );
    }

    #[test]
    fn empty_series_are_removed_entirely() {
        let mut store = MetricStore::new(1);
        let old = Utc::now() - ChronoDuration::minutes(10);
        store.record("runtime", "threads", 1.0, old);
        store.prune(Utc::now());
        assert!(store.is_empty());
    }
}
