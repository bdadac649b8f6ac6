use crate::alerts::types::MetricSnapshot;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::Duration;

/// Sliding window of recent snapshots, bounded by count and age.
pub struct ObservationWindow {
    max_count: usize,
    max_age: ChronoDuration,
    observations: VecDeque<MetricSnapshot>,
}

impl ObservationWindow {
    pub fn new(max_count: usize, max_age: Duration) -> Self {
        Self {
            max_count,
            max_age: ChronoDuration::from_std(max_age)
                .unwrap_or_else(|_| ChronoDuration::hours(1)),
            observations: VecDeque::new(),
        }
    }

    pub fn record(&mut self, snapshot: MetricSnapshot) {
        self.observations.push_back(snapshot);
        while self.observations.len() > self.max_count {
            self.observations.pop_front();
        }
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.max_age;
        while self
            .observations
            .front()
            .is_some_and(|s| s.captured_at < cutoff)
        {
            self.observations.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn snapshots(&self) -> Vec<MetricSnapshot> {
        self.observations.iter().cloned().collect()
    }

    /// Compact textual rendering for the analyze-baseline prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for snapshot in &self.observations {
            let metrics: Vec<String> = snapshot
                .metrics
                .iter()
                .map(|(name, value)| format!("{name}={value:.3}"))
                .collect();
            let _ = writeln!(
                out,
                "{} {}",
                snapshot.captured_at.to_rfc3339(),
                metrics.join(" ")
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(at: DateTime<Utc>, value: f64) -> MetricSnapshot {
        MetricSnapshot {
            skill: "runtime".into(),
            metrics: BTreeMap::from([("threads".to_string(), value)]),
            captured_at: at,
        }
    }

    #[test]
    fn count_bound_drops_oldest() {
        let mut window = ObservationWindow::new(3, Duration::from_secs(3600));
        let now = Utc::now();
        for i in 0..5 {
            window.record(snapshot(now, f64::from(i)));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.snapshots()[0].metrics["threads"], 2.0);
    }

    #[test]
    fn age_bound_prunes_stale_snapshots() {
        let mut window = ObservationWindow::new(10, Duration::from_secs(60));
        let now = Utc::now();
        window.record(snapshot(now - ChronoDuration::minutes(5), 1.0));
        window.record(snapshot(now, 2.0));
        window.prune(now);
        assert_eq!(window.len(), 1);
        assert_eq!(window.snapshots()[0].metrics["threads"], 2.0);
    }

    #[test]
    fn render_lists_one_line_per_snapshot() {
        let mut window = ObservationWindow::new(10, Duration::from_secs(3600));
        let now = Utc::now();
        window.record(snapshot(now, 4.0));
        let rendered = window.render();
        assert_eq!(rendered.lines().count(), 1);
        assert!(rendered.contains("threads=4.000"));
    }
}
