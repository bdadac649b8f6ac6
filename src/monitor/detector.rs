//! Statistical anomaly detector: learning → active → cooldown.
//!
//! On every collection tick the detector samples each registered skill and
//! appends to the metric store. The learning phase buffers samples, then
//! freezes per-metric baselines; the active phase scores fresh samples
//! against those baselines by z-score and fires after enough consecutive
//! anomalous samples; the cooldown phase keeps sampling without emitting.

use super::baseline::{compute_baseline, BaselineStore};
use super::store::MetricStore;
use crate::alerts::types::{MetricSnapshot, NotificationBuilder, Severity};
use crate::alerts::AlertQueue;
use crate::skills::SkillRegistry;
use crate::telemetry::{EventPayload, TelemetryHub};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const Z_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub collection_interval: Duration,
    pub learning_duration: Duration,
    pub z_threshold: f64,
    pub consecutive_required: u32,
    pub cooldown: Duration,
    pub history_minutes: u64,
    pub min_required_samples: usize,
    pub ema_alpha: f64,
    pub persistence_path: Option<PathBuf>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(30),
            learning_duration: Duration::from_secs(3600),
            z_threshold: 3.0,
            consecutive_required: 3,
            cooldown: Duration::from_secs(300),
            history_minutes: 60,
            min_required_samples: 30,
            ema_alpha: 0.2,
            persistence_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    Learning,
    Active,
    Cooldown,
}

pub struct AnomalyDetector {
    settings: DetectorSettings,
    registry: SkillRegistry,
    queue: Arc<AlertQueue>,
    telemetry: Arc<TelemetryHub>,
    store: MetricStore,
    baselines: BaselineStore,
    phase: DetectorPhase,
    learning_started: DateTime<Utc>,
    cooldown_started: Option<DateTime<Utc>>,
    consecutive: BTreeMap<(String, String), u32>,
}

impl AnomalyDetector {
    pub fn new(
        settings: DetectorSettings,
        registry: SkillRegistry,
        queue: Arc<AlertQueue>,
        telemetry: Arc<TelemetryHub>,
    ) -> Self {
        let mut baselines = BaselineStore::new(
            settings.min_required_samples,
            settings.persistence_path.clone(),
        );
        let restored = baselines.load() && !baselines.is_empty();
        let phase = if restored {
            DetectorPhase::Active
        } else {
            telemetry.emit(None, EventPayload::MonitorLearningStarted);
            DetectorPhase::Learning
        };

        Self {
            store: MetricStore::new(settings.history_minutes),
            baselines,
            settings,
            registry,
            queue,
            telemetry,
            phase,
            learning_started: Utc::now(),
            cooldown_started: None,
            consecutive: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    /// One collection tick. Split out from the timer loop so the state
    /// machine is testable with synthetic clocks.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let sampled = self.collect(now);
        self.store.prune(now);

        match self.phase {
            DetectorPhase::Learning => self.tick_learning(now),
            DetectorPhase::Active => self.tick_active(now, &sampled),
            DetectorPhase::Cooldown => self.tick_cooldown(now, &sampled),
        }
    }

    /// Snapshot every skill, record samples, return this tick's values in
    /// stable (skill, metric) order.
    fn collect(&mut self, now: DateTime<Utc>) -> BTreeMap<(String, String), f64> {
        let mut sampled = BTreeMap::new();
        for skill in self.registry.iter() {
            for (metric, value) in skill.snapshot() {
                self.store.record(skill.id(), &metric, value, now);
                sampled.insert((skill.id().to_string(), metric), value);
            }
        }
        sampled
    }

    fn tick_learning(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.learning_started)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed < self.settings.learning_duration {
            return;
        }

        let keys: Vec<(String, String)> = self.store.keys().cloned().collect();
        let mut ready = 0usize;
        for (skill, metric) in keys {
            let values = self.store.values(&skill, &metric);
            if values.len() >= self.settings.min_required_samples {
                self.baselines
                    .set(&skill, &metric, compute_baseline(&values, now));
                ready += 1;
            }
        }
        if let Err(err) = self.baselines.flush() {
            tracing::warn!(error = %err, "baseline flush failed");
        }
        self.telemetry
            .emit(None, EventPayload::MonitorBaselinesReady { metrics: ready });
        self.phase = DetectorPhase::Active;
    }

    fn tick_active(&mut self, now: DateTime<Utc>, sampled: &BTreeMap<(String, String), f64>) {
        let mut triggered: Vec<(String, String, f64, f64)> = Vec::new();

        for ((skill, metric), value) in sampled {
            let Some(baseline) = self.baselines.usable(skill, metric) else {
                continue;
            };
            let z = (value - baseline.mean) / baseline.std_dev.max(Z_EPSILON);
            let counter = self
                .consecutive
                .entry((skill.clone(), metric.clone()))
                .or_insert(0);
            if z.abs() >= self.settings.z_threshold {
                *counter += 1;
            } else {
                *counter = 0;
            }
            if *counter >= self.settings.consecutive_required {
                triggered.push((skill.clone(), metric.clone(), *value, z));
            }
            self.baselines
                .update_ema(skill, metric, *value, self.settings.ema_alpha);
        }

        if triggered.is_empty() {
            return;
        }

        // `sampled` iterates in (skill, metric) order, so `triggered`
        // already carries the stable tie-break ordering.
        for (skill, metric, value, z) in &triggered {
            self.emit_anomaly(now, skill, metric, *value, *z);
        }
        self.consecutive.clear();
        self.cooldown_started = Some(now);
        self.phase = DetectorPhase::Cooldown;
        self.telemetry.emit(None, EventPayload::MonitorCooldownEntered);
    }

    fn tick_cooldown(&mut self, now: DateTime<Utc>, sampled: &BTreeMap<(String, String), f64>) {
        for ((skill, metric), value) in sampled {
            self.baselines
                .update_ema(skill, metric, *value, self.settings.ema_alpha);
        }
        let expired = self.cooldown_started.is_some_and(|started| {
            (now - started).to_std().unwrap_or(Duration::ZERO) >= self.settings.cooldown
        });
        if expired {
            self.cooldown_started = None;
            self.phase = DetectorPhase::Active;
            self.telemetry.emit(None, EventPayload::MonitorCooldownExpired);
        }
    }

    fn emit_anomaly(&self, now: DateTime<Utc>, skill: &str, metric: &str, value: f64, z: f64) {
        let Some(baseline) = self.baselines.usable(skill, metric) else {
            return;
        };
        let severity = if z.abs() >= 2.0 * self.settings.z_threshold {
            Severity::Critical
        } else {
            Severity::Warning
        };

        let metrics = self
            .registry
            .get(skill)
            .map(|s| s.snapshot())
            .unwrap_or_default();

        let notification = NotificationBuilder::new(skill, format!("{metric}_deviation"))
            .severity(severity)
            .context(format!(
                "baseline mean={:.3} std_dev={:.3} p95={:.3} over {} samples",
                baseline.mean, baseline.std_dev, baseline.percentile_95, baseline.sample_count
            ))
            .observation(format!(
                "{metric}={value:.3} deviates z={z:.2} for {} consecutive samples",
                self.settings.consecutive_required
            ))
            .snapshots(vec![MetricSnapshot {
                skill: skill.to_string(),
                metrics,
                captured_at: now,
            }])
            .build();

        self.telemetry.emit(
            None,
            EventPayload::MonitorAnomalyDetected {
                skill: skill.to_string(),
                metric: metric.to_string(),
                z_score: z,
            },
        );
        self.queue.push(notification);
    }

    /// Timer-driven worker loop. Flushes baselines on shutdown.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.collection_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(err) = self.baselines.flush() {
                            tracing::warn!(error = %err, "baseline flush on shutdown failed");
                        }
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick(Utc::now());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::{Skill, SkillCallback, SkillMetrics};
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;

    /// Skill whose snapshot replays a programmed series.
    struct SeriesSkill {
        values: Mutex<std::vec::IntoIter<f64>>,
        last: Mutex<f64>,
    }

    impl SeriesSkill {
        fn new(values: Vec<f64>) -> Arc<dyn Skill> {
            Arc::new(Self {
                values: Mutex::new(values.into_iter()),
                last: Mutex::new(0.0),
            })
        }
    }

    impl Skill for SeriesSkill {
        fn id(&self) -> &str {
            "series"
        }

        fn title(&self) -> &str {
            "Series"
        }

        fn description(&self) -> &str {
            "replays programmed values"
        }

        fn system_prompt(&self) -> String {
            String::new()
        }

        fn snapshot(&self) -> SkillMetrics {
            let mut last = self.last.lock();
            if let Some(next) = self.values.lock().next() {
                *last = next;
            }
            BTreeMap::from([("value".to_string(), *last)])
        }

        fn callbacks(&self) -> Vec<SkillCallback> {
            vec![]
        }
    }

    fn detector(values: Vec<f64>, consecutive_required: u32) -> (AnomalyDetector, Arc<AlertQueue>) {
        let telemetry = TelemetryHub::new();
        let queue = AlertQueue::new(telemetry.clone());
        let settings = DetectorSettings {
            learning_duration: Duration::from_secs(60),
            min_required_samples: 5,
            consecutive_required,
            z_threshold: 3.0,
            cooldown: Duration::from_secs(300),
            ..DetectorSettings::default()
        };
        let registry = SkillRegistry::new(vec![SeriesSkill::new(values)]);
        (
            AnomalyDetector::new(settings, registry, queue.clone(), telemetry),
            queue,
        )
    }

    /// Drive learning with 10 flat samples, then return the time cursor.
    fn learn(d: &mut AnomalyDetector, start: DateTime<Utc>) -> DateTime<Utc> {
        let mut now = start;
        for _ in 0..10 {
            d.tick(now);
            now += ChronoDuration::seconds(5);
        }
        d.tick(start + ChronoDuration::seconds(61));
        assert_eq!(d.phase(), DetectorPhase::Active);
        start + ChronoDuration::seconds(62)
    }

    #[test]
    fn fewer_than_required_consecutive_anomalies_never_fire() {
        // 11 learning samples at 10.0, then spike, recover, spike.
        let mut series = vec![10.0; 11];
        series.extend([100.0, 100.0, 10.0, 100.0, 100.0]);
        let (mut d, queue) = detector(series, 3);

        let mut now = learn(&mut d, Utc::now());
        for _ in 0..5 {
            d.tick(now);
            now += ChronoDuration::seconds(5);
        }
        assert_eq!(queue.count(), 0);
        assert_eq!(d.phase(), DetectorPhase::Active);
    }

    #[test]
    fn exactly_k_consecutive_anomalies_fire_exactly_once() {
        let mut series = vec![10.0; 11];
        series.extend([100.0, 100.0, 100.0, 100.0]);
        let (mut d, queue) = detector(series, 3);

        let mut now = learn(&mut d, Utc::now());
        for _ in 0..4 {
            d.tick(now);
            now += ChronoDuration::seconds(5);
        }

        let drained = queue.take_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].operator, "series");
        assert!(drained[0].anomaly_type.starts_with("value"));
        assert_eq!(d.phase(), DetectorPhase::Cooldown);
    }

    #[test]
    fn cooldown_suppresses_and_then_expires() {
        let mut series = vec![10.0; 11];
        series.extend(vec![100.0; 12]);
        let (mut d, queue) = detector(series, 3);

        let mut now = learn(&mut d, Utc::now());
        for _ in 0..3 {
            d.tick(now);
            now += ChronoDuration::seconds(5);
        }
        assert_eq!(queue.take_all().len(), 1);
        assert_eq!(d.phase(), DetectorPhase::Cooldown);

        // Still anomalous during cooldown: nothing emitted.
        d.tick(now);
        assert_eq!(queue.count(), 0);

        // Past the cooldown window the detector re-arms.
        let later = now + ChronoDuration::seconds(301);
        d.tick(later);
        assert_eq!(d.phase(), DetectorPhase::Active);
    }

    #[test]
    fn restored_baselines_skip_learning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baselines.json");
        {
            let mut store = BaselineStore::new(5, Some(path.clone()));
            store.set(
                "series",
                "value",
                compute_baseline(&[10.0; 30], Utc::now()),
            );
            store.flush().unwrap();
        }

        let telemetry = TelemetryHub::new();
        let queue = AlertQueue::new(telemetry.clone());
        let settings = DetectorSettings {
            min_required_samples: 5,
            persistence_path: Some(path),
            ..DetectorSettings::default()
        };
        let registry = SkillRegistry::new(vec![SeriesSkill::new(vec![10.0; 4])]);
        let d = AnomalyDetector::new(settings, registry, queue, telemetry);
        assert_eq!(d.phase(), DetectorPhase::Active);
    }
}
