//! Baseline-LLM watchers.
//!
//! A watcher owns a sliding window of snapshots for one domain and, on each
//! cron-driven tick, asks the LLM to classify the window instead of relying
//! on statistical baselines. Reported anomalies pass a per-category cooldown
//! before they reach the alert queue, and can optionally trigger a bounded
//! operator investigation whose findings ride along on the notification.

pub mod window;

pub use window::ObservationWindow;

use crate::agent::operator::{OperatorConfig, OperatorHandle};
use crate::agent::prompt;
use crate::agent::tools::parse_tool;
use crate::agent::RunContext;
use crate::alerts::types::{
    Confidence, MetricSnapshot, NotificationBuilder, Severity, WatcherFindings,
};
use crate::alerts::AlertQueue;
use crate::error::AgentError;
use crate::providers::LlmGateway;
use crate::skills::Skill;
use crate::telemetry::{EventPayload, TelemetryHub};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_COOLDOWN_MINUTES: u64 = 5;

fn default_cooldown_minutes() -> u64 {
    DEFAULT_COOLDOWN_MINUTES
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub name: String,
    pub skill: String,
    pub cron: String,
    pub min_required_observations: usize,
    pub max_observations: usize,
    pub max_observation_age: Duration,
    pub investigate_on_anomaly: bool,
}

impl WatcherConfig {
    pub fn new(name: impl Into<String>, skill: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skill: skill.into(),
            cron: cron.into(),
            min_required_observations: 5,
            max_observations: 60,
            max_observation_age: Duration::from_secs(3600),
            investigate_on_anomaly: false,
        }
    }
}

/// The three tagged responses the analyze-baseline prompt allows.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum BaselineVerdict {
    ContinueObserving {
        notes: String,
        confidence: Confidence,
    },
    ReportAnomaly {
        anomaly_type: String,
        severity: Severity,
        summary: String,
        #[serde(default)]
        evidence: Vec<String>,
        confidence: Confidence,
        #[serde(default = "default_cooldown_minutes")]
        cooldown_minutes: u64,
    },
    ReportHealthy {
        summary: String,
        confidence: Confidence,
    },
}

impl BaselineVerdict {
    /// Per-variant confidence bounds are part of the schema.
    fn validate(&self) -> Result<(), AgentError> {
        let ok = match self {
            Self::ContinueObserving { confidence, .. } => {
                matches!(confidence, Confidence::Low | Confidence::Medium)
            }
            Self::ReportAnomaly { confidence, .. } | Self::ReportHealthy { confidence, .. } => {
                matches!(confidence, Confidence::Medium | Confidence::High)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(AgentError::SchemaInvalid(
                "confidence outside the allowed range for this verdict".to_string(),
            ))
        }
    }
}

/// What one tick concluded, as reported to `trigger_watcher` callers.
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherTickOutcome {
    Collecting { observations: usize, required: usize },
    Observing,
    Healthy,
    Reported { notification_id: String },
    Suppressed { category: String },
}

#[derive(Debug, Clone)]
pub struct WatcherStatus {
    pub name: String,
    pub skill: String,
    pub observations: usize,
    pub cooldowns: BTreeMap<String, DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

enum WatcherCommand {
    Trigger {
        reply: oneshot::Sender<Result<WatcherTickOutcome, AgentError>>,
    },
    Status {
        reply: oneshot::Sender<WatcherStatus>,
    },
}

/// Handle to one watcher worker. Cheap to clone.
#[derive(Clone)]
pub struct WatcherHandle {
    name: String,
    tx: mpsc::Sender<WatcherCommand>,
}

impl WatcherHandle {
    pub fn spawn(
        config: WatcherConfig,
        skill: Arc<dyn Skill>,
        gateway: LlmGateway,
        queue: Arc<AlertQueue>,
        operator_config: OperatorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(4);
        let name = config.name.clone();
        let system_prompt = prompt::analyze_baseline_system_prompt(&skill);
        let window = ObservationWindow::new(config.max_observations, config.max_observation_age);
        let worker = WatcherWorker {
            config,
            skill,
            gateway,
            queue,
            operator_config,
            cancel,
            rx,
            system_prompt,
            window,
            notes: Vec::new(),
            cooldowns: BTreeMap::new(),
            last_outcome: None,
        };
        tokio::spawn(worker.run());
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one tick now. Used by the cron handler and `trigger_watcher`.
    pub async fn trigger(&self) -> Result<WatcherTickOutcome, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WatcherCommand::Trigger { reply: reply_tx })
            .await
            .map_err(|_| AgentError::WorkerCrashed)?;
        reply_rx.await.map_err(|_| AgentError::WorkerCrashed)?
    }

    pub async fn status(&self) -> Result<WatcherStatus, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WatcherCommand::Status { reply: reply_tx })
            .await
            .map_err(|_| AgentError::WorkerCrashed)?;
        reply_rx.await.map_err(|_| AgentError::WorkerCrashed)
    }
}

struct WatcherWorker {
    config: WatcherConfig,
    skill: Arc<dyn Skill>,
    gateway: LlmGateway,
    queue: Arc<AlertQueue>,
    operator_config: OperatorConfig,
    cancel: CancellationToken,
    rx: mpsc::Receiver<WatcherCommand>,
    system_prompt: String,
    window: ObservationWindow,
    notes: Vec<String>,
    cooldowns: BTreeMap<String, DateTime<Utc>>,
    last_outcome: Option<String>,
}

impl WatcherWorker {
    fn telemetry(&self) -> &Arc<TelemetryHub> {
        self.gateway.telemetry()
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    None => break,
                    Some(WatcherCommand::Trigger { reply }) => {
                        let outcome = self.tick(Utc::now()).await;
                        if let Ok(outcome) = &outcome {
                            self.last_outcome = Some(format!("{outcome:?}"));
                        }
                        let _ = reply.send(outcome);
                    }
                    Some(WatcherCommand::Status { reply }) => {
                        let _ = reply.send(WatcherStatus {
                            name: self.config.name.clone(),
                            skill: self.config.skill.clone(),
                            observations: self.window.len(),
                            cooldowns: self.cooldowns.clone(),
                            last_outcome: self.last_outcome.clone(),
                        });
                    }
                }
            }
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> Result<WatcherTickOutcome, AgentError> {
        self.window
            .record(MetricSnapshot::new(self.skill.id(), self.skill.snapshot()));
        self.window.prune(now);

        if self.window.len() < self.config.min_required_observations {
            self.telemetry().emit(
                None,
                EventPayload::WatcherBaselineCollecting {
                    name: self.config.name.clone(),
                    observations: self.window.len(),
                    required: self.config.min_required_observations,
                },
            );
            return Ok(WatcherTickOutcome::Collecting {
                observations: self.window.len(),
                required: self.config.min_required_observations,
            });
        }

        let verdict = self.classify_window().await?;
        verdict.validate()?;

        match verdict {
            BaselineVerdict::ContinueObserving { notes, .. } => {
                if !notes.trim().is_empty() {
                    self.notes.push(notes);
                }
                Ok(WatcherTickOutcome::Observing)
            }
            BaselineVerdict::ReportHealthy { .. } => {
                self.notes.clear();
                self.telemetry().emit(
                    None,
                    EventPayload::WatcherHealthy {
                        name: self.config.name.clone(),
                    },
                );
                Ok(WatcherTickOutcome::Healthy)
            }
            BaselineVerdict::ReportAnomaly {
                anomaly_type,
                severity,
                summary,
                evidence,
                cooldown_minutes,
                ..
            } => {
                self.report_anomaly(now, anomaly_type, severity, summary, evidence, cooldown_minutes)
                    .await
            }
        }
    }

    async fn classify_window(&mut self) -> Result<BaselineVerdict, AgentError> {
        let mut message = format!(
            "Observation window ({} snapshots):\n{}",
            self.window.len(),
            self.window.render()
        );
        if !self.notes.is_empty() {
            message.push_str("\nNotes from earlier ticks:\n");
            for note in &self.notes {
                message.push_str("- ");
                message.push_str(note);
                message.push('\n');
            }
        }

        let reply = self
            .gateway
            .complete(Some(&self.system_prompt), &message, None)
            .await?;
        match parse_tool::<BaselineVerdict>(&reply) {
            Ok(verdict) => Ok(verdict),
            Err(AgentError::SchemaInvalid(msg)) => {
                let retry = format!(
                    "{message}\n\nYour previous reply did not match the expected JSON \
                     shape ({msg}). Answer with the JSON object only."
                );
                let reply = self
                    .gateway
                    .complete(Some(&self.system_prompt), &retry, None)
                    .await?;
                parse_tool::<BaselineVerdict>(&reply)
            }
            Err(other) => Err(other),
        }
    }

    async fn report_anomaly(
        &mut self,
        now: DateTime<Utc>,
        anomaly_type: String,
        severity: Severity,
        summary: String,
        evidence: Vec<String>,
        cooldown_minutes: u64,
    ) -> Result<WatcherTickOutcome, AgentError> {
        let category = anomaly_type
            .split_once('_')
            .map_or(anomaly_type.as_str(), |(prefix, _)| prefix)
            .to_string();

        if let Some(expiry) = self.cooldowns.get(&category) {
            if now < *expiry {
                self.telemetry().emit(
                    None,
                    EventPayload::WatcherAnomalySuppressed {
                        name: self.config.name.clone(),
                        category: category.clone(),
                        until: *expiry,
                    },
                );
                return Ok(WatcherTickOutcome::Suppressed { category });
            }
        }

        let findings = if self.config.investigate_on_anomaly {
            Some(self.investigate(&summary, &evidence).await)
        } else {
            None
        };

        let notification = NotificationBuilder::new(self.config.skill.clone(), anomaly_type)
            .severity(severity)
            .context(format!(
                "window of {} snapshots; evidence: {}",
                self.window.len(),
                evidence.join("; ")
            ))
            .observation(summary)
            .snapshots(self.window.snapshots())
            .findings(findings)
            .build();

        self.cooldowns.insert(
            category,
            now + ChronoDuration::minutes(cooldown_minutes as i64),
        );
        self.telemetry().emit(
            None,
            EventPayload::WatcherAnomalyReported {
                name: self.config.name.clone(),
                anomaly_type: notification.anomaly_type.clone(),
            },
        );
        let id = notification.id.clone();
        self.queue.push(notification);
        Ok(WatcherTickOutcome::Reported {
            notification_id: id,
        })
    }

    /// Bounded operator run whose output becomes `WatcherFindings`.
    async fn investigate(&self, summary: &str, evidence: &[String]) -> WatcherFindings {
        let operator = OperatorHandle::spawn(
            self.skill.clone(),
            self.gateway.clone(),
            self.operator_config.clone(),
            self.cancel.child_token(),
        );
        let context = RunContext::with_reason(format!("investigate reported anomaly: {summary}"));
        let result = operator.run(context, None).await;
        operator.stop();

        match result {
            Ok(notifications) => WatcherFindings {
                summary: summary.to_string(),
                evidence: evidence.to_vec(),
                notifications,
            },
            Err(err) => {
                tracing::warn!(error = %err, watcher = %self.config.name, "investigation failed");
                WatcherFindings {
                    summary: summary.to_string(),
                    evidence: evidence.to_vec(),
                    notifications: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedClient;
    use crate::providers::{BreakerSettings, CircuitBreaker, RegisteredClient};
    use crate::skills::RuntimeSkill;

    fn gateway(replies: Vec<&str>) -> (LlmGateway, Arc<TelemetryHub>) {
        let telemetry = TelemetryHub::new();
        let breaker = CircuitBreaker::new(BreakerSettings::default(), telemetry.clone());
        let gateway = LlmGateway::new(
            &RegisteredClient {
                client: ScriptedClient::with_replies(
                    replies.into_iter().map(String::from).collect(),
                ),
                model: "test-model".into(),
                temperature: 0.0,
            },
            breaker,
            telemetry.clone(),
        );
        (gateway, telemetry)
    }

    fn spawn(
        replies: Vec<&str>,
        min_required: usize,
    ) -> (WatcherHandle, Arc<AlertQueue>, Arc<TelemetryHub>) {
        let (gateway, telemetry) = gateway(replies);
        let queue = AlertQueue::new(telemetry.clone());
        let mut config = WatcherConfig::new("runtime-watch", "runtime", "*/5 * * * *");
        config.min_required_observations = min_required;
        let handle = WatcherHandle::spawn(
            config,
            Arc::new(RuntimeSkill::new()),
            gateway,
            queue.clone(),
            OperatorConfig::default(),
            CancellationToken::new(),
        );
        (handle, queue, telemetry)
    }

    #[test]
    fn verdicts_parse_and_enforce_confidence_bounds() {
        let v: BaselineVerdict = parse_tool(
            r#"{"verdict": "continue_observing", "notes": "rss creeping", "confidence": "low"}"#,
        )
        .unwrap();
        assert!(v.validate().is_ok());

        let v: BaselineVerdict = parse_tool(
            r#"{"verdict": "continue_observing", "notes": "", "confidence": "high"}"#,
        )
        .unwrap();
        assert!(v.validate().is_err());

        let v: BaselineVerdict = parse_tool(
            r#"{"verdict": "report_anomaly", "anomaly_type": "memory_high",
                "severity": "warning", "summary": "s", "evidence": ["rss=1GB"],
                "confidence": "high"}"#,
        )
        .unwrap();
        assert!(v.validate().is_ok());
        if let BaselineVerdict::ReportAnomaly { cooldown_minutes, .. } = v {
            assert_eq!(cooldown_minutes, DEFAULT_COOLDOWN_MINUTES);
        }
    }

    #[tokio::test]
    async fn collecting_phase_skips_the_llm() {
        let (watcher, queue, telemetry) = spawn(vec![], 3);
        let mut events = telemetry.subscribe();

        let outcome = watcher.trigger().await.unwrap();
        assert_eq!(
            outcome,
            WatcherTickOutcome::Collecting {
                observations: 1,
                required: 3
            }
        );
        assert_eq!(queue.count(), 0);
        assert_eq!(
            events.recv().await.unwrap().name(),
            "watcher.baseline_collecting"
        );
    }

    #[tokio::test]
    async fn anomaly_report_enqueues_and_cooldown_suppresses_repeat() {
        let anomaly = r#"{"verdict": "report_anomaly", "anomaly_type": "memory_high",
            "severity": "warning", "summary": "rss stepped up",
            "evidence": ["rss=900MB"], "confidence": "high", "cooldown_minutes": 5}"#;
        let (watcher, queue, _) = spawn(vec![anomaly, anomaly], 1);

        let first = watcher.trigger().await.unwrap();
        assert!(matches!(first, WatcherTickOutcome::Reported { .. }));
        assert_eq!(queue.count(), 1);
        let n = &queue.take_all()[0];
        assert_eq!(n.anomaly_type, "memory_high");
        assert_eq!(n.operator, "runtime");

        // Same category within the cooldown window: suppressed.
        let second = watcher.trigger().await.unwrap();
        assert_eq!(
            second,
            WatcherTickOutcome::Suppressed {
                category: "memory".into()
            }
        );
        assert_eq!(queue.count(), 0);
    }

    #[tokio::test]
    async fn healthy_verdict_trims_notes() {
        let (watcher, _, _) = spawn(
            vec![
                r#"{"verdict": "continue_observing", "notes": "watching rss", "confidence": "low"}"#,
                r#"{"verdict": "report_healthy", "summary": "stable", "confidence": "medium"}"#,
            ],
            1,
        );
        assert_eq!(watcher.trigger().await.unwrap(), WatcherTickOutcome::Observing);
        assert_eq!(watcher.trigger().await.unwrap(), WatcherTickOutcome::Healthy);

        let status = watcher.status().await.unwrap();
        assert_eq!(status.observations, 2);
    }
}
