use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationType {
    Causal,
    Temporal,
    Symptomatic,
}

/// Coordinator-side processing state of a notification.
///
/// Transitions are monotonic toward `Resolved`; attempts to move backward
/// are ignored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Unread,
    Acknowledged,
    Resolved,
}

/// One point-in-time reading of a skill's metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSnapshot {
    pub skill: String,
    pub metrics: BTreeMap<String, f64>,
    pub captured_at: DateTime<Utc>,
}

impl MetricSnapshot {
    pub fn new(skill: impl Into<String>, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            skill: skill.into(),
            metrics,
            captured_at: Utc::now(),
        }
    }
}

/// Structured findings attached by a watcher's bounded investigation run.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WatcherFindings {
    pub summary: String,
    pub evidence: Vec<String>,
    pub notifications: Vec<Notification>,
}

/// Structured anomaly record produced by an operator, watcher, or the
/// statistical detector. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    /// Unique id, 16 hex characters.
    pub id: String,
    /// Skill id of the producing operator.
    pub operator: String,
    pub anomaly_type: String,
    pub severity: Severity,
    /// Factual state observed at detection time.
    pub context: String,
    /// The detected anomaly itself.
    pub observation: String,
    /// Speculative cause, if the producer ventured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    #[serde(default)]
    pub snapshots: Vec<MetricSnapshot>,
    pub detected_at: DateTime<Utc>,
    /// Origin node, for cluster fan-out loop prevention.
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<WatcherFindings>,
}

impl Notification {
    /// Suppression category: the `anomaly_type` prefix before the first
    /// underscore (`memory_high` → `memory`).
    pub fn category(&self) -> &str {
        self.anomaly_type
            .split_once('_')
            .map_or(self.anomaly_type.as_str(), |(prefix, _)| prefix)
    }
}

/// Fresh 16-hex-char identifier for notifications and insights.
pub fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Builder for [`Notification`] so call sites only name the fields they
/// actually set.
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    operator: String,
    anomaly_type: String,
    severity: Severity,
    context: String,
    observation: String,
    hypothesis: Option<String>,
    snapshots: Vec<MetricSnapshot>,
    node: String,
    findings: Option<WatcherFindings>,
}

impl NotificationBuilder {
    pub fn new(operator: impl Into<String>, anomaly_type: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            anomaly_type: anomaly_type.into(),
            severity: Severity::Info,
            context: String::new(),
            observation: String::new(),
            hypothesis: None,
            snapshots: Vec::new(),
            node: local_node(),
            findings: None,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = observation.into();
        self
    }

    pub fn hypothesis(mut self, hypothesis: Option<String>) -> Self {
        self.hypothesis = hypothesis;
        self
    }

    pub fn snapshots(mut self, snapshots: Vec<MetricSnapshot>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn findings(mut self, findings: Option<WatcherFindings>) -> Self {
        self.findings = findings;
        self
    }

    pub fn build(self) -> Notification {
        Notification {
            id: new_id(),
            operator: self.operator,
            anomaly_type: self.anomaly_type,
            severity: self.severity,
            context: self.context,
            observation: self.observation,
            hypothesis: self.hypothesis,
            snapshots: self.snapshots,
            detected_at: Utc::now(),
            node: self.node,
            findings: self.findings,
        }
    }
}

/// Default node identifier: hostname when resolvable, `"local"` otherwise.
pub fn local_node() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

/// A notification as tracked inside the coordinator inbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEntry {
    pub notification: Notification,
    pub status: NotificationStatus,
}

impl NotificationEntry {
    pub fn unread(notification: Notification) -> Self {
        Self {
            notification,
            status: NotificationStatus::Unread,
        }
    }

    /// Advance status; downgrades are ignored to keep transitions monotonic.
    pub fn advance(&mut self, status: NotificationStatus) {
        if status > self.status {
            self.status = status;
        }
    }
}

/// Correlated explanation the coordinator produced over one or more
/// notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Insight {
    pub id: String,
    pub notification_ids: Vec<String>,
    pub correlation_type: CorrelationType,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause_hypothesis: Option<String>,
    /// Observations copied verbatim from the cited notifications.
    pub matched_observations: Vec<String>,
    /// Whether `root_cause_hypothesis` is supported by the matched
    /// observations.
    pub hypothesis_grounded: bool,
    pub confidence: Confidence,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(anomaly_type: &str) -> Notification {
        NotificationBuilder::new("runtime", anomaly_type)
            .severity(Severity::Warning)
            .observation("rss=820MB")
            .build()
    }

    #[test]
    fn ids_are_sixteen_hex_chars() {
        let n = notification("memory_high");
        assert_eq!(n.id.len(), 16);
        assert!(n.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn category_is_prefix_before_first_underscore() {
        assert_eq!(notification("memory_high").category(), "memory");
        assert_eq!(notification("gc_pressure_sustained").category(), "gc");
        assert_eq!(notification("deadlock").category(), "deadlock");
    }

    #[test]
    fn entry_status_never_moves_backward() {
        let mut entry = NotificationEntry::unread(notification("memory_high"));
        entry.advance(NotificationStatus::Resolved);
        entry.advance(NotificationStatus::Acknowledged);
        assert_eq!(entry.status, NotificationStatus::Resolved);
    }

    #[test]
    fn severity_and_status_round_trip_lowercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let status: NotificationStatus = serde_json::from_str("\"unread\"").unwrap();
        assert_eq!(status, NotificationStatus::Unread);
    }
}
