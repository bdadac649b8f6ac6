//! Telemetry catalogue and hub.
//!
//! Every span-shaped activity (agent runs, LLM calls, tool executions, judge
//! calls) emits a `start`/`stop`/`exception` triple with a shared measurement
//! contract: `start` carries `system_time`, `stop` carries `duration`,
//! `exception` carries `duration` plus an error kind and reason. Point events
//! (scheduler, watcher, monitor, alert handler, breaker, coordinator) have
//! their own variants. Events carry the `trace_id` in scope so one run can be
//! correlated end to end.
//!
//! The hub fans events out to registered [`TelemetryHandler`]s and to
//! broadcast subscribers (used by the cluster forwarder and by tests).

pub mod log;
pub mod noop;

pub use log::LogHandler;
pub use noop::NoopHandler;

use crate::alerts::types::Notification;
use crate::providers::breaker::BreakerState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Which start/stop/exception family a span belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Agent,
    Llm,
    Tool,
    Judge,
}

impl SpanKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Judge => "judge",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    SpanStart {
        kind: SpanKind,
        system_time: DateTime<Utc>,
        detail: String,
    },
    SpanStop {
        kind: SpanKind,
        duration: Duration,
        detail: String,
    },
    SpanException {
        kind: SpanKind,
        duration: Duration,
        error_kind: String,
        reason: String,
    },

    ScheduleTriggered {
        name: String,
    },
    ScheduleSkipped {
        name: String,
        reason: String,
    },
    ScheduleCompleted {
        name: String,
        duration: Duration,
    },
    ScheduleFailed {
        name: String,
        reason: String,
    },

    WatcherBaselineCollecting {
        name: String,
        observations: usize,
        required: usize,
    },
    WatcherAnomalyReported {
        name: String,
        anomaly_type: String,
    },
    WatcherAnomalySuppressed {
        name: String,
        category: String,
        until: DateTime<Utc>,
    },
    WatcherHealthy {
        name: String,
    },

    MonitorLearningStarted,
    MonitorBaselinesReady {
        metrics: usize,
    },
    MonitorAnomalyDetected {
        skill: String,
        metric: String,
        z_score: f64,
    },
    MonitorCooldownEntered,
    MonitorCooldownExpired,

    AlertFired {
        notification: Notification,
    },
    AlertDropped {
        queue_len: usize,
    },
    AlertHandlerTriggered {
        notification_id: String,
    },

    CircuitStateChange {
        from: BreakerState,
        to: BreakerState,
        failure_count: u32,
        reason: Option<String>,
    },
    CircuitRejected {
        state: BreakerState,
        failure_count: u32,
    },

    CoordinatorIterationStart {
        iteration: u32,
    },
    CoordinatorInsightProduced {
        insight_id: String,
        notification_ids: Vec<String>,
    },
    CoordinatorDone {
        iterations: u32,
    },
    CoordinatorLlmError {
        reason: String,
    },
    CoordinatorOperatorComplete {
        skill: String,
        notifications: usize,
    },
    CoordinatorOperatorCrashed {
        skill: String,
    },
    CoordinatorDoneRejected {
        running: usize,
    },
    CoordinatorScheduleRejected {
        running: usize,
    },
    CoordinatorMaxIterations {
        iterations: u32,
    },

    OperatorMaxIterationsReached {
        skill: String,
        iterations: u32,
    },
    OperatorCancelled {
        skill: String,
    },
}

impl EventPayload {
    /// Hierarchical event name, e.g. `llm.exception` or
    /// `circuit_breaker.state_change`.
    pub fn name(&self) -> String {
        match self {
            Self::SpanStart { kind, .. } => format!("{}.start", kind.prefix()),
            Self::SpanStop { kind, .. } => format!("{}.stop", kind.prefix()),
            Self::SpanException { kind, .. } => format!("{}.exception", kind.prefix()),
            Self::ScheduleTriggered { .. } => "schedule.triggered".into(),
            Self::ScheduleSkipped { .. } => "schedule.skipped".into(),
            Self::ScheduleCompleted { .. } => "schedule.completed".into(),
            Self::ScheduleFailed { .. } => "schedule.failed".into(),
            Self::WatcherBaselineCollecting { .. } => "watcher.baseline_collecting".into(),
            Self::WatcherAnomalyReported { .. } => "watcher.anomaly_reported".into(),
            Self::WatcherAnomalySuppressed { .. } => "watcher.anomaly_suppressed".into(),
            Self::WatcherHealthy { .. } => "watcher.healthy".into(),
            Self::MonitorLearningStarted => "monitor.learning_started".into(),
            Self::MonitorBaselinesReady { .. } => "monitor.baselines_ready".into(),
            Self::MonitorAnomalyDetected { .. } => "monitor.anomaly_detected".into(),
            Self::MonitorCooldownEntered => "monitor.cooldown_entered".into(),
            Self::MonitorCooldownExpired => "monitor.cooldown_expired".into(),
            Self::AlertFired { .. } => "alert_handler.alert_fired".into(),
            Self::AlertDropped { .. } => "alert_handler.alert_dropped".into(),
            Self::AlertHandlerTriggered { .. } => "alert_handler.triggered".into(),
            Self::CircuitStateChange { .. } => "circuit_breaker.state_change".into(),
            Self::CircuitRejected { .. } => "circuit_breaker.rejected".into(),
            Self::CoordinatorIterationStart { .. } => "coordinator.iteration_start".into(),
            Self::CoordinatorInsightProduced { .. } => "coordinator.insight_produced".into(),
            Self::CoordinatorDone { .. } => "coordinator.done".into(),
            Self::CoordinatorLlmError { .. } => "coordinator.llm_error".into(),
            Self::CoordinatorOperatorComplete { .. } => "coordinator.operator_complete".into(),
            Self::CoordinatorOperatorCrashed { .. } => "coordinator.operator_crashed".into(),
            Self::CoordinatorDoneRejected { .. } => "coordinator.done_rejected".into(),
            Self::CoordinatorScheduleRejected { .. } => "coordinator.schedule_rejected".into(),
            Self::CoordinatorMaxIterations { .. } => "coordinator.max_iterations".into(),
            Self::OperatorMaxIterationsReached { .. } => "operator.max_iterations_reached".into(),
            Self::OperatorCancelled { .. } => "operator.cancelled".into(),
        }
    }
}

/// One emitted telemetry event plus its correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub payload: EventPayload,
}

impl TelemetryEvent {
    pub fn name(&self) -> String {
        self.payload.name()
    }
}

/// Sink for telemetry events. Implementations must not block: events are
/// dispatched synchronously on the emitting task.
pub trait TelemetryHandler: Send + Sync + 'static {
    fn handle(&self, event: &TelemetryEvent);

    fn name(&self) -> &str;

    /// Flush buffered data; called on shutdown.
    fn flush(&self) {}
}

const BROADCAST_CAPACITY: usize = 256;

/// Fan-out hub for the fixed event catalogue.
pub struct TelemetryHub {
    handlers: parking_lot::RwLock<Vec<Arc<dyn TelemetryHandler>>>,
    broadcast: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryHub {
    pub fn new() -> Arc<Self> {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            handlers: parking_lot::RwLock::new(Vec::new()),
            broadcast,
        })
    }

    pub fn register(&self, handler: Arc<dyn TelemetryHandler>) {
        self.handlers.write().push(handler);
    }

    /// Subscribe to the raw event stream. Lagging subscribers lose events;
    /// telemetry is best-effort by design.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.broadcast.subscribe()
    }

    pub fn emit(&self, trace_id: Option<&str>, payload: EventPayload) {
        let event = TelemetryEvent {
            trace_id: trace_id.map(ToString::to_string),
            payload,
        };
        for handler in self.handlers.read().iter() {
            handler.handle(&event);
        }
        let _ = self.broadcast.send(event);
    }

    pub fn flush(&self) {
        for handler in self.handlers.read().iter() {
            handler.flush();
        }
    }

    /// Run `fut` inside a `start`/`stop`/`exception` span of the given kind.
    pub async fn span<T, E, F>(
        &self,
        kind: SpanKind,
        detail: &str,
        trace_id: Option<&str>,
        fut: F,
    ) -> Result<T, E>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.emit(
            trace_id,
            EventPayload::SpanStart {
                kind,
                system_time: Utc::now(),
                detail: detail.to_string(),
            },
        );
        let started = Instant::now();
        match fut.await {
            Ok(value) => {
                self.emit(
                    trace_id,
                    EventPayload::SpanStop {
                        kind,
                        duration: started.elapsed(),
                        detail: detail.to_string(),
                    },
                );
                Ok(value)
            }
            Err(err) => {
                self.emit(
                    trace_id,
                    EventPayload::SpanException {
                        kind,
                        duration: started.elapsed(),
                        error_kind: "error".to_string(),
                        reason: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }
}

/// Fresh trace id for a run that did not receive one from its caller.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
