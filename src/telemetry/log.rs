use super::{EventPayload, TelemetryEvent, TelemetryHandler};
use tracing::info;

/// Log-based handler — renders the catalogue through tracing, zero external
/// deps.
pub struct LogHandler;

impl LogHandler {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetryHandler for LogHandler {
    fn handle(&self, event: &TelemetryEvent) {
        let name = event.name();
        let trace = event.trace_id.as_deref().unwrap_or("-");
        match &event.payload {
            EventPayload::SpanStart { detail, .. } => {
                info!(trace_id = %trace, detail = %detail, "{name}");
            }
            EventPayload::SpanStop {
                duration, detail, ..
            } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                info!(trace_id = %trace, duration_ms = ms, detail = %detail, "{name}");
            }
            EventPayload::SpanException {
                duration,
                error_kind,
                reason,
                ..
            } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                info!(trace_id = %trace, duration_ms = ms, kind = %error_kind, reason = %reason, "{name}");
            }
            EventPayload::AlertFired { notification } => {
                info!(
                    trace_id = %trace,
                    id = %notification.id,
                    operator = %notification.operator,
                    anomaly_type = %notification.anomaly_type,
                    "{name}"
                );
            }
            EventPayload::CircuitStateChange {
                from,
                to,
                failure_count,
                reason,
            } => {
                info!(
                    trace_id = %trace,
                    from = ?from,
                    to = ?to,
                    failure_count = failure_count,
                    reason = ?reason,
                    "{name}"
                );
            }
            other => {
                let fields = serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string());
                info!(trace_id = %trace, fields = %fields, "{name}");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::EventPayload;

    #[test]
    fn log_handler_accepts_every_shape() {
        let handler = LogHandler::new();
        handler.handle(&TelemetryEvent {
            trace_id: Some("t-1".into()),
            payload: EventPayload::MonitorLearningStarted,
        });
        handler.handle(&TelemetryEvent {
            trace_id: None,
            payload: EventPayload::CoordinatorIterationStart { iteration: 3 },
        });
        assert_eq!(handler.name(), "log");
    }
}
