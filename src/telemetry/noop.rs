use super::{TelemetryEvent, TelemetryHandler};

/// Discards all telemetry. Useful for tests and hosts that only consume the
/// broadcast stream.
pub struct NoopHandler;

impl TelemetryHandler for NoopHandler {
    fn handle(&self, _event: &TelemetryEvent) {}

    fn name(&self) -> &str {
        "noop"
    }
}
