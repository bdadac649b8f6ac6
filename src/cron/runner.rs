//! Cron-driven schedule workers.
//!
//! One supervised worker per entry: sleep until the next occurrence, fire the
//! handler under a watchdog, refuse to overlap a still-running handler.

use super::schedule::{next_occurrence, validate_expression};
use crate::error::AgentError;
use crate::telemetry::{EventPayload, TelemetryHub};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type ScheduleHandler = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

pub struct ScheduleEntry {
    pub name: String,
    pub expr: String,
    pub handler: ScheduleHandler,
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        expr: impl Into<String>,
        handler: ScheduleHandler,
    ) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
            handler,
        }
    }
}

enum RunnerCommand {
    RunNow {
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
}

/// Handle over all schedule workers.
pub struct Scheduler {
    workers: HashMap<String, mpsc::Sender<RunnerCommand>>,
}

impl Scheduler {
    /// Validate every expression and spawn one worker per entry.
    pub fn start(
        entries: Vec<ScheduleEntry>,
        telemetry: Arc<TelemetryHub>,
        cancel: CancellationToken,
    ) -> Result<Self, AgentError> {
        let mut workers = HashMap::new();
        for entry in entries {
            validate_expression(&entry.expr)
                .map_err(|err| AgentError::Config(format!("schedule {}: {err}", entry.name)))?;
            let (tx, rx) = mpsc::channel(4);
            let name = entry.name.clone();
            spawn_worker(entry, rx, telemetry.clone(), cancel.child_token());
            workers.insert(name, tx);
        }
        Ok(Self { workers })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fire a schedule immediately. `AlreadyRunning` when its handler is
    /// still in flight, `NotFound` for unknown names.
    pub async fn run_now(&self, name: &str) -> Result<(), AgentError> {
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| AgentError::NotFound(format!("schedule {name}")))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .send(RunnerCommand::RunNow { reply: reply_tx })
            .await
            .map_err(|_| AgentError::WorkerCrashed)?;
        reply_rx.await.map_err(|_| AgentError::WorkerCrashed)?
    }
}

fn spawn_worker(
    entry: ScheduleEntry,
    mut rx: mpsc::Receiver<RunnerCommand>,
    telemetry: Arc<TelemetryHub>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut running: Option<JoinHandle<()>> = None;

        loop {
            let sleep_duration = match next_occurrence(&entry.expr, Utc::now()) {
                Ok(next) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                Err(err) => {
                    tracing::error!(schedule = %entry.name, error = %err, "cron evaluation failed");
                    break;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(handle) = running.take() {
                        handle.abort();
                    }
                    break;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(RunnerCommand::RunNow { reply }) => {
                            let result = if is_running(&running) {
                                Err(AgentError::AlreadyRunning)
                            } else {
                                running = Some(fire(&entry, &telemetry));
                                Ok(())
                            };
                            let _ = reply.send(result);
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(sleep_duration) => {
                    if is_running(&running) {
                        telemetry.emit(None, EventPayload::ScheduleSkipped {
                            name: entry.name.clone(),
                            reason: "already_running".to_string(),
                        });
                    } else {
                        running = Some(fire(&entry, &telemetry));
                    }
                }
            }
        }
    })
}

fn is_running(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

/// Spawn the handler under a watchdog that records the outcome, panics
/// included.
fn fire(entry: &ScheduleEntry, telemetry: &Arc<TelemetryHub>) -> JoinHandle<()> {
    telemetry.emit(
        None,
        EventPayload::ScheduleTriggered {
            name: entry.name.clone(),
        },
    );
    let name = entry.name.clone();
    let telemetry = telemetry.clone();
    let inner = tokio::spawn((entry.handler)());
    tokio::spawn(async move {
        let started = Instant::now();
        match inner.await {
            Ok(Ok(())) => telemetry.emit(
                None,
                EventPayload::ScheduleCompleted {
                    name,
                    duration: started.elapsed(),
                },
            ),
            Ok(Err(err)) => telemetry.emit(
                None,
                EventPayload::ScheduleFailed {
                    name,
                    reason: err.to_string(),
                },
            ),
            Err(join_err) => telemetry.emit(
                None,
                EventPayload::ScheduleFailed {
                    name,
                    reason: format!("handler crashed: {join_err}"),
                },
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn counting_handler(count: Arc<Mutex<u32>>, delay: Duration) -> ScheduleHandler {
        Arc::new(move || {
            let count = count.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                *count.lock() += 1;
                Ok(())
            }) as HandlerFuture
        })
    }

    fn scheduler(entries: Vec<ScheduleEntry>) -> (Scheduler, CancellationToken) {
        let cancel = CancellationToken::new();
        let scheduler =
            Scheduler::start(entries, TelemetryHub::new(), cancel.clone()).unwrap();
        (scheduler, cancel)
    }

    #[tokio::test]
    async fn invalid_expressions_fail_startup() {
        let entry = ScheduleEntry::new(
            "bad",
            "not a cron",
            counting_handler(Arc::new(Mutex::new(0)), Duration::ZERO),
        );
        let result = Scheduler::start(vec![entry], TelemetryHub::new(), CancellationToken::new());
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn run_now_fires_and_refuses_overlap() {
        let count = Arc::new(Mutex::new(0));
        let entry = ScheduleEntry::new(
            "tick",
            "0 0 1 1 *",
            counting_handler(count.clone(), Duration::from_millis(100)),
        );
        let (scheduler, cancel) = scheduler(vec![entry]);

        scheduler.run_now("tick").await.unwrap();
        assert_eq!(
            scheduler.run_now("tick").await,
            Err(AgentError::AlreadyRunning)
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*count.lock(), 1);

        // Finished handler no longer counts as running.
        scheduler.run_now("tick").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*count.lock(), 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let (scheduler, cancel) = scheduler(vec![]);
        assert!(matches!(
            scheduler.run_now("ghost").await,
            Err(AgentError::NotFound(_))
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn handler_failure_emits_failed_telemetry() {
        let telemetry = TelemetryHub::new();
        let mut events = telemetry.subscribe();
        let cancel = CancellationToken::new();
        let entry = ScheduleEntry::new(
            "failing",
            "0 0 1 1 *",
            Arc::new(|| {
                Box::pin(async { anyhow::bail!("expected failure") }) as HandlerFuture
            }),
        );
        let scheduler = Scheduler::start(vec![entry], telemetry.clone(), cancel.clone()).unwrap();

        scheduler.run_now("failing").await.unwrap();

        let mut saw_failed = false;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            while let Ok(event) = events.try_recv() {
                if event.name() == "schedule.failed" {
                    saw_failed = true;
                }
            }
            if saw_failed {
                break;
            }
        }
        assert!(saw_failed);
        cancel.cancel();
    }
}
