//! Per-skill operator: a long-lived worker running the LLM tool loop over
//! one monitored domain.
//!
//! One command at a time: a run owns the worker until it finishes. Out-of-band
//! `message` questions and `stop` are observed at tool boundaries, as is
//! cancellation (token or the caller going away). Every LLM call goes through
//! the breaker-gated gateway.

use super::context::{Context, RunContext};
use super::prompt;
use super::tools::{parse_tool, OperatorTool};
use crate::alerts::types::{MetricSnapshot, Notification, NotificationBuilder};
use crate::error::AgentError;
use crate::providers::LlmGateway;
use crate::skills::{run_callback, Skill};
use crate::telemetry::{new_trace_id, EventPayload, SpanKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub max_iterations: u32,
    pub callback_timeout: Duration,
    pub compaction_max_tokens: usize,
    pub compaction_keep_last: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            callback_timeout: Duration::from_secs(5),
            compaction_max_tokens: 50_000,
            compaction_keep_last: 5,
        }
    }
}

/// Messages an async run delivers to its requester.
#[derive(Debug)]
pub enum OperatorEvent {
    /// A notification produced mid-run, delivered immediately.
    Notification {
        skill: String,
        notification: Notification,
    },
    Complete {
        skill: String,
        result: Result<Vec<Notification>, AgentError>,
    },
    Crashed {
        skill: String,
    },
}

enum OperatorCommand {
    Run {
        context: RunContext,
        trace_id: Option<String>,
        reply: oneshot::Sender<Result<Vec<Notification>, AgentError>>,
    },
    RunAsync {
        context: RunContext,
        trace_id: Option<String>,
        events: mpsc::UnboundedSender<OperatorEvent>,
    },
    Message {
        text: String,
        reply: oneshot::Sender<Result<String, AgentError>>,
    },
    Stop,
}

/// Which channel tells us the caller still exists.
enum CallerProbe<'a> {
    Reply(&'a oneshot::Sender<Result<Vec<Notification>, AgentError>>),
    Events(&'a mpsc::UnboundedSender<OperatorEvent>),
}

impl CallerProbe<'_> {
    fn is_alive(&self) -> bool {
        match self {
            Self::Reply(tx) => !tx.is_closed(),
            Self::Events(tx) => !tx.is_closed(),
        }
    }
}

pub struct OperatorHandle {
    skill_id: String,
    tx: mpsc::Sender<OperatorCommand>,
    cancel: CancellationToken,
    join: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl OperatorHandle {
    pub fn spawn(
        skill: Arc<dyn Skill>,
        gateway: LlmGateway,
        config: OperatorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let skill_id = skill.id().to_string();
        let system_prompt = prompt::operator_system_prompt(&skill);
        let worker = OperatorWorker {
            skill,
            gateway,
            config,
            cancel: cancel.clone(),
            rx,
            system_prompt,
        };
        let join = tokio::spawn(worker.run());
        Self {
            skill_id,
            tx,
            cancel,
            join: parking_lot::Mutex::new(Some(join)),
        }
    }

    pub fn skill_id(&self) -> &str {
        &self.skill_id
    }

    /// Blocking one-shot investigation.
    pub async fn run(
        &self,
        context: RunContext,
        trace_id: Option<String>,
    ) -> Result<Vec<Notification>, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(OperatorCommand::Run {
                context,
                trace_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AgentError::WorkerCrashed)?;
        reply_rx.await.map_err(|_| AgentError::WorkerCrashed)?
    }

    /// Fire-and-forget; the result arrives as [`OperatorEvent::Complete`].
    pub async fn run_async(
        &self,
        context: RunContext,
        trace_id: Option<String>,
        events: mpsc::UnboundedSender<OperatorEvent>,
    ) -> Result<(), AgentError> {
        self.tx
            .send(OperatorCommand::RunAsync {
                context,
                trace_id,
                events,
            })
            .await
            .map_err(|_| AgentError::WorkerCrashed)
    }

    /// Out-of-band question, answered by a single LLM call with no tool loop.
    /// A busy operator answers at its next tool boundary.
    pub async fn message(&self, text: impl Into<String>) -> Result<String, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(OperatorCommand::Message {
                text: text.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| AgentError::WorkerCrashed)?;
        reply_rx.await.map_err(|_| AgentError::WorkerCrashed)?
    }

    /// Cooperative shutdown: observed at the next suspension point.
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = self.tx.try_send(OperatorCommand::Stop);
    }

    /// Take the worker's join handle, for crash monitoring by the owner.
    pub fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().take()
    }
}

struct OperatorWorker {
    skill: Arc<dyn Skill>,
    gateway: LlmGateway,
    config: OperatorConfig,
    cancel: CancellationToken,
    rx: mpsc::Receiver<OperatorCommand>,
    system_prompt: String,
}

impl OperatorWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.rx.recv() => {
                    match cmd {
                        None => break,
                        Some(OperatorCommand::Run { context, trace_id, reply }) => {
                            let result = self
                                .execute_run(context, trace_id, None, CallerProbe::Reply(&reply))
                                .await;
                            let _ = reply.send(result);
                        }
                        Some(OperatorCommand::RunAsync { context, trace_id, events }) => {
                            let result = self
                                .execute_run(
                                    context,
                                    trace_id,
                                    Some(&events),
                                    CallerProbe::Events(&events),
                                )
                                .await;
                            let _ = events.send(OperatorEvent::Complete {
                                skill: self.skill.id().to_string(),
                                result,
                            });
                        }
                        Some(OperatorCommand::Message { text, reply }) => {
                            let result = self.answer_message(&text).await;
                            let _ = reply.send(result);
                        }
                        Some(OperatorCommand::Stop) => break,
                    }
                }
            }
        }
    }

    async fn answer_message(&self, text: &str) -> Result<String, AgentError> {
        self.gateway
            .complete(Some(&self.system_prompt), text, None)
            .await
    }

    async fn execute_run(
        &mut self,
        context: RunContext,
        trace_id: Option<String>,
        events: Option<&mpsc::UnboundedSender<OperatorEvent>>,
        caller: CallerProbe<'_>,
    ) -> Result<Vec<Notification>, AgentError> {
        let trace = trace_id.unwrap_or_else(new_trace_id);
        let telemetry = self.gateway.telemetry().clone();
        let detail = format!("operator:{}", self.skill.id());
        let skill_id = self.skill.id().to_string();

        let run = self.tool_loop(&context, &trace, events, &caller);
        let result = telemetry
            .span(SpanKind::Agent, &detail, Some(&trace), run)
            .await;

        if matches!(result, Err(AgentError::Cancelled)) {
            telemetry.emit(
                Some(&trace),
                EventPayload::OperatorCancelled { skill: skill_id },
            );
        }
        result
    }

    async fn tool_loop(
        &mut self,
        run_context: &RunContext,
        trace: &str,
        events: Option<&mpsc::UnboundedSender<OperatorEvent>>,
        caller: &CallerProbe<'_>,
    ) -> Result<Vec<Notification>, AgentError> {
        let telemetry = self.gateway.telemetry().clone();
        let mut ctx = Context::new(
            self.config.compaction_max_tokens,
            self.config.compaction_keep_last,
        );
        ctx.push_user(run_context.render());

        let mut notifications: Vec<Notification> = Vec::new();
        let mut snapshots: Vec<MetricSnapshot> = Vec::new();
        let mut iteration = 0u32;

        loop {
            if iteration >= self.config.max_iterations {
                // Not an error: the run finishes with whatever it gathered.
                telemetry.emit(
                    Some(trace),
                    EventPayload::OperatorMaxIterationsReached {
                        skill: self.skill.id().to_string(),
                        iterations: iteration,
                    },
                );
                break;
            }

            // Tool boundary: cancellation, caller death, side commands.
            if self.cancel.is_cancelled() || !caller.is_alive() {
                return Err(AgentError::Cancelled);
            }
            self.drain_side_commands().await;
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            iteration += 1;
            let rendered = ctx.render();
            let reply = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.gateway.complete(Some(&self.system_prompt), &rendered, Some(trace)) => r?,
            };

            let tool = match parse_tool::<OperatorTool>(&reply) {
                Ok(tool) => tool,
                Err(AgentError::SchemaInvalid(msg)) => {
                    // Recoverable: the parse error becomes the next
                    // observation and consumes an iteration.
                    ctx.push_tool(json!({ "error": format!("schema: {msg}") }).to_string());
                    continue;
                }
                Err(other) => return Err(other),
            };

            match tool {
                OperatorTool::TakeSnapshot => {
                    let snapshot: Result<MetricSnapshot, AgentError> = telemetry
                        .span(SpanKind::Tool, "take_snapshot", Some(trace), async {
                            Ok(MetricSnapshot::new(self.skill.id(), self.skill.snapshot()))
                        })
                        .await;
                    if let Ok(snapshot) = snapshot {
                        ctx.push_tool(json!({ "snapshot": snapshot.metrics }).to_string());
                        snapshots.push(snapshot);
                    }
                }
                OperatorTool::RunCallback { name, args } => {
                    let outcome = telemetry
                        .span(SpanKind::Tool, &name, Some(trace), async {
                            run_callback(&self.skill, &name, args, self.config.callback_timeout)
                                .await
                        })
                        .await;
                    let result = match outcome {
                        Ok(value) => json!({ "result": value }),
                        Err(err) => json!({ "error": err.to_string() }),
                    };
                    ctx.push_tool(result.to_string());
                }
                OperatorTool::SendNotification {
                    anomaly_type,
                    severity,
                    context: fact_context,
                    observation,
                    hypothesis,
                } => {
                    let notification = NotificationBuilder::new(self.skill.id(), anomaly_type)
                        .severity(severity)
                        .context(fact_context)
                        .observation(observation)
                        .hypothesis(hypothesis)
                        .snapshots(snapshots.clone())
                        .build();
                    if let Some(events) = events {
                        let _ = events.send(OperatorEvent::Notification {
                            skill: self.skill.id().to_string(),
                            notification: notification.clone(),
                        });
                    }
                    ctx.push_tool(
                        json!({ "status": "sent", "id": notification.id }).to_string(),
                    );
                    notifications.push(notification);
                }
                OperatorTool::Think { thought } => {
                    ctx.push_assistant(thought);
                    ctx.push_tool(json!({ "status": "noted" }).to_string());
                }
                OperatorTool::Wait { ms } => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                        () = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                    ctx.push_tool(json!({ "status": "waited", "ms": ms }).to_string());
                }
                OperatorTool::Finish => break,
            }

            let _ = ctx.compact(&self.gateway, Some(trace)).await;
        }

        Ok(notifications)
    }

    /// Handle commands that arrived while a run holds the worker. Messages
    /// are answered inline; a queued run cannot start and is refused.
    async fn drain_side_commands(&mut self) {
        loop {
            let cmd = match self.rx.try_recv() {
                Ok(cmd) => cmd,
                Err(_) => return,
            };
            match cmd {
                OperatorCommand::Message { text, reply } => {
                    let result = self.answer_message(&text).await;
                    let _ = reply.send(result);
                }
                OperatorCommand::Stop => self.cancel.cancel(),
                OperatorCommand::Run { reply, .. } => {
                    let _ = reply.send(Err(AgentError::AlreadyRunning));
                }
                OperatorCommand::RunAsync { events, .. } => {
                    let _ = events.send(OperatorEvent::Complete {
                        skill: self.skill.id().to_string(),
                        result: Err(AgentError::AlreadyRunning),
                    });
                }
            }
        }
    }
}
