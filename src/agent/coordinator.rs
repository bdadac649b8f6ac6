//! Singleton coordinator: correlates notifications into insights.
//!
//! One run at a time; `run` calls that arrive while busy queue FIFO. Every
//! suspension point inside a run — LLM calls, waits, operator completions —
//! is guarded by the run deadline, the supervisor token, an explicit
//! `cancel`, and the caller's reply channel, so teardown is orderly no
//! matter which of them fires. Operators invoked by a run are children: the
//! run's end, for any reason, ends them.

use super::context::{Context, RunContext};
use super::operator::{OperatorConfig, OperatorEvent, OperatorHandle};
use super::pipeline;
use super::prompt;
use super::tools::{parse_tool, CoordinatorTool};
use crate::alerts::types::{
    new_id, Insight, Notification, NotificationEntry, NotificationStatus,
};
use crate::error::AgentError;
use crate::providers::{CircuitBreaker, ClientRegistry, LlmGateway};
use crate::skills::SkillRegistry;
use crate::telemetry::{new_trace_id, EventPayload, SpanKind, TelemetryHub};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Iterative tool-calling; can correct course mid-run.
    #[default]
    AgentLoop,
    /// Fixed classify → gather → synthesize; fewer LLM calls, no recovery.
    Pipeline,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_iterations: u32,
    pub deadline: Duration,
    pub llm_timeout: Duration,
    pub compaction_max_tokens: usize,
    pub compaction_keep_last: usize,
    /// Pipeline gather stage poll cadence.
    pub poll_interval: Duration,
    /// Synchronous `message_operator` timeout.
    pub message_timeout: Duration,
    pub operator: OperatorConfig,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            deadline: Duration::from_secs(300),
            llm_timeout: Duration::from_secs(60),
            compaction_max_tokens: 50_000,
            compaction_keep_last: 5,
            poll_interval: Duration::from_millis(500),
            message_timeout: Duration::from_secs(10),
            operator: OperatorConfig::default(),
        }
    }
}

/// Per-invocation options; unset fields fall back to [`CoordinatorSettings`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub notifications: Vec<Notification>,
    /// Restrict which operators this run may invoke.
    pub skills: Option<Vec<String>>,
    pub strategy: Strategy,
    pub max_iterations: Option<u32>,
    pub deadline: Option<Duration>,
    /// Named client override from the registry.
    pub client: Option<String>,
    pub compaction_max_tokens: Option<usize>,
    pub compaction_keep_last: Option<usize>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OperatorRunResult {
    pub skill: String,
    pub notifications: Vec<Notification>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub insights: Vec<Insight>,
    pub operator_results: Vec<OperatorRunResult>,
    /// Final state of the run's inbox, statuses included.
    pub notifications: Vec<NotificationEntry>,
    /// Pipeline strategy's synthesized answer.
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    Idle,
    Running,
}

type RunReply = oneshot::Sender<Result<RunOutcome, AgentError>>;

enum Command {
    Run {
        context: RunContext,
        opts: RunOptions,
        reply: Option<RunReply>,
    },
    Cancel,
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Reinvoke {
        reason: String,
    },
}

struct QueuedRun {
    context: RunContext,
    opts: RunOptions,
    reply: Option<RunReply>,
}

/// Handle to the coordinator worker. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::Sender<Command>,
}

impl Coordinator {
    pub fn spawn(
        skills: SkillRegistry,
        clients: Arc<ClientRegistry>,
        breaker: Arc<CircuitBreaker>,
        telemetry: Arc<TelemetryHub>,
        settings: CoordinatorSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let worker = CoordinatorWorker {
            rx,
            tx: tx.clone(),
            skills,
            clients,
            breaker,
            telemetry,
            settings,
            cancel,
        };
        tokio::spawn(worker.run_loop());
        Self { tx }
    }

    /// One-shot invocation; queues FIFO while another run is in progress.
    pub async fn run(
        &self,
        context: RunContext,
        opts: RunOptions,
    ) -> Result<RunOutcome, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Run {
                context,
                opts,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| AgentError::WorkerCrashed)?;
        reply_rx.await.map_err(|_| AgentError::WorkerCrashed)?
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply: reply_tx })
            .await
            .map_err(|_| AgentError::WorkerCrashed)?;
        reply_rx.await.map_err(|_| AgentError::WorkerCrashed)
    }

    /// Cancel the run in progress, if any.
    pub async fn cancel(&self) -> Result<(), AgentError> {
        self.tx
            .send(Command::Cancel)
            .await
            .map_err(|_| AgentError::WorkerCrashed)
    }
}

struct CoordinatorWorker {
    rx: mpsc::Receiver<Command>,
    tx: mpsc::Sender<Command>,
    skills: SkillRegistry,
    clients: Arc<ClientRegistry>,
    breaker: Arc<CircuitBreaker>,
    telemetry: Arc<TelemetryHub>,
    settings: CoordinatorSettings,
    cancel: CancellationToken,
}

impl CoordinatorWorker {
    async fn run_loop(mut self) {
        let mut pending: VecDeque<QueuedRun> = VecDeque::new();
        loop {
            if let Some(run) = pending.pop_front() {
                self.execute(run, &mut pending).await;
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    None => break,
                    Some(Command::Run { context, opts, reply }) => {
                        pending.push_back(QueuedRun { context, opts, reply });
                    }
                    Some(Command::Cancel) => {}
                    Some(Command::Status { reply }) => {
                        let _ = reply.send(CoordinatorStatus::Idle);
                    }
                    Some(Command::Reinvoke { reason }) => {
                        pending.push_back(QueuedRun {
                            context: RunContext::with_reason(reason),
                            opts: RunOptions::default(),
                            reply: None,
                        });
                    }
                },
            }
        }
    }

    async fn execute(&mut self, run: QueuedRun, pending: &mut VecDeque<QueuedRun>) {
        let QueuedRun {
            context,
            opts,
            reply,
        } = run;
        let trace = opts.trace_id.clone().unwrap_or_else(new_trace_id);

        let registered = match self.clients.get(opts.client.as_deref()) {
            Ok(r) => r.clone(),
            Err(err) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                return;
            }
        };
        let gateway = LlmGateway::new(&registered, self.breaker.clone(), self.telemetry.clone())
            .with_timeout(self.settings.llm_timeout);

        let deadline =
            tokio::time::Instant::now() + opts.deadline.unwrap_or(self.settings.deadline);
        let run_cancel = self.cancel.child_token();
        let (op_tx, op_rx) = mpsc::unbounded_channel();

        let mut state = RunState::new(
            &self.settings,
            &opts,
            &context,
            gateway,
            self.skills.clone(),
            run_cancel.clone(),
            trace.clone(),
            op_tx,
            op_rx,
        );

        let mut reply = reply;
        let strategy = opts.strategy;
        let telemetry = self.telemetry.clone();
        let result = {
            let mut guards = RunGuards {
                rx: &mut self.rx,
                pending,
                reply: &mut reply,
                deadline,
                cancel: self.cancel.clone(),
            };
            telemetry
                .span(SpanKind::Agent, "coordinator", Some(&trace), async {
                    match strategy {
                        Strategy::AgentLoop => agent_loop(&mut state, &mut guards).await,
                        Strategy::Pipeline => pipeline::run(&mut state, &mut guards).await,
                    }
                })
                .await
        };

        // Teardown is unconditional: children never outlive the run.
        run_cancel.cancel();
        state.teardown();

        let outcome = result.map(|()| RunOutcome {
            insights: std::mem::take(&mut state.insights),
            operator_results: std::mem::take(&mut state.operator_results),
            notifications: std::mem::take(&mut state.inbox),
            answer: state.answer.take(),
        });
        if let Some(reply) = reply.take() {
            let _ = reply.send(outcome);
        }

        if let Some((ms, reason)) = state.scheduled.take() {
            let tx = self.tx.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    () = tokio::time::sleep(Duration::from_millis(ms)) => {
                        let _ = tx.send(Command::Reinvoke { reason }).await;
                    }
                }
            });
        }
    }
}

/// Everything that can interrupt a run, polled around every suspension
/// point: supervisor cancel, deadline, caller death, and worker commands
/// (new runs queue; `Cancel` aborts; `Status` answers `Running`).
pub(super) struct RunGuards<'a> {
    rx: &'a mut mpsc::Receiver<Command>,
    pending: &'a mut VecDeque<QueuedRun>,
    reply: &'a mut Option<RunReply>,
    deadline: tokio::time::Instant,
    cancel: CancellationToken,
}

impl RunGuards<'_> {
    pub(super) async fn guard<F: Future>(&mut self, fut: F) -> Result<F::Output, AgentError> {
        tokio::pin!(fut);
        let Self {
            rx,
            pending,
            reply,
            deadline,
            cancel,
        } = self;
        loop {
            let caller_gone = async {
                match reply.as_mut() {
                    Some(r) => r.closed().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep_until(*deadline) => return Err(AgentError::DeadlineExceeded),
                () = caller_gone => return Err(AgentError::Cancelled),
                cmd = rx.recv() => match cmd {
                    None => return Err(AgentError::Cancelled),
                    Some(Command::Run { context, opts, reply }) => {
                        pending.push_back(QueuedRun { context, opts, reply });
                    }
                    Some(Command::Cancel) => return Err(AgentError::Cancelled),
                    Some(Command::Status { reply }) => {
                        let _ = reply.send(CoordinatorStatus::Running);
                    }
                    // Only an idle coordinator honors a scheduled reinvoke.
                    Some(Command::Reinvoke { .. }) => {}
                },
                out = &mut fut => return Ok(out),
            }
        }
    }
}

struct RunningOperator {
    handle: OperatorHandle,
    started_at: DateTime<Utc>,
}

pub(super) struct RunState {
    pub(super) gateway: LlmGateway,
    pub(super) telemetry: Arc<TelemetryHub>,
    pub(super) skills: SkillRegistry,
    allowed_skills: Option<Vec<String>>,
    pub(super) trace: String,
    pub(super) context: Context,
    pub(super) query: String,
    inbox: Vec<NotificationEntry>,
    pub(super) insights: Vec<Insight>,
    operators: HashMap<String, RunningOperator>,
    pub(super) operator_results: Vec<OperatorRunResult>,
    op_tx: mpsc::UnboundedSender<OperatorEvent>,
    op_rx: mpsc::UnboundedReceiver<OperatorEvent>,
    run_cancel: CancellationToken,
    operator_config: OperatorConfig,
    message_timeout: Duration,
    pub(super) poll_interval: Duration,
    max_iterations: u32,
    pub(super) scheduled: Option<(u64, String)>,
    pub(super) answer: Option<String>,
}

impl RunState {
    #[allow(clippy::too_many_arguments)]
    fn new(
        settings: &CoordinatorSettings,
        opts: &RunOptions,
        context: &RunContext,
        gateway: LlmGateway,
        skills: SkillRegistry,
        run_cancel: CancellationToken,
        trace: String,
        op_tx: mpsc::UnboundedSender<OperatorEvent>,
        op_rx: mpsc::UnboundedReceiver<OperatorEvent>,
    ) -> Self {
        let telemetry = gateway.telemetry().clone();
        let mut operator_config = settings.operator.clone();
        operator_config.compaction_max_tokens = opts
            .compaction_max_tokens
            .unwrap_or(settings.compaction_max_tokens);
        operator_config.compaction_keep_last = opts
            .compaction_keep_last
            .unwrap_or(settings.compaction_keep_last);

        Self {
            context: Context::new(
                opts.compaction_max_tokens
                    .unwrap_or(settings.compaction_max_tokens),
                opts.compaction_keep_last
                    .unwrap_or(settings.compaction_keep_last),
            ),
            query: context.render(),
            inbox: opts
                .notifications
                .iter()
                .cloned()
                .map(NotificationEntry::unread)
                .collect(),
            insights: Vec::new(),
            operators: HashMap::new(),
            operator_results: Vec::new(),
            allowed_skills: opts.skills.clone(),
            max_iterations: opts.max_iterations.unwrap_or(settings.max_iterations),
            message_timeout: settings.message_timeout,
            poll_interval: settings.poll_interval,
            scheduled: None,
            answer: None,
            gateway,
            telemetry,
            skills,
            trace,
            op_tx,
            op_rx,
            run_cancel,
            operator_config,
        }
    }

    pub(super) fn available_skill_ids(&self) -> Vec<String> {
        match &self.allowed_skills {
            Some(allowed) => self
                .skills
                .ids()
                .into_iter()
                .filter(|id| allowed.contains(id))
                .collect(),
            None => self.skills.ids(),
        }
    }

    pub(super) fn operators_running(&self) -> usize {
        self.operators.len()
    }

    pub(super) fn inbox_notifications(&self) -> Vec<&Notification> {
        self.inbox.iter().map(|e| &e.notification).collect()
    }

    pub(super) fn unread_count(&self) -> usize {
        self.inbox
            .iter()
            .filter(|e| e.status == NotificationStatus::Unread)
            .count()
    }

    fn ingest(&mut self, notification: Notification) {
        if !self
            .inbox
            .iter()
            .any(|e| e.notification.id == notification.id)
        {
            self.inbox.push(NotificationEntry::unread(notification));
        }
    }

    /// Resolve exactly the named notifications; others keep their status.
    pub(super) fn resolve(&mut self, ids: &[String]) {
        for entry in &mut self.inbox {
            if ids.contains(&entry.notification.id) {
                entry.advance(NotificationStatus::Resolved);
            }
        }
    }

    /// Spawn one operator child and start its async run.
    pub(super) async fn spawn_operator(
        &mut self,
        skill_id: &str,
        operator_context: String,
    ) -> Result<(), String> {
        if self.operators.contains_key(skill_id) {
            return Err(format!("operator {skill_id} already running"));
        }
        if !self
            .available_skill_ids()
            .iter()
            .any(|id| id == skill_id)
        {
            return Err(format!("unknown or restricted skill {skill_id}"));
        }
        let Some(skill) = self.skills.get(skill_id) else {
            return Err(format!("unknown skill {skill_id}"));
        };

        let handle = OperatorHandle::spawn(
            skill,
            self.gateway.clone(),
            self.operator_config.clone(),
            self.run_cancel.child_token(),
        );
        let mut ctx = RunContext::new();
        if !operator_context.is_empty() {
            ctx.insert("reason", operator_context);
        }
        handle
            .run_async(ctx, Some(self.trace.clone()), self.op_tx.clone())
            .await
            .map_err(|err| err.to_string())?;

        if let Some(join) = handle.take_join() {
            let tx = self.op_tx.clone();
            let skill_name = skill_id.to_string();
            tokio::spawn(async move {
                if join.await.is_err() {
                    let _ = tx.send(OperatorEvent::Crashed { skill: skill_name });
                }
            });
        }

        self.operators.insert(
            skill_id.to_string(),
            RunningOperator {
                handle,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Merge completed operator work without blocking.
    pub(super) fn drain_operator_events(&mut self) {
        while let Ok(event) = self.op_rx.try_recv() {
            self.handle_operator_event(event);
        }
    }

    fn handle_operator_event(&mut self, event: OperatorEvent) {
        match event {
            OperatorEvent::Notification {
                notification, ..
            } => {
                self.ingest(notification);
            }
            OperatorEvent::Complete { skill, result } => {
                if self.operators.remove(&skill).is_none() {
                    return;
                }
                match result {
                    Ok(notifications) => {
                        self.telemetry.emit(
                            Some(&self.trace),
                            EventPayload::CoordinatorOperatorComplete {
                                skill: skill.clone(),
                                notifications: notifications.len(),
                            },
                        );
                        for n in &notifications {
                            self.ingest(n.clone());
                        }
                        self.operator_results.push(OperatorRunResult {
                            skill,
                            notifications,
                            error: None,
                        });
                    }
                    Err(err) => {
                        self.telemetry.emit(
                            Some(&self.trace),
                            EventPayload::CoordinatorOperatorComplete {
                                skill: skill.clone(),
                                notifications: 0,
                            },
                        );
                        self.operator_results.push(OperatorRunResult {
                            skill,
                            notifications: Vec::new(),
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
            OperatorEvent::Crashed { skill } => {
                if self.operators.remove(&skill).is_none() {
                    return;
                }
                self.telemetry.emit(
                    Some(&self.trace),
                    EventPayload::CoordinatorOperatorCrashed {
                        skill: skill.clone(),
                    },
                );
                self.operator_results.push(OperatorRunResult {
                    skill,
                    notifications: Vec::new(),
                    error: Some("operator crashed".to_string()),
                });
            }
        }
    }

    /// Block (guarded) until every child operator has reported back.
    pub(super) async fn await_operators(
        &mut self,
        guards: &mut RunGuards<'_>,
    ) -> Result<(), AgentError> {
        while !self.operators.is_empty() {
            let event = guards.guard(self.op_rx.recv()).await?;
            match event {
                Some(event) => self.handle_operator_event(event),
                None => break,
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        for (_, op) in self.operators.drain() {
            op.handle.stop();
        }
    }

    fn notifications_view(&self, status: Option<NotificationStatus>) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .inbox
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(|e| {
                json!({
                    "id": e.notification.id,
                    "operator": e.notification.operator,
                    "anomaly_type": e.notification.anomaly_type,
                    "severity": e.notification.severity,
                    "status": e.status,
                    "context": e.notification.context,
                    "observation": e.notification.observation,
                    "hypothesis": e.notification.hypothesis,
                })
            })
            .collect();
        json!({ "notifications": entries })
    }
}

/// The iterative tool-calling strategy.
pub(super) async fn agent_loop(
    state: &mut RunState,
    guards: &mut RunGuards<'_>,
) -> Result<(), AgentError> {
    let system_prompt = prompt::coordinator_system_prompt(&state.available_skill_ids());
    let query = state.query.clone();
    state.context.push_user(query);

    let mut iteration = 0u32;
    loop {
        state.drain_operator_events();

        if iteration >= state.max_iterations {
            state.telemetry.emit(
                Some(&state.trace),
                EventPayload::CoordinatorMaxIterations {
                    iterations: iteration,
                },
            );
            // No further LLM calls, but running operators are still awaited.
            state.await_operators(guards).await?;
            state.drain_operator_events();
            if state.unread_count() > 0 {
                state.context.push_tool(
                    json!({
                        "warning": format!(
                            "run ended at max iterations with {} unread notifications",
                            state.unread_count()
                        )
                    })
                    .to_string(),
                );
            }
            return Ok(());
        }

        iteration += 1;
        state.telemetry.emit(
            Some(&state.trace),
            EventPayload::CoordinatorIterationStart { iteration },
        );

        let rendered = state.context.render();
        let llm_result = guards
            .guard(
                state
                    .gateway
                    .complete(Some(&system_prompt), &rendered, Some(&state.trace)),
            )
            .await?;
        let reply = match llm_result {
            Ok(reply) => reply,
            Err(err) => {
                state.telemetry.emit(
                    Some(&state.trace),
                    EventPayload::CoordinatorLlmError {
                        reason: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        let tool = match parse_tool::<CoordinatorTool>(&reply) {
            Ok(tool) => tool,
            Err(AgentError::SchemaInvalid(msg)) => {
                state
                    .context
                    .push_tool(json!({ "error": format!("schema: {msg}") }).to_string());
                continue;
            }
            Err(other) => return Err(other),
        };

        match tool {
            CoordinatorTool::GetNotifications { status } => {
                let view = state.notifications_view(status);
                state.context.push_tool(view.to_string());
            }
            CoordinatorTool::UpdateNotificationStatuses { ids, status, reason } => {
                let mut updated = 0usize;
                for id in &ids {
                    // Missing ids are silently skipped.
                    if let Some(entry) =
                        state.inbox.iter_mut().find(|e| e.notification.id == *id)
                    {
                        entry.advance(status);
                        updated += 1;
                    }
                }
                state.context.push_tool(
                    json!({ "updated": updated, "reason": reason }).to_string(),
                );
            }
            CoordinatorTool::ProduceInsight {
                notification_ids,
                correlation_type,
                summary,
                root_cause_hypothesis,
                matched_observations,
                hypothesis_grounded,
                confidence,
            } => {
                let unknown: Vec<&String> = notification_ids
                    .iter()
                    .filter(|id| !state.inbox.iter().any(|e| e.notification.id == **id))
                    .collect();
                if !unknown.is_empty() {
                    state.context.push_tool(
                        json!({
                            "error": format!("unknown notification ids: {unknown:?}")
                        })
                        .to_string(),
                    );
                    continue;
                }

                let insight = Insight {
                    id: new_id(),
                    notification_ids: notification_ids.clone(),
                    correlation_type,
                    summary,
                    root_cause_hypothesis,
                    matched_observations,
                    hypothesis_grounded,
                    confidence,
                    created_at: Utc::now(),
                };
                for id in &notification_ids {
                    if let Some(entry) =
                        state.inbox.iter_mut().find(|e| e.notification.id == *id)
                    {
                        entry.advance(NotificationStatus::Resolved);
                    }
                }
                state.telemetry.emit(
                    Some(&state.trace),
                    EventPayload::CoordinatorInsightProduced {
                        insight_id: insight.id.clone(),
                        notification_ids,
                    },
                );
                state
                    .context
                    .push_tool(json!({ "insight_id": insight.id }).to_string());
                state.insights.push(insight);
            }
            CoordinatorTool::Think { thought } => {
                state.context.push_assistant(thought);
                state
                    .context
                    .push_tool(json!({ "status": "noted" }).to_string());
            }
            CoordinatorTool::InvokeOperators { skills, context } => {
                let mut invoked = Vec::new();
                let mut errors = Vec::new();
                let mut seen = std::collections::HashSet::new();
                for skill in skills {
                    if !seen.insert(skill.clone()) {
                        continue;
                    }
                    match state.spawn_operator(&skill, context.clone()).await {
                        Ok(()) => invoked.push(skill),
                        Err(err) => errors.push(err),
                    }
                }
                state.context.push_tool(
                    json!({ "invoked": invoked, "errors": errors }).to_string(),
                );
            }
            CoordinatorTool::MessageOperator { skill, message } => {
                let result = match state.operators.get(&skill) {
                    Some(op) => {
                        let fut = tokio::time::timeout(
                            state.message_timeout,
                            op.handle.message(message),
                        );
                        match guards.guard(fut).await? {
                            Ok(Ok(answer)) => json!({ "reply": answer }),
                            Ok(Err(err)) => json!({ "error": err.to_string() }),
                            Err(_) => json!({ "error": "operator reply timed out" }),
                        }
                    }
                    None => json!({ "error": format!("operator {skill} is not running") }),
                };
                state.context.push_tool(result.to_string());
            }
            CoordinatorTool::GetOperatorStatuses => {
                let mut statuses: Vec<serde_json::Value> = state
                    .operators
                    .iter()
                    .map(|(skill, op)| {
                        json!({
                            "skill": skill,
                            "status": "running",
                            "started_at": op.started_at.to_rfc3339(),
                        })
                    })
                    .collect();
                statuses.sort_by_key(|v| v["skill"].as_str().unwrap_or_default().to_string());
                state
                    .context
                    .push_tool(json!({ "operators": statuses }).to_string());
            }
            CoordinatorTool::Schedule { ms, reason } => {
                if state.operators_running() > 0 {
                    state.telemetry.emit(
                        Some(&state.trace),
                        EventPayload::CoordinatorScheduleRejected {
                            running: state.operators_running(),
                        },
                    );
                    state.context.push_tool(
                        json!({
                            "error": format!(
                                "cannot schedule: {} operators still running",
                                state.operators_running()
                            )
                        })
                        .to_string(),
                    );
                    continue;
                }
                state.scheduled = Some((ms, reason));
                return Ok(());
            }
            CoordinatorTool::Wait { ms } => {
                guards
                    .guard(tokio::time::sleep(Duration::from_millis(ms)))
                    .await?;
                state
                    .context
                    .push_tool(json!({ "status": "waited", "ms": ms }).to_string());
            }
            CoordinatorTool::Done => {
                state.drain_operator_events();
                if state.operators_running() > 0 {
                    state.telemetry.emit(
                        Some(&state.trace),
                        EventPayload::CoordinatorDoneRejected {
                            running: state.operators_running(),
                        },
                    );
                    state.context.push_tool(
                        json!({
                            "error": format!(
                                "{} operators still running; wait for them before done",
                                state.operators_running()
                            )
                        })
                        .to_string(),
                    );
                    continue;
                }
                state.telemetry.emit(
                    Some(&state.trace),
                    EventPayload::CoordinatorDone {
                        iterations: iteration,
                    },
                );
                return Ok(());
            }
        }

        let gateway = state.gateway.clone();
        let _ = state.context.compact(&gateway, Some(&state.trace)).await;
    }
}
