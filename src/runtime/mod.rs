//! Supervisor: wires every worker together and exposes the public API.
//!
//! `BeamLens::start` builds the telemetry hub, breaker, client registry,
//! skill registry, alert queue, optional statistical monitor, watchers with
//! their cron schedules, the optional cluster forwarder, and the
//! coordinator — all under one root cancellation token. `shutdown` cancels
//! that token; workers flush and exit at their next suspension point.

use crate::agent::{
    Coordinator, CoordinatorStatus, OperatorConfig, OperatorEvent, OperatorHandle, RunContext,
    RunOptions, RunOutcome,
};
use crate::alerts::{
    AlertEvent, AlertQueue, ClusterForwarder, ClusterTransport, MqttTransport,
};
use crate::config::{Config, TriggerMode};
use crate::cron::{ScheduleEntry, ScheduleHandler, Scheduler};
use crate::error::AgentError;
use crate::monitor::AnomalyDetector;
use crate::providers::{
    BreakerSnapshot, CircuitBreaker, ClientRegistry, LlmGateway,
};
use crate::skills::SkillRegistry;
use crate::telemetry::{EventPayload, LogHandler, TelemetryHub};
use crate::watch::{WatcherHandle, WatcherStatus, WatcherTickOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result of `investigate`: either nothing was pending, or the coordinator's
/// analysis of the drained alerts.
#[derive(Debug)]
pub enum InvestigateOutcome {
    NoAlerts,
    Analysis(RunOutcome),
}

pub struct BeamLens {
    telemetry: Arc<TelemetryHub>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<AlertQueue>,
    skills: SkillRegistry,
    clients: Arc<ClientRegistry>,
    coordinator: Coordinator,
    watchers: HashMap<String, WatcherHandle>,
    scheduler: Scheduler,
    operators: parking_lot::Mutex<HashMap<String, Arc<OperatorHandle>>>,
    operator_config: OperatorConfig,
    llm_timeout: Duration,
    cancel: CancellationToken,
}

impl BeamLens {
    /// Bring up the supervisor tree from configuration.
    pub async fn start(config: Config) -> Result<Self, AgentError> {
        let clients = config.build_client_registry()?;
        Self::start_with_clients(config, clients).await
    }

    /// Same as [`start`](Self::start) but with an externally built client
    /// registry — the entry point for tests and custom transports.
    pub async fn start_with_clients(
        config: Config,
        clients: ClientRegistry,
    ) -> Result<Self, AgentError> {
        let telemetry = TelemetryHub::new();
        telemetry.register(Arc::new(LogHandler::new()));
        let cancel = CancellationToken::new();

        let breaker = CircuitBreaker::new(config.breaker_settings(), telemetry.clone());
        let queue = match config.alert_queue_capacity {
            Some(capacity) => AlertQueue::with_capacity(telemetry.clone(), capacity),
            None => AlertQueue::new(telemetry.clone()),
        };
        let skills = config.build_skill_registry()?;
        let clients = Arc::new(clients);
        let llm_timeout = Duration::from_millis(config.agent.llm_timeout_ms);
        let operator_config = config.operator_config();

        let coordinator = Coordinator::spawn(
            skills.clone(),
            clients.clone(),
            breaker.clone(),
            telemetry.clone(),
            config.coordinator_settings(),
            cancel.child_token(),
        );

        if config.monitor.enabled {
            AnomalyDetector::new(
                config.detector_settings(),
                skills.clone(),
                queue.clone(),
                telemetry.clone(),
            )
            .spawn(cancel.child_token());
        }

        let gateway = |registered: &crate::providers::RegisteredClient| {
            LlmGateway::new(registered, breaker.clone(), telemetry.clone())
                .with_timeout(llm_timeout)
        };
        let primary = clients.get(None)?.clone();

        let mut watchers = HashMap::new();
        let mut entries = Vec::new();
        for wc in config.watcher_configs() {
            let skill = skills.get(&wc.skill).ok_or_else(|| {
                AgentError::Config(format!("watcher {} names unknown skill {}", wc.name, wc.skill))
            })?;
            let handle = WatcherHandle::spawn(
                wc.clone(),
                skill,
                gateway(&primary),
                queue.clone(),
                operator_config.clone(),
                cancel.child_token(),
            );
            entries.push(ScheduleEntry::new(
                wc.name.clone(),
                wc.cron.clone(),
                watcher_schedule_handler(handle.clone()),
            ));
            watchers.insert(wc.name.clone(), handle);
        }
        let scheduler = Scheduler::start(entries, telemetry.clone(), cancel.child_token())?;

        if config.alert_handler.trigger == TriggerMode::OnAlert {
            spawn_alert_consumer(
                queue.clone(),
                coordinator.clone(),
                telemetry.clone(),
                cancel.child_token(),
            );
        }

        if config.cluster.enabled {
            if let Some(host) = &config.cluster.mqtt_host {
                let node = config
                    .cluster
                    .node
                    .clone()
                    .unwrap_or_else(crate::alerts::types::local_node);
                let transport: Arc<dyn ClusterTransport> = MqttTransport::connect(
                    host,
                    config.cluster.mqtt_port,
                    &node,
                    cancel.child_token(),
                );
                ClusterForwarder::spawn(
                    node,
                    transport,
                    telemetry.clone(),
                    queue.clone(),
                    cancel.child_token(),
                );
            }
        }

        Ok(Self {
            telemetry,
            breaker,
            queue,
            skills,
            clients,
            coordinator,
            watchers,
            scheduler,
            operators: parking_lot::Mutex::new(HashMap::new()),
            operator_config,
            llm_timeout,
            cancel,
        })
    }

    fn gateway(&self, client: Option<&str>) -> Result<LlmGateway, AgentError> {
        let registered = self.clients.get(client)?;
        Ok(
            LlmGateway::new(registered, self.breaker.clone(), self.telemetry.clone())
                .with_timeout(self.llm_timeout),
        )
    }

    /// Long-lived operator registry keyed by skill: spawned on first use,
    /// reused afterwards.
    fn operator_for(&self, skill_id: &str) -> Result<Arc<OperatorHandle>, AgentError> {
        if let Some(handle) = self.operators.lock().get(skill_id) {
            return Ok(handle.clone());
        }
        let skill = self
            .skills
            .get(skill_id)
            .ok_or_else(|| AgentError::NotFound(format!("skill {skill_id}")))?;
        let handle = Arc::new(OperatorHandle::spawn(
            skill,
            self.gateway(None)?,
            self.operator_config.clone(),
            self.cancel.child_token(),
        ));
        self.operators
            .lock()
            .insert(skill_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// One-shot coordinator invocation.
    pub async fn run(
        &self,
        context: RunContext,
        opts: RunOptions,
    ) -> Result<RunOutcome, AgentError> {
        self.coordinator.run(context, opts).await
    }

    /// Fire-and-forget operator invocation; notifications and the final
    /// result arrive as [`OperatorEvent`]s on the returned receiver.
    pub async fn run_async(
        &self,
        skill: &str,
        context: RunContext,
    ) -> Result<mpsc::UnboundedReceiver<OperatorEvent>, AgentError> {
        let operator = self.operator_for(skill)?;
        let (tx, rx) = mpsc::unbounded_channel();
        operator.run_async(context, None, tx).await?;
        Ok(rx)
    }

    /// Ask a skill's long-lived operator a question outside any tool loop.
    pub async fn message_operator(
        &self,
        skill: &str,
        text: impl Into<String>,
    ) -> Result<String, AgentError> {
        self.operator_for(skill)?.message(text).await
    }

    /// Drain pending alerts and correlate them. `NoAlerts` when the queue
    /// was empty.
    pub async fn investigate(&self) -> Result<InvestigateOutcome, AgentError> {
        let drained = self.queue.take_all();
        if drained.is_empty() {
            return Ok(InvestigateOutcome::NoAlerts);
        }
        let outcome = self
            .coordinator
            .run(
                RunContext::with_reason("investigate pending alerts"),
                RunOptions {
                    notifications: drained,
                    ..RunOptions::default()
                },
            )
            .await?;
        Ok(InvestigateOutcome::Analysis(outcome))
    }

    pub fn pending_alerts(&self) -> bool {
        self.queue.pending()
    }

    pub fn list_watchers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn trigger_watcher(&self, name: &str) -> Result<WatcherTickOutcome, AgentError> {
        let watcher = self
            .watchers
            .get(name)
            .ok_or_else(|| AgentError::NotFound(format!("watcher {name}")))?;
        watcher.trigger().await
    }

    pub async fn watcher_status(&self, name: &str) -> Result<WatcherStatus, AgentError> {
        let watcher = self
            .watchers
            .get(name)
            .ok_or_else(|| AgentError::NotFound(format!("watcher {name}")))?;
        watcher.status().await
    }

    /// Fire a schedule by name, respecting the overlap guard.
    pub async fn run_schedule_now(&self, name: &str) -> Result<(), AgentError> {
        self.scheduler.run_now(name).await
    }

    pub fn circuit_breaker_state(&self) -> BreakerSnapshot {
        self.breaker.state()
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    pub async fn coordinator_status(&self) -> Result<CoordinatorStatus, AgentError> {
        self.coordinator.status().await
    }

    pub fn telemetry(&self) -> &Arc<TelemetryHub> {
        &self.telemetry
    }

    pub fn alert_queue(&self) -> &Arc<AlertQueue> {
        &self.queue
    }

    /// Cancel every worker and flush telemetry. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.telemetry.flush();
    }
}

impl Drop for BeamLens {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn watcher_schedule_handler(watcher: WatcherHandle) -> ScheduleHandler {
    Arc::new(move || {
        let watcher = watcher.clone();
        Box::pin(async move {
            watcher.trigger().await?;
            Ok(())
        }) as crate::cron::HandlerFuture
    })
}

/// `on_alert` mode: every push wakes this consumer, which drains the queue
/// and hands the batch to the coordinator.
fn spawn_alert_consumer(
    queue: Arc<AlertQueue>,
    coordinator: Coordinator,
    telemetry: Arc<TelemetryHub>,
    cancel: CancellationToken,
) {
    let mut rx = queue.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(AlertEvent::Available { notification }) = event else {
                        break;
                    };
                    let drained = queue.take_all();
                    if drained.is_empty() {
                        continue;
                    }
                    telemetry.emit(
                        None,
                        EventPayload::AlertHandlerTriggered {
                            notification_id: notification.id,
                        },
                    );
                    let result = coordinator
                        .run(
                            RunContext::with_reason("alert received"),
                            RunOptions {
                                notifications: drained,
                                ..RunOptions::default()
                            },
                        )
                        .await;
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "alert-triggered investigation failed");
                    }
                }
            }
        }
    });
}
