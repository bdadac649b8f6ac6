#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

//! BeamLens: a runtime self-observation agent embedded in a host
//! application. Operators run a bounded, read-only LLM tool loop over one
//! monitored domain each; the coordinator correlates their notifications
//! into insights. A circuit breaker guards every LLM call, a statistical
//! detector and LLM-backed watchers turn metric streams into anomaly
//! signals, and a cron scheduler drives the periodic work.

pub mod agent;
pub mod alerts;
pub mod config;
pub mod cron;
pub mod error;
pub mod monitor;
pub mod providers;
pub mod runtime;
pub mod skills;
pub mod telemetry;
pub mod watch;

pub use agent::{
    Coordinator, CoordinatorStatus, OperatorConfig, OperatorEvent, RunContext, RunOptions,
    RunOutcome, Strategy,
};
pub use alerts::{
    AlertQueue, Confidence, CorrelationType, Insight, MetricSnapshot, Notification,
    NotificationStatus, Severity,
};
pub use config::Config;
pub use error::AgentError;
pub use providers::{BreakerState, ChatClient, CircuitBreaker, ClientRegistry};
pub use runtime::{BeamLens, InvestigateOutcome};
pub use skills::{Skill, SkillRegistry};
pub use telemetry::{TelemetryEvent, TelemetryHub};
pub use watch::{WatcherStatus, WatcherTickOutcome};
