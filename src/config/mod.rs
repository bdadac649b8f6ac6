//! Configuration surface.
//!
//! Everything is deserializable from TOML with per-field defaults, and
//! constructible in code for embedding hosts. Custom skills and storage
//! stats providers cannot come from a file; they are attached with the
//! builder methods.

use crate::agent::{CoordinatorSettings, OperatorConfig};
use crate::error::AgentError;
use crate::monitor::DetectorSettings;
use crate::providers::{create_client, BreakerSettings, ClientRegistry};
use crate::skills::{RuntimeSkill, Skill, SkillRegistry, StorageSkill, StorageStats};
use crate::watch::WatcherConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    pub llm_timeout_ms: u64,
    pub callback_timeout_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            llm_timeout_ms: 60_000,
            callback_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub max_iterations: u32,
    pub deadline_ms: u64,
    pub compaction_max_tokens: usize,
    pub compaction_keep_last: usize,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            deadline_ms: 300_000,
            compaction_max_tokens: 50_000,
            compaction_keep_last: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Invoke the coordinator as alerts arrive.
    #[default]
    OnAlert,
    /// Alerts accumulate until `investigate()` is called.
    Manual,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AlertHandlerSection {
    pub trigger: TriggerMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub enabled: bool,
    pub collection_interval_ms: u64,
    pub learning_duration_ms: u64,
    pub z_threshold: f64,
    pub consecutive_required: u32,
    pub cooldown_ms: u64,
    pub history_minutes: u64,
    pub min_required_samples: usize,
    pub ema_alpha: f64,
    pub persistence_path: Option<PathBuf>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            collection_interval_ms: 30_000,
            learning_duration_ms: 3_600_000,
            z_threshold: 3.0,
            consecutive_required: 3,
            cooldown_ms: 300_000,
            history_minutes: 60,
            min_required_samples: 30,
            ema_alpha: 0.2,
            persistence_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSection {
    pub name: String,
    /// Skill to watch; defaults to the watcher name.
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default = "default_watcher_cron")]
    pub cron: String,
    #[serde(default = "default_min_required_observations")]
    pub min_required_observations: usize,
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,
    #[serde(default = "default_max_observation_age_ms")]
    pub max_observation_age_ms: u64,
    #[serde(default)]
    pub investigate_on_anomaly: bool,
}

fn default_watcher_cron() -> String {
    "*/5 * * * *".to_string()
}

fn default_min_required_observations() -> usize {
    5
}

fn default_max_observations() -> usize {
    60
}

fn default_max_observation_age_ms() -> u64 {
    3_600_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSpec {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    pub api_key_env: Option<String>,
}

impl Default for ClientSpec {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            api_key: None,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientRegistrySection {
    pub primary: String,
    pub clients: Vec<ClientSpec>,
}

impl Default for ClientRegistrySection {
    fn default() -> Self {
        Self {
            primary: "default".to_string(),
            clients: vec![ClientSpec::default()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub enabled: bool,
    /// Node identifier; defaults to the hostname.
    pub node: Option<String>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            node: None,
            mqtt_host: None,
            mqtt_port: 1883,
        }
    }
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Built-in skill names to enable (`"runtime"`, `"storage"`).
    pub skills: Vec<String>,
    pub agent: AgentSection,
    pub coordinator: CoordinatorSection,
    pub alert_handler: AlertHandlerSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub monitor: MonitorSection,
    pub watchers: Vec<WatcherSection>,
    pub client_registry: ClientRegistrySection,
    pub cluster: ClusterSection,
    /// Cap on pending alerts; oldest are dropped beyond it.
    pub alert_queue_capacity: Option<usize>,

    #[serde(skip)]
    custom_skills: Vec<Arc<dyn Skill>>,
    #[serde(skip)]
    storage_stats: Option<Arc<dyn StorageStats>>,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, AgentError> {
        toml::from_str(raw).map_err(|err| AgentError::Config(err.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| AgentError::Config(err.to_string()))?;
        Self::from_toml_str(&raw)
    }

    /// Register a custom skill implementation.
    pub fn with_skill(mut self, skill: Arc<dyn Skill>) -> Self {
        self.custom_skills.push(skill);
        self
    }

    /// Back the built-in `storage` skill with real table stats.
    pub fn with_storage_stats(mut self, stats: Arc<dyn StorageStats>) -> Self {
        self.storage_stats = Some(stats);
        self
    }

    pub fn build_skill_registry(&self) -> Result<SkillRegistry, AgentError> {
        let mut skills: Vec<Arc<dyn Skill>> = Vec::new();
        for name in &self.skills {
            match name.as_str() {
                "runtime" => skills.push(Arc::new(RuntimeSkill::new())),
                "storage" => match &self.storage_stats {
                    Some(stats) => skills.push(Arc::new(StorageSkill::new(stats.clone()))),
                    None => {
                        return Err(AgentError::Config(
                            "storage skill requires with_storage_stats".to_string(),
                        ))
                    }
                },
                other => {
                    return Err(AgentError::Config(format!("unknown built-in skill {other}")))
                }
            }
        }
        skills.extend(self.custom_skills.iter().cloned());
        if skills.is_empty() {
            return Err(AgentError::Config("no skills configured".to_string()));
        }
        Ok(SkillRegistry::new(skills))
    }

    pub fn build_client_registry(&self) -> Result<ClientRegistry, AgentError> {
        let mut registry = ClientRegistry::new(self.client_registry.primary.clone());
        for spec in &self.client_registry.clients {
            let api_key = spec.api_key.clone().or_else(|| {
                spec.api_key_env
                    .as_ref()
                    .and_then(|var| std::env::var(var).ok())
            });
            let client = create_client(&spec.provider, api_key.as_deref())
                .map_err(|err| AgentError::Config(err.to_string()))?;
            registry.insert(&spec.name, client, &spec.model, spec.temperature);
        }
        registry.get(None)?;
        Ok(registry)
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            enabled: self.circuit_breaker.enabled,
            failure_threshold: self.circuit_breaker.failure_threshold,
            success_threshold: self.circuit_breaker.success_threshold,
            reset_timeout: Duration::from_millis(self.circuit_breaker.reset_timeout_ms),
        }
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            collection_interval: Duration::from_millis(self.monitor.collection_interval_ms),
            learning_duration: Duration::from_millis(self.monitor.learning_duration_ms),
            z_threshold: self.monitor.z_threshold,
            consecutive_required: self.monitor.consecutive_required,
            cooldown: Duration::from_millis(self.monitor.cooldown_ms),
            history_minutes: self.monitor.history_minutes,
            min_required_samples: self.monitor.min_required_samples,
            ema_alpha: self.monitor.ema_alpha,
            persistence_path: self.monitor.persistence_path.clone(),
        }
    }

    pub fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            max_iterations: self.agent.max_iterations,
            callback_timeout: Duration::from_millis(self.agent.callback_timeout_ms),
            compaction_max_tokens: self.coordinator.compaction_max_tokens,
            compaction_keep_last: self.coordinator.compaction_keep_last,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_iterations: self.coordinator.max_iterations,
            deadline: Duration::from_millis(self.coordinator.deadline_ms),
            llm_timeout: Duration::from_millis(self.agent.llm_timeout_ms),
            compaction_max_tokens: self.coordinator.compaction_max_tokens,
            compaction_keep_last: self.coordinator.compaction_keep_last,
            operator: self.operator_config(),
            ..CoordinatorSettings::default()
        }
    }

    pub fn watcher_configs(&self) -> Vec<WatcherConfig> {
        self.watchers
            .iter()
            .map(|w| WatcherConfig {
                name: w.name.clone(),
                skill: w.skill.clone().unwrap_or_else(|| w.name.clone()),
                cron: w.cron.clone(),
                min_required_observations: w.min_required_observations,
                max_observations: w.max_observations,
                max_observation_age: Duration::from_millis(w.max_observation_age_ms),
                investigate_on_anomaly: w.investigate_on_anomaly,
            })
            .collect()
    }
}
