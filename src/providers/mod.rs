pub mod breaker;
pub mod compatible;
pub mod testing;
pub mod traits;

pub use breaker::{BreakerSettings, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use traits::ChatClient;

use crate::error::AgentError;
use crate::telemetry::{SpanKind, TelemetryHub};
use compatible::{AuthStyle, OpenAiCompatibleClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Factory: create the right client from a provider name.
pub fn create_client(name: &str, api_key: Option<&str>) -> anyhow::Result<Arc<dyn ChatClient>> {
    match name {
        "openai" => Ok(Arc::new(OpenAiCompatibleClient::new(
            "OpenAI",
            "https://api.openai.com",
            api_key,
            AuthStyle::Bearer,
        ))),
        "openrouter" => Ok(Arc::new(OpenAiCompatibleClient::new(
            "OpenRouter",
            "https://openrouter.ai/api",
            api_key,
            AuthStyle::Bearer,
        ))),
        "groq" => Ok(Arc::new(OpenAiCompatibleClient::new(
            "Groq",
            "https://api.groq.com/openai",
            api_key,
            AuthStyle::Bearer,
        ))),
        "ollama" => Ok(Arc::new(OpenAiCompatibleClient::new(
            "Ollama",
            "http://localhost:11434",
            api_key.filter(|k| !k.is_empty()),
            AuthStyle::Bearer,
        ))),
        name if name.starts_with("custom:") => {
            let base_url = name.strip_prefix("custom:").unwrap_or("");
            if base_url.is_empty() {
                anyhow::bail!("Custom provider requires a URL. Format: custom:https://your-api.com");
            }
            Ok(Arc::new(OpenAiCompatibleClient::new(
                "Custom",
                base_url,
                api_key,
                AuthStyle::Bearer,
            )))
        }
        _ => anyhow::bail!(
            "Unknown provider: {name}. Use \"custom:https://your-api.com\" for any \
             OpenAI-compatible endpoint."
        ),
    }
}

/// One configured client plus the model/temperature it is invoked with.
#[derive(Clone)]
pub struct RegisteredClient {
    pub client: Arc<dyn ChatClient>,
    pub model: String,
    pub temperature: f64,
}

/// Named clients with a primary selection. Built once at supervisor start.
pub struct ClientRegistry {
    primary: String,
    clients: HashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            clients: HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        client: Arc<dyn ChatClient>,
        model: impl Into<String>,
        temperature: f64,
    ) {
        self.clients.insert(
            name.into(),
            RegisteredClient {
                client,
                model: model.into(),
                temperature,
            },
        );
    }

    /// Resolve a client by name; `None` selects the primary.
    pub fn get(&self, name: Option<&str>) -> Result<&RegisteredClient, AgentError> {
        let key = name.unwrap_or(self.primary.as_str());
        self.clients
            .get(key)
            .ok_or_else(|| AgentError::NotFound(format!("client {key}")))
    }

    pub fn primary_name(&self) -> &str {
        &self.primary
    }
}

const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything an agent loop needs to talk to the LLM: the resolved client,
/// breaker gating, per-call timeout, and span telemetry. Cheap to clone.
#[derive(Clone)]
pub struct LlmGateway {
    client: Arc<dyn ChatClient>,
    model: String,
    temperature: f64,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
    telemetry: Arc<TelemetryHub>,
}

impl LlmGateway {
    pub fn new(
        registered: &RegisteredClient,
        breaker: Arc<CircuitBreaker>,
        telemetry: Arc<TelemetryHub>,
    ) -> Self {
        Self {
            client: registered.client.clone(),
            model: registered.model.clone(),
            temperature: registered.temperature,
            timeout: DEFAULT_LLM_TIMEOUT,
            breaker,
            telemetry,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn telemetry(&self) -> &Arc<TelemetryHub> {
        &self.telemetry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// One breaker-gated, timed-out, span-wrapped chat call.
    ///
    /// An open breaker fails fast with [`AgentError::CircuitOpen`] without
    /// touching the transport; transport failures and timeouts are recorded
    /// as breaker failures.
    pub async fn complete(
        &self,
        system_prompt: Option<&str>,
        message: &str,
        trace_id: Option<&str>,
    ) -> Result<String, AgentError> {
        if !self.breaker.allow() {
            return Err(AgentError::CircuitOpen);
        }

        let result = self
            .telemetry
            .span(SpanKind::Llm, self.client.name(), trace_id, async {
                match tokio::time::timeout(
                    self.timeout,
                    self.client
                        .chat(system_prompt, message, &self.model, self.temperature),
                )
                .await
                {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(err)) => Err(AgentError::Provider(err.to_string())),
                    Err(_) => Err(AgentError::Timeout),
                }
            })
            .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) => self.breaker.record_failure(err.code()),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedClient;

    #[test]
    fn factory_resolves_known_and_custom_providers() {
        assert!(create_client("openai", Some("k")).is_ok());
        assert!(create_client("custom:http://localhost:8080", None).is_ok());
        assert!(create_client("custom:", None).is_err());
        assert!(create_client("nope", None).is_err());
    }

    #[test]
    fn registry_resolves_primary_and_named() {
        let mut registry = ClientRegistry::new("default");
        registry.insert(
            "default",
            ScriptedClient::with_replies(vec![]),
            "test-model",
            0.2,
        );
        assert!(registry.get(None).is_ok());
        assert!(registry.get(Some("default")).is_ok());
        assert!(matches!(
            registry.get(Some("other")),
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn gateway_records_breaker_outcomes() {
        let telemetry = TelemetryHub::new();
        let breaker = CircuitBreaker::new(
            BreakerSettings {
                failure_threshold: 1,
                ..BreakerSettings::default()
            },
            telemetry.clone(),
        );
        let registered = RegisteredClient {
            client: ScriptedClient::with_replies(vec!["ok".into()]),
            model: "test-model".into(),
            temperature: 0.0,
        };
        let gateway = LlmGateway::new(&registered, breaker.clone(), telemetry);

        assert_eq!(gateway.complete(None, "hi", None).await.unwrap(), "ok");
        // Script exhausted: provider error trips the one-failure breaker.
        assert!(gateway.complete(None, "hi", None).await.is_err());
        assert_eq!(
            gateway.complete(None, "hi", None).await,
            Err(AgentError::CircuitOpen)
        );
    }
}
