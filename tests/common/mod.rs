//! Shared fixtures for the end-to-end tests.

use async_trait::async_trait;
use beamlens::providers::ChatClient;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Routes replies by caller: prompts containing "coordinator" consume the
/// coordinator script, everything else the operator script. Exhausted
/// scripts park the caller forever, which lets deadline tests exercise
/// teardown instead of tripping provider errors.
pub struct RoutedClient {
    coordinator: Mutex<VecDeque<String>>,
    operator: Mutex<VecDeque<String>>,
}

impl RoutedClient {
    pub fn new(coordinator: Vec<&str>, operator: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            coordinator: Mutex::new(coordinator.into_iter().map(String::from).collect()),
            operator: Mutex::new(operator.into_iter().map(String::from).collect()),
        })
    }
}

#[async_trait]
impl ChatClient for RoutedClient {
    fn name(&self) -> &str {
        "routed"
    }

    async fn chat(
        &self,
        system_prompt: Option<&str>,
        _message: &str,
        _model: &str,
        _temperature: f64,
    ) -> anyhow::Result<String> {
        // Pipeline stage prompts count as coordinator traffic too.
        let is_coordinator = system_prompt.is_some_and(|s| {
            s.contains("coordinator") || s.contains("route a query") || s.contains("summarize the findings")
        });
        let script = if is_coordinator {
            &self.coordinator
        } else {
            &self.operator
        };
        let next = script.lock().pop_front();
        match next {
            Some(reply) => Ok(reply),
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
