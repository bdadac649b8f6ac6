//! Deterministic clients for tests and offline development.
//!
//! Kept in the library proper (not behind `cfg(test)`) so integration tests
//! and embedding hosts can drive the agent loops without a live provider.

use crate::providers::traits::ChatClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Replays a fixed sequence of replies, one per `chat` call. An exhausted
/// script is a provider error, which surfaces through the gateway like any
/// transport failure.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn with_replies(replies: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Messages the client has been asked so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().push_back(reply.into());
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        _system_prompt: Option<&str>,
        message: &str,
        _model: &str,
        _temperature: f64,
    ) -> anyhow::Result<String> {
        self.calls.lock().push(message.to_string());
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted client: reply script exhausted"))
    }
}

/// Never replies. For deadline and cancellation tests.
pub struct SilentClient;

impl SilentClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ChatClient for SilentClient {
    fn name(&self) -> &str {
        "silent"
    }

    async fn chat(
        &self,
        _system_prompt: Option<&str>,
        _message: &str,
        _model: &str,
        _temperature: f64,
    ) -> anyhow::Result<String> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Fails every call with the given reason. For breaker integration tests.
pub struct FailingClient {
    reason: String,
}

impl FailingClient {
    pub fn new(reason: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reason: reason.into(),
        })
    }
}

#[async_trait]
impl ChatClient for FailingClient {
    fn name(&self) -> &str {
        "failing"
    }

    async fn chat(
        &self,
        _system_prompt: Option<&str>,
        _message: &str,
        _model: &str,
        _temperature: f64,
    ) -> anyhow::Result<String> {
        anyhow::bail!("{}", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_replays_in_order_then_errors() {
        let client = ScriptedClient::with_replies(vec!["a".into(), "b".into()]);
        assert_eq!(client.chat(None, "1", "m", 0.0).await.unwrap(), "a");
        assert_eq!(client.chat(None, "2", "m", 0.0).await.unwrap(), "b");
        assert!(client.chat(None, "3", "m", 0.0).await.is_err());
        assert_eq!(client.calls(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn failing_client_reports_reason() {
        let client = FailingClient::new("boom");
        let err = client.chat(None, "x", "m", 0.0).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
