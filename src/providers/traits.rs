use async_trait::async_trait;

/// Transport-level LLM client. One chat turn in, one reply out; the agent
/// loops above this layer keep their own conversation state and render it
/// into `message`.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Provider name for telemetry and diagnostics.
    fn name(&self) -> &str;

    async fn chat(
        &self,
        system_prompt: Option<&str>,
        message: &str,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String>;

    /// Warm up the HTTP connection pool (TLS handshake, DNS, HTTP/2 setup).
    /// Default implementation is a no-op; clients with HTTP transports should
    /// override.
    async fn warmup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
