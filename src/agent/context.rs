//! Append-only conversation context for the agent loops.
//!
//! Tool results are appended in execution order. Compaction is an external
//! policy applied between iterations: when the estimated token count passes
//! the configured bound, everything but the most recent messages is replaced
//! by a single summary produced by a judge LLM call, with a deterministic
//! truncation fallback when that call fails.

use crate::error::AgentError;
use crate::providers::LlmGateway;
use crate::telemetry::SpanKind;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Estimated characters per token, for the chars/4 heuristic.
const CHARS_PER_TOKEN: usize = 4;

/// Safety cap on the transcript handed to the summarizer.
const COMPACTION_MAX_SOURCE_CHARS: usize = 24_000;

/// Max characters retained from the summary.
const COMPACTION_MAX_SUMMARY_CHARS: usize = 2_000;

const COMPACTION_SYSTEM_PROMPT: &str = "You are a context compaction engine for a \
runtime observation agent. Summarize the older part of an investigation \
transcript into concise context for later iterations. Preserve: metric values, \
anomalies observed, tool results, hypotheses, decisions. Omit: repeated \
snapshots, verbose tool payloads. Output plain text bullet points only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
            Self::Tool => "TOOL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

pub struct Context {
    messages: Vec<ContextMessage>,
    max_tokens: usize,
    keep_last: usize,
}

impl Context {
    pub fn new(max_tokens: usize, keep_last: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_tokens,
            keep_last,
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ContextMessage {
            role,
            content: content.into(),
        });
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content);
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Role::Assistant, content);
    }

    pub fn push_tool(&mut self, content: impl Into<String>) {
        self.push(Role::Tool, content);
    }

    pub fn messages(&self) -> &[ContextMessage] {
        &self.messages
    }

    pub fn render(&self) -> String {
        let mut transcript = String::new();
        for msg in &self.messages {
            let _ = writeln!(transcript, "{}: {}", msg.role.label(), msg.content.trim());
        }
        transcript
    }

    pub fn estimated_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| m.content.chars().count() / CHARS_PER_TOKEN)
            .sum()
    }

    pub fn needs_compaction(&self) -> bool {
        self.estimated_tokens() > self.max_tokens && self.messages.len() > self.keep_last
    }

    /// Replace all but the last `keep_last` messages with one summary
    /// message. No-op while under the token bound.
    pub async fn compact(
        &mut self,
        gateway: &LlmGateway,
        trace_id: Option<&str>,
    ) -> Result<bool, AgentError> {
        if !self.needs_compaction() {
            return Ok(false);
        }

        let compact_end = self.messages.len() - self.keep_last;
        let transcript = {
            let mut t = String::new();
            for msg in &self.messages[..compact_end] {
                let _ = writeln!(t, "{}: {}", msg.role.label(), msg.content.trim());
            }
            truncate_chars(&t, COMPACTION_MAX_SOURCE_CHARS)
        };

        let request = format!(
            "Summarize the following investigation transcript for context \
             preservation. Keep it short (max 12 bullet points).\n\n{transcript}"
        );

        let summary_raw = gateway
            .telemetry()
            .clone()
            .span(SpanKind::Judge, "compaction", trace_id, async {
                gateway
                    .complete(Some(COMPACTION_SYSTEM_PROMPT), &request, trace_id)
                    .await
            })
            .await
            .unwrap_or_else(|_| truncate_chars(&transcript, COMPACTION_MAX_SUMMARY_CHARS));

        let summary = truncate_chars(&summary_raw, COMPACTION_MAX_SUMMARY_CHARS);
        let summary_msg = ContextMessage {
            role: Role::Assistant,
            content: format!("[Compaction summary]\n{}", summary.trim()),
        };
        self.messages
            .splice(..compact_end, std::iter::once(summary_msg));
        Ok(true)
    }
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

/// Caller-supplied invocation context: an ordered string mapping where the
/// `reason` key renders first as `Reason: …` and every other key as
/// `key: value`.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    entries: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        let mut ctx = Self::default();
        ctx.insert("reason", reason);
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(reason) = self.entries.get("reason") {
            let _ = writeln!(out, "Reason: {reason}");
        }
        for (key, value) in &self.entries {
            if key != "reason" {
                let _ = writeln!(out, "{key}: {value}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedClient;
    use crate::providers::{BreakerSettings, CircuitBreaker, LlmGateway, RegisteredClient};
    use crate::telemetry::TelemetryHub;

    fn gateway(replies: Vec<String>) -> LlmGateway {
        let telemetry = TelemetryHub::new();
        let breaker = CircuitBreaker::new(BreakerSettings::default(), telemetry.clone());
        LlmGateway::new(
            &RegisteredClient {
                client: ScriptedClient::with_replies(replies),
                model: "test-model".into(),
                temperature: 0.0,
            },
            breaker,
            telemetry,
        )
    }

    #[test]
    fn render_is_ordered_and_labelled() {
        let mut ctx = Context::new(1000, 2);
        ctx.push_user("question");
        ctx.push_assistant("thinking");
        ctx.push_tool("{\"ok\":true}");
        let rendered = ctx.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "USER: question");
        assert_eq!(lines[1], "ASSISTANT: thinking");
        assert_eq!(lines[2], "TOOL: {\"ok\":true}");
    }

    #[tokio::test]
    async fn compaction_keeps_recent_messages_verbatim() {
        let mut ctx = Context::new(10, 2);
        for i in 0..8 {
            ctx.push_tool(format!("tool result number {i} with some padding text"));
        }
        assert!(ctx.needs_compaction());

        let gw = gateway(vec!["- summarized".into()]);
        assert!(ctx.compact(&gw, None).await.unwrap());

        assert_eq!(ctx.messages().len(), 3);
        assert!(ctx.messages()[0].content.contains("[Compaction summary]"));
        assert!(ctx.messages()[2].content.contains("number 7"));
    }

    #[tokio::test]
    async fn compaction_falls_back_to_truncation_when_llm_fails() {
        let mut ctx = Context::new(10, 1);
        for i in 0..6 {
            ctx.push_tool(format!("padding padding padding {i}"));
        }
        let gw = gateway(vec![]); // exhausted script: every call errors
        assert!(ctx.compact(&gw, None).await.unwrap());
        assert!(ctx.messages()[0].content.contains("[Compaction summary]"));
    }

    #[test]
    fn run_context_renders_reason_first() {
        let mut ctx = RunContext::with_reason("routine check");
        ctx.insert("budget", "low");
        let rendered = ctx.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Reason: routine check");
        assert_eq!(lines[1], "budget: low");
    }
}
