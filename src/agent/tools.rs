//! Tool unions for the operator and coordinator loops.
//!
//! The LLM must answer with a single JSON object keyed by a `tool`
//! discriminator. Parsing fails closed: anything that does not deserialize
//! into the union — missing discriminator, unknown name, wrong field types —
//! is a schema failure fed back into the context, never a guessed variant.

use crate::alerts::types::{Confidence, CorrelationType, NotificationStatus, Severity};
use crate::error::AgentError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Closed toolset of the per-skill operator loop.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum OperatorTool {
    TakeSnapshot,
    RunCallback {
        name: String,
        #[serde(default = "empty_args")]
        args: Value,
    },
    SendNotification {
        anomaly_type: String,
        severity: Severity,
        context: String,
        observation: String,
        #[serde(default)]
        hypothesis: Option<String>,
    },
    Think {
        thought: String,
    },
    Wait {
        ms: u64,
    },
    Finish,
}

/// Closed toolset of the coordinator agent loop.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum CoordinatorTool {
    GetNotifications {
        #[serde(default)]
        status: Option<NotificationStatus>,
    },
    UpdateNotificationStatuses {
        ids: Vec<String>,
        status: NotificationStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    ProduceInsight {
        notification_ids: Vec<String>,
        correlation_type: CorrelationType,
        summary: String,
        #[serde(default)]
        root_cause_hypothesis: Option<String>,
        #[serde(default)]
        matched_observations: Vec<String>,
        #[serde(default)]
        hypothesis_grounded: bool,
        confidence: Confidence,
    },
    Think {
        thought: String,
    },
    InvokeOperators {
        skills: Vec<String>,
        #[serde(default)]
        context: String,
    },
    MessageOperator {
        skill: String,
        message: String,
    },
    GetOperatorStatuses,
    Schedule {
        ms: u64,
        reason: String,
    },
    Wait {
        ms: u64,
    },
    Done,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineIntent {
    Question,
    Investigation,
}

/// Output of the pipeline classify stage.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineClassification {
    pub intent: PipelineIntent,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub operator_context: String,
}

/// Output of the pipeline synthesize stage.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineAnswer {
    pub answer: String,
}

/// Extract the first balanced JSON object from free-form LLM output.
/// Models routinely wrap tool calls in prose or code fences.
pub fn extract_first_json(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let candidate = &input[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in candidate.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&candidate[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse an LLM reply into a tool union, failing closed.
pub fn parse_tool<T: DeserializeOwned>(reply: &str) -> Result<T, AgentError> {
    let json = extract_first_json(reply)
        .ok_or_else(|| AgentError::SchemaInvalid("reply contains no JSON object".to_string()))?;
    serde_json::from_str(json).map_err(|err| AgentError::SchemaInvalid(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operator_tools_parse_by_discriminator() {
        let tool: OperatorTool = parse_tool(r#"{"tool": "take_snapshot"}"#).unwrap();
        assert_eq!(tool, OperatorTool::TakeSnapshot);

        let tool: OperatorTool =
            parse_tool(r#"{"tool": "run_callback", "name": "get_memory"}"#).unwrap();
        assert_eq!(
            tool,
            OperatorTool::RunCallback {
                name: "get_memory".into(),
                args: json!({}),
            }
        );

        let tool: OperatorTool = parse_tool(
            r#"{"tool": "send_notification", "anomaly_type": "memory_high",
                "severity": "warning", "context": "uptime 1h",
                "observation": "rss=820MB", "hypothesis": "cache growth"}"#,
        )
        .unwrap();
        assert!(matches!(
            tool,
            OperatorTool::SendNotification { severity: Severity::Warning, .. }
        ));
    }

    #[test]
    fn prose_around_the_json_is_tolerated() {
        let reply = "I'll take a snapshot first.\n```json\n{\"tool\": \"take_snapshot\"}\n```";
        let tool: OperatorTool = parse_tool(reply).unwrap();
        assert_eq!(tool, OperatorTool::TakeSnapshot);
    }

    #[test]
    fn parsing_fails_closed() {
        // No discriminator: field presence alone must not select a variant.
        assert!(matches!(
            parse_tool::<OperatorTool>(r#"{"thought": "hmm"}"#),
            Err(AgentError::SchemaInvalid(_))
        ));
        assert!(matches!(
            parse_tool::<OperatorTool>(r#"{"tool": "self_destruct"}"#),
            Err(AgentError::SchemaInvalid(_))
        ));
        assert!(matches!(
            parse_tool::<OperatorTool>("no json at all"),
            Err(AgentError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn coordinator_tools_cover_the_full_table() {
        let tool: CoordinatorTool = parse_tool(r#"{"tool": "get_notifications"}"#).unwrap();
        assert_eq!(tool, CoordinatorTool::GetNotifications { status: None });

        let tool: CoordinatorTool = parse_tool(
            r#"{"tool": "update_notification_statuses", "ids": ["a"], "status": "acknowledged"}"#,
        )
        .unwrap();
        assert!(matches!(
            tool,
            CoordinatorTool::UpdateNotificationStatuses {
                status: NotificationStatus::Acknowledged,
                ..
            }
        ));

        let tool: CoordinatorTool = parse_tool(
            r#"{"tool": "produce_insight", "notification_ids": ["n1", "n2"],
                "correlation_type": "causal", "summary": "s",
                "matched_observations": ["o"], "hypothesis_grounded": true,
                "confidence": "high"}"#,
        )
        .unwrap();
        assert!(matches!(
            tool,
            CoordinatorTool::ProduceInsight {
                correlation_type: CorrelationType::Causal,
                confidence: Confidence::High,
                ..
            }
        ));

        let tool: CoordinatorTool = parse_tool(r#"{"tool": "done"}"#).unwrap();
        assert_eq!(tool, CoordinatorTool::Done);
    }

    #[test]
    fn nested_braces_inside_strings_do_not_confuse_extraction() {
        let reply = r#"{"tool": "think", "thought": "a {weird} \"quoted\" thought"}"#;
        let tool: OperatorTool = parse_tool(reply).unwrap();
        assert!(matches!(tool, OperatorTool::Think { .. }));
    }

    #[test]
    fn pipeline_stages_parse() {
        let c: PipelineClassification = parse_tool(
            r#"{"intent": "investigation", "skills": ["runtime"], "operator_context": "memory"}"#,
        )
        .unwrap();
        assert_eq!(c.intent, PipelineIntent::Investigation);
        assert_eq!(c.skills, vec!["runtime"]);

        let a: PipelineAnswer = parse_tool(r#"{"answer": "all healthy"}"#).unwrap();
        assert_eq!(a.answer, "all healthy");
    }
}
