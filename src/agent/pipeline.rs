//! Pipeline coordinator strategy: classify → gather → synthesize.
//!
//! Three fixed stages and at most two LLM calls plus one schema retry each.
//! Cheaper than the agent loop, but if classification picks the wrong
//! skills there is no mid-run correction; callers who need that use the
//! agent loop.

use super::coordinator::{RunGuards, RunState};
use super::prompt;
use super::tools::{parse_tool, PipelineAnswer, PipelineClassification};
use crate::alerts::types::{new_id, Confidence, CorrelationType, Insight};
use crate::error::AgentError;
use crate::telemetry::EventPayload;
use chrono::Utc;
use std::collections::HashSet;

/// One LLM call with a single schema retry; the retry carries the parse
/// error back to the model.
async fn call_parsed<T: serde::de::DeserializeOwned>(
    state: &RunState,
    guards: &mut RunGuards<'_>,
    system_prompt: &str,
    message: &str,
) -> Result<T, AgentError> {
    let reply = guards
        .guard(
            state
                .gateway
                .complete(Some(system_prompt), message, Some(&state.trace)),
        )
        .await??;

    match parse_tool::<T>(&reply) {
        Ok(parsed) => Ok(parsed),
        Err(AgentError::SchemaInvalid(msg)) => {
            let retry = format!(
                "{message}\n\nYour previous reply did not match the expected JSON \
                 shape ({msg}). Answer with the JSON object only."
            );
            let reply = guards
                .guard(
                    state
                        .gateway
                        .complete(Some(system_prompt), &retry, Some(&state.trace)),
                )
                .await??;
            parse_tool::<T>(&reply)
        }
        Err(other) => Err(other),
    }
}

pub(super) async fn run(
    state: &mut RunState,
    guards: &mut RunGuards<'_>,
) -> Result<(), AgentError> {
    // Stage 1: classify.
    let classify_prompt = prompt::pipeline_classify_system_prompt(&state.available_skill_ids());
    let query = state.query.clone();
    let classification: PipelineClassification =
        call_parsed(state, guards, &classify_prompt, &query).await?;
    tracing::debug!(
        intent = ?classification.intent,
        skills = ?classification.skills,
        "pipeline classified query"
    );

    // Stage 2: gather — one operator per classified skill. Anything already
    // in the inbox (e.g. seeded through `RunOptions.notifications`) is not
    // this stage's output and stays untouched.
    let pre_existing: HashSet<String> = state
        .inbox_notifications()
        .into_iter()
        .map(|n| n.id.clone())
        .collect();

    let mut seen = HashSet::new();
    let mut spawn_errors = Vec::new();
    for skill in &classification.skills {
        if !seen.insert(skill.clone()) {
            continue;
        }
        if let Err(err) = state
            .spawn_operator(skill, classification.operator_context.clone())
            .await
        {
            spawn_errors.push(err);
        }
    }
    for err in &spawn_errors {
        tracing::debug!(error = %err, "pipeline gather skipped a skill");
    }

    while state.operators_running() > 0 {
        guards
            .guard(tokio::time::sleep(state.poll_interval))
            .await?;
        state.drain_operator_events();
    }
    state.drain_operator_events();

    // Stage 3: synthesize over what this run's operators produced.
    let gathered: Vec<_> = state
        .inbox_notifications()
        .into_iter()
        .filter(|n| !pre_existing.contains(&n.id))
        .cloned()
        .collect();
    let operator_data = serde_json::to_string(&gathered)
        .map_err(|err| AgentError::EncodingFailed {
            tool: "pipeline_synthesize".to_string(),
            reason: err.to_string(),
        })?;
    let message = format!("Query:\n{query}\n\nOperator data:\n{operator_data}");
    let synth_prompt = prompt::pipeline_synthesize_system_prompt();
    let answer: PipelineAnswer = call_parsed(state, guards, &synth_prompt, &message).await?;

    if !gathered.is_empty() {
        let gathered_ids: Vec<String> = gathered.iter().map(|n| n.id.clone()).collect();
        let insight = Insight {
            id: new_id(),
            notification_ids: gathered_ids.clone(),
            correlation_type: CorrelationType::Symptomatic,
            summary: answer.answer.clone(),
            root_cause_hypothesis: None,
            matched_observations: gathered.iter().map(|n| n.observation.clone()).collect(),
            hypothesis_grounded: false,
            confidence: Confidence::Medium,
            created_at: Utc::now(),
        };
        state.telemetry.emit(
            Some(&state.trace),
            EventPayload::CoordinatorInsightProduced {
                insight_id: insight.id.clone(),
                notification_ids: insight.notification_ids.clone(),
            },
        );
        state.insights.push(insight);
        state.resolve(&gathered_ids);
    }
    state.answer = Some(answer.answer);
    Ok(())
}
