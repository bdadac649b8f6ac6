//! Prompt assembly for the operator, coordinator, and pipeline loops.
//!
//! Every prompt ends with the same contract: answer with exactly one JSON
//! object selecting one tool. The tool docs are generated, not hand-kept, so
//! they cannot drift from the parsed union.

use crate::skills::Skill;
use std::fmt::Write as _;
use std::sync::Arc;

const JSON_CONTRACT: &str = "Respond with exactly one JSON object and nothing else. \
The object must have a \"tool\" field naming one of the tools above, plus that \
tool's arguments. Do not invent tools. Do not return multiple objects.";

pub fn operator_system_prompt(skill: &Arc<dyn Skill>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "{}", skill.system_prompt().trim());
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "You investigate one anomaly signal at a time using read-only tools. \
         You never remediate; you observe, then report."
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Available tools:");
    let _ = writeln!(
        prompt,
        "- take_snapshot: current metric snapshot of this domain. No arguments."
    );
    let _ = writeln!(
        prompt,
        "- run_callback: invoke one domain callback. Arguments: name (string), args (object)."
    );
    let _ = writeln!(prompt, "  Callbacks for this domain:");
    for line in skill.callback_docs().lines() {
        let _ = writeln!(prompt, "  {line}");
    }
    let _ = writeln!(
        prompt,
        "- send_notification: report a confirmed anomaly. Arguments: anomaly_type \
         (snake_case string, category prefix before the first underscore), severity \
         (info|warning|critical), context (factual state), observation (the anomaly \
         itself), hypothesis (optional speculative cause)."
    );
    let _ = writeln!(
        prompt,
        "- think: record reasoning. Arguments: thought (string)."
    );
    let _ = writeln!(
        prompt,
        "- wait: pause before re-checking. Arguments: ms (integer)."
    );
    let _ = writeln!(
        prompt,
        "- finish: end the investigation once you have reported or ruled out anomalies."
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "{JSON_CONTRACT}");
    prompt
}

pub fn coordinator_system_prompt(skill_ids: &[String]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are the coordinator of a runtime self-observation agent. Operators \
         investigate single domains and emit notifications; your job is to \
         correlate notifications into insights: causal chains, temporal \
         clusters, or shared symptoms. Only cite observations that appear \
         verbatim in the notifications you correlate, and only claim a \
         hypothesis is grounded when those observations support it."
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Operators you may invoke: {}.", skill_ids.join(", "));
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Available tools:");
    let _ = writeln!(
        prompt,
        "- get_notifications: list the inbox. Arguments: status (optional: unread|acknowledged|resolved)."
    );
    let _ = writeln!(
        prompt,
        "- update_notification_statuses: arguments: ids (list), status, reason (optional)."
    );
    let _ = writeln!(
        prompt,
        "- produce_insight: arguments: notification_ids (list), correlation_type \
         (causal|temporal|symptomatic), summary, root_cause_hypothesis (optional), \
         matched_observations (verbatim strings from the notifications), \
         hypothesis_grounded (bool), confidence (low|medium|high). Cited \
         notifications are resolved automatically."
    );
    let _ = writeln!(prompt, "- think: arguments: thought.");
    let _ = writeln!(
        prompt,
        "- invoke_operators: start domain investigations. Arguments: skills (list), context (string)."
    );
    let _ = writeln!(
        prompt,
        "- message_operator: ask a running operator a question. Arguments: skill, message."
    );
    let _ = writeln!(prompt, "- get_operator_statuses: no arguments.");
    let _ = writeln!(
        prompt,
        "- schedule: finish now and re-run later. Arguments: ms, reason. Rejected while operators run."
    );
    let _ = writeln!(prompt, "- wait: arguments: ms.");
    let _ = writeln!(
        prompt,
        "- done: finish the run. Rejected while operators run."
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "{JSON_CONTRACT}");
    prompt
}

pub fn analyze_baseline_system_prompt(skill: &Arc<dyn Skill>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "{}", skill.system_prompt().trim());
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "You are given a window of recent metric snapshots from this domain. \
         Classify the window. Respond with exactly one JSON object in one of \
         these shapes and nothing else:"
    );
    let _ = writeln!(
        prompt,
        r#"- {{"verdict": "continue_observing", "notes": "...", "confidence": "low|medium"}}"#
    );
    let _ = writeln!(
        prompt,
        r#"- {{"verdict": "report_anomaly", "anomaly_type": "snake_case", "severity": "info|warning|critical", "summary": "...", "evidence": ["..."], "confidence": "medium|high", "cooldown_minutes": 5}}"#
    );
    let _ = writeln!(
        prompt,
        r#"- {{"verdict": "report_healthy", "summary": "...", "confidence": "medium|high"}}"#
    );
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "Report an anomaly only when the window itself is evidence; cite the \
         values in `evidence`."
    );
    prompt
}

pub fn pipeline_classify_system_prompt(skill_ids: &[String]) -> String {
    format!(
        "You route a query about a running system. Available operator domains: {}.\n\
         Respond with exactly one JSON object: {{\"intent\": \"question\"|\"investigation\", \
         \"skills\": [domains to consult], \"operator_context\": \"what the operators \
         should look at\"}}. Choose the smallest set of domains that can answer.",
        skill_ids.join(", ")
    )
}

pub fn pipeline_synthesize_system_prompt() -> String {
    "You summarize the findings of domain operators for the person who asked. \
     You are given the original query and the operators' notifications as JSON. \
     Respond with exactly one JSON object: {\"answer\": \"...\"}. Ground every \
     claim in the notification data; say so plainly when nothing was found."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::RuntimeSkill;

    fn skill() -> Arc<dyn Skill> {
        Arc::new(RuntimeSkill::new())
    }

    #[test]
    fn operator_prompt_embeds_skill_prompt_and_callback_docs() {
        let prompt = operator_system_prompt(&skill());
        assert!(prompt.contains("runtime health"));
        assert!(prompt.contains("get_memory"));
        assert!(prompt.contains("exactly one JSON object"));
    }

    #[test]
    fn coordinator_prompt_lists_available_operators() {
        let prompt = coordinator_system_prompt(&["runtime".to_string(), "storage".to_string()]);
        assert!(prompt.contains("runtime, storage"));
        assert!(prompt.contains("produce_insight"));
    }

    #[test]
    fn baseline_prompt_documents_all_three_verdicts() {
        let prompt = analyze_baseline_system_prompt(&skill());
        for verdict in ["continue_observing", "report_anomaly", "report_healthy"] {
            assert!(prompt.contains(verdict), "missing {verdict}");
        }
    }
}
