//! Skill contract and registry.
//!
//! A skill describes one monitored domain: a cheap metric snapshot, a small
//! set of named read-only callbacks the LLM may invoke, and the system prompt
//! that frames the domain for the operator loop. Skills are opaque to the
//! core; the set is frozen when the supervisor starts.

pub mod runtime;
pub mod storage;

pub use runtime::RuntimeSkill;
pub use storage::{StorageSkill, StorageStats, TableStats};

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Finite mapping from metric name to current value.
pub type SkillMetrics = BTreeMap<String, f64>;

type CallbackHandler = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// Upper bound on an encoded callback result. Oversized results are reported
/// as tool errors rather than flooding the LLM context.
pub const MAX_CALLBACK_RESULT_BYTES: usize = 64 * 1024;

pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// One named read-only tool a skill exposes to the operator loop.
#[derive(Clone)]
pub struct SkillCallback {
    pub name: String,
    pub description: String,
    /// Documented arguments, e.g. `"name (string): table to inspect"`.
    pub args: String,
    handler: CallbackHandler,
}

impl SkillCallback {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        args: impl Into<String>,
        handler: impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: args.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn invoke(&self, args: &Value) -> anyhow::Result<Value> {
        (self.handler)(args)
    }
}

/// A monitored domain. Implementations must keep `snapshot` cheap and every
/// callback idempotent and free of observable side effects.
pub trait Skill: Send + Sync {
    fn id(&self) -> &str;

    fn title(&self) -> &str;

    fn description(&self) -> &str;

    /// LLM instructions framing this domain for the operator loop.
    fn system_prompt(&self) -> String;

    fn snapshot(&self) -> SkillMetrics;

    /// Ordered callback set; order is preserved in the rendered docs.
    fn callbacks(&self) -> Vec<SkillCallback>;

    fn callback_docs(&self) -> String {
        let mut docs = String::new();
        for cb in self.callbacks() {
            let _ = writeln!(docs, "- {}: {}", cb.name, cb.description);
            if !cb.args.is_empty() {
                let _ = writeln!(docs, "  arguments: {}", cb.args);
            }
        }
        docs
    }
}

/// Execute one named callback under a deadline, on the blocking pool.
///
/// Unknown names, handler errors, deadline overruns, and oversized results
/// all come back as `Err` — the operator loop encodes them as
/// `{"error": …}` tool results and keeps going.
pub async fn run_callback(
    skill: &Arc<dyn Skill>,
    name: &str,
    args: Value,
    timeout: Duration,
) -> anyhow::Result<Value> {
    let callback = skill
        .callbacks()
        .into_iter()
        .find(|cb| cb.name == name)
        .ok_or_else(|| anyhow::anyhow!("unknown callback: {name}"))?;

    let handle = tokio::task::spawn_blocking(move || callback.invoke(&args));
    let result = tokio::time::timeout(timeout, handle)
        .await
        .map_err(|_| anyhow::anyhow!("callback {name} exceeded {}ms deadline", timeout.as_millis()))?
        .map_err(|_| anyhow::anyhow!("callback {name} panicked"))??;

    let encoded_len = serde_json::to_vec(&result).map(|v| v.len())?;
    if encoded_len > MAX_CALLBACK_RESULT_BYTES {
        anyhow::bail!(
            "callback {name} result is {encoded_len} bytes, exceeds the {MAX_CALLBACK_RESULT_BYTES} byte bound"
        );
    }
    Ok(result)
}

/// Ordered, immutable set of skills known at supervisor start.
#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: Vec<Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new(skills: Vec<Arc<dyn Skill>>) -> Self {
        Self { skills }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Skill>> {
        self.skills.iter().find(|s| s.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.skills.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Skill>> {
        self.skills.iter()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoSkill;

    impl Skill for EchoSkill {
        fn id(&self) -> &str {
            "echo"
        }

        fn title(&self) -> &str {
            "Echo"
        }

        fn description(&self) -> &str {
            "test skill"
        }

        fn system_prompt(&self) -> String {
            "You observe the echo domain.".into()
        }

        fn snapshot(&self) -> SkillMetrics {
            BTreeMap::from([("value".to_string(), 1.0)])
        }

        fn callbacks(&self) -> Vec<SkillCallback> {
            vec![
                SkillCallback::new("echo", "returns its arguments", "any", |args| {
                    Ok(args.clone())
                }),
                SkillCallback::new("fail", "always errors", "", |_| {
                    anyhow::bail!("deliberate")
                }),
                SkillCallback::new("slow", "sleeps past the deadline", "", |_| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(json!("late"))
                }),
            ]
        }
    }

    fn skill() -> Arc<dyn Skill> {
        Arc::new(EchoSkill)
    }

    #[tokio::test]
    async fn run_callback_dispatches_by_name() {
        let result = run_callback(&skill(), "echo", json!({"x": 1}), DEFAULT_CALLBACK_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn run_callback_reports_unknown_names_and_handler_errors() {
        let err = run_callback(&skill(), "nope", json!({}), DEFAULT_CALLBACK_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown callback"));

        let err = run_callback(&skill(), "fail", json!({}), DEFAULT_CALLBACK_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deliberate"));
    }

    #[tokio::test]
    async fn run_callback_enforces_the_deadline() {
        let err = run_callback(&skill(), "slow", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn callback_docs_render_names_and_args() {
        let docs = skill().callback_docs();
        assert!(docs.contains("- echo: returns its arguments"));
        assert!(docs.contains("arguments: any"));
    }

    #[test]
    fn registry_preserves_order_and_resolves_ids() {
        let registry = SkillRegistry::new(vec![skill()]);
        assert_eq!(registry.ids(), vec!["echo"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("none").is_none());
    }
}
