//! Built-in skill observing the hosting process itself: memory, threads,
//! file descriptors, uptime. Metrics come from procfs where available and
//! degrade to zero elsewhere.

use super::{Skill, SkillCallback, SkillMetrics};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Instant;

pub struct RuntimeSkill {
    started_at: Instant,
}

impl RuntimeSkill {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }
}

impl Default for RuntimeSkill {
    fn default() -> Self {
        Self::new()
    }
}

/// kB values for (VmRSS, VmSize, Threads) from `/proc/self/status`.
fn proc_status() -> (f64, f64, f64) {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return (0.0, 0.0, 0.0);
    };
    let field = |key: &str| {
        status
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    (field("VmRSS:"), field("VmSize:"), field("Threads:"))
}

fn open_fds() -> f64 {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count().saturating_sub(1) as f64)
        .unwrap_or(0.0)
}

impl Skill for RuntimeSkill {
    fn id(&self) -> &str {
        "runtime"
    }

    fn title(&self) -> &str {
        "Runtime metrics"
    }

    fn description(&self) -> &str {
        "Process-level health: resident and virtual memory, thread count, open \
         file descriptors, uptime."
    }

    fn system_prompt(&self) -> String {
        "You are observing the hosting process's runtime health. Resident \
         memory growth without matching workload growth, thread count climbing \
         over consecutive snapshots, or file descriptors approaching the ulimit \
         are the anomalies worth reporting. Uptime resets indicate a restart \
         outside your control; note it in context rather than reporting it as \
         an anomaly."
            .to_string()
    }

    fn snapshot(&self) -> SkillMetrics {
        let (rss_kb, vsz_kb, threads) = proc_status();
        BTreeMap::from([
            ("memory_resident_kb".to_string(), rss_kb),
            ("memory_virtual_kb".to_string(), vsz_kb),
            ("threads".to_string(), threads),
            ("open_fds".to_string(), open_fds()),
            (
                "uptime_seconds".to_string(),
                self.started_at.elapsed().as_secs_f64(),
            ),
        ])
    }

    fn callbacks(&self) -> Vec<SkillCallback> {
        let started_at = self.started_at;
        vec![
            SkillCallback::new(
                "get_memory",
                "current resident and virtual memory in kB",
                "",
                |_| {
                    let (rss_kb, vsz_kb, _) = proc_status();
                    Ok(json!({ "resident_kb": rss_kb, "virtual_kb": vsz_kb }))
                },
            ),
            SkillCallback::new("get_thread_count", "current OS thread count", "", |_| {
                let (_, _, threads) = proc_status();
                Ok(json!({ "threads": threads }))
            }),
            SkillCallback::new(
                "get_uptime",
                "seconds since this agent was constructed",
                "",
                move |_| Ok(json!({ "uptime_seconds": started_at.elapsed().as_secs_f64() })),
            ),
        ]
    }
}
