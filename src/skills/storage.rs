//! Built-in skill observing table/structure growth. The host feeds it a
//! [`StorageStats`] implementation; the skill itself never touches storage.

use super::{Skill, SkillCallback, SkillMetrics};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
pub struct TableStats {
    pub name: String,
    pub rows: u64,
    pub bytes: u64,
}

/// Read-only view of the host's table-shaped storage.
pub trait StorageStats: Send + Sync {
    fn tables(&self) -> Vec<TableStats>;
}

/// Fixed stats, for tests and demos.
pub struct StaticStorageStats(pub Vec<TableStats>);

impl StorageStats for StaticStorageStats {
    fn tables(&self) -> Vec<TableStats> {
        self.0.clone()
    }
}

pub struct StorageSkill {
    stats: Arc<dyn StorageStats>,
}

impl StorageSkill {
    pub fn new(stats: Arc<dyn StorageStats>) -> Self {
        Self { stats }
    }

    pub fn with_static(tables: Vec<TableStats>) -> Self {
        Self::new(Arc::new(StaticStorageStats(tables)))
    }
}

impl Skill for StorageSkill {
    fn id(&self) -> &str {
        "storage"
    }

    fn title(&self) -> &str {
        "Table metrics"
    }

    fn description(&self) -> &str {
        "Row counts and byte sizes of the host's tables."
    }

    fn system_prompt(&self) -> String {
        "You are observing the host application's table-shaped storage. \
         Unbounded row growth in a single table, a table's byte size growing \
         much faster than its row count, or sudden table count changes are the \
         anomalies worth reporting. Compare tables against each other before \
         concluding growth is abnormal."
            .to_string()
    }

    fn snapshot(&self) -> SkillMetrics {
        let tables = self.stats.tables();
        let total_rows: u64 = tables.iter().map(|t| t.rows).sum();
        let total_bytes: u64 = tables.iter().map(|t| t.bytes).sum();
        let largest_rows = tables.iter().map(|t| t.rows).max().unwrap_or(0);
        BTreeMap::from([
            ("table_count".to_string(), tables.len() as f64),
            ("total_rows".to_string(), total_rows as f64),
            ("total_bytes".to_string(), total_bytes as f64),
            ("largest_table_rows".to_string(), largest_rows as f64),
        ])
    }

    fn callbacks(&self) -> Vec<SkillCallback> {
        let stats = self.stats.clone();
        let stats_for_get = self.stats.clone();
        vec![
            SkillCallback::new(
                "list_tables",
                "every table with row count and byte size",
                "",
                move |_| Ok(json!(stats.tables())),
            ),
            SkillCallback::new(
                "get_table",
                "stats for one named table",
                "name (string): table to inspect",
                move |args| {
                    let name = args
                        .get("name")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("missing argument: name"))?;
                    stats_for_get
                        .tables()
                        .into_iter()
                        .find(|t| t.name == name)
                        .map(|t| json!(t))
                        .ok_or_else(|| anyhow::anyhow!("no such table: {name}"))
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill() -> Arc<dyn Skill> {
        Arc::new(StorageSkill::with_static(vec![
            TableStats {
                name: "sessions".into(),
                rows: 10,
                bytes: 4096,
            },
            TableStats {
                name: "cache".into(),
                rows: 10_000,
                bytes: 1 << 20,
            },
        ]))
    }

    #[test]
    fn snapshot_aggregates_tables() {
        let metrics = skill().snapshot();
        assert_eq!(metrics["table_count"], 2.0);
        assert_eq!(metrics["total_rows"], 10_010.0);
        assert_eq!(metrics["largest_table_rows"], 10_000.0);
    }

    #[tokio::test]
    async fn get_table_resolves_by_name() {
        let skill = skill();
        let result = super::super::run_callback(
            &skill,
            "get_table",
            json!({"name": "cache"}),
            super::super::DEFAULT_CALLBACK_TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!(result["rows"], 10_000);

        let err = super::super::run_callback(
            &skill,
            "get_table",
            json!({"name": "missing"}),
            super::super::DEFAULT_CALLBACK_TIMEOUT,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no such table"));
    }
}
