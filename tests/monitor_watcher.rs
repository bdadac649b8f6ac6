//! Watcher, scheduler, and investigate() through the public runtime
//! (invariants 7 and 8 at the integration level).

mod common;

use beamlens::providers::testing::ScriptedClient;
use beamlens::providers::ClientRegistry;
use beamlens::{BeamLens, Config, InvestigateOutcome, WatcherTickOutcome};
use common::RoutedClient;
use std::sync::Arc;

fn registry(client: Arc<dyn beamlens::ChatClient>) -> ClientRegistry {
    let mut registry = ClientRegistry::new("default");
    registry.insert("default", client, "test-model", 0.0);
    registry
}

fn manual_config() -> Config {
    Config::from_toml_str(
        r#"
        skills = ["runtime"]

        [alert_handler]
        trigger = "manual"

        [[watchers]]
        name = "runtime"
        cron = "*/5 * * * *"
        min_required_observations = 2
        "#,
    )
    .unwrap()
}

#[tokio::test]
async fn watcher_collects_then_reports_then_suppresses() {
    let anomaly = r#"{"verdict": "report_anomaly", "anomaly_type": "memory_high",
        "severity": "warning", "summary": "rss stepped up",
        "evidence": ["rss=900MB"], "confidence": "high", "cooldown_minutes": 5}"#;
    let client = ScriptedClient::with_replies(vec![anomaly.to_string(), anomaly.to_string()]);
    let agent = BeamLens::start_with_clients(manual_config(), registry(client))
        .await
        .unwrap();

    assert_eq!(agent.list_watchers(), vec!["runtime"]);

    // First tick: only one observation, below the window minimum.
    let outcome = agent.trigger_watcher("runtime").await.unwrap();
    assert_eq!(
        outcome,
        WatcherTickOutcome::Collecting {
            observations: 1,
            required: 2
        }
    );
    assert!(!agent.pending_alerts());

    // Second tick: the window is full and the verdict reports an anomaly.
    let outcome = agent.trigger_watcher("runtime").await.unwrap();
    assert!(matches!(outcome, WatcherTickOutcome::Reported { .. }));
    assert!(agent.pending_alerts());

    // Third tick: same category, inside the cooldown window.
    let outcome = agent.trigger_watcher("runtime").await.unwrap();
    assert_eq!(
        outcome,
        WatcherTickOutcome::Suppressed {
            category: "memory".into()
        }
    );
    assert_eq!(agent.alert_queue().count(), 1);

    let status = agent.watcher_status("runtime").await.unwrap();
    assert_eq!(status.skill, "runtime");
    assert!(status.cooldowns.contains_key("memory"));

    agent.shutdown();
}

#[tokio::test]
async fn unknown_watcher_names_are_not_found() {
    let client = ScriptedClient::with_replies(vec![]);
    let agent = BeamLens::start_with_clients(manual_config(), registry(client))
        .await
        .unwrap();
    assert!(agent.trigger_watcher("ghost").await.is_err());
    assert!(agent.watcher_status("ghost").await.is_err());
    agent.shutdown();
}

#[tokio::test]
async fn investigate_drains_the_queue_and_correlates() {
    // Watcher reports once; the coordinator then resolves the drained alert.
    let client = RoutedClient::new(
        vec![
            r#"{"tool": "get_notifications", "status": "unread"}"#,
            r#"{"tool": "done"}"#,
        ],
        vec![
            r#"{"verdict": "report_anomaly", "anomaly_type": "memory_high",
                "severity": "warning", "summary": "rss stepped up",
                "evidence": ["rss=900MB"], "confidence": "high"}"#,
        ],
    );
    let mut config = manual_config();
    config.watchers[0].min_required_observations = 1;
    let agent = BeamLens::start_with_clients(config, registry(client))
        .await
        .unwrap();

    // Nothing pending yet.
    assert!(matches!(
        agent.investigate().await.unwrap(),
        InvestigateOutcome::NoAlerts
    ));

    let outcome = agent.trigger_watcher("runtime").await.unwrap();
    assert!(matches!(outcome, WatcherTickOutcome::Reported { .. }));
    assert!(agent.pending_alerts());

    let analysis = agent.investigate().await.unwrap();
    let InvestigateOutcome::Analysis(outcome) = analysis else {
        panic!("expected an analysis");
    };
    assert_eq!(outcome.notifications.len(), 1);
    assert_eq!(
        outcome.notifications[0].notification.anomaly_type,
        "memory_high"
    );
    // Queue was drained by the investigation.
    assert!(!agent.pending_alerts());

    agent.shutdown();
}

#[tokio::test]
async fn run_schedule_now_fires_watchers_and_rejects_unknown_names() {
    let client = ScriptedClient::with_replies(vec![]);
    let mut config = manual_config();
    // High minimum keeps every tick in the collecting phase: no LLM calls.
    config.watchers[0].min_required_observations = 99;
    let agent = BeamLens::start_with_clients(config, registry(client))
        .await
        .unwrap();

    agent.run_schedule_now("runtime").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    // The previous handler finished, so the guard lets this one through.
    agent.run_schedule_now("runtime").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let status = agent.watcher_status("runtime").await.unwrap();
    assert_eq!(status.observations, 2);

    assert!(matches!(
        agent.run_schedule_now("ghost").await,
        Err(beamlens::AgentError::NotFound(_))
    ));
    agent.shutdown();
}

#[tokio::test]
async fn breaker_surface_is_reachable_through_the_runtime() {
    let client = ScriptedClient::with_replies(vec![]);
    let agent = BeamLens::start_with_clients(manual_config(), registry(client))
        .await
        .unwrap();
    let snapshot = agent.circuit_breaker_state();
    assert_eq!(snapshot.state, beamlens::BreakerState::Closed);
    agent.reset_circuit_breaker();
    agent.shutdown();
}

#[tokio::test]
async fn operator_message_goes_through_the_runtime_registry() {
    let client = ScriptedClient::with_replies(vec!["memory looks fine".to_string()]);
    let agent = BeamLens::start_with_clients(manual_config(), registry(client))
        .await
        .unwrap();
    let answer = agent.message_operator("runtime", "how is memory?").await.unwrap();
    assert_eq!(answer, "memory looks fine");
    assert!(agent.message_operator("ghost", "hi").await.is_err());
    agent.shutdown();
}
