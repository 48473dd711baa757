//! End-to-end fleet behaviour against the in-memory store and paper exchange.

use anyhow::Result;
use async_trait::async_trait;
use bot_fleet_core::{
    BackupType, Bot, BotStatus, ExchangeCredential, FleetConfig, FleetEvent, FleetStore,
    HealthWarningKind, ReliabilityConfig, RuntimeConfig, RuntimeStatus, Strategy,
    StrategyContext, StrategyDecision, StrategyKind, TradeAction, WatchdogConfig,
};
use bot_fleet_orchestrator::{
    BotCommand, BotManager, MemoryStore, PaperConnector, PaperExchange, RecoveryOptions,
    StrategyRegistry,
};
use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

/// Buys on every tick; the decision engine gates repeats once a position is open.
struct AlwaysBuy;

#[async_trait]
impl Strategy for AlwaysBuy {
    async fn initialize(&mut self, _context: &StrategyContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self, context: &StrategyContext) -> Result<StrategyDecision> {
        Ok(StrategyDecision::new(TradeAction::Buy, &context.symbol, 0.9))
    }

    async fn cleanup(&mut self, _context: &StrategyContext) -> Result<()> {
        Ok(())
    }

    fn get_state(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn set_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "always-buy"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Custom
    }
}

struct Fleet {
    manager: Arc<BotManager>,
    store: Arc<MemoryStore>,
    paper: Arc<PaperExchange>,
}

fn base_config() -> FleetConfig {
    FleetConfig {
        runtime: RuntimeConfig {
            tick_interval_ms: 1_000,
            ..RuntimeConfig::default()
        },
        ..FleetConfig::default()
    }
}

async fn fleet(config: FleetConfig, bots: &[(&str, &str)]) -> Fleet {
    let store = Arc::new(MemoryStore::new());
    let paper = Arc::new(PaperExchange::new());
    paper.set_price("BTC-USD", dec!(100), dec!(0.02));

    store
        .upsert_credential(&ExchangeCredential::new("cred-1", "paper"))
        .await
        .unwrap();
    for (id, strategy) in bots {
        let bot = Bot::new(*id, "owner", *strategy, "paper", "BTC-USD").with_credential("cred-1");
        store.upsert_bot(&bot).await.unwrap();
    }

    let mut registry = StrategyRegistry::with_builtins();
    registry.register("always-buy", "0.1.0", StrategyKind::Custom, |_| {
        Ok(Box::new(AlwaysBuy) as Box<dyn Strategy>)
    });

    let manager = BotManager::builder(
        config,
        Arc::clone(&store) as Arc<dyn FleetStore>,
        Arc::new(PaperConnector::new(Arc::clone(&paper))),
    )
    .registry(registry)
    .build();
    manager.spawn_background();

    Fleet {
        manager,
        store,
        paper,
    }
}

/// Advances virtual time in small steps until `done` holds or `limit` passes.
async fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let step = Duration::from_millis(250);
    let mut waited = Duration::ZERO;
    while waited < limit {
        if done() {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    done()
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_tick_errors_stop_and_deregister() {
    let fleet = fleet(base_config(), &[("bot-1", "hold")]).await;
    fleet.paper.fail_market_data(true);
    fleet.manager.start_bot("bot-1").await.unwrap();

    let manager = Arc::clone(&fleet.manager);
    assert!(wait_until(Duration::from_secs(120), || manager.running_bots().is_empty()).await);

    let view = fleet.manager.get_bot_status("bot-1").await.unwrap();
    assert_eq!(view.status, BotStatus::Stopped);
    assert!(view.runtime.is_none());
    assert!(fleet.manager.watchdog().monitored_bots().is_empty());

    let stored = fleet.store.get_bot("bot-1").await.unwrap().unwrap();
    assert_eq!(stored.status, BotStatus::Stopped);

    let snapshot = fleet.manager.state_manager().load_snapshot("bot-1").await.unwrap();
    assert_eq!(snapshot.payload.state.error_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_stale_tick_warns_without_restart() {
    let config = FleetConfig {
        runtime: RuntimeConfig {
            tick_interval_ms: 3_600_000,
            ..RuntimeConfig::default()
        },
        ..FleetConfig::default()
    };
    let fleet = fleet(config, &[("bot-1", "hold")]).await;
    let mut events = fleet.manager.events().subscribe();
    fleet.manager.start_bot("bot-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let later = Utc::now() + chrono::Duration::minutes(10);
    let warnings = fleet.manager.health_sweep_at(later);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].kind, HealthWarningKind::StaleTick);

    assert!(fleet.manager.health_sweep().is_empty());
    assert_eq!(fleet.manager.running_bots(), vec!["bot-1".to_string()]);
    assert_eq!(fleet.manager.watchdog().restart_count("bot-1"), 0);

    let mut saw_warning = false;
    while let Ok(event) = events.try_recv() {
        if let FleetEvent::HealthWarning { bot_id, kind, .. } = event {
            assert_eq!(bot_id, "bot-1");
            assert_eq!(kind, HealthWarningKind::StaleTick);
            saw_warning = true;
        }
    }
    assert!(saw_warning);
}

#[tokio::test(start_paused = true)]
async fn test_high_error_ratio_warns() {
    let fleet = fleet(base_config(), &[("bot-1", "hold")]).await;
    fleet.paper.fail_market_data(true);
    fleet.manager.start_bot("bot-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    fleet.paper.fail_market_data(false);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let warnings = fleet.manager.health_sweep();
    assert!(warnings
        .iter()
        .any(|w| w.bot_id == "bot-1" && w.kind == HealthWarningKind::HighErrorRatio));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_restarts_unhealthy_bot_through_manager() {
    let config = FleetConfig {
        runtime: RuntimeConfig {
            tick_interval_ms: 1_000,
            max_retries: 1_000,
            ..RuntimeConfig::default()
        },
        watchdog: WatchdogConfig {
            check_interval_secs: 10,
            restart_threshold: 1,
            restart_delay_ms: 100,
            max_error_rate: 0.5,
            ..WatchdogConfig::default()
        },
        reliability: ReliabilityConfig {
            failover_enabled: false,
            ..ReliabilityConfig::default()
        },
        ..FleetConfig::default()
    };
    let fleet = fleet(config, &[("bot-1", "hold")]).await;
    let mut events = fleet.manager.events().subscribe();
    fleet.paper.fail_market_data(true);
    fleet.manager.start_bot("bot-1").await.unwrap();

    let watchdog = Arc::clone(fleet.manager.watchdog());
    assert!(wait_until(Duration::from_secs(60), || watchdog.restart_count("bot-1") >= 1).await);
    fleet.paper.fail_market_data(false);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let runtime = fleet.manager.runtime("bot-1").expect("bot restarted");
    assert_eq!(runtime.status(), RuntimeStatus::Running);

    let backups = fleet.manager.state_manager().list_backups("bot-1").await.unwrap();
    assert!(backups.iter().any(|b| b.backup_type == BackupType::PreRestart));

    let mut restarted = false;
    while let Ok(event) = events.try_recv() {
        restarted |= matches!(event, FleetEvent::BotRestarted { .. });
    }
    assert!(restarted);
}

#[tokio::test(start_paused = true)]
async fn test_failover_stops_the_fleet() {
    let config = FleetConfig {
        runtime: RuntimeConfig {
            tick_interval_ms: 1_000,
            max_retries: 1_000,
            ..RuntimeConfig::default()
        },
        watchdog: WatchdogConfig {
            auto_restart: false,
            ..WatchdogConfig::default()
        },
        reliability: ReliabilityConfig {
            failover_error_threshold: 2,
            ..ReliabilityConfig::default()
        },
        ..FleetConfig::default()
    };
    let fleet = fleet(config, &[("bot-1", "hold"), ("bot-2", "hold")]).await;
    let mut events = fleet.manager.events().subscribe();
    fleet.paper.fail_market_data(true);
    fleet.manager.start_bot("bot-1").await.unwrap();
    fleet.manager.start_bot("bot-2").await.unwrap();

    let reliability = Arc::clone(fleet.manager.reliability());
    assert!(wait_until(Duration::from_secs(120), || reliability.failover_active()).await);
    let manager = Arc::clone(&fleet.manager);
    assert!(wait_until(Duration::from_secs(10), || manager.running_bots().is_empty()).await);

    let mut stopped = None;
    while let Ok(event) = events.try_recv() {
        if let FleetEvent::FailoverActivated { stopped_bots, .. } = event {
            stopped = Some(stopped_bots);
        }
    }
    assert_eq!(
        stopped.expect("failover event"),
        vec!["bot-1".to_string(), "bot-2".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_selective_restore_without_positions() {
    let fleet = fleet(base_config(), &[("bot-1", "always-buy")]).await;
    fleet.manager.start_bot("bot-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fleet.manager.runtime("bot-1").unwrap().status_view().positions.len(), 1);

    let response = fleet
        .manager
        .dispatch("bot-1", BotCommand::Backup { reason: "before maintenance".into() })
        .await;
    assert!(response.success, "{response:?}");
    let backup_id = response.data.unwrap()["id"].as_str().unwrap().to_string();

    let denied = fleet
        .manager
        .recover_bot("bot-1", RecoveryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(denied.reason(), "already_running");

    fleet.manager.stop_bot("bot-1", "maintenance").await.unwrap();

    let options = RecoveryOptions {
        backup_id: Some(backup_id.clone()),
        restore_positions: false,
        ..RecoveryOptions::default()
    };
    fleet.manager.recover_bot("bot-1", options).await.unwrap();
    let snapshot = fleet.manager.state_manager().load_snapshot("bot-1").await.unwrap();
    assert!(snapshot.payload.state.positions.is_empty());
    assert!(snapshot.payload.state.performance.trades >= 1);

    let options = RecoveryOptions {
        backup_id: Some(backup_id),
        ..RecoveryOptions::default()
    };
    fleet.manager.recover_bot("bot-1", options).await.unwrap();
    let snapshot = fleet.manager.state_manager().load_snapshot("bot-1").await.unwrap();
    assert_eq!(snapshot.payload.state.positions.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_from_wire_commands() {
    let fleet = fleet(base_config(), &[("bot-1", "hold")]).await;

    let commands = [
        (r#"{"command":"start"}"#, true, BotStatus::Running),
        (r#"{"command":"pause"}"#, true, BotStatus::Paused),
        (r#"{"command":"pause"}"#, false, BotStatus::Paused),
        (r#"{"command":"resume"}"#, true, BotStatus::Running),
        (r#"{"command":"stop","reason":"done"}"#, true, BotStatus::Stopped),
    ];
    for (wire, success, status) in commands {
        let command: BotCommand = serde_json::from_str(wire).unwrap();
        let response = fleet.manager.dispatch("bot-1", command).await;
        assert_eq!(response.success, success, "{wire}: {response:?}");
        if success {
            assert_eq!(response.status, Some(status));
        } else {
            assert_eq!(response.reason, "invalid_transition");
        }
    }

    let missing = fleet.manager.dispatch("ghost", BotCommand::Start).await;
    assert_eq!(missing.reason, "bot_not_found");
}

#[tokio::test(start_paused = true)]
async fn test_live_switch_persists_strategy() {
    let fleet = fleet(base_config(), &[("bot-1", "hold")]).await;
    fleet.manager.start_bot("bot-1").await.unwrap();

    let command: BotCommand = serde_json::from_value(serde_json::json!({
        "command": "switch_strategy",
        "strategy": "momentum",
        "configuration": { "momentum": { "lookback": 3 } },
        "options": { "preserve_state": false },
    }))
    .unwrap();
    let response = fleet.manager.dispatch("bot-1", command).await;
    assert!(response.success, "{response:?}");
    assert_eq!(fleet.store.get_bot("bot-1").await.unwrap().unwrap().strategy, "momentum");

    let response = fleet.manager.dispatch("bot-1", BotCommand::RollbackStrategy).await;
    assert!(response.success, "{response:?}");
    assert_eq!(fleet.store.get_bot("bot-1").await.unwrap().unwrap().strategy, "hold");
    assert_eq!(
        fleet.manager.runtime("bot-1").unwrap().status(),
        RuntimeStatus::Running
    );
}

#[tokio::test(start_paused = true)]
async fn test_restore_running_bots_after_crash() {
    let fleet = fleet(base_config(), &[("bot-1", "hold"), ("bot-2", "hold")]).await;
    fleet
        .store
        .update_bot_status("bot-1", BotStatus::Running)
        .await
        .unwrap();

    let results = fleet.manager.restore_running_bots().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "bot-1");
    assert!(results[0].1.is_ok());
    assert_eq!(fleet.manager.running_bots(), vec!["bot-1".to_string()]);

    let statuses = fleet.manager.get_all_bots_status().await.unwrap();
    let statuses: Vec<_> = statuses.iter().map(|v| (v.bot_id.as_str(), v.status)).collect();
    assert_eq!(
        statuses,
        vec![("bot-1", BotStatus::Running), ("bot-2", BotStatus::Stopped)]
    );
}
