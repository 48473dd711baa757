//! Bot state survives a process restart through the SQLite store.

use bot_fleet_core::{
    Bot, BotStatus, ExchangeCredential, FleetConfig, FleetStore, RuntimeConfig, StateConfig,
};
use bot_fleet_orchestrator::{BotManager, PaperConnector, PaperExchange, SqliteStore};
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config() -> FleetConfig {
    FleetConfig {
        runtime: RuntimeConfig {
            tick_interval_ms: 50,
            ..RuntimeConfig::default()
        },
        state: StateConfig {
            // Force the gzip path for every snapshot.
            compression_threshold_bytes: 1,
            ..StateConfig::default()
        },
        ..FleetConfig::default()
    }
}

async fn open(path: &Path) -> (Arc<BotManager>, Arc<SqliteStore>) {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let store = Arc::new(SqliteStore::connect(&url, 2).await.unwrap());
    let paper = Arc::new(PaperExchange::new());
    paper.set_price("BTC-USD", dec!(100), dec!(0.02));

    let manager = BotManager::builder(
        config(),
        Arc::clone(&store) as Arc<dyn FleetStore>,
        Arc::new(PaperConnector::new(paper)),
    )
    .build();
    manager.spawn_background();
    (manager, store)
}

#[tokio::test]
async fn test_counters_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.db");

    let ticks_before = {
        let (manager, store) = open(&path).await;
        store
            .upsert_credential(&ExchangeCredential::new("cred-1", "paper"))
            .await
            .unwrap();
        store
            .upsert_bot(&Bot::new("bot-1", "owner", "hold", "paper", "BTC-USD").with_credential("cred-1"))
            .await
            .unwrap();

        manager.start_bot("bot-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let reports = manager.shutdown("test restart", None).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(
            store.get_bot("bot-1").await.unwrap().unwrap().status,
            BotStatus::Stopped
        );

        let snapshot = manager.state_manager().load_snapshot("bot-1").await.unwrap();
        assert!(snapshot.verify());
        snapshot.payload.state.performance.ticks
    };
    assert!(ticks_before >= 2);

    let (manager, _store) = open(&path).await;
    let state = manager.start_bot("bot-1").await.unwrap();
    assert!(state.performance.ticks >= ticks_before);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let view = manager.get_bot_status("bot-1").await.unwrap();
    assert_eq!(view.status, BotStatus::Running);
    assert!(view.runtime.unwrap().performance.ticks > ticks_before);

    manager.shutdown("done", None).await;
}
