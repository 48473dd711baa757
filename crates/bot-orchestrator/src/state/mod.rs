//! Versioned snapshots, backups, and recovery of bot runtime state.

mod snapshot;

pub use snapshot::{
    checksum_of, decode, encode, EncodedSnapshot, SnapshotPayload, StateSnapshot,
    CURRENT_SCHEMA_VERSION,
};

use bot_fleet_core::{
    BackupRecord, BackupType, BotState, FleetError, FleetResult, FleetStore, OpenOrder,
    PerformanceCounters, Position, RuntimeStatus, SnapshotRecord, StateConfig, StrategyDescriptor,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Metadata describing a stored backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub bot_id: String,
    pub backup_type: BackupType,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub version: u64,
    pub size_bytes: u64,
    pub compressed: bool,
}

impl From<&BackupRecord> for BackupInfo {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id.clone(),
            bot_id: record.bot_id.clone(),
            backup_type: record.backup_type,
            reason: record.reason.clone(),
            created_at: record.created_at,
            version: record.version,
            size_bytes: record.size_bytes,
            compressed: record.compressed,
        }
    }
}

/// Selects a backup and the parts of it to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Explicit backup; takes precedence over `target_time`.
    pub backup_id: Option<String>,
    /// Newest backup taken at or before this instant.
    pub target_time: Option<DateTime<Utc>>,
    pub verify_integrity: bool,
    pub restore_positions: bool,
    pub restore_orders: bool,
    pub restore_configuration: bool,
    pub restore_strategy: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            backup_id: None,
            target_time: None,
            verify_integrity: true,
            restore_positions: true,
            restore_orders: true,
            restore_configuration: true,
            restore_strategy: true,
        }
    }
}

/// Partial update merged into the latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub status: Option<RuntimeStatus>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub error_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub performance: Option<PerformanceCounters>,
    pub positions: Option<Vec<Position>>,
    pub open_orders: Option<Vec<OpenOrder>>,
    pub strategy: Option<StrategyDescriptor>,
    pub strategy_state: Option<serde_json::Value>,
    pub configuration: Option<serde_json::Value>,
}

impl StateUpdate {
    /// Update carrying the tick-level fields of `state`.
    #[must_use]
    pub fn from_tick(state: &BotState, strategy_state: serde_json::Value) -> Self {
        Self {
            status: Some(state.status),
            last_tick_at: state.last_tick_at,
            error_count: Some(state.error_count),
            last_error: Some(state.last_error.clone()),
            performance: Some(state.performance.clone()),
            positions: Some(state.positions.clone()),
            open_orders: Some(state.open_orders.clone()),
            strategy: Some(state.strategy.clone()),
            strategy_state: Some(strategy_state),
            configuration: None,
        }
    }

    fn apply(self, payload: &mut SnapshotPayload) {
        let state = &mut payload.state;
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(at) = self.last_tick_at {
            state.last_tick_at = Some(at);
        }
        if let Some(count) = self.error_count {
            state.error_count = count;
        }
        if let Some(last_error) = self.last_error {
            state.last_error = last_error;
        }
        if let Some(performance) = self.performance {
            state.performance = performance;
        }
        if let Some(positions) = self.positions {
            state.positions = positions;
        }
        if let Some(orders) = self.open_orders {
            state.open_orders = orders;
        }
        if let Some(strategy) = self.strategy {
            state.strategy = strategy;
        }
        if let Some(strategy_state) = self.strategy_state {
            payload.strategy_state = Some(strategy_state);
        }
        if let Some(configuration) = self.configuration {
            payload.configuration = configuration;
        }
    }
}

/// Owns snapshot versioning, backup retention, and recovery for every bot.
pub struct StateManager {
    store: Arc<dyn FleetStore>,
    config: StateConfig,
    versions: Mutex<HashMap<String, u64>>,
    latest: Mutex<HashMap<String, StateSnapshot>>,
    tracked: Mutex<HashSet<String>>,
}

impl StateManager {
    #[must_use]
    pub fn new(store: Arc<dyn FleetStore>, config: StateConfig) -> Self {
        Self {
            store,
            config,
            versions: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &StateConfig {
        &self.config
    }

    async fn next_version(&self, bot_id: &str) -> FleetResult<u64> {
        let known = self.versions.lock().get(bot_id).copied();
        let seed = match known {
            Some(v) => v,
            None => self
                .store
                .latest_snapshot(bot_id)
                .await
                .map_err(|e| FleetError::storage(&e))?
                .map_or(0, |record| record.version),
        };

        let mut versions = self.versions.lock();
        let current = versions.entry(bot_id.to_string()).or_insert(seed);
        *current = (*current).max(seed) + 1;
        Ok(*current)
    }

    /// Builds a new sealed snapshot with the next version for the bot.
    ///
    /// # Errors
    ///
    /// Returns an error if the version counter cannot be seeded from storage.
    pub async fn create_snapshot(
        &self,
        state: &BotState,
        configuration: &serde_json::Value,
        strategy_state: Option<serde_json::Value>,
    ) -> FleetResult<StateSnapshot> {
        let version = self.next_version(&state.bot_id).await?;
        StateSnapshot::seal(
            state.bot_id.clone(),
            version,
            Utc::now(),
            SnapshotPayload {
                schema_version: CURRENT_SCHEMA_VERSION,
                state: state.clone(),
                configuration: configuration.clone(),
                strategy_state,
            },
        )
    }

    /// Persists a snapshot as the bot's latest.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the store write fails.
    pub async fn save_snapshot(&self, snapshot: &StateSnapshot) -> FleetResult<()> {
        let encoded = encode(snapshot, self.config.compression_threshold_bytes)?;
        let record = SnapshotRecord {
            bot_id: snapshot.bot_id.clone(),
            version: snapshot.version,
            created_at: snapshot.timestamp,
            checksum: snapshot.checksum.clone(),
            compressed: encoded.compressed,
            size_bytes: encoded.size_bytes,
            payload: encoded.bytes,
        };

        self.store
            .save_snapshot(&record)
            .await
            .map_err(|e| FleetError::storage(&e))?;

        self.latest
            .lock()
            .insert(snapshot.bot_id.clone(), snapshot.clone());
        tracing::debug!(
            "Saved snapshot v{} for bot {} ({} bytes, compressed={})",
            snapshot.version,
            snapshot.bot_id,
            record.size_bytes,
            record.compressed
        );
        Ok(())
    }

    /// Creates and saves a snapshot in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if versioning, encoding, or the store write fails.
    pub async fn persist(
        &self,
        state: &BotState,
        configuration: &serde_json::Value,
        strategy_state: Option<serde_json::Value>,
    ) -> FleetResult<StateSnapshot> {
        let snapshot = self
            .create_snapshot(state, configuration, strategy_state)
            .await?;
        self.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Loads the latest stored snapshot, verifying its checksum when configured.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::SnapshotNotFound`] when nothing is stored and
    /// [`FleetError::StateCorrupted`] when verification or decoding fails.
    pub async fn load_snapshot(&self, bot_id: &str) -> FleetResult<StateSnapshot> {
        let record = self
            .store
            .latest_snapshot(bot_id)
            .await
            .map_err(|e| FleetError::storage(&e))?
            .ok_or_else(|| FleetError::SnapshotNotFound(bot_id.to_string()))?;

        let snapshot = decode(
            bot_id,
            &record.payload,
            record.compressed,
            Some(&record.checksum),
            self.config.verify_checksum,
        )?;

        {
            let mut versions = self.versions.lock();
            let current = versions.entry(bot_id.to_string()).or_insert(0);
            *current = (*current).max(snapshot.version);
        }
        self.latest
            .lock()
            .insert(bot_id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Merges `update` into the latest snapshot and saves it as the next version.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::SnapshotNotFound`] if the bot has no snapshot yet.
    pub async fn update_state(&self, bot_id: &str, update: StateUpdate) -> FleetResult<StateSnapshot> {
        let cached = self.latest.lock().get(bot_id).cloned();
        let base = match cached {
            Some(snapshot) => snapshot,
            None => self.load_snapshot(bot_id).await?,
        };

        let mut payload = base.payload;
        update.apply(&mut payload);
        let version = self.next_version(bot_id).await?;
        let snapshot = StateSnapshot::seal(bot_id, version, Utc::now(), payload)?;
        self.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Stores `snapshot` as a backup and prunes beyond the retention count.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or a store operation fails.
    pub async fn create_backup(
        &self,
        snapshot: &StateSnapshot,
        backup_type: BackupType,
        reason: &str,
    ) -> FleetResult<BackupInfo> {
        let encoded = encode(snapshot, self.config.compression_threshold_bytes)?;
        let record = BackupRecord {
            id: uuid::Uuid::new_v4().to_string(),
            bot_id: snapshot.bot_id.clone(),
            backup_type,
            reason: reason.to_string(),
            created_at: Utc::now(),
            version: snapshot.version,
            checksum: snapshot.checksum.clone(),
            compressed: encoded.compressed,
            size_bytes: encoded.size_bytes,
            payload: encoded.bytes,
        };

        self.store
            .save_backup(&record)
            .await
            .map_err(|e| FleetError::storage(&e))?;
        tracing::info!(
            "Created {} backup {} for bot {}: {}",
            backup_type,
            record.id,
            snapshot.bot_id,
            reason
        );

        self.prune_backups(&snapshot.bot_id).await?;
        Ok(BackupInfo::from(&record))
    }

    /// Backs up the bot's latest stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid snapshot exists or the backup cannot be stored.
    pub async fn backup_latest(
        &self,
        bot_id: &str,
        backup_type: BackupType,
        reason: &str,
    ) -> FleetResult<BackupInfo> {
        let snapshot = self.load_snapshot(bot_id).await?;
        self.create_backup(&snapshot, backup_type, reason).await
    }

    /// Snapshots live state and stores it as an emergency backup.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot or backup cannot be stored.
    pub async fn emergency_backup(
        &self,
        state: &BotState,
        configuration: &serde_json::Value,
        strategy_state: Option<serde_json::Value>,
        reason: &str,
    ) -> FleetResult<BackupInfo> {
        tracing::warn!("Emergency backup for bot {}: {}", state.bot_id, reason);
        let snapshot = self
            .create_snapshot(state, configuration, strategy_state)
            .await?;
        self.create_backup(&snapshot, BackupType::Emergency, reason)
            .await
    }

    async fn prune_backups(&self, bot_id: &str) -> FleetResult<()> {
        let backups = self
            .store
            .list_backups(bot_id)
            .await
            .map_err(|e| FleetError::storage(&e))?;

        for stale in backups.iter().skip(self.config.backup_retention) {
            self.store
                .delete_backup(&stale.id)
                .await
                .map_err(|e| FleetError::storage(&e))?;
            tracing::debug!("Pruned backup {} for bot {}", stale.id, bot_id);
        }
        Ok(())
    }

    /// Lists backups for the bot, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn list_backups(&self, bot_id: &str) -> FleetResult<Vec<BackupInfo>> {
        let backups = self
            .store
            .list_backups(bot_id)
            .await
            .map_err(|e| FleetError::storage(&e))?;
        Ok(backups.iter().map(BackupInfo::from).collect())
    }

    async fn select_backup(&self, bot_id: &str, options: &RecoveryOptions) -> FleetResult<BackupRecord> {
        let not_found = || FleetError::BackupNotFound(bot_id.to_string());

        if let Some(id) = &options.backup_id {
            return self
                .store
                .get_backup(id)
                .await
                .map_err(|e| FleetError::storage(&e))?
                .filter(|b| b.bot_id == bot_id)
                .ok_or_else(not_found);
        }

        let backups = self
            .store
            .list_backups(bot_id)
            .await
            .map_err(|e| FleetError::storage(&e))?;

        match options.target_time {
            Some(target) => backups.into_iter().find(|b| b.created_at <= target),
            None => backups.into_iter().next(),
        }
        .ok_or_else(not_found)
    }

    /// Restores a backup as the bot's newest snapshot.
    ///
    /// Suppressed positions and orders are cleared. Suppressed configuration
    /// and strategy are carried over from the current latest snapshot when one
    /// can be loaded.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::BackupNotFound`] if no backup matches and
    /// [`FleetError::StateCorrupted`] if integrity verification fails.
    pub async fn recover_from_backup(
        &self,
        bot_id: &str,
        options: RecoveryOptions,
    ) -> FleetResult<StateSnapshot> {
        let record = self.select_backup(bot_id, &options).await?;
        let restored = decode(
            bot_id,
            &record.payload,
            record.compressed,
            Some(&record.checksum),
            options.verify_integrity,
        )?;

        let needs_current = !options.restore_configuration || !options.restore_strategy;
        let current = if needs_current {
            self.load_snapshot(bot_id).await.ok()
        } else {
            None
        };

        let mut payload = restored.payload;
        if !options.restore_positions {
            payload.state.positions.clear();
        }
        if !options.restore_orders {
            payload.state.open_orders.clear();
        }
        if !options.restore_configuration {
            payload.configuration = current.as_ref().map_or_else(
                || serde_json::Value::Object(serde_json::Map::new()),
                |c| c.payload.configuration.clone(),
            );
        }
        if !options.restore_strategy {
            match &current {
                Some(c) => {
                    payload.state.strategy = c.payload.state.strategy.clone();
                    payload.strategy_state = c.payload.strategy_state.clone();
                }
                None => payload.strategy_state = None,
            }
        }

        let version = self.next_version(bot_id).await?;
        let snapshot = StateSnapshot::seal(bot_id, version, Utc::now(), payload)?;
        self.save_snapshot(&snapshot).await?;

        tracing::info!(
            "Recovered bot {} from backup {} (v{} -> v{})",
            bot_id,
            record.id,
            record.version,
            snapshot.version
        );
        Ok(snapshot)
    }

    /// Includes the bot in scheduled backups.
    pub fn track(&self, bot_id: &str) {
        self.tracked.lock().insert(bot_id.to_string());
    }

    pub fn untrack(&self, bot_id: &str) {
        self.tracked.lock().remove(bot_id);
    }

    #[must_use]
    pub fn tracked_bots(&self) -> Vec<String> {
        let mut bots: Vec<_> = self.tracked.lock().iter().cloned().collect();
        bots.sort();
        bots
    }

    /// Takes a scheduled backup of every tracked bot's latest snapshot.
    ///
    /// Returns the number of backups created. Failures are logged per bot.
    pub async fn run_scheduled_backups(&self) -> usize {
        let mut created = 0;
        for bot_id in self.tracked_bots() {
            match self
                .backup_latest(&bot_id, BackupType::Scheduled, "scheduled backup")
                .await
            {
                Ok(_) => created += 1,
                Err(e) => tracing::warn!("Scheduled backup failed for bot {}: {}", bot_id, e),
            }
        }
        created
    }

    /// Spawns the periodic backup task. It exits when `shutdown` flips to `true`.
    pub fn spawn_backup_scheduler(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let period = manager.config.backup_interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let created = manager.run_scheduled_backups().await;
                        tracing::debug!("Scheduled backup pass created {} backups", created);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Backup scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bot_fleet_core::{
        MarketType, OrderPurpose, OrderSide, OrderStatus, OrderType, StrategyKind,
    };
    use rust_decimal_macros::dec;

    fn manager(store: Arc<MemoryStore>) -> StateManager {
        StateManager::new(
            store,
            StateConfig {
                backup_retention: 3,
                compression_threshold_bytes: 512,
                ..StateConfig::default()
            },
        )
    }

    fn state_with_book(bot_id: &str) -> BotState {
        let mut state = BotState::new(
            bot_id,
            StrategyDescriptor::new("momentum", "1.0.0", StrategyKind::BuiltIn),
        );
        state.apply_fill("BTC-USD", OrderSide::Buy, dec!(1), dec!(100), Utc::now());
        state.apply_fill("ETH-USD", OrderSide::Sell, dec!(2), dec!(50), Utc::now());
        state.open_orders.push(OpenOrder {
            order_id: "ord-1".into(),
            symbol: "BTC-USD".into(),
            side: OrderSide::Sell,
            order_type: OrderType::TakeProfit,
            quantity: dec!(1),
            price: Some(dec!(110)),
            status: OrderStatus::Open,
            purpose: OrderPurpose::TakeProfit,
            market_type: MarketType::Spot,
            placed_at: Utc::now(),
        });
        state
    }

    #[tokio::test]
    async fn test_versions_are_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));
        let state = state_with_book("bot-1");
        let config = serde_json::json!({});

        let a = manager.persist(&state, &config, None).await.unwrap();
        let b = manager.persist(&state, &config, None).await.unwrap();
        assert_eq!((a.version, b.version), (1, 2));

        // A fresh manager over the same store continues the sequence.
        let restarted = StateManager::new(store, StateConfig::default());
        let c = restarted.persist(&state, &config, None).await.unwrap();
        assert_eq!(c.version, 3);
    }

    #[tokio::test]
    async fn test_load_detects_tampering() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));
        let saved = manager
            .persist(&state_with_book("bot-1"), &serde_json::json!({}), None)
            .await
            .unwrap();

        let loaded = manager.load_snapshot("bot-1").await.unwrap();
        assert_eq!(loaded, saved);

        assert!(store.tamper_snapshot("bot-1", |record| {
            assert!(record.compressed);
            let last = record.payload.len() - 5;
            record.payload[last] ^= 0x01;
        }));
        let err = manager.load_snapshot("bot-1").await.unwrap_err();
        assert_eq!(err.reason(), "state_corrupted");
    }

    #[tokio::test]
    async fn test_load_missing_snapshot() {
        let manager = manager(Arc::new(MemoryStore::new()));
        let err = manager.load_snapshot("ghost").await.unwrap_err();
        assert_eq!(err.reason(), "snapshot_not_found");
    }

    #[tokio::test]
    async fn test_update_state_requires_snapshot() {
        let manager = manager(Arc::new(MemoryStore::new()));
        let err = manager
            .update_state("ghost", StateUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "snapshot_not_found");
    }

    #[tokio::test]
    async fn test_update_state_merges_and_bumps_version() {
        let manager = manager(Arc::new(MemoryStore::new()));
        let state = state_with_book("bot-1");
        let first = manager
            .persist(&state, &serde_json::json!({"lookback": 3}), None)
            .await
            .unwrap();

        let updated = manager
            .update_state(
                "bot-1",
                StateUpdate {
                    positions: Some(Vec::new()),
                    strategy_state: Some(serde_json::json!({"n": 1})),
                    ..StateUpdate::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.version, first.version + 1);
        assert!(updated.payload.state.positions.is_empty());
        assert_eq!(updated.payload.state.open_orders.len(), 1);
        assert_eq!(updated.payload.configuration["lookback"], 3);
        assert!(updated.verify());
    }

    #[tokio::test]
    async fn test_backup_retention_prunes_oldest() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));
        let state = state_with_book("bot-1");
        let config = serde_json::json!({});

        let mut ids = Vec::new();
        for i in 0..5 {
            let snap = manager.persist(&state, &config, None).await.unwrap();
            let info = manager
                .create_backup(&snap, BackupType::Manual, &format!("backup {i}"))
                .await
                .unwrap();
            ids.push(info.id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let remaining: Vec<_> = manager
            .list_backups("bot-1")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(remaining, vec![ids[4].clone(), ids[3].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_recover_without_positions() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));
        let state = state_with_book("bot-1");
        let snap = manager
            .persist(&state, &serde_json::json!({"lookback": 5}), Some(serde_json::json!({"k": 1})))
            .await
            .unwrap();
        assert_eq!(snap.payload.state.positions.len(), 2);
        manager
            .create_backup(&snap, BackupType::PreRestart, "before restart")
            .await
            .unwrap();

        let recovered = manager
            .recover_from_backup(
                "bot-1",
                RecoveryOptions {
                    restore_positions: false,
                    ..RecoveryOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(recovered.payload.state.positions.is_empty());
        assert_eq!(recovered.payload.state.open_orders, snap.payload.state.open_orders);
        assert_eq!(recovered.payload.state.strategy, snap.payload.state.strategy);
        assert_eq!(recovered.payload.strategy_state, snap.payload.strategy_state);
        assert!(recovered.version > snap.version);

        let latest = manager.load_snapshot("bot-1").await.unwrap();
        assert_eq!(latest.version, recovered.version);
    }

    #[tokio::test]
    async fn test_recover_by_target_time_and_id() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));
        let config = serde_json::json!({});

        let mut state = state_with_book("bot-1");
        let early = manager.persist(&state, &config, None).await.unwrap();
        let early_backup = manager
            .create_backup(&early, BackupType::Scheduled, "early")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        state.positions.clear();
        let late = manager.persist(&state, &config, None).await.unwrap();
        manager
            .create_backup(&late, BackupType::Scheduled, "late")
            .await
            .unwrap();

        let by_time = manager
            .recover_from_backup(
                "bot-1",
                RecoveryOptions {
                    target_time: Some(cutoff),
                    ..RecoveryOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_time.payload.state.positions.len(), 2);

        let latest = manager
            .recover_from_backup("bot-1", RecoveryOptions::default())
            .await
            .unwrap();
        assert!(latest.payload.state.positions.is_empty());

        let by_id = manager
            .recover_from_backup(
                "bot-1",
                RecoveryOptions {
                    backup_id: Some(early_backup.id),
                    ..RecoveryOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_id.payload.state.positions.len(), 2);

        let err = manager
            .recover_from_backup(
                "bot-1",
                RecoveryOptions {
                    backup_id: Some("nope".into()),
                    ..RecoveryOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "backup_not_found");
    }

    #[tokio::test]
    async fn test_recover_rejects_corrupted_backup() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(Arc::clone(&store));
        let snap = manager
            .persist(&state_with_book("bot-1"), &serde_json::json!({}), None)
            .await
            .unwrap();
        let info = manager
            .create_backup(&snap, BackupType::Manual, "manual")
            .await
            .unwrap();

        store.tamper_backup(&info.id, |record| record.checksum = "0".repeat(64));
        let err = manager
            .recover_from_backup("bot-1", RecoveryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "state_corrupted");
    }

    #[tokio::test]
    async fn test_scheduled_backups_cover_tracked_bots() {
        let manager = manager(Arc::new(MemoryStore::new()));
        let config = serde_json::json!({});
        manager
            .persist(&state_with_book("bot-1"), &config, None)
            .await
            .unwrap();
        manager.track("bot-1");
        manager.track("bot-2");

        assert_eq!(manager.run_scheduled_backups().await, 1);
        let backups = manager.list_backups("bot-1").await.unwrap();
        assert_eq!(backups[0].backup_type, BackupType::Scheduled);

        manager.untrack("bot-1");
        assert_eq!(manager.tracked_bots(), vec!["bot-2".to_string()]);
    }
}
