use anyhow::{bail, Result};
use async_trait::async_trait;
use bot_fleet_core::{
    BackupRecord, Bot, BotStatus, ExchangeCredential, FleetStore, PerformanceSummary,
    SnapshotRecord,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct Inner {
    bots: HashMap<String, Bot>,
    credentials: HashMap<String, ExchangeCredential>,
    snapshots: HashMap<String, SnapshotRecord>,
    backups: HashMap<String, BackupRecord>,
}

/// In-process [`FleetStore`] for tests and paper runs.
///
/// Keeps only the latest snapshot per bot.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    connected: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the database connection. While
    /// disconnected every call fails.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Mutates the stored latest snapshot in place. Returns `false` if none exists.
    pub fn tamper_snapshot(&self, bot_id: &str, f: impl FnOnce(&mut SnapshotRecord)) -> bool {
        let mut inner = self.inner.write();
        match inner.snapshots.get_mut(bot_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Mutates a stored backup in place. Returns `false` if none exists.
    pub fn tamper_backup(&self, backup_id: &str, f: impl FnOnce(&mut BackupRecord)) -> bool {
        let mut inner = self.inner.write();
        match inner.backups.get_mut(backup_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("database pool unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn is_connection_active(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>> {
        self.ensure_connected()?;
        Ok(self.inner.read().bots.get(bot_id).cloned())
    }

    async fn list_bots(&self) -> Result<Vec<Bot>> {
        self.ensure_connected()?;
        let mut bots: Vec<_> = self.inner.read().bots.values().cloned().collect();
        bots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(bots)
    }

    async fn upsert_bot(&self, bot: &Bot) -> Result<()> {
        self.ensure_connected()?;
        self.inner.write().bots.insert(bot.id.clone(), bot.clone());
        Ok(())
    }

    async fn update_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()> {
        self.ensure_connected()?;
        if let Some(bot) = self.inner.write().bots.get_mut(bot_id) {
            bot.status = status;
            bot.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_bot_strategy(
        &self,
        bot_id: &str,
        strategy: &str,
        configuration: &serde_json::Value,
    ) -> Result<()> {
        self.ensure_connected()?;
        if let Some(bot) = self.inner.write().bots.get_mut(bot_id) {
            bot.strategy = strategy.to_string();
            bot.configuration = configuration.clone();
            bot.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_bot_performance(
        &self,
        bot_id: &str,
        performance: &PerformanceSummary,
    ) -> Result<()> {
        self.ensure_connected()?;
        if let Some(bot) = self.inner.write().bots.get_mut(bot_id) {
            bot.performance = performance.clone();
            bot.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_credential(&self, credential_id: &str) -> Result<Option<ExchangeCredential>> {
        self.ensure_connected()?;
        Ok(self.inner.read().credentials.get(credential_id).cloned())
    }

    async fn upsert_credential(&self, credential: &ExchangeCredential) -> Result<()> {
        self.ensure_connected()?;
        self.inner
            .write()
            .credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn save_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        self.ensure_connected()?;
        let mut inner = self.inner.write();
        let newer_exists = inner
            .snapshots
            .get(&record.bot_id)
            .is_some_and(|existing| existing.version > record.version);
        if !newer_exists {
            inner
                .snapshots
                .insert(record.bot_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn latest_snapshot(&self, bot_id: &str) -> Result<Option<SnapshotRecord>> {
        self.ensure_connected()?;
        Ok(self.inner.read().snapshots.get(bot_id).cloned())
    }

    async fn save_backup(&self, record: &BackupRecord) -> Result<()> {
        self.ensure_connected()?;
        self.inner
            .write()
            .backups
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_backups(&self, bot_id: &str) -> Result<Vec<BackupRecord>> {
        self.ensure_connected()?;
        let mut backups: Vec<_> = self
            .inner
            .read()
            .backups
            .values()
            .filter(|b| b.bot_id == bot_id)
            .cloned()
            .collect();
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.version.cmp(&a.version))
        });
        Ok(backups)
    }

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        self.ensure_connected()?;
        Ok(self.inner.read().backups.get(backup_id).cloned())
    }

    async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        self.ensure_connected()?;
        self.inner.write().backups.remove(backup_id);
        Ok(())
    }
}
