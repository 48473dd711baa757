use crate::bot::{Bot, BotStatus, ExchangeCredential, PerformanceSummary};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Scheduled,
    Manual,
    PreRestart,
    Emergency,
}

impl BackupType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::PreRestart => "pre_restart",
            Self::Emergency => "emergency",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "manual" => Some(Self::Manual),
            "pre_restart" => Some(Self::PreRestart),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded snapshot as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub bot_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    pub compressed: bool,
    /// Uncompressed payload size.
    pub size_bytes: u64,
    pub payload: Vec<u8>,
}

/// Encoded snapshot retained as a labeled backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    pub bot_id: String,
    pub backup_type: BackupType,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub version: u64,
    pub checksum: String,
    pub compressed: bool,
    pub size_bytes: u64,
    pub payload: Vec<u8>,
}

/// Durable storage consumed by the fleet.
///
/// Implementations must be safe to share between tasks.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn is_connection_active(&self) -> bool;

    async fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>>;

    async fn list_bots(&self) -> Result<Vec<Bot>>;

    async fn upsert_bot(&self, bot: &Bot) -> Result<()>;

    async fn update_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()>;

    async fn update_bot_strategy(
        &self,
        bot_id: &str,
        strategy: &str,
        configuration: &serde_json::Value,
    ) -> Result<()>;

    async fn update_bot_performance(
        &self,
        bot_id: &str,
        performance: &PerformanceSummary,
    ) -> Result<()>;

    async fn get_credential(&self, credential_id: &str) -> Result<Option<ExchangeCredential>>;

    async fn upsert_credential(&self, credential: &ExchangeCredential) -> Result<()>;

    async fn save_snapshot(&self, record: &SnapshotRecord) -> Result<()>;

    /// Highest-version snapshot for the bot.
    async fn latest_snapshot(&self, bot_id: &str) -> Result<Option<SnapshotRecord>>;

    async fn save_backup(&self, record: &BackupRecord) -> Result<()>;

    /// Backups for the bot, newest first.
    async fn list_backups(&self, bot_id: &str) -> Result<Vec<BackupRecord>>;

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>>;

    async fn delete_backup(&self, backup_id: &str) -> Result<()>;
}
