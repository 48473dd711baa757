use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bot_fleet_core::{
    BackupRecord, BackupType, Bot, BotStatus, ExchangeCredential, FleetStore, PerformanceSummary,
    SnapshotRecord,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

/// Snapshot versions kept per bot. Older versions are pruned on save.
const SNAPSHOT_HISTORY: i64 = 20;

/// `SQLite` implementation of [`FleetStore`].
///
/// Uses connection pooling for concurrent access and runs the embedded
/// migrations on connect.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Creates a new connection pool and runs migrations.
    ///
    /// # Arguments
    ///
    /// * `database_url` - `SQLite` database URL (e.g., `sqlite://fleet.db?mode=rwc`)
    /// * `max_connections` - Pool size
    ///
    /// # Errors
    ///
    /// Returns error if connection fails or migrations fail.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to connect to {database_url}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database.
    ///
    /// A single connection is used so every query sees the same database.
    ///
    /// # Errors
    ///
    /// Returns error if connection or migrations fail.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("invalid timestamp {ms}"))
}

fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative value in {column}"))
}

fn to_i64(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{column} out of range"))
}

fn bot_from_row(row: &SqliteRow) -> Result<Bot> {
    let status: String = row.try_get("status")?;
    let configuration: String = row.try_get("configuration_json")?;
    let risk: String = row.try_get("risk_json")?;
    let performance: String = row.try_get("performance_json")?;

    Ok(Bot {
        id: row.try_get("bot_id")?,
        owner_id: row.try_get("owner_id")?,
        strategy: row.try_get("strategy")?,
        exchange: row.try_get("exchange")?,
        credential_id: row.try_get("credential_id")?,
        symbol: row.try_get("symbol")?,
        status: BotStatus::parse(&status).ok_or_else(|| anyhow!("unknown bot status {status}"))?,
        configuration: serde_json::from_str(&configuration)?,
        risk_management: serde_json::from_str(&risk)?,
        performance: serde_json::from_str(&performance)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<SnapshotRecord> {
    Ok(SnapshotRecord {
        bot_id: row.try_get("bot_id")?,
        version: to_u64(row.try_get("version")?, "version")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        checksum: row.try_get("checksum")?,
        compressed: row.try_get("compressed")?,
        size_bytes: to_u64(row.try_get("size_bytes")?, "size_bytes")?,
        payload: row.try_get("payload")?,
    })
}

fn backup_from_row(row: &SqliteRow) -> Result<BackupRecord> {
    let backup_type: String = row.try_get("backup_type")?;
    Ok(BackupRecord {
        id: row.try_get("backup_id")?,
        bot_id: row.try_get("bot_id")?,
        backup_type: BackupType::parse(&backup_type)
            .ok_or_else(|| anyhow!("unknown backup type {backup_type}"))?,
        reason: row.try_get("reason")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        version: to_u64(row.try_get("version")?, "version")?,
        checksum: row.try_get("checksum")?,
        compressed: row.try_get("compressed")?,
        size_bytes: to_u64(row.try_get("size_bytes")?, "size_bytes")?,
        payload: row.try_get("payload")?,
    })
}

#[async_trait]
impl FleetStore for SqliteStore {
    async fn is_connection_active(&self) -> bool {
        !self.pool.is_closed() && sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>> {
        let row = sqlx::query("SELECT * FROM bots WHERE bot_id = ?1")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(bot_from_row).transpose()
    }

    async fn list_bots(&self) -> Result<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM bots ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(bot_from_row).collect()
    }

    async fn upsert_bot(&self, bot: &Bot) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO bots (bot_id, owner_id, strategy, exchange, credential_id, symbol, status,
                              configuration_json, risk_json, performance_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(bot_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                strategy = excluded.strategy,
                exchange = excluded.exchange,
                credential_id = excluded.credential_id,
                symbol = excluded.symbol,
                status = excluded.status,
                configuration_json = excluded.configuration_json,
                risk_json = excluded.risk_json,
                performance_json = excluded.performance_json,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&bot.id)
        .bind(&bot.owner_id)
        .bind(&bot.strategy)
        .bind(&bot.exchange)
        .bind(&bot.credential_id)
        .bind(&bot.symbol)
        .bind(bot.status.as_str())
        .bind(serde_json::to_string(&bot.configuration)?)
        .bind(serde_json::to_string(&bot.risk_management)?)
        .bind(serde_json::to_string(&bot.performance)?)
        .bind(bot.created_at.timestamp_millis())
        .bind(bot.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()> {
        sqlx::query("UPDATE bots SET status = ?1, updated_at = ?2 WHERE bot_id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(bot_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_bot_strategy(
        &self,
        bot_id: &str,
        strategy: &str,
        configuration: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE bots SET strategy = ?1, configuration_json = ?2, updated_at = ?3 WHERE bot_id = ?4",
        )
        .bind(strategy)
        .bind(serde_json::to_string(configuration)?)
        .bind(Utc::now().timestamp_millis())
        .bind(bot_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_bot_performance(
        &self,
        bot_id: &str,
        performance: &PerformanceSummary,
    ) -> Result<()> {
        sqlx::query("UPDATE bots SET performance_json = ?1, updated_at = ?2 WHERE bot_id = ?3")
            .bind(serde_json::to_string(performance)?)
            .bind(Utc::now().timestamp_millis())
            .bind(bot_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_credential(&self, credential_id: &str) -> Result<Option<ExchangeCredential>> {
        let row = sqlx::query_as::<_, (String, String, String, bool)>(
            "SELECT credential_id, exchange, key_reference, active FROM exchange_credentials WHERE credential_id = ?1",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, exchange, key_reference, active)| ExchangeCredential {
            id,
            exchange,
            key_reference,
            active,
        }))
    }

    async fn upsert_credential(&self, credential: &ExchangeCredential) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO exchange_credentials (credential_id, exchange, key_reference, active)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(credential_id) DO UPDATE SET
                exchange = excluded.exchange,
                key_reference = excluded.key_reference,
                active = excluded.active
            ",
        )
        .bind(&credential.id)
        .bind(&credential.exchange)
        .bind(&credential.key_reference)
        .bind(credential.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let version = to_i64(record.version, "version")?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT OR REPLACE INTO bot_snapshots
                (bot_id, version, created_at, checksum, compressed, size_bytes, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(&record.bot_id)
        .bind(version)
        .bind(record.created_at.timestamp_millis())
        .bind(&record.checksum)
        .bind(record.compressed)
        .bind(to_i64(record.size_bytes, "size_bytes")?)
        .bind(&record.payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM bot_snapshots WHERE bot_id = ?1 AND version <= ?2")
            .bind(&record.bot_id)
            .bind(version - SNAPSHOT_HISTORY)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn latest_snapshot(&self, bot_id: &str) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query(
            "SELECT * FROM bot_snapshots WHERE bot_id = ?1 ORDER BY version DESC LIMIT 1",
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn save_backup(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO bot_backups
                (backup_id, bot_id, backup_type, reason, created_at, version, checksum,
                 compressed, size_bytes, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(&record.id)
        .bind(&record.bot_id)
        .bind(record.backup_type.as_str())
        .bind(&record.reason)
        .bind(record.created_at.timestamp_millis())
        .bind(to_i64(record.version, "version")?)
        .bind(&record.checksum)
        .bind(record.compressed)
        .bind(to_i64(record.size_bytes, "size_bytes")?)
        .bind(&record.payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_backups(&self, bot_id: &str) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM bot_backups WHERE bot_id = ?1 ORDER BY created_at DESC, version DESC",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(backup_from_row).collect()
    }

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let row = sqlx::query("SELECT * FROM bot_backups WHERE backup_id = ?1")
            .bind(backup_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(backup_from_row).transpose()
    }

    async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM bot_backups WHERE backup_id = ?1")
            .bind(backup_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
