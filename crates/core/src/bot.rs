use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted lifecycle status of a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Error,
}

impl BotStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    /// Parses the persisted representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stopped" => Some(Self::Stopped),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "pausing" => Some(Self::Pausing),
            "paused" => Some(Self::Paused),
            "stopping" => Some(Self::Stopping),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate performance figures kept on the bot record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_trades: u64,
    pub realized_pnl: Decimal,
    pub win_rate: f64,
    pub max_drawdown: Decimal,
}

/// One configured trading automation unit.
///
/// The persistence layer owns this record; runtimes work on a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub owner_id: String,
    /// Name of the strategy in the strategy registry.
    pub strategy: String,
    pub exchange: String,
    pub credential_id: Option<String>,
    /// Symbol the bot trades.
    pub symbol: String,
    pub status: BotStatus,
    /// Strategy parameters.
    pub configuration: serde_json::Value,
    /// Risk overrides, keyed like the decision config.
    pub risk_management: serde_json::Value,
    pub performance: PerformanceSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    /// Creates a stopped bot with empty configuration.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        strategy: impl Into<String>,
        exchange: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            strategy: strategy.into(),
            exchange: exchange.into(),
            credential_id: None,
            symbol: symbol.into(),
            status: BotStatus::Stopped,
            configuration: serde_json::Value::Object(serde_json::Map::new()),
            risk_management: serde_json::Value::Object(serde_json::Map::new()),
            performance: PerformanceSummary::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_credential(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }

    #[must_use]
    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }
}

/// Reference to exchange API credentials. Secrets live outside this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeCredential {
    pub id: String,
    pub exchange: String,
    pub key_reference: String,
    pub active: bool,
}

impl ExchangeCredential {
    #[must_use]
    pub fn new(id: impl Into<String>, exchange: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            key_reference: format!("vault://{id}"),
            id,
            exchange: exchange.into(),
            active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            BotStatus::Stopped,
            BotStatus::Starting,
            BotStatus::Running,
            BotStatus::Pausing,
            BotStatus::Paused,
            BotStatus::Stopping,
            BotStatus::Error,
        ] {
            assert_eq!(BotStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BotStatus::parse("exploded"), None);
    }

    #[test]
    fn test_new_bot_is_stopped() {
        let bot = Bot::new("bot-1", "user-1", "momentum", "paper", "BTC-USD").with_credential("cred-1");
        assert_eq!(bot.status, BotStatus::Stopped);
        assert_eq!(bot.credential_id.as_deref(), Some("cred-1"));
        assert!(bot.configuration.is_object());
    }
}
