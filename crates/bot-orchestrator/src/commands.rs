use crate::state::RecoveryOptions;
use bot_fleet_core::{BotStatus, FleetError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation addressed to one bot through [`crate::BotManager::dispatch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BotCommand {
    Start,
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
    Pause,
    Resume,
    SwitchStrategy {
        strategy: String,
        #[serde(default)]
        configuration: serde_json::Value,
        #[serde(default)]
        options: SwitchOptions,
    },
    RollbackStrategy,
    Status,
    Backup {
        #[serde(default = "default_backup_reason")]
        reason: String,
    },
    /// Restores a backup into the bot's latest snapshot. The bot must not be
    /// running.
    Recover {
        #[serde(default)]
        request: RecoverRequest,
    },
}

impl BotCommand {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop { .. } => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::SwitchStrategy { .. } => "switch_strategy",
            Self::RollbackStrategy => "rollback_strategy",
            Self::Status => "status",
            Self::Backup { .. } => "backup",
            Self::Recover { .. } => "recover",
        }
    }
}

fn default_backup_reason() -> String {
    "manual backup".to_string()
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchOptions {
    /// Hand the outgoing strategy's state to the new one.
    #[serde(default)]
    pub preserve_state: bool,
    /// Keep running on the previous strategy if the new one fails. When
    /// `false`, a failed switch stops the bot.
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

impl Default for SwitchOptions {
    fn default() -> Self {
        Self {
            preserve_state: false,
            rollback_on_failure: true,
        }
    }
}

/// Wire form of [`RecoveryOptions`]; every part is restored unless disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverRequest {
    pub backup_id: Option<String>,
    pub target_time: Option<DateTime<Utc>>,
    pub verify_integrity: bool,
    pub restore_positions: bool,
    pub restore_orders: bool,
    pub restore_configuration: bool,
    pub restore_strategy: bool,
}

impl Default for RecoverRequest {
    fn default() -> Self {
        let options = RecoveryOptions::default();
        Self {
            backup_id: options.backup_id,
            target_time: options.target_time,
            verify_integrity: options.verify_integrity,
            restore_positions: options.restore_positions,
            restore_orders: options.restore_orders,
            restore_configuration: options.restore_configuration,
            restore_strategy: options.restore_strategy,
        }
    }
}

impl From<RecoverRequest> for RecoveryOptions {
    fn from(request: RecoverRequest) -> Self {
        Self {
            backup_id: request.backup_id,
            target_time: request.target_time,
            verify_integrity: request.verify_integrity,
            restore_positions: request.restore_positions,
            restore_orders: request.restore_orders,
            restore_configuration: request.restore_configuration,
            restore_strategy: request.restore_strategy,
        }
    }
}

/// Structured outcome of a dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    /// Machine-readable code, `ok` on success.
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BotStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    #[must_use]
    pub fn ok(message: impl Into<String>, status: Option<BotStatus>) -> Self {
        Self {
            success: true,
            reason: "ok".to_string(),
            message: message.into(),
            status,
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn from_error(error: &FleetError) -> Self {
        Self {
            success: false,
            reason: error.reason().to_string(),
            message: error.to_string(),
            status: None,
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd: BotCommand = serde_json::from_value(serde_json::json!({
            "command": "switch_strategy",
            "strategy": "momentum",
            "configuration": { "momentum": { "lookback": 4 } },
        }))
        .unwrap();
        match cmd {
            BotCommand::SwitchStrategy { strategy, options, .. } => {
                assert_eq!(strategy, "momentum");
                assert!(options.rollback_on_failure);
                assert!(!options.preserve_state);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let stop: BotCommand = serde_json::from_str(r#"{"command":"stop"}"#).unwrap();
        assert_eq!(stop.name(), "stop");
    }

    #[test]
    fn test_recover_request_defaults_restore_everything() {
        let request: RecoverRequest =
            serde_json::from_str(r#"{"restore_positions": false}"#).unwrap();
        let options = RecoveryOptions::from(request);
        assert!(!options.restore_positions);
        assert!(options.restore_orders);
        assert!(options.verify_integrity);
    }

    #[test]
    fn test_error_response_carries_reason_code() {
        let response = CommandResponse::from_error(&FleetError::AlreadyRunning("bot-1".into()));
        assert!(!response.success);
        assert_eq!(response.reason, "already_running");
        assert_eq!(response.message, "bot bot-1 is already running");
    }
}
