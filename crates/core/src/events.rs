//! Fleet-wide event stream.
//!
//! Every component publishes onto one [`EventBus`]. Delivery is
//! fire-and-forget: a subscriber that falls more than the channel capacity
//! behind skips the oldest events.

use crate::bot::BotStatus;
use crate::classification::{ErrorSeverity, ErrorType, HealthStatus, RecoveryStrategy};
use crate::state::{PerformanceCounters, StrategyDescriptor};
use crate::trading::{OrderResponse, OrderSide, StrategyDecision};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthWarningKind {
    /// Running without a tick for longer than the staleness threshold.
    StaleTick,
    /// Error/tick ratio above the configured maximum.
    HighErrorRatio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    StatusChanged {
        bot_id: String,
        status: BotStatus,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Performance {
        bot_id: String,
        counters: PerformanceCounters,
        timestamp: DateTime<Utc>,
    },
    StrategyUpdated {
        bot_id: String,
        strategy: StrategyDescriptor,
        previous: Option<StrategyDescriptor>,
        rollback: bool,
    },
    Alert {
        bot_id: Option<String>,
        level: AlertLevel,
        title: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    // Trade pipeline
    SignalValidated {
        bot_id: String,
        decision: StrategyDecision,
    },
    SignalRejected {
        bot_id: String,
        reason: String,
    },
    DecisionApproved {
        bot_id: String,
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        estimated_cost: Decimal,
    },
    DecisionRejected {
        bot_id: String,
        symbol: String,
        reason: String,
    },
    TradeExecuted {
        bot_id: String,
        order: OrderResponse,
    },
    TradeFailed {
        bot_id: String,
        symbol: String,
        reason: String,
    },
    OrderTimedOut {
        bot_id: String,
        order_id: String,
    },

    // Recovery lifecycle
    ErrorRecorded {
        bot_id: String,
        error_id: String,
        error_type: ErrorType,
        severity: ErrorSeverity,
        message: String,
    },
    Recovered {
        bot_id: String,
        error_id: String,
        strategy: RecoveryStrategy,
    },
    RecoveryFailed {
        bot_id: String,
        error_id: String,
        error_type: ErrorType,
        reason: String,
    },
    AdminAlert {
        bot_id: String,
        error_id: String,
        error_type: ErrorType,
        message: String,
    },
    RestartRequired {
        bot_id: String,
        error_id: String,
        reason: String,
    },
    AlertThresholdExceeded {
        bot_id: String,
        error_count: usize,
        window_secs: u64,
    },

    // Watchdog and health
    HealthChecked {
        bot_id: String,
        status: HealthStatus,
        issues: Vec<String>,
    },
    HealthWarning {
        bot_id: String,
        kind: HealthWarningKind,
        message: String,
    },
    BotRestarted {
        bot_id: String,
        reason: String,
    },
    BotRestartFailed {
        bot_id: String,
        error: String,
    },
    ShutdownCompleted {
        bot_id: String,
        completed: Vec<String>,
        failed: Vec<String>,
    },
    FailoverActivated {
        error_count: usize,
        stopped_bots: Vec<String>,
    },
}

impl FleetEvent {
    /// Bot the event concerns, if any.
    #[must_use]
    pub fn bot_id(&self) -> Option<&str> {
        match self {
            Self::StatusChanged { bot_id, .. }
            | Self::Performance { bot_id, .. }
            | Self::StrategyUpdated { bot_id, .. }
            | Self::SignalValidated { bot_id, .. }
            | Self::SignalRejected { bot_id, .. }
            | Self::DecisionApproved { bot_id, .. }
            | Self::DecisionRejected { bot_id, .. }
            | Self::TradeExecuted { bot_id, .. }
            | Self::TradeFailed { bot_id, .. }
            | Self::OrderTimedOut { bot_id, .. }
            | Self::ErrorRecorded { bot_id, .. }
            | Self::Recovered { bot_id, .. }
            | Self::RecoveryFailed { bot_id, .. }
            | Self::AdminAlert { bot_id, .. }
            | Self::RestartRequired { bot_id, .. }
            | Self::AlertThresholdExceeded { bot_id, .. }
            | Self::HealthChecked { bot_id, .. }
            | Self::HealthWarning { bot_id, .. }
            | Self::BotRestarted { bot_id, .. }
            | Self::BotRestartFailed { bot_id, .. }
            | Self::ShutdownCompleted { bot_id, .. } => Some(bot_id),
            Self::Alert { bot_id, .. } => bot_id.as_deref(),
            Self::FailoverActivated { .. } => None,
        }
    }

    /// Short kebab-case name, used in logs and by subscribers that filter.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status",
            Self::Performance { .. } => "performance",
            Self::StrategyUpdated { .. } => "strategy-update",
            Self::Alert { .. } => "alert",
            Self::SignalValidated { .. } => "signal-validated",
            Self::SignalRejected { .. } => "signal-rejected",
            Self::DecisionApproved { .. } => "decision-approved",
            Self::DecisionRejected { .. } => "decision-rejected",
            Self::TradeExecuted { .. } => "trade-executed",
            Self::TradeFailed { .. } => "trade-failed",
            Self::OrderTimedOut { .. } => "order-timeout",
            Self::ErrorRecorded { .. } => "error",
            Self::Recovered { .. } => "recovery",
            Self::RecoveryFailed { .. } => "recovery-failed",
            Self::AdminAlert { .. } => "admin-alert",
            Self::RestartRequired { .. } => "restart-required",
            Self::AlertThresholdExceeded { .. } => "alert-threshold-exceeded",
            Self::HealthChecked { .. } => "health-check",
            Self::HealthWarning { .. } => "health-warning",
            Self::BotRestarted { .. } => "bot-restarted",
            Self::BotRestartFailed { .. } => "bot-restart-failed",
            Self::ShutdownCompleted { .. } => "shutdown-completed",
            Self::FailoverActivated { .. } => "failover-activated",
        }
    }
}

/// Broadcast bus shared by every component of one fleet.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: FleetEvent) {
        tracing::trace!("event {} for {:?}", event.name(), event.bot_id());
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(FleetEvent::BotRestarted {
            bot_id: "bot-1".into(),
            reason: "watchdog".into(),
        });

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.name(), "bot-restarted");
            assert_eq!(event.bot_id(), Some("bot-1"));
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(FleetEvent::FailoverActivated {
            error_count: 3,
            stopped_bots: vec![],
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
