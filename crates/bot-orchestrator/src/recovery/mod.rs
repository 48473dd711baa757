//! Error classification, recovery policy, and per-bot circuit breakers.

mod circuit_breaker;
mod classifier;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use classifier::{classify, classify_message, Classification};

use bot_fleet_core::{
    ErrorType, EventBus, FleetEvent, RecoveryConfig, RecoveryStrategy,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Records
// =============================================================================

/// Where an error happened.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub bot_id: String,
    pub operation: String,
    pub metadata: serde_json::Value,
}

impl ErrorContext {
    #[must_use]
    pub fn new(bot_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            operation: operation.into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Recovered,
    Failed,
    Escalated,
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub attempt: u32,
    pub strategy: RecoveryStrategy,
    pub timestamp: DateTime<Utc>,
    pub succeeded: bool,
    pub detail: String,
}

/// One handled error, kept in the bot's bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: String,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Full context chain, outermost first.
    pub chain: Vec<String>,
    pub classification: Classification,
    pub attempts: Vec<RecoveryAttempt>,
    pub resolved: bool,
    pub outcome: ResolutionStatus,
    #[serde(skip)]
    pub occurred_at: Instant,
}

/// What the caller should do after [`ErrorRecoveryManager::handle_error`].
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// The error counts as handled and the caller may continue.
    pub recovered: bool,
    /// Wait this long before retrying.
    pub retry_after: Option<Duration>,
    /// The bot should be restarted.
    pub restart_requested: bool,
    /// Recovery was skipped because the bot's breaker is open.
    pub circuit_open: bool,
    pub record: ErrorRecord,
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Default)]
struct BotRecoveryState {
    history: VecDeque<ErrorRecord>,
    breaker: Option<CircuitBreaker>,
    attempts: HashMap<ErrorType, u32>,
    window: VecDeque<Instant>,
    threshold_alerted_at: Option<Instant>,
}

/// Classifies errors, runs the matching recovery policy, and keeps per-bot
/// history and circuit breakers.
///
/// Each bot's entries are only touched by calls carrying that bot's id.
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    events: EventBus,
    bots: Mutex<HashMap<String, BotRecoveryState>>,
}

impl ErrorRecoveryManager {
    #[must_use]
    pub fn new(config: RecoveryConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            bots: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Handles one error for a bot.
    ///
    /// Classifies it, records it, consults the bot's circuit breaker, runs the
    /// recovery policy, and publishes lifecycle events. Backoff policies
    /// compute a delay and return it instead of sleeping.
    pub fn handle_error(&self, error: &anyhow::Error, context: ErrorContext) -> RecoveryOutcome {
        let classification = classify(error);
        let now = Instant::now();
        let bot_id = context.bot_id.clone();

        let mut record = ErrorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            message: error.to_string(),
            chain: error.chain().map(ToString::to_string).collect(),
            classification,
            attempts: Vec::new(),
            resolved: false,
            outcome: ResolutionStatus::Pending,
            occurred_at: now,
            context,
        };

        tracing::error!(
            "Bot {} error in {} [{}]: {:#}",
            bot_id,
            record.context.operation,
            classification.error_type,
            error
        );
        self.events.publish(FleetEvent::ErrorRecorded {
            bot_id: bot_id.clone(),
            error_id: record.id.clone(),
            error_type: classification.error_type,
            severity: classification.severity,
            message: record.message.clone(),
        });

        let mut bots = self.bots.lock();
        let entry = bots.entry(bot_id.clone()).or_default();

        entry.window.push_back(now);
        let window = self.config.alert_window();
        while entry
            .window
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            entry.window.pop_front();
        }

        let threshold = self.config.circuit_breaker_threshold;
        let timeout = self.config.circuit_breaker_timeout();
        let breaker = entry
            .breaker
            .get_or_insert_with(|| CircuitBreaker::new(threshold, timeout));

        let mut outcome = if breaker.allows(now) {
            let outcome = self.run_recovery(&mut record, &mut entry.attempts);
            if outcome.recovered {
                breaker.record_success();
            } else {
                breaker.record_failure(now);
            }
            outcome
        } else {
            tracing::warn!("Circuit breaker open for bot {}, skipping recovery", bot_id);
            record.outcome = ResolutionStatus::Failed;
            PolicyResult {
                recovered: false,
                retry_after: None,
                restart_requested: false,
                circuit_open: true,
            }
        };

        self.check_alert_threshold(&bot_id, entry, now);

        if outcome.recovered {
            record.resolved = true;
            record.outcome = ResolutionStatus::Recovered;
            self.events.publish(FleetEvent::Recovered {
                bot_id: bot_id.clone(),
                error_id: record.id.clone(),
                strategy: classification.strategy,
            });
        } else {
            let reason = if outcome.circuit_open {
                "circuit breaker open".to_string()
            } else {
                format!("{:?} recovery did not succeed", classification.strategy)
            };
            self.events.publish(FleetEvent::RecoveryFailed {
                bot_id: bot_id.clone(),
                error_id: record.id.clone(),
                error_type: classification.error_type,
                reason,
            });
        }

        entry.history.push_back(record.clone());
        while entry.history.len() > self.config.history_limit {
            entry.history.pop_front();
        }
        drop(bots);

        if outcome.circuit_open {
            outcome.retry_after = None;
        }
        RecoveryOutcome {
            recovered: outcome.recovered,
            retry_after: outcome.retry_after,
            restart_requested: outcome.restart_requested,
            circuit_open: outcome.circuit_open,
            record,
        }
    }

    fn run_recovery(
        &self,
        record: &mut ErrorRecord,
        attempts: &mut HashMap<ErrorType, u32>,
    ) -> PolicyResult {
        let classification = record.classification;
        let bot_id = record.context.bot_id.clone();
        let mut result = PolicyResult::default();

        let (succeeded, attempt, detail) = match classification.strategy {
            RecoveryStrategy::Retry | RecoveryStrategy::ExponentialBackoff => {
                let count = attempts.entry(classification.error_type).or_insert(0);
                *count += 1;
                let attempt = *count;
                let allowed = attempt <= self.config.max_retry_attempts;
                if allowed && classification.strategy == RecoveryStrategy::ExponentialBackoff {
                    result.retry_after = Some(self.config.backoff(attempt));
                }
                let detail = if allowed {
                    format!("attempt {attempt} of {}", self.config.max_retry_attempts)
                } else {
                    format!("retries exhausted after {} attempts", attempt - 1)
                };
                (allowed, attempt, detail)
            }
            RecoveryStrategy::Fallback => (true, 1, "fallback to strategy re-initialization".into()),
            RecoveryStrategy::Restart => {
                result.restart_requested = true;
                self.events.publish(FleetEvent::RestartRequired {
                    bot_id: bot_id.clone(),
                    error_id: record.id.clone(),
                    reason: record.message.clone(),
                });
                (true, 1, "restart requested".into())
            }
            RecoveryStrategy::AlertAdmin => {
                record.outcome = ResolutionStatus::Escalated;
                tracing::error!(
                    "Admin alert for bot {}: {} ({})",
                    bot_id,
                    record.message,
                    classification.error_type
                );
                self.events.publish(FleetEvent::AdminAlert {
                    bot_id: bot_id.clone(),
                    error_id: record.id.clone(),
                    error_type: classification.error_type,
                    message: record.message.clone(),
                });
                (false, 1, "manual intervention required".into())
            }
            RecoveryStrategy::GracefulShutdown => {
                record.outcome = ResolutionStatus::Escalated;
                (false, 1, "graceful shutdown required".into())
            }
            RecoveryStrategy::NoAction => (true, 1, "no action".into()),
        };

        record.attempts.push(RecoveryAttempt {
            attempt,
            strategy: classification.strategy,
            timestamp: Utc::now(),
            succeeded,
            detail,
        });
        if !succeeded && record.outcome == ResolutionStatus::Pending {
            record.outcome = ResolutionStatus::Failed;
        }
        result.recovered = succeeded;
        result
    }

    fn check_alert_threshold(&self, bot_id: &str, entry: &mut BotRecoveryState, now: Instant) {
        let count = entry.window.len();
        if count < self.config.alert_threshold {
            return;
        }
        let window = self.config.alert_window();
        let recently_alerted = entry
            .threshold_alerted_at
            .is_some_and(|at| now.saturating_duration_since(at) < window);
        if recently_alerted {
            return;
        }

        entry.threshold_alerted_at = Some(now);
        tracing::warn!(
            "Bot {} hit {} errors within {:?}",
            bot_id,
            count,
            window
        );
        self.events.publish(FleetEvent::AlertThresholdExceeded {
            bot_id: bot_id.to_string(),
            error_count: count,
            window_secs: self.config.alert_window_secs,
        });
    }

    /// Marks a clean operation: closes the breaker and clears retry counters.
    pub fn record_success(&self, bot_id: &str) {
        let mut bots = self.bots.lock();
        if let Some(entry) = bots.get_mut(bot_id) {
            entry.attempts.clear();
            if let Some(breaker) = entry.breaker.as_mut() {
                breaker.record_success();
            }
        }
    }

    /// Most recent errors for the bot, oldest first.
    #[must_use]
    pub fn error_history(&self, bot_id: &str) -> Vec<ErrorRecord> {
        self.bots
            .lock()
            .get(bot_id)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Errors recorded for the bot within `window` of now.
    #[must_use]
    pub fn errors_within(&self, bot_id: &str, window: Duration) -> usize {
        let now = Instant::now();
        self.bots.lock().get(bot_id).map_or(0, |entry| {
            entry
                .history
                .iter()
                .filter(|r| now.saturating_duration_since(r.occurred_at) <= window)
                .count()
        })
    }

    /// Errors per minute over `window`.
    #[must_use]
    pub fn error_rate(&self, bot_id: &str, window: Duration) -> f64 {
        let minutes = window.as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = self.errors_within(bot_id, window) as f64;
        count / minutes
    }

    pub fn clear_history(&self, bot_id: &str) {
        let mut bots = self.bots.lock();
        if let Some(entry) = bots.get_mut(bot_id) {
            entry.history.clear();
            entry.window.clear();
            entry.attempts.clear();
            entry.threshold_alerted_at = None;
        }
    }

    pub fn reset_circuit_breaker(&self, bot_id: &str) {
        let mut bots = self.bots.lock();
        if let Some(breaker) = bots.get_mut(bot_id).and_then(|e| e.breaker.as_mut()) {
            breaker.record_success();
            tracing::info!("Circuit breaker reset for bot {}", bot_id);
        }
    }

    /// Breaker state, or `None` if the bot has never failed.
    #[must_use]
    pub fn circuit_state(&self, bot_id: &str) -> Option<CircuitState> {
        let now = Instant::now();
        self.bots
            .lock()
            .get_mut(bot_id)
            .and_then(|e| e.breaker.as_mut())
            .map(|b| b.check(now))
    }

    /// Drops everything kept for the bot.
    pub fn forget(&self, bot_id: &str) {
        self.bots.lock().remove(bot_id);
    }
}

#[derive(Debug, Default)]
struct PolicyResult {
    recovered: bool,
    retry_after: Option<Duration>,
    restart_requested: bool,
    circuit_open: bool,
}
