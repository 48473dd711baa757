//! Fleet-wide reliability: alert fan-out with cooldown, periodic health
//! reports, and failover when unrecoverable errors pile up across bots.

use crate::recovery::{CircuitState, ErrorRecoveryManager};
use crate::watchdog::{BotController, BotWatchdog};
use bot_fleet_core::{AlertLevel, EventBus, FleetEvent, HealthStatus, ReliabilityConfig};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Serialize)]
pub struct BotHealth {
    pub bot_id: String,
    /// Latest watchdog verdict, if a check has run.
    pub status: Option<HealthStatus>,
    pub error_rate: f64,
    pub circuit: Option<CircuitState>,
    pub restarts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub bots: Vec<BotHealth>,
    /// Unrecoverable errors inside the failover window.
    pub recent_failures: usize,
    pub failover_active: bool,
}

impl HealthReport {
    #[must_use]
    pub fn count(&self, status: HealthStatus) -> usize {
        self.bots.iter().filter(|b| b.status == Some(status)).count()
    }
}

pub struct BotReliabilitySystem {
    config: ReliabilityConfig,
    recovery: Arc<ErrorRecoveryManager>,
    watchdog: Arc<BotWatchdog>,
    controller: Weak<dyn BotController>,
    events: EventBus,
    failures: Mutex<VecDeque<Instant>>,
    last_alert: Mutex<HashMap<(Option<String>, String), Instant>>,
    failover_active: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BotReliabilitySystem {
    #[must_use]
    pub fn new(
        config: ReliabilityConfig,
        recovery: Arc<ErrorRecoveryManager>,
        watchdog: Arc<BotWatchdog>,
        controller: Weak<dyn BotController>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            recovery,
            watchdog,
            controller,
            events,
            failures: Mutex::new(VecDeque::new()),
            last_alert: Mutex::new(HashMap::new()),
            failover_active: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failover_active(&self) -> bool {
        self.failover_active.load(Ordering::SeqCst)
    }

    /// Subscribes to the event bus and starts the periodic health report.
    pub fn start(self: &Arc<Self>) {
        let mut rx = self.events.subscribe();
        let weak = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(system) = weak.upgrade() else { break };
                        system.handle_event(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Reliability listener lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let weak = Arc::downgrade(self);
        let period = self.config.health_report_interval();
        let reporter = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(system) = weak.upgrade() else { break };
                let report = system.health_report();
                tracing::info!(
                    "Fleet health: {} bots, {} healthy, {} degraded, {} unhealthy, {} dead, {} recent failures",
                    report.bots.len(),
                    report.count(HealthStatus::Healthy),
                    report.count(HealthStatus::Degraded),
                    report.count(HealthStatus::Unhealthy),
                    report.count(HealthStatus::Dead),
                    report.recent_failures
                );
            }
        });

        self.tasks.lock().extend([listener, reporter]);
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Reacts to one fleet event.
    pub async fn handle_event(&self, event: &FleetEvent) {
        match event {
            FleetEvent::RecoveryFailed { bot_id, reason, .. } => {
                let count = self.record_failure();
                tracing::debug!(
                    "Unrecoverable error for bot {} ({}), {} in window",
                    bot_id,
                    reason,
                    count
                );
                if self.config.failover_enabled
                    && count > self.config.failover_error_threshold
                    && !self.failover_active()
                {
                    self.activate_failover(count).await;
                }
            }
            FleetEvent::AdminAlert {
                bot_id, message, ..
            } => {
                self.alert(Some(bot_id), AlertLevel::Critical, "Administrator attention required", message);
            }
            FleetEvent::AlertThresholdExceeded {
                bot_id,
                error_count,
                window_secs,
            } => {
                let message = format!("{error_count} errors in the last {window_secs}s");
                self.alert(Some(bot_id), AlertLevel::Warning, "Error rate threshold exceeded", &message);
            }
            FleetEvent::BotRestartFailed { bot_id, error } => {
                self.alert(Some(bot_id), AlertLevel::Critical, "Bot restart failed", error);
            }
            FleetEvent::HealthChecked {
                bot_id,
                status: status @ (HealthStatus::Unhealthy | HealthStatus::Dead),
                issues,
            } => {
                let message = if issues.is_empty() {
                    format!("bot is {status}")
                } else {
                    issues.join("; ")
                };
                self.alert(Some(bot_id), AlertLevel::Warning, "Bot health degraded", &message);
            }
            _ => {}
        }
    }

    /// Records an unrecoverable error and returns the count inside the window.
    fn record_failure(&self) -> usize {
        let now = Instant::now();
        let window = self.config.failover_window();
        let mut failures = self.failures.lock();
        failures.push_back(now);
        while failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            failures.pop_front();
        }
        failures.len()
    }

    fn recent_failures(&self) -> usize {
        let now = Instant::now();
        let window = self.config.failover_window();
        self.failures
            .lock()
            .iter()
            .filter(|at| now.duration_since(**at) <= window)
            .count()
    }

    async fn activate_failover(&self, error_count: usize) {
        self.failover_active.store(true, Ordering::SeqCst);
        tracing::error!(
            "Failover activated: {} unrecoverable errors within {}s",
            error_count,
            self.config.failover_window_secs
        );

        let stopped_bots = match self.controller.upgrade() {
            Some(controller) => controller.stop_all("failover").await,
            None => {
                tracing::error!("Failover cannot stop bots: controller is gone");
                Vec::new()
            }
        };

        self.alert(
            None,
            AlertLevel::Critical,
            "Failover activated",
            &format!("stopped {} bots after {} unrecoverable errors", stopped_bots.len(), error_count),
        );
        self.events.publish(FleetEvent::FailoverActivated {
            error_count,
            stopped_bots,
        });
    }

    /// Clears the failover latch and the failure window.
    pub fn reset_failover(&self) {
        self.failures.lock().clear();
        self.failover_active.store(false, Ordering::SeqCst);
        tracing::info!("Failover reset");
    }

    /// Publishes an alert unless the same one fired within the cooldown.
    /// Returns whether it was published.
    pub fn alert(&self, bot_id: Option<&str>, level: AlertLevel, title: &str, message: &str) -> bool {
        let key = (bot_id.map(str::to_string), title.to_string());
        let now = Instant::now();
        {
            let mut last = self.last_alert.lock();
            if let Some(at) = last.get(&key) {
                if now.duration_since(*at) < self.config.alert_cooldown() {
                    tracing::debug!("Alert '{}' for {:?} suppressed by cooldown", title, bot_id);
                    return false;
                }
            }
            last.insert(key, now);
        }

        match level {
            AlertLevel::Critical => tracing::error!("ALERT {:?}: {} - {}", bot_id, title, message),
            AlertLevel::Warning => tracing::warn!("ALERT {:?}: {} - {}", bot_id, title, message),
            AlertLevel::Info => tracing::info!("ALERT {:?}: {} - {}", bot_id, title, message),
        }
        self.events.publish(FleetEvent::Alert {
            bot_id: bot_id.map(str::to_string),
            level,
            title: title.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let window = self.watchdog.config().error_rate_window();
        let bots = self
            .watchdog
            .monitored_bots()
            .into_iter()
            .map(|bot_id| BotHealth {
                status: self.watchdog.latest_metrics(&bot_id).map(|m| m.status),
                error_rate: self.recovery.error_rate(&bot_id, window),
                circuit: self.recovery.circuit_state(&bot_id),
                restarts: self.watchdog.restart_count(&bot_id),
                bot_id,
            })
            .collect();

        HealthReport {
            generated_at: Utc::now(),
            bots,
            recent_failures: self.recent_failures(),
            failover_active: self.failover_active(),
        }
    }
}

impl Drop for BotReliabilitySystem {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bot_fleet_core::{BotState, ErrorType, FleetResult, RecoveryConfig, WatchdogConfig};
    use std::time::Duration;

    #[derive(Default)]
    struct FleetStub {
        stop_all_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BotController for FleetStub {
        fn bot_state(&self, _bot_id: &str) -> Option<BotState> {
            None
        }

        async fn prepare_restart(&self, _bot_id: &str, _reason: &str) -> FleetResult<()> {
            Ok(())
        }

        async fn stop_bot(&self, _bot_id: &str, _reason: &str) -> FleetResult<()> {
            Ok(())
        }

        async fn start_bot(&self, _bot_id: &str) -> FleetResult<()> {
            Ok(())
        }

        async fn stop_all(&self, reason: &str) -> Vec<String> {
            self.stop_all_calls.lock().push(reason.to_string());
            vec!["bot-1".to_string(), "bot-2".to_string()]
        }
    }

    fn system(config: ReliabilityConfig, controller: &Arc<FleetStub>) -> (BotReliabilitySystem, EventBus) {
        let events = EventBus::new(64);
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default(), events.clone()));
        let watchdog = Arc::new(BotWatchdog::new(
            WatchdogConfig::default(),
            Arc::clone(&recovery),
            events.clone(),
        ));
        let weak: Weak<dyn BotController> = Arc::downgrade(controller) as Weak<dyn BotController>;
        let system = BotReliabilitySystem::new(config, recovery, watchdog, weak, events.clone());
        (system, events)
    }

    fn failure(bot_id: &str) -> FleetEvent {
        FleetEvent::RecoveryFailed {
            bot_id: bot_id.to_string(),
            error_id: uuid::Uuid::new_v4().to_string(),
            error_type: ErrorType::NetworkError,
            reason: "retries exhausted".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_after_threshold() {
        let controller = Arc::new(FleetStub::default());
        let config = ReliabilityConfig {
            failover_error_threshold: 3,
            ..ReliabilityConfig::default()
        };
        let (system, events) = system(config, &controller);
        let mut rx = events.subscribe();

        for i in 0..3 {
            system.handle_event(&failure(&format!("bot-{i}"))).await;
        }
        assert!(!system.failover_active());

        system.handle_event(&failure("bot-1")).await;
        assert!(system.failover_active());
        assert_eq!(controller.stop_all_calls.lock().as_slice(), ["failover"]);

        // Latched: later failures do not stop the fleet again.
        system.handle_event(&failure("bot-2")).await;
        assert_eq!(controller.stop_all_calls.lock().len(), 1);

        let mut saw_failover = false;
        while let Ok(event) = rx.try_recv() {
            if let FleetEvent::FailoverActivated {
                error_count,
                stopped_bots,
            } = event
            {
                assert_eq!(error_count, 4);
                assert_eq!(stopped_bots.len(), 2);
                saw_failover = true;
            }
        }
        assert!(saw_failover);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_expire() {
        let controller = Arc::new(FleetStub::default());
        let config = ReliabilityConfig {
            failover_error_threshold: 2,
            failover_window_secs: 60,
            ..ReliabilityConfig::default()
        };
        let (system, _events) = system(config, &controller);

        system.handle_event(&failure("bot-1")).await;
        system.handle_event(&failure("bot-1")).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        system.handle_event(&failure("bot-1")).await;

        assert!(!system.failover_active());
        assert_eq!(system.health_report().recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_disabled() {
        let controller = Arc::new(FleetStub::default());
        let config = ReliabilityConfig {
            failover_enabled: false,
            failover_error_threshold: 1,
            ..ReliabilityConfig::default()
        };
        let (system, _events) = system(config, &controller);
        for _ in 0..5 {
            system.handle_event(&failure("bot-1")).await;
        }
        assert!(!system.failover_active());
        assert!(controller.stop_all_calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_cooldown() {
        let controller = Arc::new(FleetStub::default());
        let config = ReliabilityConfig {
            alert_cooldown_secs: 30,
            ..ReliabilityConfig::default()
        };
        let (system, _events) = system(config, &controller);

        assert!(system.alert(Some("bot-1"), AlertLevel::Warning, "Slow", "ticks late"));
        assert!(!system.alert(Some("bot-1"), AlertLevel::Warning, "Slow", "ticks late"));
        assert!(system.alert(Some("bot-2"), AlertLevel::Warning, "Slow", "ticks late"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(system.alert(Some("bot-1"), AlertLevel::Warning, "Slow", "ticks late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_turns_restart_failure_into_alert() {
        let controller = Arc::new(FleetStub::default());
        let (system, events) = system(ReliabilityConfig::default(), &controller);
        let system = Arc::new(system);
        system.start();
        let mut rx = events.subscribe();

        events.publish(FleetEvent::BotRestartFailed {
            bot_id: "bot-7".to_string(),
            error: "exchange unreachable".to_string(),
        });

        let alert = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(FleetEvent::Alert { bot_id, level, .. }) = rx.recv().await {
                    return (bot_id, level);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(alert, (Some("bot-7".to_string()), AlertLevel::Critical));
        system.stop();
    }
}
