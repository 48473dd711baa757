//! Per-bot health monitoring with automatic restart.
//!
//! Every registered bot gets its own interval task. A check derives a
//! [`HealthStatus`] from runtime status, recent error rate, resource usage and
//! heartbeat age. Consecutive unhealthy checks build a streak; at the
//! configured threshold the bot is stopped and started again through the
//! [`BotController`].

use crate::recovery::{ErrorContext, ErrorRecoveryManager};
use anyhow::anyhow;
use async_trait::async_trait;
use bot_fleet_core::{
    BotState, EventBus, FleetError, FleetEvent, FleetResult, HealthStatus, RuntimeStatus,
    WatchdogConfig,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Fraction of a resource limit at which a bot counts as degraded.
const RESOURCE_WARNING_RATIO: f64 = 0.9;

/// Operations the watchdog and reliability layer need from whoever owns the
/// runtimes.
#[async_trait]
pub trait BotController: Send + Sync {
    /// Current working state of a registered runtime.
    fn bot_state(&self, bot_id: &str) -> Option<BotState>;

    /// Called before a restart begins, e.g. to take a pre-restart backup.
    async fn prepare_restart(&self, bot_id: &str, reason: &str) -> FleetResult<()>;

    async fn stop_bot(&self, bot_id: &str, reason: &str) -> FleetResult<()>;

    async fn start_bot(&self, bot_id: &str) -> FleetResult<()>;

    /// Stops every running bot. Returns the ids that were stopped.
    async fn stop_all(&self, reason: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Source of per-bot resource usage.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self, bot_id: &str) -> ResourceUsage;
}

/// Reports zero usage. Bots share one process, so there is nothing per-bot
/// to measure by default.
#[derive(Debug, Default)]
pub struct NoopSampler;

impl ResourceSampler for NoopSampler {
    fn sample(&self, _bot_id: &str) -> ResourceUsage {
        ResourceUsage::default()
    }
}

/// Result of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub bot_id: String,
    pub status: HealthStatus,
    pub runtime_status: Option<RuntimeStatus>,
    /// Errors per minute over the configured window.
    pub error_rate: f64,
    pub resources: ResourceUsage,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub issues: Vec<String>,
    pub unhealthy_streak: u32,
    pub checked_at: DateTime<Utc>,
}

struct Monitor {
    handle: JoinHandle<()>,
    streak: u32,
    last: Option<HealthMetrics>,
}

pub struct BotWatchdog {
    config: WatchdogConfig,
    recovery: Arc<ErrorRecoveryManager>,
    events: EventBus,
    sampler: Arc<dyn ResourceSampler>,
    controller: RwLock<Option<Weak<dyn BotController>>>,
    monitors: Mutex<HashMap<String, Monitor>>,
    restarting: Mutex<HashSet<String>>,
    /// Survives re-registration, which a restart through the manager causes.
    restarts: Mutex<HashMap<String, u32>>,
}

impl BotWatchdog {
    #[must_use]
    pub fn new(config: WatchdogConfig, recovery: Arc<ErrorRecoveryManager>, events: EventBus) -> Self {
        Self {
            config,
            recovery,
            events,
            sampler: Arc::new(NoopSampler),
            controller: RwLock::new(None),
            monitors: Mutex::new(HashMap::new()),
            restarting: Mutex::new(HashSet::new()),
            restarts: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn set_controller(&self, controller: Weak<dyn BotController>) {
        *self.controller.write() = Some(controller);
    }

    #[must_use]
    pub const fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    fn controller(&self) -> Option<Arc<dyn BotController>> {
        self.controller.read().as_ref().and_then(Weak::upgrade)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Starts monitoring a bot. Registering twice replaces the monitor.
    pub fn register(self: &Arc<Self>, bot_id: &str) {
        let watchdog = Arc::downgrade(self);
        let id = bot_id.to_string();
        let interval = self.config.check_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(watchdog) = watchdog.upgrade() else {
                    break;
                };
                watchdog.check_and_act(&id, false);
            }
        });

        let previous = self.monitors.lock().insert(
            bot_id.to_string(),
            Monitor {
                handle,
                streak: 0,
                last: None,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        tracing::info!("Watchdog monitoring bot {}", bot_id);
    }

    pub fn deregister(&self, bot_id: &str) {
        if let Some(monitor) = self.monitors.lock().remove(bot_id) {
            monitor.handle.abort();
            tracing::info!("Watchdog stopped monitoring bot {}", bot_id);
        }
    }

    #[must_use]
    pub fn monitored_bots(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.monitors.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn latest_metrics(&self, bot_id: &str) -> Option<HealthMetrics> {
        self.monitors.lock().get(bot_id).and_then(|m| m.last.clone())
    }

    #[must_use]
    pub fn restart_count(&self, bot_id: &str) -> u32 {
        self.restarts.lock().get(bot_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_restarting(&self, bot_id: &str) -> bool {
        self.restarting.lock().contains(bot_id)
    }

    // =========================================================================
    // Checks
    // =========================================================================

    /// Computes health for a bot without acting on it.
    #[must_use]
    pub fn evaluate(&self, bot_id: &str) -> HealthMetrics {
        let state = self.controller().and_then(|c| c.bot_state(bot_id));
        let error_rate = self
            .recovery
            .error_rate(bot_id, self.config.error_rate_window());
        let resources = self.sampler.sample(bot_id);
        let mut issues = Vec::new();

        let runtime_status = state.as_ref().map(|s| s.status);
        let status = match runtime_status {
            None => {
                issues.push("runtime not registered".to_string());
                HealthStatus::Dead
            }
            Some(s) if !matches!(s, RuntimeStatus::Running | RuntimeStatus::Paused) => {
                issues.push(format!("runtime is {s}"));
                HealthStatus::Dead
            }
            Some(_) => self.grade(error_rate, resources, state.as_ref(), &mut issues),
        };

        HealthMetrics {
            bot_id: bot_id.to_string(),
            status,
            runtime_status,
            error_rate,
            resources,
            last_heartbeat: state.and_then(|s| s.last_tick_at),
            issues,
            unhealthy_streak: 0,
            checked_at: Utc::now(),
        }
    }

    fn grade(
        &self,
        error_rate: f64,
        resources: ResourceUsage,
        state: Option<&BotState>,
        issues: &mut Vec<String>,
    ) -> HealthStatus {
        let max_rate = self.config.max_error_rate;
        if error_rate >= max_rate {
            issues.push(format!("error rate {error_rate:.2}/min at or above {max_rate:.2}/min"));
            return HealthStatus::Unhealthy;
        }

        let mut degraded = false;
        let memory_limit = self.config.memory_limit_mb * RESOURCE_WARNING_RATIO;
        if resources.memory_mb >= memory_limit {
            issues.push(format!(
                "memory {:.1}MB near limit {:.1}MB",
                resources.memory_mb, self.config.memory_limit_mb
            ));
            degraded = true;
        }
        let cpu_limit = self.config.cpu_limit_percent * RESOURCE_WARNING_RATIO;
        if resources.cpu_percent >= cpu_limit {
            issues.push(format!(
                "cpu {:.1}% near limit {:.1}%",
                resources.cpu_percent, self.config.cpu_limit_percent
            ));
            degraded = true;
        }
        if error_rate >= max_rate / 2.0 {
            issues.push(format!("elevated error rate {error_rate:.2}/min"));
            degraded = true;
        }

        if let Some(state) = state.filter(|s| s.status == RuntimeStatus::Running) {
            let reference = state.last_tick_at.or(state.started_at);
            if let Some(at) = reference {
                let silent = Utc::now().signed_duration_since(at);
                let timeout = self.config.heartbeat_timeout();
                if silent.to_std().is_ok_and(|s| s > timeout) {
                    issues.push(format!("no heartbeat for {}s", silent.num_seconds()));
                    degraded = true;
                }
            }
        }

        if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Runs one check, updates the streak and schedules a restart if due.
    fn check_and_act(self: &Arc<Self>, bot_id: &str, forced: bool) -> HealthMetrics {
        let mut metrics = self.evaluate(bot_id);

        let streak = {
            let mut monitors = self.monitors.lock();
            let streak = monitors.get_mut(bot_id).map_or(0, |monitor| {
                // Any non-healthy result extends the streak; only an
                // unhealthy one can act on it.
                monitor.streak = if metrics.status == HealthStatus::Healthy {
                    0
                } else {
                    monitor.streak + 1
                };
                monitor.streak
            });
            metrics.unhealthy_streak = streak;
            if let Some(monitor) = monitors.get_mut(bot_id) {
                monitor.last = Some(metrics.clone());
            }
            streak
        };

        if metrics.status != HealthStatus::Healthy {
            tracing::warn!(
                "Bot {} is {}: {}",
                bot_id,
                metrics.status,
                metrics.issues.join("; ")
            );
        } else {
            tracing::debug!("Bot {} is healthy", bot_id);
        }
        self.events.publish(FleetEvent::HealthChecked {
            bot_id: bot_id.to_string(),
            status: metrics.status,
            issues: metrics.issues.clone(),
        });

        let due = forced || streak >= self.config.restart_threshold;
        if metrics.status == HealthStatus::Unhealthy && self.config.auto_restart && due {
            self.spawn_restart(bot_id, format!("unhealthy for {streak} consecutive checks"));
        }
        metrics
    }

    /// Checks a bot now. An unhealthy result restarts it without waiting for
    /// the streak.
    #[must_use]
    pub fn force_health_check(self: &Arc<Self>, bot_id: &str) -> HealthMetrics {
        self.check_and_act(bot_id, true)
    }

    // =========================================================================
    // Restart
    // =========================================================================

    /// Restarts a bot regardless of its health and waits for the outcome.
    ///
    /// # Errors
    ///
    /// Returns the stop or start error, or [`FleetError::Configuration`] when
    /// no controller is attached or a restart is already running.
    pub async fn force_restart(self: &Arc<Self>, bot_id: &str, reason: &str) -> FleetResult<()> {
        let Some(handle) = self.spawn_restart(bot_id, reason.to_string()) else {
            return Err(FleetError::Configuration(format!(
                "restart already in progress for bot {bot_id}"
            )));
        };
        handle
            .await
            .map_err(|e| FleetError::Other(anyhow!("restart task for bot {bot_id} failed: {e}")))?
    }

    /// Runs the restart on its own task so that deregistering the bot's
    /// monitor during the stop does not cancel it.
    fn spawn_restart(
        self: &Arc<Self>,
        bot_id: &str,
        reason: String,
    ) -> Option<JoinHandle<FleetResult<()>>> {
        if !self.restarting.lock().insert(bot_id.to_string()) {
            tracing::debug!("Restart already in progress for bot {}", bot_id);
            return None;
        }
        if let Some(monitor) = self.monitors.lock().get_mut(bot_id) {
            monitor.streak = 0;
        }

        let watchdog = Arc::clone(self);
        let id = bot_id.to_string();
        Some(tokio::spawn(async move {
            let result = watchdog.restart(&id, &reason).await;
            watchdog.restarting.lock().remove(&id);
            result
        }))
    }

    async fn restart(&self, bot_id: &str, reason: &str) -> FleetResult<()> {
        tracing::warn!("Watchdog restarting bot {}: {}", bot_id, reason);
        let result = self.stop_then_start(bot_id, reason).await;

        match &result {
            Ok(()) => {
                self.recovery.clear_history(bot_id);
                self.recovery.reset_circuit_breaker(bot_id);
                *self.restarts.lock().entry(bot_id.to_string()).or_insert(0) += 1;
                tracing::info!("Bot {} restarted by watchdog", bot_id);
                self.events.publish(FleetEvent::BotRestarted {
                    bot_id: bot_id.to_string(),
                    reason: reason.to_string(),
                });
            }
            Err(e) => {
                tracing::error!("Watchdog restart of bot {} failed: {}", bot_id, e);
                let error = anyhow!("watchdog restart failed: {e}");
                self.recovery.handle_error(
                    &error,
                    ErrorContext::new(bot_id, "watchdog_restart")
                        .with_metadata(serde_json::json!({ "reason": reason })),
                );
                self.events.publish(FleetEvent::BotRestartFailed {
                    bot_id: bot_id.to_string(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn stop_then_start(&self, bot_id: &str, reason: &str) -> FleetResult<()> {
        let controller = self
            .controller()
            .ok_or_else(|| FleetError::Configuration("watchdog has no controller".into()))?;

        if let Err(e) = controller.prepare_restart(bot_id, reason).await {
            tracing::warn!("Pre-restart step failed for bot {}: {}", bot_id, e);
        }

        match controller.stop_bot(bot_id, "watchdog restart").await {
            Ok(()) | Err(FleetError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(self.config.restart_delay()).await;
        controller.start_bot(bot_id).await
    }

    /// Aborts every monitor.
    pub fn shutdown(&self) {
        let mut monitors = self.monitors.lock();
        for (_, monitor) in monitors.drain() {
            monitor.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bot_fleet_core::{RecoveryConfig, StrategyDescriptor, StrategyKind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeController {
        states: Mutex<HashMap<String, BotState>>,
        stops: AtomicUsize,
        starts: AtomicUsize,
        fail_start: AtomicBool,
    }

    impl FakeController {
        fn with_bot(status: RuntimeStatus) -> Arc<Self> {
            let mut state = BotState::new(
                "bot-1",
                StrategyDescriptor::new("hold", "1.0.0", StrategyKind::BuiltIn),
            );
            state.status = status;
            state.last_tick_at = Some(Utc::now());
            Arc::new(Self {
                states: Mutex::new(HashMap::from([("bot-1".to_string(), state)])),
                stops: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BotController for FakeController {
        fn bot_state(&self, bot_id: &str) -> Option<BotState> {
            self.states.lock().get(bot_id).cloned()
        }

        async fn prepare_restart(&self, _bot_id: &str, _reason: &str) -> FleetResult<()> {
            Ok(())
        }

        async fn stop_bot(&self, bot_id: &str, _reason: &str) -> FleetResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if let Some(state) = self.states.lock().get_mut(bot_id) {
                state.status = RuntimeStatus::Stopped;
            }
            Ok(())
        }

        async fn start_bot(&self, bot_id: &str) -> FleetResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(FleetError::MissingCredentials(bot_id.to_string()));
            }
            if let Some(state) = self.states.lock().get_mut(bot_id) {
                state.status = RuntimeStatus::Running;
            }
            Ok(())
        }

        async fn stop_all(&self, _reason: &str) -> Vec<String> {
            Vec::new()
        }
    }

    struct FixedSampler(ResourceUsage);

    impl ResourceSampler for FixedSampler {
        fn sample(&self, _bot_id: &str) -> ResourceUsage {
            self.0
        }
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            check_interval_secs: 10,
            restart_threshold: 3,
            restart_delay_ms: 100,
            max_error_rate: 2.0,
            error_rate_window_secs: 60,
            ..WatchdogConfig::default()
        }
    }

    fn setup(
        controller: &Arc<FakeController>,
    ) -> (Arc<BotWatchdog>, Arc<ErrorRecoveryManager>, EventBus) {
        let events = EventBus::new(256);
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default(), events.clone()));
        let watchdog = Arc::new(BotWatchdog::new(config(), Arc::clone(&recovery), events.clone()));
        let weak: Weak<dyn BotController> = Arc::downgrade(&(Arc::clone(controller) as Arc<dyn BotController>));
        watchdog.set_controller(weak);
        (watchdog, recovery, events)
    }

    fn record_errors(recovery: &ErrorRecoveryManager, count: usize) {
        for _ in 0..count {
            recovery.handle_error(
                &anyhow!("exchange rejected order"),
                ErrorContext::new("bot-1", "tick"),
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_rules() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        let (watchdog, recovery, _) = setup(&controller);

        assert_eq!(watchdog.evaluate("bot-1").status, HealthStatus::Healthy);
        assert_eq!(watchdog.evaluate("ghost").status, HealthStatus::Dead);

        // 1 error/min is half the maximum.
        record_errors(&recovery, 1);
        assert_eq!(watchdog.evaluate("bot-1").status, HealthStatus::Degraded);

        record_errors(&recovery, 1);
        let metrics = watchdog.evaluate("bot-1");
        assert_eq!(metrics.status, HealthStatus::Unhealthy);
        assert!(metrics.issues[0].contains("error rate"));

        controller.states.lock().get_mut("bot-1").unwrap().status = RuntimeStatus::Stopped;
        assert_eq!(watchdog.evaluate("bot-1").status, HealthStatus::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_bot_is_not_dead() {
        let controller = FakeController::with_bot(RuntimeStatus::Paused);
        let (watchdog, _, _) = setup(&controller);
        assert_eq!(watchdog.evaluate("bot-1").status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_pressure_degrades() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        let events = EventBus::new(16);
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default(), events.clone()));
        let watchdog = Arc::new(
            BotWatchdog::new(config(), recovery, events).with_sampler(Arc::new(FixedSampler(
                ResourceUsage {
                    memory_mb: 480.0,
                    cpu_percent: 10.0,
                },
            ))),
        );
        let weak: Weak<dyn BotController> = Arc::downgrade(&(Arc::clone(&controller) as Arc<dyn BotController>));
        watchdog.set_controller(weak);

        let metrics = watchdog.evaluate("bot-1");
        assert_eq!(metrics.status, HealthStatus::Degraded);
        assert!(metrics.issues[0].contains("memory"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_heartbeat_degrades_without_restart() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        controller.states.lock().get_mut("bot-1").unwrap().last_tick_at =
            Some(Utc::now() - chrono::Duration::seconds(600));
        let (watchdog, _, _) = setup(&controller);
        watchdog.register("bot-1");

        tokio::time::sleep(Duration::from_secs(45)).await;
        let metrics = watchdog.latest_metrics("bot-1").unwrap();
        assert_eq!(metrics.status, HealthStatus::Degraded);
        assert!(metrics.issues.iter().any(|i| i.contains("heartbeat")));
        assert_eq!(controller.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_restart_at_threshold() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        let (watchdog, recovery, events) = setup(&controller);
        let mut rx = events.subscribe();
        record_errors(&recovery, 3);
        watchdog.register("bot-1");

        // Two unhealthy checks: below threshold.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(watchdog.latest_metrics("bot-1").unwrap().unhealthy_streak, 2);
        assert_eq!(controller.stops.load(Ordering::SeqCst), 0);

        // Third check restarts.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
        assert_eq!(controller.starts.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.restart_count("bot-1"), 1);
        assert!(recovery.error_history("bot-1").is_empty());

        // History was cleared, so later checks are healthy and nothing repeats.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.latest_metrics("bot-1").unwrap().unhealthy_streak, 0);

        let mut restarted = 0;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "bot-restarted" {
                restarted += 1;
            }
        }
        assert_eq!(restarted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_checks_extend_the_streak() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        let (watchdog, recovery, _) = setup(&controller);
        record_errors(&recovery, 1);
        watchdog.register("bot-1");

        tokio::time::sleep(Duration::from_secs(15)).await;
        let metrics = watchdog.latest_metrics("bot-1").unwrap();
        assert_eq!(metrics.status, HealthStatus::Degraded);
        assert_eq!(metrics.unhealthy_streak, 1);

        record_errors(&recovery, 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let metrics = watchdog.latest_metrics("bot-1").unwrap();
        assert_eq!(metrics.status, HealthStatus::Unhealthy);
        assert_eq!(metrics.unhealthy_streak, 2);
        assert_eq!(controller.stops.load(Ordering::SeqCst), 0);

        // Third non-healthy check in a row, and it is unhealthy.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
        assert_eq!(controller.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_escalates() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        controller.fail_start.store(true, Ordering::SeqCst);
        let (watchdog, recovery, events) = setup(&controller);
        let mut rx = events.subscribe();

        let err = watchdog.force_restart("bot-1", "operator").await.unwrap_err();
        assert!(matches!(err, FleetError::MissingCredentials(_)));
        assert!(!watchdog.is_restarting("bot-1"));

        let history = recovery.error_history("bot-1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].context.operation, "watchdog_restart");

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"bot-restart-failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_check_skips_streak() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        let (watchdog, recovery, _) = setup(&controller);
        record_errors(&recovery, 3);
        watchdog.register("bot-1");

        let metrics = watchdog.force_health_check("bot-1");
        assert_eq!(metrics.status, HealthStatus::Unhealthy);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
        assert_eq!(controller.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_stops_checks() {
        let controller = FakeController::with_bot(RuntimeStatus::Running);
        let (watchdog, _, _) = setup(&controller);
        watchdog.register("bot-1");
        assert_eq!(watchdog.monitored_bots(), vec!["bot-1".to_string()]);

        watchdog.deregister("bot-1");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(watchdog.monitored_bots().is_empty());
        assert!(watchdog.latest_metrics("bot-1").is_none());
    }
}
