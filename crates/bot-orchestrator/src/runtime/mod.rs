//! Live execution of one bot.
//!
//! A runtime owns the bot's strategy, working state and exchange session. A
//! single task drives ticks on a fixed interval; an order monitor polls open
//! orders beside it. Lifecycle follows [`RuntimeStatus::can_transition`];
//! illegal transitions are logged and ignored.

mod swap;
mod tick;

use crate::recovery::ErrorRecoveryManager;
use crate::shutdown::{CapturedState, GracefulShutdownManager, ShutdownReport, ShutdownTarget};
use crate::state::{RecoveryOptions, StateManager, StateSnapshot, StateUpdate};
use crate::strategies::StrategyRegistry;
use crate::trade::{SignalProcessor, TradeDecisionEngine, TradeExecutor};
use anyhow::Result;
use async_trait::async_trait;
use bot_fleet_core::{
    Bot, BotState, DecisionConfig, EventBus, ExchangeSession, FleetError, FleetEvent, FleetResult,
    MarketConditions, MarketType, RuntimeConfig, RuntimeStatus, Strategy, StrategyContext,
    TradingConfig,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Shared services a runtime depends on.
#[derive(Clone)]
pub struct RuntimeServices {
    pub runtime: RuntimeConfig,
    pub trading: TradingConfig,
    pub state: Arc<StateManager>,
    pub recovery: Arc<ErrorRecoveryManager>,
    pub shutdown: Arc<GracefulShutdownManager>,
    pub registry: Arc<StrategyRegistry>,
    pub events: EventBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The runtime stopped itself.
    Stopped,
    /// Recovery asked for the runtime to be restarted.
    RestartRequested,
}

/// Notification from a runtime to whoever owns it.
#[derive(Debug, Clone)]
pub struct RuntimeExit {
    pub bot_id: String,
    pub reason: String,
    pub kind: ExitKind,
}

#[derive(Default)]
struct RuntimeTasks {
    stop_tx: Option<watch::Sender<bool>>,
    tick: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

pub struct BotRuntime {
    bot_id: String,
    symbol: String,
    market_type: MarketType,
    configuration: RwLock<serde_json::Value>,
    services: RuntimeServices,
    session: ExchangeSession,
    state: Arc<Mutex<BotState>>,
    strategy: tokio::sync::Mutex<Box<dyn Strategy>>,
    signals: SignalProcessor,
    decisions: TradeDecisionEngine,
    executor: Arc<TradeExecutor>,
    tasks: Mutex<RuntimeTasks>,
    /// Held for the duration of every tick.
    tick_gate: tokio::sync::Mutex<()>,
    pending_fallback: AtomicBool,
    /// Cleared when the shutdown sequence cleans the strategy up.
    strategy_ready: AtomicBool,
    exit_tx: Option<mpsc::UnboundedSender<RuntimeExit>>,
}

impl BotRuntime {
    /// Builds a runtime in `initializing` state.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Configuration`] when the bot's risk overrides do
    /// not fit the decision config.
    pub fn new(
        bot: &Bot,
        strategy: Box<dyn Strategy>,
        session: ExchangeSession,
        services: RuntimeServices,
        exit_tx: Option<mpsc::UnboundedSender<RuntimeExit>>,
    ) -> FleetResult<Arc<Self>> {
        let decision_config = merge_risk_overrides(&services.trading.decision, &bot.risk_management)?;
        let market_type = bot
            .configuration
            .get("market_type")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(MarketType::Spot);

        let executor = Arc::new(TradeExecutor::new(
            bot.id.clone(),
            services.trading.execution.clone(),
            Arc::clone(&session.exchange),
            market_type,
            services.events.clone(),
        ));
        let state = BotState::new(bot.id.clone(), strategy.descriptor());

        Ok(Arc::new(Self {
            bot_id: bot.id.clone(),
            symbol: bot.symbol.clone(),
            market_type,
            configuration: RwLock::new(bot.configuration.clone()),
            signals: SignalProcessor::new(services.trading.signals.clone()),
            decisions: TradeDecisionEngine::new(decision_config),
            executor,
            services,
            session,
            state: Arc::new(Mutex::new(state)),
            strategy: tokio::sync::Mutex::new(strategy),
            tasks: Mutex::new(RuntimeTasks::default()),
            tick_gate: tokio::sync::Mutex::new(()),
            pending_fallback: AtomicBool::new(false),
            strategy_ready: AtomicBool::new(false),
            exit_tx,
        }))
    }

    #[must_use]
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    #[must_use]
    pub const fn market_type(&self) -> MarketType {
        self.market_type
    }

    /// Read-only copy of the working state.
    #[must_use]
    pub fn status_view(&self) -> BotState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn status(&self) -> RuntimeStatus {
        self.state.lock().status
    }

    #[must_use]
    pub fn configuration(&self) -> serde_json::Value {
        self.configuration.read().clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restores persisted state and initializes the strategy.
    ///
    /// State comes from the latest snapshot, else the latest backup. The
    /// runtime ends in `stopped` (or `error` if the strategy fails).
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Strategy`] if strategy initialization fails.
    pub async fn initialize(&self) -> FleetResult<()> {
        tracing::info!("Initializing runtime for bot {}", self.bot_id);
        self.restore_state().await;

        let context = self.strategy_context(None);
        let init = self.strategy.lock().await.initialize(&context).await;
        if let Err(e) = init {
            tracing::error!("Strategy initialization failed for bot {}: {:#}", self.bot_id, e);
            self.state.lock().last_error = Some(format!("{e:#}"));
            self.transition(RuntimeStatus::Error, Some("strategy initialization failed"));
            return Err(FleetError::Strategy(format!("{e:#}")));
        }

        self.strategy_ready.store(true, Ordering::SeqCst);
        self.transition(RuntimeStatus::Stopped, None);
        self.persist().await?;
        Ok(())
    }

    async fn restore_state(&self) {
        let restored = match self.services.state.load_snapshot(&self.bot_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(FleetError::SnapshotNotFound(_)) => self.restore_from_backup().await,
            Err(e) => {
                tracing::warn!("Latest snapshot unusable for bot {}: {}", self.bot_id, e);
                self.restore_from_backup().await
            }
        };

        let Some(snapshot) = restored else {
            tracing::info!("No saved state for bot {}, starting fresh", self.bot_id);
            return;
        };

        let saved = snapshot.payload.state;
        let strategy_state = snapshot.payload.strategy_state;
        let mut strategy = self.strategy.lock().await;
        let descriptor = strategy.descriptor();
        if saved.strategy.name == descriptor.name {
            if let Some(blob) = strategy_state {
                if let Err(e) = strategy.set_state(blob) {
                    tracing::warn!("Discarding saved strategy state for bot {}: {:#}", self.bot_id, e);
                }
            }
        }
        drop(strategy);

        let mut state = self.state.lock();
        state.last_tick_at = saved.last_tick_at;
        state.last_error = saved.last_error;
        state.performance = saved.performance;
        state.positions = saved.positions;
        state.open_orders = saved.open_orders;
        state.strategy = descriptor;
        tracing::info!(
            "Restored bot {} from snapshot v{} ({} positions, {} open orders)",
            self.bot_id,
            snapshot.version,
            state.positions.len(),
            state.open_orders.len()
        );
    }

    async fn restore_from_backup(&self) -> Option<StateSnapshot> {
        match self
            .services
            .state
            .recover_from_backup(&self.bot_id, RecoveryOptions::default())
            .await
        {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!("No usable backup for bot {}: {}", self.bot_id, e);
                None
            }
        }
    }

    /// Moves to `running` and spawns the tick loop and order monitor.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::InvalidTransition`] unless the runtime is stopped.
    pub async fn start(self: &Arc<Self>) -> FleetResult<()> {
        let current = self.status();
        if current != RuntimeStatus::Stopped {
            return Err(self.invalid(current, RuntimeStatus::Running));
        }

        if !self.strategy_ready.load(Ordering::SeqCst) {
            let context = self.strategy_context(None);
            self.strategy
                .lock()
                .await
                .initialize(&context)
                .await
                .map_err(|e| FleetError::Strategy(format!("{e:#}")))?;
            self.strategy_ready.store(true, Ordering::SeqCst);
        }

        {
            let mut state = self.state.lock();
            state.started_at = Some(Utc::now());
            state.error_count = 0;
        }
        self.transition(RuntimeStatus::Running, Some("started"));
        self.persist().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let tick = tokio::spawn(Arc::clone(self).run_loop(stop_rx.clone()));
        let monitor = self
            .executor
            .spawn_monitor(Arc::clone(&self.state), stop_rx);

        let mut tasks = self.tasks.lock();
        tasks.stop_tx = Some(stop_tx);
        tasks.tick = Some(tick);
        tasks.monitor = Some(monitor);
        tracing::info!("Bot {} is now running", self.bot_id);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`FleetError::InvalidTransition`] unless the runtime is running.
    pub async fn pause(&self) -> FleetResult<()> {
        let current = self.status();
        if !self.transition(RuntimeStatus::Paused, Some("paused")) {
            return Err(self.invalid(current, RuntimeStatus::Paused));
        }
        self.persist_status().await;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`FleetError::InvalidTransition`] unless the runtime is paused.
    pub async fn resume(&self) -> FleetResult<()> {
        let current = self.status();
        if current != RuntimeStatus::Paused {
            return Err(self.invalid(current, RuntimeStatus::Running));
        }
        self.transition(RuntimeStatus::Running, Some("resumed"));
        self.persist_status().await;
        Ok(())
    }

    /// Runs the shutdown sequence and ends in `stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::NotRunning`] when the runtime is already stopping
    /// or stopped.
    pub async fn stop(self: &Arc<Self>, reason: &str) -> FleetResult<ShutdownReport> {
        self.stop_with_signal(reason, None).await
    }

    /// [`BotRuntime::stop`] recording the process signal that caused it.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::NotRunning`] when the runtime is already stopping
    /// or stopped.
    pub async fn stop_with_signal(
        self: &Arc<Self>,
        reason: &str,
        signal: Option<&str>,
    ) -> FleetResult<ShutdownReport> {
        self.services
            .shutdown
            .stop_target(Arc::clone(self) as Arc<dyn ShutdownTarget>, reason, signal)
            .await
            .ok_or_else(|| FleetError::NotRunning(self.bot_id.clone()))
    }

    /// Moves to `stopping` and waits out any in-flight tick. Returns `false`
    /// if the runtime cannot stop from its current status.
    fn begin_stop(&self, reason: &str) -> bool {
        let current = self.status();
        if matches!(current, RuntimeStatus::Stopping | RuntimeStatus::Stopped) {
            tracing::debug!("Bot {} already {}", self.bot_id, current);
            return false;
        }
        if !self.transition(RuntimeStatus::Stopping, Some(reason)) {
            return false;
        }
        tracing::info!("Stopping bot {}: {}", self.bot_id, reason);
        true
    }

    /// Halts tasks, marks `stopped` and writes the final snapshot.
    async fn finish_stop(&self) {
        self.halt_tasks().await;
        self.transition(RuntimeStatus::Stopped, Some("stopped"));
        if let Err(e) = self.persist().await {
            tracing::error!("Final snapshot failed for bot {}: {}", self.bot_id, e);
        }
        tracing::info!("Bot {} stopped", self.bot_id);
    }

    /// Signals both tasks to stop and waits for them.
    async fn halt_tasks(&self) {
        // Let an in-flight tick finish before tearing down.
        drop(self.tick_gate.lock().await);

        let (stop_tx, tick, monitor) = {
            let mut tasks = self.tasks.lock();
            (tasks.stop_tx.take(), tasks.tick.take(), tasks.monitor.take())
        };
        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }
        for handle in [tick, monitor].into_iter().flatten() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!("Task for bot {} ended abnormally: {}", self.bot_id, e);
                }
            }
        }
    }

    /// Stops from inside the tick loop. The stop itself runs on a separate
    /// task so the loop can exit first.
    fn stop_self(self: &Arc<Self>, reason: String) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            match runtime.stop(&reason).await {
                Ok(_) | Err(FleetError::NotRunning(_)) => {}
                Err(e) => tracing::error!("Self-stop of bot {} failed: {}", runtime.bot_id, e),
            }
            runtime.notify_exit(reason, ExitKind::Stopped);
        });
    }

    fn notify_exit(&self, reason: String, kind: ExitKind) {
        if let Some(tx) = &self.exit_tx {
            let _ = tx.send(RuntimeExit {
                bot_id: self.bot_id.clone(),
                reason,
                kind,
            });
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Applies a status change if the state machine allows it.
    fn transition(&self, next: RuntimeStatus, message: Option<&str>) -> bool {
        {
            let mut state = self.state.lock();
            if !state.status.can_transition(next) {
                tracing::warn!(
                    "Bot {} ignoring illegal transition {} -> {}",
                    self.bot_id,
                    state.status,
                    next
                );
                return false;
            }
            state.status = next;
        }
        tracing::debug!("Bot {} is now {}", self.bot_id, next);
        self.services.events.publish(FleetEvent::StatusChanged {
            bot_id: self.bot_id.clone(),
            status: next.into(),
            message: message.map(str::to_string),
            timestamp: Utc::now(),
        });
        true
    }

    fn invalid(&self, from: RuntimeStatus, to: RuntimeStatus) -> FleetError {
        FleetError::InvalidTransition {
            bot_id: self.bot_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn strategy_context(&self, market: Option<MarketConditions>) -> StrategyContext {
        let state = self.state.lock();
        StrategyContext {
            bot_id: self.bot_id.clone(),
            symbol: self.symbol.clone(),
            configuration: self.configuration.read().clone(),
            positions: state.positions.clone(),
            open_orders: state.open_orders.clone(),
            market,
            tick: state.performance.ticks,
            timestamp: Utc::now(),
        }
    }

    async fn capture(&self) -> CapturedState {
        let strategy_state = self.strategy.lock().await.get_state();
        CapturedState {
            state: self.status_view(),
            configuration: self.configuration(),
            strategy_state: Some(strategy_state),
        }
    }

    /// Writes a full snapshot.
    async fn persist(&self) -> FleetResult<()> {
        let captured = self.capture().await;
        self.services
            .state
            .persist(&captured.state, &captured.configuration, captured.strategy_state)
            .await?;
        Ok(())
    }

    /// Merges the current tick-level fields into the latest snapshot.
    async fn persist_status(&self) {
        let captured = self.capture().await;
        let update = StateUpdate::from_tick(
            &captured.state,
            captured.strategy_state.unwrap_or(serde_json::Value::Null),
        );
        let result = match self.services.state.update_state(&self.bot_id, update).await {
            Err(FleetError::SnapshotNotFound(_)) => self
                .services
                .state
                .persist(&captured.state, &captured.configuration, None)
                .await
                .map(|_| ()),
            other => other.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::error!("Persisting state failed for bot {}: {}", self.bot_id, e);
        }
    }
}

#[async_trait]
impl ShutdownTarget for BotRuntime {
    fn bot_id(&self) -> &str {
        &self.bot_id
    }

    async fn cancel_pending_orders(&self) -> Result<usize> {
        self.executor.cancel_all(&self.state).await
    }

    async fn close_open_positions(&self) -> Result<usize> {
        self.executor.close_all(&self.state).await
    }

    async fn cleanup_resources(&self) -> Result<()> {
        let context = self.strategy_context(None);
        self.strategy_ready.store(false, Ordering::SeqCst);
        self.strategy.lock().await.cleanup(&context).await
    }

    async fn stop_services(&self) -> Result<()> {
        self.halt_tasks().await;
        Ok(())
    }

    async fn capture_state(&self) -> CapturedState {
        self.capture().await
    }

    async fn force_terminate(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(tx) = tasks.stop_tx.take() {
            let _ = tx.send(true);
        }
        for handle in [tasks.tick.take(), tasks.monitor.take()].into_iter().flatten() {
            handle.abort();
        }
        drop(tasks);
        tracing::warn!("Bot {} tasks force-terminated", self.bot_id);
    }

    fn begin_shutdown(&self, reason: &str) -> bool {
        self.begin_stop(reason)
    }

    async fn finish_shutdown(&self) {
        self.finish_stop().await;
    }
}

/// Overlays a bot's risk overrides on the fleet-wide decision config.
fn merge_risk_overrides(
    base: &DecisionConfig,
    overrides: &serde_json::Value,
) -> FleetResult<DecisionConfig> {
    let Some(overrides) = overrides.as_object().filter(|o| !o.is_empty()) else {
        return Ok(base.clone());
    };
    let mut merged = serde_json::to_value(base)
        .map_err(|e| FleetError::Configuration(format!("decision config: {e}")))?;
    if let Some(target) = merged.as_object_mut() {
        for (key, value) in overrides {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(merged)
        .map_err(|e| FleetError::Configuration(format!("invalid risk management overrides: {e}")))
}
