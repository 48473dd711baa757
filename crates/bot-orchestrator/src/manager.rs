//! Fleet-level lifecycle: one registry of live runtimes per process.
//!
//! The manager owns every shared service (state, recovery, shutdown,
//! watchdog), starts and stops runtimes, persists bot status through the
//! [`FleetStore`], and runs a periodic health sweep. Construct one per process
//! and share it as `Arc<BotManager>`.

use crate::commands::{BotCommand, CommandResponse, SwitchOptions};
use crate::recovery::ErrorRecoveryManager;
use crate::reliability::BotReliabilitySystem;
use crate::runtime::{BotRuntime, ExitKind, RuntimeExit, RuntimeServices};
use crate::shutdown::{GracefulShutdownManager, ShutdownReport, ShutdownTarget};
use crate::state::{BackupInfo, RecoveryOptions, StateManager};
use crate::strategies::StrategyRegistry;
use crate::watchdog::{BotController, BotWatchdog, HealthMetrics, NoopSampler, ResourceSampler};
use async_trait::async_trait;
use bot_fleet_core::{
    BackupType, Bot, BotState, BotStatus, EventBus, ExchangeConnector, ExchangeCredential,
    FleetConfig, FleetError, FleetEvent, FleetResult, FleetStore, HealthWarningKind,
    RuntimeStatus, StrategyDescriptor,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Status of one bot as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatusView {
    pub bot_id: String,
    pub status: BotStatus,
    /// Live working state when a runtime is registered.
    pub runtime: Option<BotState>,
    pub health: Option<HealthMetrics>,
}

/// A problem found by the health sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthWarning {
    pub bot_id: String,
    pub kind: HealthWarningKind,
}

pub struct BotManagerBuilder {
    config: FleetConfig,
    store: Arc<dyn FleetStore>,
    connector: Arc<dyn ExchangeConnector>,
    registry: StrategyRegistry,
    sampler: Arc<dyn ResourceSampler>,
}

impl BotManagerBuilder {
    #[must_use]
    pub fn registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<BotManager> {
        let config = self.config;
        let events = EventBus::new(config.events.channel_capacity);
        let state = Arc::new(StateManager::new(
            Arc::clone(&self.store),
            config.state.clone(),
        ));
        let recovery = Arc::new(ErrorRecoveryManager::new(
            config.recovery.clone(),
            events.clone(),
        ));
        let shutdown = Arc::new(GracefulShutdownManager::new(
            config.shutdown.clone(),
            Arc::clone(&state),
            events.clone(),
        ));
        let watchdog = Arc::new(
            BotWatchdog::new(config.watchdog.clone(), Arc::clone(&recovery), events.clone())
                .with_sampler(self.sampler),
        );
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<BotManager>| {
            let controller: Weak<dyn BotController> = weak.clone();
            watchdog.set_controller(controller.clone());
            let reliability = Arc::new(BotReliabilitySystem::new(
                config.reliability.clone(),
                Arc::clone(&recovery),
                Arc::clone(&watchdog),
                controller,
                events.clone(),
            ));

            BotManager {
                services: RuntimeServices {
                    runtime: config.runtime.clone(),
                    trading: config.trading.clone(),
                    state,
                    recovery,
                    shutdown,
                    registry: Arc::new(self.registry),
                    events,
                },
                config,
                store: self.store,
                connector: self.connector,
                watchdog,
                reliability,
                runtimes: RwLock::new(HashMap::new()),
                starting: Mutex::new(HashSet::new()),
                exit_tx,
                exit_rx: Mutex::new(Some(exit_rx)),
                stop_tx,
                background: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }
        })
    }
}

pub struct BotManager {
    config: FleetConfig,
    store: Arc<dyn FleetStore>,
    connector: Arc<dyn ExchangeConnector>,
    services: RuntimeServices,
    watchdog: Arc<BotWatchdog>,
    reliability: Arc<BotReliabilitySystem>,
    runtimes: RwLock<HashMap<String, Arc<BotRuntime>>>,
    /// Bots between the start checks and registration.
    starting: Mutex<HashSet<String>>,
    exit_tx: mpsc::UnboundedSender<RuntimeExit>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<RuntimeExit>>>,
    stop_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl BotManager {
    #[must_use]
    pub fn builder(
        config: FleetConfig,
        store: Arc<dyn FleetStore>,
        connector: Arc<dyn ExchangeConnector>,
    ) -> BotManagerBuilder {
        BotManagerBuilder {
            config,
            store,
            connector,
            registry: StrategyRegistry::with_builtins(),
            sampler: Arc::new(NoopSampler),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    #[must_use]
    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.services.state
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.services.recovery
    }

    #[must_use]
    pub fn watchdog(&self) -> &Arc<BotWatchdog> {
        &self.watchdog
    }

    #[must_use]
    pub fn reliability(&self) -> &Arc<BotReliabilitySystem> {
        &self.reliability
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.services.registry
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    #[must_use]
    pub fn runtime(&self, bot_id: &str) -> Option<Arc<BotRuntime>> {
        self.runtimes.read().get(bot_id).cloned()
    }

    #[must_use]
    pub fn running_bots(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.runtimes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Spawns the health sweep, the runtime exit listener, the reliability
    /// listener and (if enabled) the backup scheduler. Call once after building.
    pub fn spawn_background(self: &Arc<Self>) {
        self.reliability.start();
        let mut tasks = self.background.lock();

        if let Some(exit_rx) = self.exit_rx.lock().take() {
            tasks.push(tokio::spawn(listen_for_exits(Arc::downgrade(self), exit_rx)));
        }

        let weak = Arc::downgrade(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let period = self.config.manager.health_check_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.health_sweep();
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Health sweep stopped");
        }));

        if self.config.state.scheduled_backups {
            tasks.push(
                self.services
                    .state
                    .spawn_backup_scheduler(self.stop_tx.subscribe()),
            );
        }
        tracing::info!("Bot manager background tasks started");
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts a bot and returns its initial working state.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::AlreadyRunning`], [`FleetError::LimitReached`],
    /// [`FleetError::BotNotFound`], a credential error, or whatever failed
    /// while loading and starting the runtime (the bot is then marked `error`).
    pub async fn start_bot(&self, bot_id: &str) -> FleetResult<BotState> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FleetError::Configuration("fleet is shutting down".into()));
        }
        self.reserve(bot_id)?;
        let result = self.start_reserved(bot_id).await;
        self.starting.lock().remove(bot_id);
        result
    }

    /// Claims the start slot for a bot, enforcing uniqueness and the limit.
    fn reserve(&self, bot_id: &str) -> FleetResult<()> {
        let runtimes = self.runtimes.read();
        let mut starting = self.starting.lock();
        if runtimes.contains_key(bot_id) || starting.contains(bot_id) {
            tracing::info!("Bot {} is already running", bot_id);
            return Err(FleetError::AlreadyRunning(bot_id.to_string()));
        }
        let limit = self.config.manager.max_concurrent_bots;
        if runtimes.len() + starting.len() >= limit {
            tracing::warn!("Cannot start bot {}: limit of {} reached", bot_id, limit);
            return Err(FleetError::LimitReached { limit });
        }
        starting.insert(bot_id.to_string());
        Ok(())
    }

    async fn start_reserved(&self, bot_id: &str) -> FleetResult<BotState> {
        let bot = self
            .store
            .get_bot(bot_id)
            .await
            .map_err(|e| FleetError::storage(&e))?
            .ok_or_else(|| FleetError::BotNotFound(bot_id.to_string()))?;
        let credential = self.credential_for(&bot).await?;

        tracing::info!("Starting bot {} ({} on {})", bot.id, bot.strategy, bot.symbol);
        self.set_status(bot_id, BotStatus::Starting, None).await;

        match self.launch(&bot, &credential).await {
            Ok(runtime) => {
                self.register(&runtime);
                self.set_status(bot_id, BotStatus::Running, Some("started")).await;
                Ok(runtime.status_view())
            }
            Err(e) => {
                tracing::error!("Failed to start bot {}: {}", bot_id, e);
                self.set_status(bot_id, BotStatus::Error, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn credential_for(&self, bot: &Bot) -> FleetResult<ExchangeCredential> {
        let missing = || FleetError::MissingCredentials(bot.id.clone());
        let credential_id = bot.credential_id.as_deref().ok_or_else(missing)?;
        let credential = self
            .store
            .get_credential(credential_id)
            .await
            .map_err(|e| FleetError::storage(&e))?
            .ok_or_else(missing)?;
        if !credential.active {
            return Err(FleetError::InactiveCredentials(bot.id.clone()));
        }
        Ok(credential)
    }

    async fn launch(
        &self,
        bot: &Bot,
        credential: &ExchangeCredential,
    ) -> FleetResult<Arc<BotRuntime>> {
        let strategy = self
            .services
            .registry
            .load(&bot.id, &bot.strategy, &bot.configuration)?;
        let session = self
            .connector
            .connect(bot, credential)
            .await
            .map_err(|e| FleetError::Exchange(format!("{e:#}")))?;

        let runtime = BotRuntime::new(
            bot,
            strategy,
            session,
            self.services.clone(),
            Some(self.exit_tx.clone()),
        )?;
        runtime.initialize().await?;
        runtime.start().await?;
        Ok(runtime)
    }

    fn register(&self, runtime: &Arc<BotRuntime>) {
        let bot_id = runtime.bot_id().to_string();
        self.runtimes.write().insert(bot_id.clone(), Arc::clone(runtime));
        self.watchdog.register(&bot_id);
        self.services
            .shutdown
            .track(Arc::clone(runtime) as Arc<dyn ShutdownTarget>);
        self.services.state.track(&bot_id);
    }

    fn deregister(&self, bot_id: &str) -> Option<Arc<BotRuntime>> {
        let runtime = self.runtimes.write().remove(bot_id);
        self.watchdog.deregister(bot_id);
        self.services.shutdown.untrack(bot_id);
        self.services.state.untrack(bot_id);
        runtime
    }

    /// Stops a bot. Stopping a bot without a runtime only records `stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::BotNotFound`] when neither a runtime nor a stored
    /// bot exists.
    pub async fn stop_bot(&self, bot_id: &str, reason: &str) -> FleetResult<Option<ShutdownReport>> {
        let Some(runtime) = self.runtime(bot_id) else {
            self.ensure_known(bot_id).await?;
            self.set_status(bot_id, BotStatus::Stopped, Some(reason)).await;
            return Ok(None);
        };

        let report = match runtime.stop(reason).await {
            Ok(report) => {
                if !report.is_clean() {
                    tracing::warn!(
                        "Bot {} stopped with failed steps: {:?}",
                        bot_id,
                        report.failed
                    );
                }
                Some(report)
            }
            Err(FleetError::NotRunning(_)) => None,
            Err(e) => return Err(e),
        };

        self.finalize_stopped(bot_id, &runtime, reason).await;
        Ok(report)
    }

    /// Deregisters a stopped runtime and records its final status.
    async fn finalize_stopped(&self, bot_id: &str, runtime: &Arc<BotRuntime>, reason: &str) {
        let removed = {
            let mut runtimes = self.runtimes.write();
            match runtimes.get(bot_id) {
                Some(current) if Arc::ptr_eq(current, runtime) => runtimes.remove(bot_id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.watchdog.deregister(bot_id);
            self.services.shutdown.untrack(bot_id);
            self.services.state.untrack(bot_id);
        }

        let summary = runtime.status_view().performance.summary();
        if let Err(e) = self.store.update_bot_performance(bot_id, &summary).await {
            tracing::error!("Failed to persist performance for bot {}: {:#}", bot_id, e);
        }
        self.set_status(bot_id, BotStatus::Stopped, Some(reason)).await;
    }

    /// # Errors
    ///
    /// Returns [`FleetError::NotRunning`] without a runtime, or
    /// [`FleetError::InvalidTransition`] unless the bot is running.
    pub async fn pause_bot(&self, bot_id: &str) -> FleetResult<()> {
        let runtime = self.require_runtime(bot_id)?;
        runtime.pause().await?;
        self.set_status(bot_id, BotStatus::Paused, None).await;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`FleetError::NotRunning`] without a runtime, or
    /// [`FleetError::InvalidTransition`] unless the bot is paused.
    pub async fn resume_bot(&self, bot_id: &str) -> FleetResult<()> {
        let runtime = self.require_runtime(bot_id)?;
        runtime.resume().await?;
        self.set_status(bot_id, BotStatus::Running, None).await;
        Ok(())
    }

    /// Switches a bot's strategy.
    ///
    /// Without a runtime the new strategy is validated and stored for the
    /// next start. With one, the swap happens live; if it fails and
    /// `rollback_on_failure` is off, the bot is stopped.
    ///
    /// # Errors
    ///
    /// Returns the validation or initialization error of the new strategy.
    pub async fn switch_bot_strategy(
        &self,
        bot_id: &str,
        strategy: &str,
        configuration: serde_json::Value,
        options: SwitchOptions,
    ) -> FleetResult<StrategyDescriptor> {
        let Some(runtime) = self.runtime(bot_id) else {
            self.ensure_known(bot_id).await?;
            self.services.registry.validate(strategy, &configuration)?;
            self.store
                .update_bot_strategy(bot_id, strategy, &configuration)
                .await
                .map_err(|e| FleetError::storage(&e))?;
            return self
                .services
                .registry
                .descriptor(strategy)
                .ok_or_else(|| FleetError::UnknownStrategy(strategy.to_string()));
        };

        match runtime
            .switch_strategy(strategy, configuration.clone(), options.preserve_state)
            .await
        {
            Ok(descriptor) => {
                self.store
                    .update_bot_strategy(bot_id, strategy, &configuration)
                    .await
                    .map_err(|e| FleetError::storage(&e))?;
                Ok(descriptor)
            }
            Err(e @ FleetError::Strategy(_)) if !options.rollback_on_failure => {
                tracing::error!(
                    "Strategy switch failed for bot {} without rollback, stopping: {}",
                    bot_id,
                    e
                );
                if let Err(stop) = self.stop_bot(bot_id, "strategy switch failed").await {
                    tracing::error!("Stopping bot {} failed: {}", bot_id, stop);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// # Errors
    ///
    /// Returns [`FleetError::NotRunning`] without a runtime, or the rollback
    /// error.
    pub async fn rollback_bot_strategy(&self, bot_id: &str) -> FleetResult<StrategyDescriptor> {
        let runtime = self.require_runtime(bot_id)?;
        let descriptor = runtime.rollback_strategy().await?;
        self.store
            .update_bot_strategy(bot_id, &descriptor.name, &runtime.configuration())
            .await
            .map_err(|e| FleetError::storage(&e))?;
        Ok(descriptor)
    }

    /// # Errors
    ///
    /// Returns [`FleetError::BotNotFound`] for an unknown bot.
    pub async fn get_bot_status(&self, bot_id: &str) -> FleetResult<BotStatusView> {
        if let Some(runtime) = self.runtime(bot_id) {
            let state = runtime.status_view();
            return Ok(BotStatusView {
                bot_id: bot_id.to_string(),
                status: state.status.into(),
                runtime: Some(state),
                health: self.watchdog.latest_metrics(bot_id),
            });
        }

        let bot = self
            .store
            .get_bot(bot_id)
            .await
            .map_err(|e| FleetError::storage(&e))?
            .ok_or_else(|| FleetError::BotNotFound(bot_id.to_string()))?;
        Ok(BotStatusView {
            bot_id: bot.id,
            status: bot.status,
            runtime: None,
            health: None,
        })
    }

    /// Status of every stored bot, plus any runtime not in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list bots.
    pub async fn get_all_bots_status(&self) -> FleetResult<Vec<BotStatusView>> {
        let bots = self
            .store
            .list_bots()
            .await
            .map_err(|e| FleetError::storage(&e))?;
        let runtimes: HashMap<_, _> = self.runtimes.read().clone();

        let mut views: Vec<BotStatusView> = bots
            .into_iter()
            .map(|bot| match runtimes.get(&bot.id) {
                Some(runtime) => {
                    let state = runtime.status_view();
                    BotStatusView {
                        status: state.status.into(),
                        health: self.watchdog.latest_metrics(&bot.id),
                        runtime: Some(state),
                        bot_id: bot.id,
                    }
                }
                None => BotStatusView {
                    bot_id: bot.id,
                    status: bot.status,
                    runtime: None,
                    health: None,
                },
            })
            .collect();

        for (bot_id, runtime) in runtimes {
            if views.iter().any(|v| v.bot_id == bot_id) {
                continue;
            }
            let state = runtime.status_view();
            views.push(BotStatusView {
                status: state.status.into(),
                health: self.watchdog.latest_metrics(&bot_id),
                runtime: Some(state),
                bot_id,
            });
        }
        views.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        Ok(views)
    }

    /// Starts every stored bot whose persisted status is `running`.
    pub async fn restore_running_bots(&self) -> Vec<(String, FleetResult<()>)> {
        let bots = match self.store.list_bots().await {
            Ok(bots) => bots,
            Err(e) => {
                tracing::error!("Cannot list bots to restore: {:#}", e);
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for bot in bots.into_iter().filter(|b| b.status == BotStatus::Running) {
            tracing::info!("Restoring bot {}", bot.id);
            let result = self.start_bot(&bot.id).await.map(|_| ());
            results.push((bot.id, result));
        }
        results
    }

    /// Stops every bot and the background tasks.
    pub async fn shutdown(&self, reason: &str, signal: Option<&str>) -> Vec<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::warn!("Shutdown already in progress");
            return Vec::new();
        }
        tracing::info!("Shutting down bot fleet: {}", reason);
        let _ = self.stop_tx.send(true);
        self.watchdog.shutdown();
        self.reliability.stop();

        // Every registered runtime is tracked by the shutdown manager.
        let runtimes: Vec<_> = self.runtimes.read().values().cloned().collect();
        let reports = self.services.shutdown.shutdown_all(reason, signal).await;
        join_all(
            runtimes
                .iter()
                .map(|runtime| self.finalize_stopped(runtime.bot_id(), runtime, reason)),
        )
        .await;

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        tracing::info!("Bot fleet shut down ({} bots stopped)", reports.len());
        reports
    }

    // =========================================================================
    // Health sweep
    // =========================================================================

    /// Flags running bots with a stale tick or a high error ratio. Warnings
    /// only; nothing is restarted.
    pub fn health_sweep(&self) -> Vec<HealthWarning> {
        self.health_sweep_at(Utc::now())
    }

    /// [`Self::health_sweep`] evaluated as of `now`.
    pub fn health_sweep_at(&self, now: DateTime<Utc>) -> Vec<HealthWarning> {
        let runtimes: Vec<_> = self.runtimes.read().values().cloned().collect();
        let stale_after = self.config.manager.stale_tick_threshold();
        let max_ratio = self.config.manager.max_error_ratio;
        let mut warnings = Vec::new();

        for runtime in runtimes {
            let state = runtime.status_view();
            if state.status != RuntimeStatus::Running {
                continue;
            }

            let reference = state.last_tick_at.or(state.started_at);
            if let Some(at) = reference {
                let silent = now.signed_duration_since(at);
                if silent.to_std().is_ok_and(|s| s > stale_after) {
                    let message = format!("no tick for {}s", silent.num_seconds());
                    warnings.push(self.warn(&state.bot_id, HealthWarningKind::StaleTick, message));
                }
            }

            let ratio = state.performance.error_ratio();
            if ratio > max_ratio {
                let message = format!(
                    "error ratio {:.1}% above {:.1}%",
                    ratio * 100.0,
                    max_ratio * 100.0
                );
                warnings.push(self.warn(&state.bot_id, HealthWarningKind::HighErrorRatio, message));
            }
        }
        warnings
    }

    fn warn(&self, bot_id: &str, kind: HealthWarningKind, message: String) -> HealthWarning {
        tracing::warn!("Bot {} health warning: {}", bot_id, message);
        self.services.events.publish(FleetEvent::HealthWarning {
            bot_id: bot_id.to_string(),
            kind,
            message,
        });
        HealthWarning {
            bot_id: bot_id.to_string(),
            kind,
        }
    }

    // =========================================================================
    // Backups
    // =========================================================================

    /// Backs up the bot's latest snapshot, taking a fresh one first when a
    /// runtime is live.
    ///
    /// # Errors
    ///
    /// Returns an error if no snapshot exists or the store fails.
    pub async fn backup_bot(
        &self,
        bot_id: &str,
        backup_type: BackupType,
        reason: &str,
    ) -> FleetResult<BackupInfo> {
        if let Some(runtime) = self.runtime(bot_id) {
            let captured = runtime.capture_state().await;
            let snapshot = self
                .services
                .state
                .persist(&captured.state, &captured.configuration, captured.strategy_state)
                .await?;
            return self
                .services
                .state
                .create_backup(&snapshot, backup_type, reason)
                .await;
        }
        self.services
            .state
            .backup_latest(bot_id, backup_type, reason)
            .await
    }

    /// Restores a backup for a bot that is not running.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::AlreadyRunning`] for a live bot, or the recovery
    /// error.
    pub async fn recover_bot(&self, bot_id: &str, options: RecoveryOptions) -> FleetResult<u64> {
        if self.runtime(bot_id).is_some() {
            return Err(FleetError::AlreadyRunning(bot_id.to_string()));
        }
        let snapshot = self
            .services
            .state
            .recover_from_backup(bot_id, options)
            .await?;
        Ok(snapshot.version)
    }

    // =========================================================================
    // Command surface
    // =========================================================================

    /// Runs a command and reports the outcome with a machine-readable reason.
    pub async fn dispatch(&self, bot_id: &str, command: BotCommand) -> CommandResponse {
        let name = command.name();
        tracing::debug!("Dispatching {} to bot {}", name, bot_id);

        let result = match command {
            BotCommand::Start => self.start_bot(bot_id).await.map(|state| {
                CommandResponse::ok(format!("bot {bot_id} started"), Some(state.status.into()))
            }),
            BotCommand::Stop { reason } => {
                let reason = reason.unwrap_or_else(|| "stop requested".to_string());
                self.stop_bot(bot_id, &reason).await.map(|report| {
                    let response =
                        CommandResponse::ok(format!("bot {bot_id} stopped"), Some(BotStatus::Stopped));
                    match report.and_then(|r| serde_json::to_value(r).ok()) {
                        Some(report) => response.with_data(report),
                        None => response,
                    }
                })
            }
            BotCommand::Pause => self.pause_bot(bot_id).await.map(|()| {
                CommandResponse::ok(format!("bot {bot_id} paused"), Some(BotStatus::Paused))
            }),
            BotCommand::Resume => self.resume_bot(bot_id).await.map(|()| {
                CommandResponse::ok(format!("bot {bot_id} resumed"), Some(BotStatus::Running))
            }),
            BotCommand::SwitchStrategy {
                strategy,
                configuration,
                options,
            } => self
                .switch_bot_strategy(bot_id, &strategy, configuration, options)
                .await
                .map(|d| CommandResponse::ok(format!("bot {bot_id} now runs {} v{}", d.name, d.version), None)),
            BotCommand::RollbackStrategy => self.rollback_bot_strategy(bot_id).await.map(|d| {
                CommandResponse::ok(format!("bot {bot_id} rolled back to {} v{}", d.name, d.version), None)
            }),
            BotCommand::Status => self.get_bot_status(bot_id).await.map(|view| {
                let response = CommandResponse::ok(format!("bot {bot_id} is {}", view.status), Some(view.status));
                match serde_json::to_value(&view) {
                    Ok(data) => response.with_data(data),
                    Err(_) => response,
                }
            }),
            BotCommand::Backup { reason } => self
                .backup_bot(bot_id, BackupType::Manual, &reason)
                .await
                .map(|info| {
                    let response = CommandResponse::ok(format!("backup {} created", info.id), None);
                    match serde_json::to_value(&info) {
                        Ok(data) => response.with_data(data),
                        Err(_) => response,
                    }
                }),
            BotCommand::Recover { request } => self
                .recover_bot(bot_id, request.into())
                .await
                .map(|version| {
                    CommandResponse::ok(format!("bot {bot_id} restored as snapshot v{version}"), None)
                }),
        };

        result.unwrap_or_else(|e| {
            tracing::info!("Command {} for bot {} rejected: {}", name, bot_id, e);
            CommandResponse::from_error(&e)
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn require_runtime(&self, bot_id: &str) -> FleetResult<Arc<BotRuntime>> {
        self.runtime(bot_id)
            .ok_or_else(|| FleetError::NotRunning(bot_id.to_string()))
    }

    async fn ensure_known(&self, bot_id: &str) -> FleetResult<()> {
        match self.store.get_bot(bot_id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(FleetError::BotNotFound(bot_id.to_string())),
            Err(e) => Err(FleetError::storage(&e)),
        }
    }

    /// Persists a bot status and announces it. Store failures are logged.
    async fn set_status(&self, bot_id: &str, status: BotStatus, message: Option<&str>) {
        if let Err(e) = self.store.update_bot_status(bot_id, status).await {
            tracing::error!("Failed to persist status {} for bot {}: {:#}", status, bot_id, e);
        }
        self.services.events.publish(FleetEvent::StatusChanged {
            bot_id: bot_id.to_string(),
            status,
            message: message.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    async fn handle_exit(&self, exit: RuntimeExit) {
        match exit.kind {
            ExitKind::Stopped => {
                let Some(runtime) = self.runtime(&exit.bot_id) else {
                    return;
                };
                if runtime.status() == RuntimeStatus::Stopped {
                    tracing::info!("Bot {} stopped itself: {}", exit.bot_id, exit.reason);
                    self.finalize_stopped(&exit.bot_id, &runtime, &exit.reason).await;
                }
            }
            ExitKind::RestartRequested => {
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                tracing::warn!("Restart requested for bot {}: {}", exit.bot_id, exit.reason);
                if let Err(e) = self.restart_bot(&exit.bot_id, &exit.reason).await {
                    tracing::error!("Restart of bot {} failed: {}", exit.bot_id, e);
                }
            }
        }
    }

    /// Backs up, stops and starts a bot.
    ///
    /// # Errors
    ///
    /// Returns the stop or start error.
    pub async fn restart_bot(&self, bot_id: &str, reason: &str) -> FleetResult<BotState> {
        if let Err(e) = BotController::prepare_restart(self, bot_id, reason).await {
            tracing::warn!("Pre-restart backup failed for bot {}: {}", bot_id, e);
        }
        self.stop_bot(bot_id, &format!("restart: {reason}")).await?;
        tokio::time::sleep(self.config.watchdog.restart_delay()).await;
        self.start_bot(bot_id).await
    }
}

async fn listen_for_exits(manager: Weak<BotManager>, mut exits: mpsc::UnboundedReceiver<RuntimeExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        // Restarts stop the runtime, which can emit another exit; keep the
        // listener free while they run.
        tokio::spawn(async move { manager.handle_exit(exit).await });
    }
    tracing::debug!("Runtime exit listener stopped");
}

#[async_trait]
impl BotController for BotManager {
    fn bot_state(&self, bot_id: &str) -> Option<BotState> {
        self.runtime(bot_id).map(|r| r.status_view())
    }

    async fn prepare_restart(&self, bot_id: &str, reason: &str) -> FleetResult<()> {
        self.backup_bot(bot_id, BackupType::PreRestart, reason)
            .await
            .map(|_| ())
    }

    async fn stop_bot(&self, bot_id: &str, reason: &str) -> FleetResult<()> {
        Self::stop_bot(self, bot_id, reason).await.map(|_| ())
    }

    async fn start_bot(&self, bot_id: &str) -> FleetResult<()> {
        Self::start_bot(self, bot_id).await.map(|_| ())
    }

    async fn stop_all(&self, reason: &str) -> Vec<String> {
        let ids = self.running_bots();
        let results = join_all(ids.iter().map(|id| Self::stop_bot(self, id, reason))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(_) => Some(id),
                Err(e) => {
                    tracing::error!("Failed to stop bot {}: {}", id, e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperConnector, PaperExchange};
    use crate::store::MemoryStore;
    use bot_fleet_core::ManagerConfig;
    use rust_decimal_macros::dec;

    async fn setup(config: FleetConfig) -> (Arc<BotManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let paper = Arc::new(PaperExchange::new());
        paper.set_price("BTC-USD", dec!(100), dec!(0.02));

        store
            .upsert_credential(&ExchangeCredential::new("cred-1", "paper"))
            .await
            .unwrap();
        for id in ["bot-1", "bot-2", "bot-3"] {
            let bot = Bot::new(id, "owner", "hold", "paper", "BTC-USD").with_credential("cred-1");
            store.upsert_bot(&bot).await.unwrap();
        }

        let manager = BotManager::builder(
            config,
            Arc::clone(&store) as Arc<dyn FleetStore>,
            Arc::new(PaperConnector::new(paper)),
        )
        .build();
        (manager, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_runtime_per_bot() {
        let (manager, _) = setup(FleetConfig::default()).await;
        manager.start_bot("bot-1").await.unwrap();

        let err = manager.start_bot("bot-1").await.unwrap_err();
        assert_eq!(err.reason(), "already_running");
        assert_eq!(manager.running_bots(), vec!["bot-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let config = FleetConfig {
            manager: ManagerConfig {
                max_concurrent_bots: 2,
                ..ManagerConfig::default()
            },
            ..FleetConfig::default()
        };
        let (manager, _) = setup(config).await;
        manager.start_bot("bot-1").await.unwrap();
        manager.start_bot("bot-2").await.unwrap();

        let err = manager.start_bot("bot-3").await.unwrap_err();
        assert!(matches!(err, FleetError::LimitReached { limit: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_credentials_checked() {
        let (manager, store) = setup(FleetConfig::default()).await;

        let mut bot = store.get_bot("bot-1").await.unwrap().unwrap();
        bot.credential_id = None;
        store.upsert_bot(&bot).await.unwrap();
        assert_eq!(
            manager.start_bot("bot-1").await.unwrap_err().reason(),
            "missing_credentials"
        );

        let mut credential = ExchangeCredential::new("cred-2", "paper");
        credential.active = false;
        store.upsert_credential(&credential).await.unwrap();
        let bot = Bot::new("bot-4", "owner", "hold", "paper", "BTC-USD").with_credential("cred-2");
        store.upsert_bot(&bot).await.unwrap();
        assert_eq!(
            manager.start_bot("bot-4").await.unwrap_err().reason(),
            "inactive_credentials"
        );
        assert!(manager.running_bots().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_strategy_marks_error() {
        let (manager, store) = setup(FleetConfig::default()).await;
        let bot = Bot::new("bot-5", "owner", "nope", "paper", "BTC-USD").with_credential("cred-1");
        store.upsert_bot(&bot).await.unwrap();

        let err = manager.start_bot("bot-5").await.unwrap_err();
        assert_eq!(err.reason(), "unknown_strategy");
        let stored = store.get_bot("bot-5").await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_runtime_is_idempotent() {
        let (manager, store) = setup(FleetConfig::default()).await;
        assert!(manager.stop_bot("bot-1", "cleanup").await.unwrap().is_none());
        assert!(manager.stop_bot("bot-1", "cleanup").await.unwrap().is_none());
        assert_eq!(
            store.get_bot("bot-1").await.unwrap().unwrap().status,
            BotStatus::Stopped
        );
        assert_eq!(
            manager.stop_bot("ghost", "cleanup").await.unwrap_err().reason(),
            "bot_not_found"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_updates_store_and_registrations() {
        let (manager, store) = setup(FleetConfig::default()).await;
        manager.start_bot("bot-1").await.unwrap();
        assert_eq!(manager.watchdog().monitored_bots(), vec!["bot-1".to_string()]);
        assert_eq!(
            store.get_bot("bot-1").await.unwrap().unwrap().status,
            BotStatus::Running
        );

        manager.pause_bot("bot-1").await.unwrap();
        assert_eq!(
            manager.get_bot_status("bot-1").await.unwrap().status,
            BotStatus::Paused
        );
        manager.resume_bot("bot-1").await.unwrap();

        manager.stop_bot("bot-1", "done").await.unwrap();
        assert!(manager.running_bots().is_empty());
        assert!(manager.watchdog().monitored_bots().is_empty());
        assert!(manager.state_manager().tracked_bots().is_empty());
        assert_eq!(
            store.get_bot("bot-1").await.unwrap().unwrap().status,
            BotStatus::Stopped
        );
        assert_eq!(manager.pause_bot("bot-1").await.unwrap_err().reason(), "not_running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_reports_reason_codes() {
        let (manager, _) = setup(FleetConfig::default()).await;

        let started = manager.dispatch("bot-1", BotCommand::Start).await;
        assert!(started.success);
        assert_eq!(started.status, Some(BotStatus::Running));

        let again = manager.dispatch("bot-1", BotCommand::Start).await;
        assert!(!again.success);
        assert_eq!(again.reason, "already_running");

        let status = manager.dispatch("bot-1", BotCommand::Status).await;
        assert!(status.success);
        assert!(status.data.is_some());

        let rollback = manager.dispatch("bot-1", BotCommand::RollbackStrategy).await;
        assert_eq!(rollback.reason, "no_rollback_target");
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_without_runtime_updates_store() {
        let (manager, store) = setup(FleetConfig::default()).await;
        manager
            .switch_bot_strategy(
                "bot-1",
                "momentum",
                serde_json::json!({ "momentum": { "lookback": 4 } }),
                SwitchOptions::default(),
            )
            .await
            .unwrap();
        let bot = store.get_bot("bot-1").await.unwrap().unwrap();
        assert_eq!(bot.strategy, "momentum");

        let err = manager
            .switch_bot_strategy(
                "bot-1",
                "momentum",
                serde_json::json!({ "momentum": { "lookback": 1 } }),
                SwitchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "configuration_error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let (manager, store) = setup(FleetConfig::default()).await;
        manager.spawn_background();
        manager.start_bot("bot-1").await.unwrap();
        manager.start_bot("bot-2").await.unwrap();

        let reports = manager.shutdown("test", Some("SIGTERM")).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.signal.as_deref() == Some("SIGTERM")));
        assert!(manager.running_bots().is_empty());
        for id in ["bot-1", "bot-2"] {
            assert_eq!(store.get_bot(id).await.unwrap().unwrap().status, BotStatus::Stopped);
        }
        assert!(manager.start_bot("bot-3").await.is_err());
    }
}
