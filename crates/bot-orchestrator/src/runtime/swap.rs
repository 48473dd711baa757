use super::BotRuntime;
use bot_fleet_core::{
    FleetError, FleetEvent, FleetResult, RuntimeStatus, Strategy, StrategyDescriptor,
};

impl BotRuntime {
    /// Replaces the running strategy without stopping the bot.
    ///
    /// A running bot is paused for the swap and resumed afterwards. If the
    /// new strategy fails to initialize, the previous one is reinstated with
    /// its state and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownStrategy`] or [`FleetError::Configuration`]
    /// before anything changes, or [`FleetError::Strategy`] if the new strategy
    /// failed to initialize.
    pub async fn switch_strategy(
        &self,
        name: &str,
        configuration: serde_json::Value,
        preserve_state: bool,
    ) -> FleetResult<StrategyDescriptor> {
        let registry = &self.services.registry;
        registry.validate(name, &configuration)?;

        let was_running = self.status() == RuntimeStatus::Running;
        if was_running {
            self.pause().await?;
        }

        let versions_before = registry.history(&self.bot_id).len();
        let result = match registry.load(&self.bot_id, name, &configuration) {
            Ok(strategy) => {
                let result = self
                    .install(strategy, configuration, preserve_state, false)
                    .await;
                if result.is_err() && registry.history(&self.bot_id).len() > versions_before {
                    registry.discard_current(&self.bot_id);
                }
                result
            }
            Err(e) => Err(e),
        };

        if was_running {
            self.resume_after_swap().await;
        }
        result
    }

    /// Returns to the strategy version that ran before the current one.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::NoRollbackTarget`] when there is no earlier
    /// version, or [`FleetError::Strategy`] if it failed to initialize. The
    /// current strategy stays in place on failure.
    pub async fn rollback_strategy(&self) -> FleetResult<StrategyDescriptor> {
        let registry = &self.services.registry;
        let current = registry.current(&self.bot_id);
        if registry.previous(&self.bot_id).is_none() {
            return Err(FleetError::NoRollbackTarget(self.bot_id.clone()));
        }

        let was_running = self.status() == RuntimeStatus::Running;
        if was_running {
            self.pause().await?;
        }

        let result = match registry.rollback(&self.bot_id) {
            Ok((strategy, target)) => {
                let result = self.install(strategy, target.configuration, true, true).await;
                if result.is_err() {
                    if let Some(current) = current {
                        registry.restore_current(&self.bot_id, current);
                    }
                }
                result
            }
            Err(e) => Err(e),
        };

        if was_running {
            self.resume_after_swap().await;
        }
        result
    }

    /// Swaps `next` in under the tick gate, or puts the old strategy back.
    async fn install(
        &self,
        next: Box<dyn Strategy>,
        configuration: serde_json::Value,
        preserve_state: bool,
        rollback: bool,
    ) -> FleetResult<StrategyDescriptor> {
        let _gate = self.tick_gate.lock().await;
        let old_context = self.strategy_context(None);
        let mut new_context = old_context.clone();
        new_context.configuration = configuration.clone();

        let mut strategy = self.strategy.lock().await;
        let previous_descriptor = strategy.descriptor();
        let previous_state = strategy.get_state();
        if let Err(e) = strategy.cleanup(&old_context).await {
            tracing::warn!(
                "Cleanup of strategy {} failed for bot {}: {:#}",
                previous_descriptor.name,
                self.bot_id,
                e
            );
        }

        let mut previous = std::mem::replace(&mut *strategy, next);
        if preserve_state {
            if let Err(e) = strategy.set_state(previous_state.clone()) {
                tracing::warn!(
                    "Strategy {} rejected carried state for bot {}: {:#}",
                    strategy.name(),
                    self.bot_id,
                    e
                );
            }
        }

        if let Err(e) = strategy.initialize(&new_context).await {
            tracing::error!(
                "Strategy {} failed to initialize for bot {}, reinstating {}: {:#}",
                strategy.name(),
                self.bot_id,
                previous_descriptor.name,
                e
            );
            if let Err(restore) = previous.set_state(previous_state) {
                tracing::warn!("Previous strategy state not restored: {:#}", restore);
            }
            if let Err(reinit) = previous.initialize(&old_context).await {
                tracing::error!(
                    "Previous strategy {} failed to re-initialize for bot {}: {:#}",
                    previous_descriptor.name,
                    self.bot_id,
                    reinit
                );
            }
            *strategy = previous;
            return Err(FleetError::Strategy(format!("{e:#}")));
        }

        let descriptor = strategy.descriptor();
        drop(strategy);

        *self.configuration.write() = configuration;
        self.state.lock().strategy = descriptor.clone();
        tracing::info!(
            "Bot {} switched strategy {} -> {} v{}",
            self.bot_id,
            previous_descriptor.name,
            descriptor.name,
            descriptor.version
        );
        self.services.events.publish(FleetEvent::StrategyUpdated {
            bot_id: self.bot_id.clone(),
            strategy: descriptor.clone(),
            previous: Some(previous_descriptor),
            rollback,
        });

        if let Err(e) = self.persist().await {
            tracing::error!("Snapshot after strategy swap failed for bot {}: {}", self.bot_id, e);
        }
        Ok(descriptor)
    }

    async fn resume_after_swap(&self) {
        if let Err(e) = self.resume().await {
            tracing::warn!("Bot {} not resumed after strategy swap: {}", self.bot_id, e);
        }
    }
}
