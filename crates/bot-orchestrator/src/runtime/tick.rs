use super::{BotRuntime, ExitKind};
use crate::recovery::ErrorContext;
use crate::state::StateUpdate;
use anyhow::{anyhow, Context, Result};
use bot_fleet_core::{FleetEvent, RecoveryStrategy, RuntimeStatus, TradeAction};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// What the loop does after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    /// Back off before the next tick.
    Wait(Duration),
    Stop(String),
}

impl BotRuntime {
    pub(super) async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.services.runtime.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.status() != RuntimeStatus::Running {
                        continue;
                    }
                    match self.tick().await {
                        TickOutcome::Continue => {}
                        TickOutcome::Wait(delay) => {
                            tracing::debug!("Bot {} backing off for {:?}", self.bot_id, delay);
                            tokio::select! {
                                biased;
                                _ = stop.changed() => break,
                                () = tokio::time::sleep(delay) => ticker.reset(),
                            }
                        }
                        TickOutcome::Stop(reason) => {
                            self.stop_self(reason);
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("Tick loop for bot {} exited", self.bot_id);
    }

    /// Runs one tick under the tick gate and applies error handling.
    pub(crate) async fn tick(self: &Arc<Self>) -> TickOutcome {
        let _gate = self.tick_gate.lock().await;
        if self.status() != RuntimeStatus::Running {
            return TickOutcome::Continue;
        }

        if self.pending_fallback.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.reinitialize_strategy().await {
                return self.handle_tick_error(&e).await;
            }
        }

        match self.run_tick().await {
            Ok(()) => {
                self.after_success().await;
                TickOutcome::Continue
            }
            Err(e) => self.handle_tick_error(&e).await,
        }
    }

    async fn run_tick(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.performance.ticks += 1;
            state.last_tick_at = Some(Utc::now());
        }

        let timeout = self.services.trading.execution.exchange_timeout();
        let market = tokio::time::timeout(
            timeout,
            self.session.market_data.market_conditions(&self.symbol),
        )
        .await
        .map_err(|_| anyhow!("market data request for {} timed out", self.symbol))??;

        let context = self.strategy_context(Some(market.clone()));
        let decision = self
            .strategy
            .lock()
            .await
            .execute(&context)
            .await
            .context("strategy execution failed")?;

        if decision.action == TradeAction::Hold {
            tracing::trace!("Bot {} holding: {}", self.bot_id, decision.reason);
            return Ok(());
        }

        let signal = match self.signals.process(&decision, &market) {
            Ok(signal) => signal,
            Err(rejection) => {
                tracing::debug!("Bot {} signal rejected: {}", self.bot_id, rejection);
                self.services.events.publish(FleetEvent::SignalRejected {
                    bot_id: self.bot_id.clone(),
                    reason: rejection.to_string(),
                });
                return Ok(());
            }
        };
        self.state.lock().performance.signals += 1;
        self.services.events.publish(FleetEvent::SignalValidated {
            bot_id: self.bot_id.clone(),
            decision: decision.clone(),
        });

        let snapshot = self.status_view();
        let plan = match self.decisions.evaluate(&signal, &snapshot) {
            Ok(plan) => plan,
            Err(rejection) => {
                tracing::info!(
                    "Bot {} trade on {} rejected: {}",
                    self.bot_id,
                    signal.symbol,
                    rejection
                );
                self.services.events.publish(FleetEvent::DecisionRejected {
                    bot_id: self.bot_id.clone(),
                    symbol: signal.symbol.clone(),
                    reason: rejection.reason().to_string(),
                });
                return Ok(());
            }
        };
        self.services.events.publish(FleetEvent::DecisionApproved {
            bot_id: self.bot_id.clone(),
            symbol: plan.symbol.clone(),
            side: plan.side,
            quantity: plan.quantity,
            estimated_cost: plan.estimated_cost,
        });

        let report = self.executor.execute(&plan, &self.state).await?;
        tracing::info!(
            "Bot {} {:?} {} {} ({:?})",
            self.bot_id,
            plan.side,
            plan.quantity,
            plan.symbol,
            report.order.status
        );

        let counters = self.state.lock().performance.clone();
        self.services.events.publish(FleetEvent::Performance {
            bot_id: self.bot_id.clone(),
            counters,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn after_success(&self) {
        {
            let mut state = self.state.lock();
            state.error_count = 0;
            state.last_error = None;
        }
        self.services.recovery.record_success(&self.bot_id);

        if !self.services.runtime.persist_every_tick {
            return;
        }
        let strategy_state = self.strategy.lock().await.get_state();
        let update = StateUpdate::from_tick(&self.status_view(), strategy_state);
        if let Err(e) = self.services.state.update_state(&self.bot_id, update).await {
            tracing::warn!("Incremental snapshot failed for bot {}: {}", self.bot_id, e);
            if let Err(e) = self.persist().await {
                tracing::error!("Full snapshot failed for bot {}: {}", self.bot_id, e);
            }
        }
    }

    async fn handle_tick_error(self: &Arc<Self>, error: &anyhow::Error) -> TickOutcome {
        let error_count = {
            let mut state = self.state.lock();
            state.error_count += 1;
            state.performance.errors += 1;
            state.last_error = Some(format!("{error:#}"));
            state.error_count
        };

        let context = ErrorContext::new(&self.bot_id, "tick").with_metadata(serde_json::json!({
            "symbol": self.symbol,
            "error_count": error_count,
        }));
        let outcome = self.services.recovery.handle_error(error, context);

        if outcome.recovered && outcome.record.classification.strategy == RecoveryStrategy::Fallback {
            self.pending_fallback.store(true, Ordering::SeqCst);
        }

        // The consecutive-error limit applies whatever the classification.
        let max_retries = self.services.runtime.max_retries;
        if error_count > max_retries {
            tracing::error!(
                "Bot {} stopping after {} consecutive errors: {}",
                self.bot_id,
                error_count,
                outcome.record.message
            );
            return TickOutcome::Stop(format!(
                "error limit reached after {error_count} consecutive errors"
            ));
        }

        if outcome.restart_requested {
            self.notify_exit(outcome.record.message.clone(), ExitKind::RestartRequested);
        }

        let backoff = self.services.runtime.error_delay(error_count);
        TickOutcome::Wait(outcome.retry_after.map_or(backoff, |d| d.max(backoff)))
    }

    /// Cleans up and re-initializes the current strategy, keeping its state.
    async fn reinitialize_strategy(&self) -> Result<()> {
        tracing::info!("Re-initializing strategy for bot {}", self.bot_id);
        let context = self.strategy_context(None);
        let mut strategy = self.strategy.lock().await;
        let saved = strategy.get_state();
        if let Err(e) = strategy.cleanup(&context).await {
            tracing::warn!("Strategy cleanup failed for bot {}: {:#}", self.bot_id, e);
        }
        strategy
            .initialize(&context)
            .await
            .context("strategy re-initialization failed")?;
        if let Err(e) = strategy.set_state(saved) {
            tracing::warn!("Strategy state not restored for bot {}: {:#}", self.bot_id, e);
        }
        Ok(())
    }
}
