//! Ordered, timed shutdown of a bot.
//!
//! Steps run in priority order under one grace-period deadline. Each step has
//! its own timeout and retries with exponential backoff unless marked
//! non-retryable. Backup and state persistence failures are tolerated; any
//! other terminal failure aborts the remaining critical steps (backup and
//! state steps still run) and schedules a forced termination.

use crate::state::StateManager;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bot_fleet_core::{BotState, EventBus, FleetError, FleetEvent, FleetResult, ShutdownConfig};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Steps
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStepKind {
    CancelOrders,
    ClosePositions,
    EmergencyBackup,
    PersistState,
    CleanupResources,
    StopServices,
}

impl ShutdownStepKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CancelOrders => "cancel_orders",
            Self::ClosePositions => "close_positions",
            Self::EmergencyBackup => "emergency_backup",
            Self::PersistState => "persist_state",
            Self::CleanupResources => "cleanup_resources",
            Self::StopServices => "stop_services",
        }
    }

    #[must_use]
    pub const fn default_priority(self) -> u8 {
        match self {
            Self::CancelOrders => 1,
            Self::ClosePositions => 2,
            Self::EmergencyBackup => 3,
            Self::PersistState => 4,
            Self::CleanupResources => 5,
            Self::StopServices => 6,
        }
    }

    /// Failure of a critical step aborts the remaining critical steps.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        !matches!(self, Self::EmergencyBackup | Self::PersistState)
    }
}

impl fmt::Display for ShutdownStepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownStep {
    pub kind: ShutdownStepKind,
    pub priority: u8,
    pub timeout: Duration,
    pub retryable: bool,
}

impl ShutdownStep {
    #[must_use]
    pub const fn new(kind: ShutdownStepKind, priority: u8, timeout: Duration) -> Self {
        Self {
            kind,
            priority,
            timeout,
            retryable: true,
        }
    }

    #[must_use]
    pub const fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// The standard six-step sequence.
    #[must_use]
    pub fn standard(config: &ShutdownConfig) -> Vec<Self> {
        [
            ShutdownStepKind::CancelOrders,
            ShutdownStepKind::ClosePositions,
            ShutdownStepKind::EmergencyBackup,
            ShutdownStepKind::PersistState,
            ShutdownStepKind::CleanupResources,
            ShutdownStepKind::StopServices,
        ]
        .into_iter()
        .map(|kind| Self::new(kind, kind.default_priority(), config.step_timeout()))
        .collect()
    }
}

// =============================================================================
// Target
// =============================================================================

/// State captured for backup and final persistence.
#[derive(Debug, Clone)]
pub struct CapturedState {
    pub state: BotState,
    pub configuration: serde_json::Value,
    pub strategy_state: Option<serde_json::Value>,
}

/// Bot-side actions the shutdown sequence drives.
#[async_trait]
pub trait ShutdownTarget: Send + Sync {
    fn bot_id(&self) -> &str;

    /// Returns the number of orders cancelled.
    async fn cancel_pending_orders(&self) -> Result<usize>;

    /// Returns the number of positions closed.
    async fn close_open_positions(&self) -> Result<usize>;

    async fn cleanup_resources(&self) -> Result<()>;

    async fn stop_services(&self) -> Result<()>;

    async fn capture_state(&self) -> CapturedState;

    /// Last resort after an aborted sequence.
    async fn force_terminate(&self);

    /// Called before the sequence. Returning `false` means the target is
    /// already stopping and nothing runs.
    fn begin_shutdown(&self, _reason: &str) -> bool {
        true
    }

    /// Called after the sequence, including any emergency fallback.
    async fn finish_shutdown(&self) {}
}

// =============================================================================
// Context and report
// =============================================================================

/// Transient record of one shutdown invocation.
struct ShutdownContext {
    bot_id: String,
    reason: String,
    signal: Option<String>,
    started_at: Instant,
    steps: Vec<ShutdownStep>,
    executed: Vec<ShutdownStepKind>,
    completed: Vec<ShutdownStepKind>,
    failed: Vec<ShutdownStepKind>,
    skipped: Vec<ShutdownStepKind>,
    captured: Option<CapturedState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub bot_id: String,
    pub reason: String,
    pub signal: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Steps attempted, in execution order.
    pub executed: Vec<ShutdownStepKind>,
    pub completed: Vec<ShutdownStepKind>,
    pub failed: Vec<ShutdownStepKind>,
    pub skipped: Vec<ShutdownStepKind>,
    /// A critical step failed terminally.
    pub aborted: bool,
    /// The grace period ran out.
    pub timed_out: bool,
    pub forced_termination_scheduled: bool,
    /// The emergency sequence ran after this one left state unsaved.
    pub emergency_fallback: bool,
    pub duration: Duration,
}

impl ShutdownReport {
    /// Converts an aborted or timed-out report into an error.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::ShutdownFailed`] naming the failed steps.
    pub fn into_result(self) -> FleetResult<Self> {
        if self.aborted || self.timed_out {
            let failed: Vec<_> = self.failed.iter().map(|k| k.name()).collect();
            return Err(FleetError::ShutdownFailed {
                bot_id: self.bot_id,
                detail: format!(
                    "failed steps [{}]{}",
                    failed.join(", "),
                    if self.timed_out { ", grace period exceeded" } else { "" }
                ),
            });
        }
        Ok(self)
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.aborted && !self.timed_out
    }

    /// True when the grace period ran out or the backup or final-state step
    /// did not complete.
    #[must_use]
    pub fn state_at_risk(&self) -> bool {
        self.timed_out
            || [ShutdownStepKind::EmergencyBackup, ShutdownStepKind::PersistState]
                .iter()
                .any(|kind| self.failed.contains(kind) || self.skipped.contains(kind))
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct GracefulShutdownManager {
    config: ShutdownConfig,
    state: Arc<StateManager>,
    events: EventBus,
    tracked: Mutex<HashMap<String, Arc<dyn ShutdownTarget>>>,
}

impl GracefulShutdownManager {
    #[must_use]
    pub fn new(config: ShutdownConfig, state: Arc<StateManager>, events: EventBus) -> Self {
        Self {
            config,
            state,
            events,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    pub fn track(&self, target: Arc<dyn ShutdownTarget>) {
        self.tracked
            .lock()
            .insert(target.bot_id().to_string(), target);
    }

    pub fn untrack(&self, bot_id: &str) {
        self.tracked.lock().remove(bot_id);
    }

    #[must_use]
    pub fn tracked_bots(&self) -> Vec<String> {
        let mut bots: Vec<_> = self.tracked.lock().keys().cloned().collect();
        bots.sort();
        bots
    }

    /// Runs the standard step sequence for one bot.
    pub async fn initiate_shutdown(
        &self,
        target: Arc<dyn ShutdownTarget>,
        reason: &str,
        signal: Option<&str>,
        current_state: Option<CapturedState>,
    ) -> ShutdownReport {
        let steps = ShutdownStep::standard(&self.config);
        self.initiate_shutdown_with_steps(target, reason, signal, current_state, steps)
            .await
    }

    /// Runs a custom step sequence. Steps are executed by ascending priority
    /// regardless of input order.
    pub async fn initiate_shutdown_with_steps(
        &self,
        target: Arc<dyn ShutdownTarget>,
        reason: &str,
        signal: Option<&str>,
        current_state: Option<CapturedState>,
        steps: Vec<ShutdownStep>,
    ) -> ShutdownReport {
        self.run_sequence(
            target,
            reason,
            signal,
            current_state,
            steps,
            self.config.grace_period(),
        )
        .await
    }

    async fn run_sequence(
        &self,
        target: Arc<dyn ShutdownTarget>,
        reason: &str,
        signal: Option<&str>,
        current_state: Option<CapturedState>,
        mut steps: Vec<ShutdownStep>,
        grace_period: Duration,
    ) -> ShutdownReport {
        steps.sort_by_key(|s| s.priority);

        let captured = match current_state {
            Some(state) => state,
            None => target.capture_state().await,
        };
        let mut ctx = ShutdownContext {
            bot_id: target.bot_id().to_string(),
            reason: reason.to_string(),
            signal: signal.map(str::to_string),
            started_at: Instant::now(),
            steps,
            executed: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            captured: Some(captured),
        };

        tracing::info!(
            "Initiating shutdown for bot {} (reason: {}, signal: {:?})",
            ctx.bot_id,
            ctx.reason,
            ctx.signal
        );

        let deadline = ctx.started_at + grace_period;
        let started_at = Utc::now();
        let mut aborted = false;
        let mut timed_out = false;

        let steps = std::mem::take(&mut ctx.steps);
        for step in &steps {
            if aborted && step.kind.is_critical() {
                tracing::warn!(
                    "Skipping {} for bot {} after aborted shutdown",
                    step.kind,
                    ctx.bot_id
                );
                ctx.skipped.push(step.kind);
                continue;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                ctx.skipped.push(step.kind);
                continue;
            }

            ctx.executed.push(step.kind);
            match self.run_with_retries(step, &*target, &ctx, deadline).await {
                Ok(()) => ctx.completed.push(step.kind),
                Err(e) => {
                    ctx.failed.push(step.kind);
                    if step.kind.is_critical() {
                        tracing::error!(
                            "Critical shutdown step {} failed for bot {}: {:#}",
                            step.kind,
                            ctx.bot_id,
                            e
                        );
                        aborted = true;
                    } else {
                        tracing::warn!(
                            "Shutdown step {} failed for bot {} (continuing): {:#}",
                            step.kind,
                            ctx.bot_id,
                            e
                        );
                    }
                    if Instant::now() >= deadline {
                        timed_out = true;
                    }
                }
            }
        }

        let forced = aborted || timed_out;
        if forced {
            self.schedule_forced_termination(Arc::clone(&target));
        }

        let report = ShutdownReport {
            bot_id: ctx.bot_id.clone(),
            reason: ctx.reason.clone(),
            signal: ctx.signal.clone(),
            started_at,
            executed: ctx.executed,
            completed: ctx.completed,
            failed: ctx.failed,
            skipped: ctx.skipped,
            aborted,
            timed_out,
            forced_termination_scheduled: forced,
            emergency_fallback: false,
            duration: ctx.started_at.elapsed(),
        };

        tracing::info!(
            "Shutdown for bot {} finished in {:?}: {} completed, {} failed",
            report.bot_id,
            report.duration,
            report.completed.len(),
            report.failed.len()
        );
        self.events.publish(FleetEvent::ShutdownCompleted {
            bot_id: report.bot_id.clone(),
            completed: report.completed.iter().map(|k| k.name().to_string()).collect(),
            failed: report.failed.iter().map(|k| k.name().to_string()).collect(),
        });
        report
    }

    async fn run_with_retries(
        &self,
        step: &ShutdownStep,
        target: &dyn ShutdownTarget,
        ctx: &ShutdownContext,
        deadline: Instant,
    ) -> Result<()> {
        let max_attempts = if step.retryable {
            self.config.max_step_retries + 1
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = step.timeout.min(remaining);
            let result = match tokio::time::timeout(budget, self.run_step(step.kind, target, ctx)).await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!("step {} timed out after {:?}", step.kind, budget)),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.config.retry_delay(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(e.context("grace period exhausted before retry"));
                    }
                    tracing::debug!(
                        "Retrying {} for bot {} in {:?} (attempt {}): {:#}",
                        step.kind,
                        ctx.bot_id,
                        delay,
                        attempt,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_step(
        &self,
        kind: ShutdownStepKind,
        target: &dyn ShutdownTarget,
        ctx: &ShutdownContext,
    ) -> Result<()> {
        match kind {
            ShutdownStepKind::CancelOrders => {
                if self.config.cancel_orders_on_stop {
                    let cancelled = target.cancel_pending_orders().await?;
                    tracing::info!("Cancelled {} orders for bot {}", cancelled, ctx.bot_id);
                }
            }
            ShutdownStepKind::ClosePositions => {
                if self.config.close_positions_on_stop {
                    let closed = target.close_open_positions().await?;
                    tracing::info!("Closed {} positions for bot {}", closed, ctx.bot_id);
                }
            }
            ShutdownStepKind::EmergencyBackup => {
                // The backup keeps the state as it was when shutdown began.
                let captured = match &ctx.captured {
                    Some(captured) => captured.clone(),
                    None => target.capture_state().await,
                };
                self.state
                    .emergency_backup(
                        &captured.state,
                        &captured.configuration,
                        captured.strategy_state,
                        &format!("shutdown: {}", ctx.reason),
                    )
                    .await?;
            }
            ShutdownStepKind::PersistState => {
                let captured = target.capture_state().await;
                self.state
                    .persist(
                        &captured.state,
                        &captured.configuration,
                        captured.strategy_state,
                    )
                    .await?;
            }
            ShutdownStepKind::CleanupResources => target.cleanup_resources().await?,
            ShutdownStepKind::StopServices => target.stop_services().await?,
        }
        Ok(())
    }

    fn schedule_forced_termination(&self, target: Arc<dyn ShutdownTarget>) {
        let delay = self.config.force_terminate_delay();
        tracing::warn!(
            "Scheduling forced termination of bot {} in {:?}",
            target.bot_id(),
            delay
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::warn!("Forcing termination of bot {}", target.bot_id());
            target.force_terminate().await;
        });
    }

    /// Skips the step pipeline: emergency backup and final state only.
    ///
    /// Used when graceful shutdown itself has failed. The sequence gets a
    /// fresh deadline of at least one step timeout per step, even when the
    /// grace period is shorter.
    pub async fn emergency_shutdown(
        &self,
        target: Arc<dyn ShutdownTarget>,
        reason: &str,
    ) -> ShutdownReport {
        tracing::error!("Emergency shutdown for bot {}: {}", target.bot_id(), reason);
        let steps = vec![
            ShutdownStep::new(
                ShutdownStepKind::EmergencyBackup,
                ShutdownStepKind::EmergencyBackup.default_priority(),
                self.config.step_timeout(),
            ),
            ShutdownStep::new(
                ShutdownStepKind::PersistState,
                ShutdownStepKind::PersistState.default_priority(),
                self.config.step_timeout(),
            ),
        ];
        let grace_period = self
            .config
            .grace_period()
            .max(self.config.step_timeout() * 2);
        self.run_sequence(target, reason, None, None, steps, grace_period)
            .await
    }

    /// Full stop of one target: the standard sequence between the target's
    /// begin and finish hooks, falling back to [`Self::emergency_shutdown`]
    /// when the sequence left state unsaved.
    ///
    /// Returns `None` when the target declined to begin.
    pub async fn stop_target(
        &self,
        target: Arc<dyn ShutdownTarget>,
        reason: &str,
        signal: Option<&str>,
    ) -> Option<ShutdownReport> {
        if !target.begin_shutdown(reason) {
            return None;
        }

        let mut report = self
            .initiate_shutdown(Arc::clone(&target), reason, signal, None)
            .await;
        if report.state_at_risk() {
            tracing::error!(
                "Graceful shutdown of bot {} left state unsaved, running emergency shutdown",
                report.bot_id
            );
            let emergency = self
                .emergency_shutdown(
                    Arc::clone(&target),
                    &format!("graceful shutdown failed: {reason}"),
                )
                .await;
            if !emergency.is_clean() {
                tracing::error!(
                    "Emergency shutdown of bot {} failed steps {:?}",
                    emergency.bot_id,
                    emergency.failed
                );
            }
            report.emergency_fallback = true;
        }

        target.finish_shutdown().await;
        Some(report)
    }

    /// Stops every tracked bot concurrently and waits for all of them.
    pub async fn shutdown_all(&self, reason: &str, signal: Option<&str>) -> Vec<ShutdownReport> {
        let targets: Vec<_> = self.tracked.lock().values().cloned().collect();
        tracing::info!("Shutting down {} tracked bots ({})", targets.len(), reason);

        join_all(
            targets
                .into_iter()
                .map(|target| self.stop_target(target, reason, signal)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Waits for SIGTERM or SIGINT and returns the signal name.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!("Received {}, initiating graceful shutdown", name);
    Ok(name)
}

/// Waits for Ctrl+C and returns the signal name.
///
/// # Errors
///
/// Returns an error if the handler cannot be installed.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    Ok("SIGINT")
}
