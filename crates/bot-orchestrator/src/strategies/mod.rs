//! Compiled-in strategies and the versioned registry bots load them from.

mod hold;
mod momentum;

pub use hold::HoldStrategy;
pub use momentum::{MomentumParams, MomentumStrategy};

use bot_fleet_core::{FleetError, FleetResult, Strategy, StrategyDescriptor, StrategyKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// Builds a strategy from a bot configuration, rejecting invalid ones.
pub type StrategyFactory = fn(&serde_json::Value) -> anyhow::Result<Box<dyn Strategy>>;

struct Registration {
    version: &'static str,
    kind: StrategyKind,
    factory: StrategyFactory,
}

/// One strategy a bot has run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyVersion {
    pub name: String,
    pub version: String,
    pub configuration: serde_json::Value,
    pub loaded_at: DateTime<Utc>,
}

/// Maps strategy names to factories and keeps a per-bot load history used
/// for rollback.
pub struct StrategyRegistry {
    factories: HashMap<String, Registration>,
    history: Mutex<HashMap<String, Vec<StrategyVersion>>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Registry preloaded with `hold` and `momentum`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("hold", "1.0.0", StrategyKind::BuiltIn, |_| {
            Ok(Box::new(HoldStrategy::new()) as Box<dyn Strategy>)
        });
        registry.register("momentum", "1.0.0", StrategyKind::BuiltIn, |configuration| {
            let params = MomentumParams::from_configuration(configuration)?;
            Ok(Box::new(MomentumStrategy::new(params)) as Box<dyn Strategy>)
        });
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        version: &'static str,
        kind: StrategyKind,
        factory: StrategyFactory,
    ) {
        self.factories.insert(
            name.to_string(),
            Registration {
                version,
                kind,
                factory,
            },
        );
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptor a freshly loaded instance of `name` would report.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<StrategyDescriptor> {
        self.factories
            .get(name)
            .map(|r| StrategyDescriptor::new(name, r.version, r.kind))
    }

    fn build(
        &self,
        name: &str,
        configuration: &serde_json::Value,
    ) -> FleetResult<(Box<dyn Strategy>, &'static str)> {
        let registration = self
            .factories
            .get(name)
            .ok_or_else(|| FleetError::UnknownStrategy(name.to_string()))?;
        let strategy = (registration.factory)(configuration)
            .map_err(|e| FleetError::Configuration(format!("{e:#}")))?;
        Ok((strategy, registration.version))
    }

    /// Checks that `configuration` is acceptable to the named strategy.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownStrategy`] or [`FleetError::Configuration`].
    pub fn validate(&self, name: &str, configuration: &serde_json::Value) -> FleetResult<()> {
        self.build(name, configuration).map(|_| ())
    }

    /// Builds a strategy for `bot_id` and records it as the bot's current version.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownStrategy`] or [`FleetError::Configuration`].
    pub fn load(
        &self,
        bot_id: &str,
        name: &str,
        configuration: &serde_json::Value,
    ) -> FleetResult<Box<dyn Strategy>> {
        let (strategy, version) = self.build(name, configuration)?;
        let entry = StrategyVersion {
            name: name.to_string(),
            version: version.to_string(),
            configuration: configuration.clone(),
            loaded_at: Utc::now(),
        };

        let mut history = self.history.lock();
        let versions = history.entry(bot_id.to_string()).or_default();
        // Reloading the same strategy (restart) does not create a rollback point.
        let same_as_current = versions
            .last()
            .is_some_and(|v| v.name == entry.name && v.configuration == entry.configuration);
        if same_as_current {
            if let Some(last) = versions.last_mut() {
                last.loaded_at = entry.loaded_at;
            }
        } else {
            versions.push(entry);
        }
        tracing::info!("Loaded strategy {} v{} for bot {}", name, version, bot_id);
        Ok(strategy)
    }

    /// Version the bot would return to on rollback.
    #[must_use]
    pub fn previous(&self, bot_id: &str) -> Option<StrategyVersion> {
        let history = self.history.lock();
        let versions = history.get(bot_id)?;
        versions.len().checked_sub(2).map(|i| versions[i].clone())
    }

    #[must_use]
    pub fn current(&self, bot_id: &str) -> Option<StrategyVersion> {
        self.history.lock().get(bot_id).and_then(|v| v.last().cloned())
    }

    /// Builds the previous version and makes it current.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::NoRollbackTarget`] when the bot has no earlier
    /// version, or the build error of that version.
    pub fn rollback(&self, bot_id: &str) -> FleetResult<(Box<dyn Strategy>, StrategyVersion)> {
        let target = self
            .previous(bot_id)
            .ok_or_else(|| FleetError::NoRollbackTarget(bot_id.to_string()))?;
        let (strategy, _) = self.build(&target.name, &target.configuration)?;
        self.discard_current(bot_id);
        tracing::info!(
            "Rolled back bot {} to strategy {} v{}",
            bot_id,
            target.name,
            target.version
        );
        Ok((strategy, target))
    }

    /// Drops the current version, e.g. after a swap that failed to initialize.
    pub fn discard_current(&self, bot_id: &str) {
        if let Some(versions) = self.history.lock().get_mut(bot_id) {
            versions.pop();
        }
    }

    /// Re-appends a version popped by [`StrategyRegistry::rollback`] when the
    /// rolled-back strategy fails to start.
    pub fn restore_current(&self, bot_id: &str, version: StrategyVersion) {
        self.history
            .lock()
            .entry(bot_id.to_string())
            .or_default()
            .push(version);
    }

    #[must_use]
    pub fn history(&self, bot_id: &str) -> Vec<StrategyVersion> {
        self.history.lock().get(bot_id).cloned().unwrap_or_default()
    }
}
