use crate::config::FleetConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::Path;

/// Environment prefix for overrides, e.g. `FLEET_MANAGER__MAX_CONCURRENT_BOTS=4`.
pub const ENV_PREFIX: &str = "FLEET_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Builds the provider chain: TOML file, then `FLEET_` environment
    /// variables (sections split on `__`), then an optional JSON override file.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Self::layered(path, None)
    }

    /// File, optional profile file, environment, then the JSON override.
    fn layered(path: &Path, profile: Option<&Path>) -> Figment {
        let json_override = path.with_extension("json");
        let mut figment = Figment::new().merge(Toml::file(path));
        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(profile));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Json::file(json_override))
    }

    /// Loads fleet configuration from `path` and its overrides.
    ///
    /// Missing files are skipped, so defaults apply when nothing is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file or variable cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<FleetConfig> {
        let path = path.as_ref();
        let config: FleetConfig = Self::figment(path)
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;

        tracing::debug!("Loaded fleet configuration from {}", path.display());
        Ok(config)
    }

    /// Loads configuration with a profile overlay (`Config.<profile>.toml`).
    ///
    /// The profile overrides the base file; environment variables still
    /// override both.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file or variable cannot be parsed.
    pub fn load_with_profile(path: impl AsRef<Path>, profile: &str) -> Result<FleetConfig> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Config");
        let profile_path = path.with_file_name(format!("{stem}.{profile}.toml"));

        let config: FleetConfig = Self::layered(path, Some(profile_path.as_path()))
            .extract()
            .with_context(|| {
                format!(
                    "failed to load configuration from {} with profile {profile}",
                    path.display()
                )
            })?;

        Ok(config)
    }
}
