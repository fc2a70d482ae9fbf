use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::{default_install_prefix, InstallLayout};
use crate::strategy::StrategyPreference;

pub const STRATEGY_ENV: &str = "MSIXCORE_STRATEGY";
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub prefix: Option<PathBuf>,
    pub strategy: StrategyPreference,
    pub download_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            strategy: StrategyPreference::Auto,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse manager config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)
                .with_context(|| format!("failed to load manager config: {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read manager config: {}", path.display())),
        }
    }

    /// Loads the config stored under the default prefix and applies
    /// environment overrides.
    pub fn load_default() -> Result<Self> {
        let prefix = default_install_prefix()?;
        let mut config = Self::load(&InstallLayout::new(&prefix).config_path())?;
        if config.prefix.is_none() {
            config.prefix = Some(prefix);
        }
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(prefix) =
            std::env::var_os(crate::layout::PREFIX_ENV).filter(|value| !value.is_empty())
        {
            self.prefix = Some(PathBuf::from(prefix));
        }
        if let Ok(value) = std::env::var(STRATEGY_ENV) {
            if !value.trim().is_empty() {
                self.strategy = StrategyPreference::parse(&value)
                    .with_context(|| format!("invalid {STRATEGY_ENV} value '{value}'"))?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_timeout_secs == 0 {
            return Err(anyhow!("download_timeout_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<InstallLayout> {
        let prefix = match &self.prefix {
            Some(prefix) => prefix.clone(),
            None => default_install_prefix()?,
        };
        Ok(InstallLayout::new(prefix))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
