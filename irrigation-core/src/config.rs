use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use crate::provider::ProviderId;

/// Configuration for a single provider (e.g., API key).
///
/// Keyless providers are enabled by an entry with an empty key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
}

/// Weather aggregation: sampling, fan-out and caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Provider calls in flight at once.
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
    /// Lattice spacing in degrees.
    pub grid_resolution: f64,
    /// Upper bound on sample points per polygon.
    pub max_sample_points: usize,
    pub forecast_days: u32,
    pub cache_ttl_secs: u64,
    /// Decimal places kept when keying the cache by polygon.
    pub key_precision: u32,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            request_timeout_secs: 10,
            grid_resolution: 0.01,
            max_sample_points: 25,
            forecast_days: 7,
            cache_ttl_secs: 30 * 60,
            key_precision: 4,
        }
    }
}

impl AggregatorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VegetationSettings {
    /// Scene service queried for live remote-sensing data. `None` disables
    /// the live tier.
    pub scene_endpoint: Option<String>,
    pub request_timeout_secs: u64,
    /// Oldest live snapshot still served after a failure.
    pub cache_max_age_secs: u64,
    /// At most one synthetic snapshot per zone per window.
    pub synthetic_window_secs: u64,
}

impl Default for VegetationSettings {
    fn default() -> Self {
        Self {
            scene_endpoint: None,
            request_timeout_secs: 30,
            cache_max_age_secs: 24 * 60 * 60,
            synthetic_window_secs: 6 * 60 * 60,
        }
    }
}

impl VegetationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn synthetic_window(&self) -> Duration {
        Duration::from_secs(self.synthetic_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub offline_after_secs: u64,
    /// Stale sweeps before alerts escalate to high severity.
    pub retry_limit: u32,
    pub weak_signal_dbm: i32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self { offline_after_secs: 15 * 60, retry_limit: 3, weak_signal_dbm: -80 }
    }
}

impl DeviceSettings {
    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgronomySettings {
    /// Crop base temperature for growing degree days, °C.
    pub base_temperature: f64,
}

impl Default for AgronomySettings {
    fn default() -> Self {
        Self { base_temperature: crate::agronomy::DEFAULT_BASE_TEMPERATURE }
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Optional default provider id, e.g. "openweather" or "openmeteo".
    #[serde(default)]
    pub default_provider: Option<String>,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub aggregator: AggregatorSettings,

    #[serde(default)]
    pub vegetation: VegetationSettings,

    #[serde(default)]
    pub devices: DeviceSettings,

    #[serde(default)]
    pub agronomy: AgronomySettings,
}

impl Config {
    /// Return the default provider as a strongly-typed ProviderId.
    pub fn default_provider_id(&self) -> Result<ProviderId> {
        let s = self.default_provider.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "No default provider configured.\n\
                 Hint: run `irrigate configure <provider>` (e.g. `irrigate configure openweather`) first."
            )
        })?;

        ProviderId::try_from(s.as_str())
    }

    /// Store default provider as string.
    pub fn set_default_provider(&mut self, id: ProviderId) {
        self.default_provider = Some(id.as_str().to_string());
    }

    /// Parse a config document. Every section is optional.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse configuration TOML")
    }

    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, return empty.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "irrigation", "irrigation-cli")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Convenience helper: set/replace a provider API key and optionally set default provider.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers.insert(provider_id.as_str().to_string(), ProviderConfig { api_key });

        if self.default_provider.is_none() {
            self.default_provider = Some(provider_id.to_string());
        }
    }

    /// Returns API key for a provider, if present.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers.get(provider_id.as_str()).map(|cfg| cfg.api_key.as_str())
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        match self.provider_api_key(provider_id) {
            Some(key) => !key.is_empty() || !provider_id.requires_api_key(),
            None => false,
        }
    }
}
