use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::{Path, PathBuf}, time::Duration};

use crate::{
    model::{City, Coordinates, LocationTokens, ProviderKind},
    provider::Backend,
    rate_limit::RateQuota,
};

/// Overrides for a single provider kind. Anything left out uses the kind's default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// Backend name, e.g. "waqi" or "openweather-air".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub max_calls: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Upper bound on upstream requests in flight across all cities.
    pub max_concurrent_fetches: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// 0 means a throttled provider falls back to the cache immediately.
    pub rate_limit_wait_ms: u64,
    pub refresh_interval_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            max_retries: 1,
            retry_backoff_ms: 250,
            rate_limit_wait_ms: 0,
            refresh_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodingConfig {
    /// Fall back to the OpenWeather geocoding API for names missing from the catalogue.
    pub remote_lookup: bool,
    /// Defaults to the OpenWeather weather key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self { remote_lookup: true, api_key: None, base_url: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbePoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A monitored city as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityConfig {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// WAQI feed token; defaults to `geo:<lat>;<lon>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waqi_station: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_probe: Option<ProbePoint>,
}

impl CityConfig {
    pub fn to_city(&self) -> Result<City> {
        let coordinates = Coordinates::new(self.latitude, self.longitude)
            .with_context(|| format!("Invalid coordinates for city '{}'", self.id))?;

        let mut tokens = LocationTokens::from_coordinates(coordinates);
        if let Some(station) = &self.waqi_station {
            tokens.waqi_station = station.clone();
        }
        if let Some(probe) = &self.traffic_probe {
            let probe = Coordinates::new(probe.latitude, probe.longitude)
                .with_context(|| format!("Invalid traffic probe for city '{}'", self.id))?;
            tokens.traffic_probe = Some(probe);
        }

        Ok(City {
            id: self.id.clone(),
            display_name: self.name.clone(),
            coordinates,
            aliases: self.aliases.clone(),
            tokens,
        })
    }
}

/// Everything a provider adapter and its cache/limiter policy need.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub backend: Backend,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub ttl: Duration,
    pub timeout: Duration,
    pub quota: RateQuota,
    /// OpenWeather key the WAQI backend uses to add pollutant concentrations.
    pub concentrations_key: Option<String>,
}

const DEFAULT_TIMEOUT_MS: u64 = 5_000;

fn default_ttl_secs(kind: ProviderKind) -> u64 {
    match kind {
        ProviderKind::Traffic => 120,
        ProviderKind::AirQuality => 300,
        ProviderKind::Weather => 600,
    }
}

fn default_quota(kind: ProviderKind) -> QuotaConfig {
    match kind {
        ProviderKind::Traffic => QuotaConfig { max_calls: 40, window_secs: 60 },
        ProviderKind::AirQuality | ProviderKind::Weather => {
            QuotaConfig { max_calls: 60, window_secs: 60 }
        }
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,

    /// Example TOML:
    /// [providers.air_quality]
    /// backend = "waqi"
    /// api_key = "..."
    /// ttl_secs = 300
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Falls back to the built-in catalogue when empty.
    #[serde(default)]
    pub cities: Vec<CityConfig>,
}

impl Config {
    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, return empty.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        cfg.validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "cityscope", "cityscope")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<()> {
        let mut issues: Vec<String> = Vec::new();

        if self.aggregator.max_concurrent_fetches == 0 {
            issues.push("aggregator.max_concurrent_fetches must be > 0".into());
        }
        if self.aggregator.refresh_interval_secs == 0 {
            issues.push("aggregator.refresh_interval_secs must be > 0".into());
        }

        let mut sections: HashMap<ProviderKind, Vec<&str>> = HashMap::new();
        for (key, provider) in &self.providers {
            let kind = match ProviderKind::try_from(key.as_str()) {
                Ok(kind) => kind,
                Err(e) => {
                    issues.push(format!("providers.{key}: {e}"));
                    continue;
                }
            };
            sections.entry(kind).or_default().push(key);
            if let Some(name) = &provider.backend {
                match Backend::try_from(name.as_str()) {
                    Ok(backend) if backend.kind() != kind => issues.push(format!(
                        "providers.{key}.backend: '{backend}' serves {}, not {kind}",
                        backend.kind()
                    )),
                    Ok(_) => {}
                    Err(e) => issues.push(format!("providers.{key}.backend: {e}")),
                }
            }
            if provider.ttl_secs == Some(0) {
                issues.push(format!("providers.{key}.ttl_secs must be > 0"));
            }
            if provider.timeout_ms == Some(0) {
                issues.push(format!("providers.{key}.timeout_ms must be > 0"));
            }
            if let Some(quota) = provider.quota
                && let Err(e) = RateQuota::new(quota.max_calls, Duration::from_secs(quota.window_secs))
            {
                issues.push(format!("providers.{key}.quota: {e}"));
            }
        }
        for (kind, mut keys) in sections {
            if keys.len() > 1 {
                keys.sort_unstable();
                issues.push(format!(
                    "{kind} is configured more than once: providers.{}",
                    keys.join(", providers.")
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for city in &self.cities {
            if city.id.trim().is_empty() {
                issues.push(format!("city '{}' has an empty id", city.name));
            }
            if !seen.insert(city.id.to_lowercase()) {
                issues.push(format!("city id '{}' is defined more than once", city.id));
            }
            if let Err(e) = city.to_city() {
                issues.push(format!("{e:#}"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{}", issues.join("\n")))
        }
    }

    /// Accepts any spelling of the kind as a section name, e.g. `[providers.aqi]`.
    pub fn provider_config(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.provider_key(kind).and_then(|key| self.providers.get(key))
    }

    fn provider_key(&self, kind: ProviderKind) -> Option<&String> {
        self.providers
            .get_key_value(kind.as_str())
            .map(|(key, _)| key)
            .or_else(|| {
                self.providers
                    .keys()
                    .find(|key| ProviderKind::try_from(key.as_str()).is_ok_and(|k| k == kind))
            })
    }

    pub fn backend(&self, kind: ProviderKind) -> Result<Backend> {
        match self.provider_config(kind).and_then(|p| p.backend.as_deref()) {
            Some(name) => Backend::try_from(name),
            None => Ok(Backend::default_for(kind)),
        }
    }

    /// Convenience helper: set/replace a provider API key, switching backend if given.
    pub fn upsert_provider_api_key(
        &mut self,
        kind: ProviderKind,
        backend: Option<Backend>,
        api_key: String,
    ) {
        let key = self.provider_key(kind).cloned().unwrap_or_else(|| kind.as_str().to_string());
        let entry = self.providers.entry(key).or_default();
        entry.api_key = Some(api_key);
        if let Some(backend) = backend {
            entry.backend = Some(backend.as_str().to_string());
        }
    }

    /// Returns the API key stored in the config file for a provider, if present.
    pub fn provider_api_key(&self, kind: ProviderKind) -> Option<&str> {
        self.provider_config(kind).and_then(|cfg| cfg.api_key.as_deref())
    }

    pub fn is_provider_configured(&self, kind: ProviderKind) -> bool {
        self.provider_api_key(kind).is_some()
    }

    /// Settings for a provider kind, with keys falling back to the environment.
    pub fn provider_settings(&self, kind: ProviderKind) -> Result<ProviderSettings> {
        self.resolve_provider_settings(kind, |name| std::env::var(name).ok())
    }

    pub fn resolve_provider_settings(
        &self,
        kind: ProviderKind,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ProviderSettings> {
        let backend = self.backend(kind)?;
        if backend.kind() != kind {
            return Err(anyhow!("Backend '{backend}' cannot serve {kind} data"));
        }

        let overrides = self.provider_config(kind).cloned().unwrap_or_default();
        let quota = overrides.quota.unwrap_or_else(|| default_quota(kind));

        Ok(ProviderSettings {
            backend,
            api_key: overrides.api_key.or_else(|| env(backend.api_key_env())),
            concentrations_key: match backend {
                Backend::Waqi => self.openweather_api_key(&env),
                _ => None,
            },
            base_url: overrides.base_url,
            ttl: Duration::from_secs(overrides.ttl_secs.unwrap_or_else(|| default_ttl_secs(kind))),
            timeout: Duration::from_millis(overrides.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            quota: RateQuota::new(quota.max_calls, Duration::from_secs(quota.window_secs))
                .with_context(|| format!("Invalid quota for provider '{kind}'"))?,
        })
    }

    /// Key for the remote geocoder, if remote lookup is enabled and a key can be found.
    pub fn geocoding_api_key(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        if !self.geocoding.remote_lookup {
            return None;
        }
        self.geocoding.api_key.clone().or_else(|| self.openweather_api_key(env))
    }

    /// The OpenWeather key from the weather section, else the environment.
    pub fn openweather_api_key(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.provider_config(ProviderKind::Weather)
            .and_then(|weather| {
                let is_openweather = weather.backend.as_deref().is_none_or(|b| b == "openweather");
                is_openweather.then(|| weather.api_key.clone()).flatten()
            })
            .or_else(|| env(Backend::OpenWeather.api_key_env()))
    }

    pub fn monitored_cities(&self) -> Result<Vec<City>> {
        if self.cities.is_empty() {
            return default_city_configs().iter().map(CityConfig::to_city).collect();
        }
        self.cities.iter().map(CityConfig::to_city).collect()
    }
}

/// The ten cities the dashboard monitors out of the box.
pub fn default_city_configs() -> Vec<CityConfig> {
    let city = |id: &str, name: &str, latitude: f64, longitude: f64, aliases: &[&str]| CityConfig {
        id: id.to_string(),
        name: name.to_string(),
        latitude,
        longitude,
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        waqi_station: Some(id.to_string()),
        traffic_probe: None,
    };

    vec![
        city("delhi", "Delhi", 28.6139, 77.2090, &["New Delhi"]),
        city("mumbai", "Mumbai", 19.0760, 72.8777, &["Bombay"]),
        city("bangalore", "Bangalore", 12.9716, 77.5946, &["Bengaluru"]),
        city("kolkata", "Kolkata", 22.5726, 88.3639, &["Calcutta"]),
        city("chennai", "Chennai", 13.0827, 80.2707, &["Madras"]),
        city("hyderabad", "Hyderabad", 17.3850, 78.4867, &[]),
        city("ahmedabad", "Ahmedabad", 23.0225, 72.5714, &[]),
        city("pune", "Pune", 18.5204, 73.8567, &["Poona"]),
        city("jaipur", "Jaipur", 26.9124, 75.7873, &[]),
        city("lucknow", "Lucknow", 26.8467, 80.9462, &[]),
    ]
}
