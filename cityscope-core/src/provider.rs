use crate::{
    clock::SharedClock,
    config::ProviderSettings,
    error::ProviderError,
    model::{City, ProviderKind, ProviderRecord},
    provider::{
        openrouteservice::OpenRouteServiceProvider, openweather::OpenWeatherProvider,
        openweather_air::OpenWeatherAirProvider, waqi::WaqiProvider,
        weatherapi::WeatherApiProvider,
    },
};
use async_trait::async_trait;
use reqwest::Client;
use std::{convert::TryFrom, fmt::Debug, sync::Arc};

pub(crate) mod http;
pub mod openrouteservice;
pub mod openweather;
pub mod openweather_air;
pub mod waqi;
pub mod weatherapi;

/// Concrete upstream service behind a provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    OpenRouteService,
    Waqi,
    OpenWeatherAir,
    OpenWeather,
    WeatherApi,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::OpenRouteService => "openrouteservice",
            Backend::Waqi => "waqi",
            Backend::OpenWeatherAir => "openweather-air",
            Backend::OpenWeather => "openweather",
            Backend::WeatherApi => "weatherapi",
        }
    }

    pub const fn all() -> &'static [Backend] {
        &[
            Backend::OpenRouteService,
            Backend::Waqi,
            Backend::OpenWeatherAir,
            Backend::OpenWeather,
            Backend::WeatherApi,
        ]
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Backend::OpenRouteService => ProviderKind::Traffic,
            Backend::Waqi | Backend::OpenWeatherAir => ProviderKind::AirQuality,
            Backend::OpenWeather | Backend::WeatherApi => ProviderKind::Weather,
        }
    }

    pub fn default_for(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Traffic => Backend::OpenRouteService,
            ProviderKind::AirQuality => Backend::Waqi,
            ProviderKind::Weather => Backend::OpenWeather,
        }
    }

    pub fn for_kind(kind: ProviderKind) -> impl Iterator<Item = Backend> {
        Self::all().iter().copied().filter(move |b| b.kind() == kind)
    }

    /// Environment variable consulted when the config file holds no key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Backend::OpenRouteService => "OPENROUTESERVICE_API_KEY",
            Backend::Waqi => "WAQI_API_TOKEN",
            Backend::OpenWeatherAir | Backend::OpenWeather => "OPENWEATHERMAP_API_KEY",
            Backend::WeatherApi => "WEATHERAPI_KEY",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Backend::OpenRouteService => openrouteservice::DEFAULT_BASE_URL,
            Backend::Waqi => waqi::DEFAULT_BASE_URL,
            Backend::OpenWeatherAir | Backend::OpenWeather => openweather::DEFAULT_BASE_URL,
            Backend::WeatherApi => weatherapi::DEFAULT_BASE_URL,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Backend {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.trim().to_lowercase();

        Backend::all().iter().copied().find(|b| b.as_str() == lower).ok_or_else(|| {
            let supported: Vec<_> = Backend::all().iter().map(Backend::as_str).collect();
            anyhow::anyhow!(
                "Unknown provider backend '{value}'. Supported backends: {}.",
                supported.join(", ")
            )
        })
    }
}

/// One upstream provider, translating its payloads into [`ProviderRecord`]s.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + Debug {
    fn kind(&self) -> ProviderKind;

    /// Short backend name stamped on produced records.
    fn name(&self) -> &'static str;

    async fn fetch(&self, city: &City) -> Result<ProviderRecord, ProviderError>;
}

/// Construct an adapter from resolved provider settings.
pub fn adapter_from_settings(
    settings: &ProviderSettings,
    http: &Client,
    clock: SharedClock,
) -> anyhow::Result<Arc<dyn ProviderAdapter>> {
    let backend = settings.backend;
    let api_key = settings.api_key.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "No API key configured for provider '{backend}'.\n\
                 Hint: run `cityscope configure {}` or set {}.",
            backend.kind(),
            backend.api_key_env()
        )
    })?;
    let base_url = settings
        .base_url
        .clone()
        .unwrap_or_else(|| backend.default_base_url().to_string());
    let http = http.clone();

    let adapter: Arc<dyn ProviderAdapter> = match backend {
        Backend::OpenRouteService => {
            Arc::new(OpenRouteServiceProvider::new(api_key, base_url, http, clock))
        }
        Backend::Waqi => {
            let waqi = WaqiProvider::new(api_key, base_url, http.clone(), clock.clone());
            match &settings.concentrations_key {
                Some(key) => Arc::new(waqi.with_concentrations(OpenWeatherAirProvider::new(
                    key.clone(),
                    openweather::DEFAULT_BASE_URL.to_string(),
                    http,
                    clock,
                ))),
                None => Arc::new(waqi),
            }
        }
        Backend::OpenWeatherAir => {
            Arc::new(OpenWeatherAirProvider::new(api_key, base_url, http, clock))
        }
        Backend::OpenWeather => Arc::new(OpenWeatherProvider::new(api_key, base_url, http, clock)),
        Backend::WeatherApi => Arc::new(WeatherApiProvider::new(api_key, base_url, http, clock)),
    };

    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::time::Duration;

    fn settings(backend: Backend, api_key: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            backend,
            api_key: api_key.map(str::to_string),
            base_url: None,
            ttl: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            quota: crate::rate_limit::RateQuota::per_minute(60).unwrap(),
            concentrations_key: None,
        }
    }

    #[test]
    fn backend_as_str_roundtrip() {
        for backend in Backend::all() {
            let parsed = Backend::try_from(backend.as_str()).expect("roundtrip should succeed");
            assert_eq!(*backend, parsed);
        }
    }

    #[test]
    fn unknown_backend_error() {
        let err = Backend::try_from("doesnotexist").unwrap_err();
        assert!(err.to_string().contains("Unknown provider backend"));
    }

    #[test]
    fn every_kind_has_a_default_backend_of_that_kind() {
        for kind in ProviderKind::all() {
            assert_eq!(Backend::default_for(*kind).kind(), *kind);
            assert!(Backend::for_kind(*kind).count() >= 1);
        }
    }

    #[test]
    fn adapter_from_settings_errors_when_missing_api_key() {
        let err = adapter_from_settings(
            &settings(Backend::Waqi, None),
            &Client::new(),
            Arc::new(SystemClock),
        )
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("No API key configured for provider 'waqi'"));
        assert!(msg.contains("WAQI_API_TOKEN"));
    }

    #[test]
    fn adapter_from_settings_builds_matching_kind() {
        for backend in Backend::all() {
            let adapter = adapter_from_settings(
                &settings(*backend, Some("KEY")),
                &Client::new(),
                Arc::new(SystemClock),
            )
            .unwrap();
            assert_eq!(adapter.kind(), backend.kind());
            assert_eq!(adapter.name(), backend.as_str());
        }
    }

    #[test]
    fn waqi_with_openweather_key_attaches_concentrations() {
        let mut settings = settings(Backend::Waqi, Some("KEY"));
        settings.concentrations_key = Some("OW".into());

        let adapter =
            adapter_from_settings(&settings, &Client::new(), Arc::new(SystemClock)).unwrap();
        assert_eq!(adapter.name(), "waqi");
        assert!(format!("{adapter:?}").contains("OpenWeatherAirProvider"));
    }
}
