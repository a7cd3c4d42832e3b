//! WeatherAPI.com current conditions (`/v1/current.json`).
//!
//! Wind is converted from km/h to m/s. Imperial duplicates (`temp_f`,
//! `wind_mph`, `pressure_in`, ...) are dropped in favor of their metric
//! fields; `uv`, `cloud`, `vis_km`, `precip_mm`, `gust_kph`, `is_day` and the
//! `location` block are not shown and are dropped.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::{
    clock::SharedClock,
    error::ProviderError,
    model::{City, ConditionCode, ProviderKind, ProviderRecord, RecordData, WeatherRecord, Wind},
};

use super::{ProviderAdapter, http, openweather::unix_to_utc};

pub const DEFAULT_BASE_URL: &str = "https://api.weatherapi.com";
const SOURCE: &str = "WeatherAPI";

/// WeatherAPI error codes with a meaning beyond their HTTP status.
const NO_MATCHING_LOCATION: u32 = 1006;
const QUOTA_EXCEEDED: u32 = 2007;

#[derive(Debug, Clone)]
pub struct WeatherApiProvider {
    api_key: String,
    base_url: String,
    http: Client,
    clock: SharedClock,
}

impl WeatherApiProvider {
    pub fn new(api_key: String, base_url: String, http: Client, clock: SharedClock) -> Self {
        Self { api_key, base_url, http, clock }
    }

    async fn fetch_current(&self, city: &City) -> Result<WaResponse, ProviderError> {
        let url = format!("{}/v1/current.json", self.base_url.trim_end_matches('/'));
        let location = format!("{},{}", city.coordinates.latitude, city.coordinates.longitude);
        let request = self
            .http
            .get(url)
            .query(&[("key", self.api_key.as_str()), ("q", location.as_str())]);

        let raw = http::send(request, SOURCE).await?;
        if raw.status.is_success() {
            return http::parse_json(&raw.body, SOURCE);
        }

        // Errors carry a body like {"error": {"code": 1006, "message": "..."}}.
        let api_error = serde_json::from_str::<WaErrorResponse>(&raw.body).ok().map(|e| e.error);
        match api_error {
            Some(e) if e.code == NO_MATCHING_LOCATION => Err(ProviderError::NotFound(e.message)),
            Some(e) if e.code == QUOTA_EXCEEDED || raw.status == StatusCode::TOO_MANY_REQUESTS => {
                Err(ProviderError::RateLimited { retry_after: raw.retry_after })
            }
            _ => Err(raw.status_error(SOURCE)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WaCondition {
    text: String,
    code: u16,
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    temp_c: f64,
    feelslike_c: f64,
    humidity: u8,
    wind_kph: f64,
    #[serde(default)]
    wind_degree: Option<f64>,
    #[serde(default)]
    pressure_mb: Option<f64>,
    condition: WaCondition,
    last_updated_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WaResponse {
    current: WaCurrent,
}

#[derive(Debug, Deserialize)]
struct WaError {
    code: u32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WaErrorResponse {
    error: WaError,
}

pub(crate) fn condition_from_code(code: u16) -> ConditionCode {
    match code {
        1000 => ConditionCode::Clear,
        1003 | 1006 | 1009 => ConditionCode::Clouds,
        1030 | 1135 | 1147 => ConditionCode::Atmosphere,
        1087 | 1273 | 1276 | 1279 | 1282 => ConditionCode::Thunderstorm,
        1072 | 1150 | 1153 | 1168 | 1171 => ConditionCode::Drizzle,
        1063 | 1180..=1201 | 1240..=1246 => ConditionCode::Rain,
        1066 | 1069 | 1114 | 1117 | 1204..=1237 | 1249..=1264 => ConditionCode::Snow,
        _ => ConditionCode::Unknown,
    }
}

fn normalize(parsed: WaResponse) -> WeatherRecord {
    let current = parsed.current;

    WeatherRecord {
        temperature_c: current.temp_c,
        feels_like_c: current.feelslike_c,
        humidity_pct: current.humidity,
        pressure_hpa: current.pressure_mb,
        wind: Wind { speed_mps: current.wind_kph / 3.6, direction_deg: current.wind_degree },
        condition: condition_from_code(current.condition.code),
        description: current.condition.text,
        observed_at: current.last_updated_epoch.and_then(unix_to_utc),
    }
}

#[async_trait]
impl ProviderAdapter for WeatherApiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Weather
    }

    fn name(&self) -> &'static str {
        "weatherapi"
    }

    async fn fetch(&self, city: &City) -> Result<ProviderRecord, ProviderError> {
        let parsed = self.fetch_current(city).await?;
        Ok(ProviderRecord::fresh(self.name(), self.clock.now(), RecordData::Weather(normalize(parsed))))
    }
}
