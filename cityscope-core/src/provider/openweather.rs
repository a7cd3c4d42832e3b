//! OpenWeather current weather (`/data/2.5/weather`), requested in metric units.
//!
//! Dropped upstream fields: `name`, `sys`, `timezone`, `id` (the city comes
//! from the resolver); `visibility`, `clouds`, `rain`, `snow`, `wind.gust`,
//! `main.temp_min/temp_max`, `main.sea_level/grnd_level` (not shown on the
//! dashboard); `weather[0].main/icon` (superseded by the numeric id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    clock::SharedClock,
    error::ProviderError,
    model::{City, ConditionCode, ProviderKind, ProviderRecord, RecordData, WeatherRecord, Wind},
};

use super::{ProviderAdapter, http};

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";
const SOURCE: &str = "OpenWeather";

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: String,
    http: Client,
    clock: SharedClock,
}

impl OpenWeatherProvider {
    pub fn new(api_key: String, base_url: String, http: Client, clock: SharedClock) -> Self {
        Self { api_key, base_url, http, clock }
    }

    async fn fetch_current(&self, city: &City) -> Result<OwCurrentResponse, ProviderError> {
        let url = format!("{}/data/2.5/weather", self.base_url.trim_end_matches('/'));
        let request = self.http.get(url).query(&[
            ("lat", city.coordinates.latitude.to_string()),
            ("lon", city.coordinates.longitude.to_string()),
            ("appid", self.api_key.clone()),
            ("units", "metric".to_string()),
        ]);

        http::send(request, SOURCE).await?.into_json(SOURCE)
    }
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
    feels_like: f64,
    humidity: u8,
    #[serde(default)]
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    id: u16,
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwWind {
    speed: f64,
    #[serde(default)]
    deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    dt: i64,
    main: OwMain,
    #[serde(default)]
    weather: Vec<OwWeather>,
    wind: OwWind,
}

/// OpenWeather condition ids are grouped by hundreds.
pub(crate) fn condition_from_id(id: u16) -> ConditionCode {
    match id {
        200..=299 => ConditionCode::Thunderstorm,
        300..=399 => ConditionCode::Drizzle,
        500..=599 => ConditionCode::Rain,
        600..=699 => ConditionCode::Snow,
        700..=799 => ConditionCode::Atmosphere,
        800 => ConditionCode::Clear,
        801..=899 => ConditionCode::Clouds,
        _ => ConditionCode::Unknown,
    }
}

fn normalize(parsed: OwCurrentResponse) -> WeatherRecord {
    let (condition, description) = parsed
        .weather
        .first()
        .map(|w| (condition_from_id(w.id), w.description.clone()))
        .unwrap_or((ConditionCode::Unknown, "Unknown".to_string()));

    WeatherRecord {
        temperature_c: parsed.main.temp,
        feels_like_c: parsed.main.feels_like,
        humidity_pct: parsed.main.humidity,
        pressure_hpa: parsed.main.pressure,
        wind: Wind { speed_mps: parsed.wind.speed, direction_deg: parsed.wind.deg },
        condition,
        description,
        observed_at: unix_to_utc(parsed.dt),
    }
}

#[async_trait]
impl ProviderAdapter for OpenWeatherProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Weather
    }

    fn name(&self) -> &'static str {
        "openweather"
    }

    async fn fetch(&self, city: &City) -> Result<ProviderRecord, ProviderError> {
        let parsed = self.fetch_current(city).await?;
        let record = normalize(parsed);

        Ok(ProviderRecord::fresh(self.name(), self.clock.now(), RecordData::Weather(record)))
    }
}

pub(crate) fn unix_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}
