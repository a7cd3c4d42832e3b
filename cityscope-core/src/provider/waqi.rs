//! World Air Quality Index city feed (`/feed/<token>/`).
//!
//! WAQI already publishes US EPA AQI values. Pollutant entries in `iaqi` are
//! per-pollutant sub-indices, not concentrations, and are reported as such
//! unless an OpenWeather pollution source is attached. With one attached, both
//! calls run together: the AQI stays WAQI's and the pollutant map is replaced
//! by OpenWeather's µg/m³ concentrations. If only the OpenWeather call fails
//! the record keeps the WAQI sub-indices and the failure is logged.
//!
//! Dropped upstream fields: `iaqi.t/h/p/w/wg/dew/r` (weather readings, owned
//! by the weather provider), `forecast` (forecasting is out of scope),
//! `attributions`, `debug`, `idx`, `city.url/geo`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{
    clock::SharedClock,
    error::ProviderError,
    model::{
        AirQualityRecord, AqiCategory, City, Pollutant, PollutantUnit, ProviderKind,
        ProviderRecord, RecordData,
    },
};

use super::{
    ProviderAdapter, http, openweather::unix_to_utc, openweather_air::OpenWeatherAirProvider,
};

pub const DEFAULT_BASE_URL: &str = "https://api.waqi.info";
const SOURCE: &str = "WAQI";
const MAX_AQI: f64 = 500.0;

#[derive(Debug, Clone)]
pub struct WaqiProvider {
    token: String,
    base_url: String,
    http: Client,
    clock: SharedClock,
    concentrations: Option<OpenWeatherAirProvider>,
}

impl WaqiProvider {
    pub fn new(token: String, base_url: String, http: Client, clock: SharedClock) -> Self {
        Self { token, base_url, http, clock, concentrations: None }
    }

    /// Fill pollutant concentrations from OpenWeather alongside WAQI's AQI.
    pub fn with_concentrations(mut self, source: OpenWeatherAirProvider) -> Self {
        self.concentrations = Some(source);
        self
    }

    async fn fetch_feed(&self, station: &str) -> Result<WaqiFeed, ProviderError> {
        let url = format!("{}/feed/{}/", self.base_url.trim_end_matches('/'), station);
        let request = self.http.get(url).query(&[("token", self.token.as_str())]);

        let envelope: WaqiEnvelope = http::send(request, SOURCE).await?.into_json(SOURCE)?;

        // Failures arrive as 200 OK with {"status": "error", "data": "<message>"}.
        if envelope.status != "ok" {
            let message = envelope.data.as_str().unwrap_or("unspecified error").to_string();
            return Err(classify_error_message(message));
        }

        serde_json::from_value(envelope.data).map_err(|e| {
            ProviderError::InvalidResponse(format!("unexpected WAQI feed shape: {e}"))
        })
    }
}

fn classify_error_message(message: String) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("unknown station") || lower.contains("unknown city") {
        ProviderError::NotFound(message)
    } else if lower.contains("over quota") {
        ProviderError::RateLimited { retry_after: None }
    } else {
        ProviderError::InvalidResponse(format!("WAQI error: {message}"))
    }
}

#[derive(Debug, Deserialize)]
struct WaqiEnvelope {
    status: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct WaqiFeed {
    /// A number, or "-" when the station has no current reading.
    aqi: Value,
    #[serde(default)]
    dominentpol: Option<String>,
    #[serde(default)]
    iaqi: BTreeMap<String, WaqiValue>,
    #[serde(default)]
    city: Option<WaqiCity>,
    #[serde(default)]
    time: Option<WaqiTime>,
}

#[derive(Debug, Deserialize)]
struct WaqiValue {
    v: f64,
}

#[derive(Debug, Deserialize)]
struct WaqiCity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WaqiTime {
    #[serde(default)]
    iso: Option<String>,
    #[serde(default)]
    v: Option<i64>,
}

impl WaqiTime {
    /// `iso` carries the station's offset; `v` is local time posing as a unix stamp.
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.iso
            .as_deref()
            .and_then(|iso| DateTime::parse_from_rfc3339(iso).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| self.v.and_then(unix_to_utc))
    }
}

fn normalize(feed: WaqiFeed) -> Result<AirQualityRecord, ProviderError> {
    let aqi = feed
        .aqi
        .as_f64()
        .ok_or_else(|| ProviderError::NotFound("station reports no current AQI".into()))?;
    let aqi = aqi.round().clamp(0.0, MAX_AQI) as u16;

    let pollutants: BTreeMap<Pollutant, f64> = feed
        .iaqi
        .iter()
        .filter_map(|(key, value)| Pollutant::parse(key).map(|p| (p, value.v)))
        .collect();

    Ok(AirQualityRecord {
        aqi,
        category: AqiCategory::from_aqi(aqi),
        dominant_pollutant: feed.dominentpol.as_deref().and_then(Pollutant::parse),
        pollutants,
        pollutant_unit: PollutantUnit::AqiSubIndex,
        station: feed.city.map(|c| c.name),
        observed_at: feed.time.as_ref().and_then(WaqiTime::observed_at),
    })
}

#[async_trait]
impl ProviderAdapter for WaqiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AirQuality
    }

    fn name(&self) -> &'static str {
        "waqi"
    }

    async fn fetch(&self, city: &City) -> Result<ProviderRecord, ProviderError> {
        let feed = self.fetch_feed(&city.tokens.waqi_station);
        let record = match &self.concentrations {
            None => normalize(feed.await?)?,
            Some(source) => {
                let (feed, concentrations) = tokio::join!(feed, source.concentrations(city));
                let mut record = normalize(feed?)?;
                match concentrations {
                    Ok(pollutants) if !pollutants.is_empty() => {
                        record.pollutants = pollutants;
                        record.pollutant_unit = PollutantUnit::MicrogramsPerCubicMetre;
                    }
                    Ok(_) => warn!(city = %city.id, "OpenWeather reported no pollutant components"),
                    Err(e) => warn!(
                        city = %city.id,
                        error = %e,
                        "Pollutant concentrations unavailable, keeping WAQI sub-indices"
                    ),
                }
                record
            }
        };

        Ok(ProviderRecord::fresh(self.name(), self.clock.now(), RecordData::AirQuality(record)))
    }
}
