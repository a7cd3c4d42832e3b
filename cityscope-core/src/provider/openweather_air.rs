//! OpenWeather Air Pollution (`/data/2.5/air_pollution`).
//!
//! Reports concentrations in µg/m³ and a coarse 1..=5 index. The index is
//! replaced by a US EPA AQI computed from PM2.5 and PM10 so both air-quality
//! backends share one scale; the 1..=5 value is only used when neither PM
//! reading is present. `coord` and `list[1..]` are dropped.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::{
    clock::SharedClock,
    error::ProviderError,
    model::{
        AirQualityRecord, AqiCategory, City, Pollutant, PollutantUnit, ProviderKind,
        ProviderRecord, RecordData,
    },
};

use super::{ProviderAdapter, http, openweather::unix_to_utc};

const SOURCE: &str = "OpenWeather Air Pollution";

/// (concentration low, concentration high, index low, index high)
type Breakpoint = (f64, f64, f64, f64);

const PM2_5_BREAKPOINTS: &[Breakpoint] = &[
    (0.0, 12.0, 0.0, 50.0),
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 350.4, 301.0, 400.0),
    (350.5, 500.4, 401.0, 500.0),
];

const PM10_BREAKPOINTS: &[Breakpoint] = &[
    (0.0, 54.0, 0.0, 50.0),
    (55.0, 154.0, 51.0, 100.0),
    (155.0, 254.0, 101.0, 150.0),
    (255.0, 354.0, 151.0, 200.0),
    (355.0, 424.0, 201.0, 300.0),
    (425.0, 504.0, 301.0, 400.0),
    (505.0, 604.0, 401.0, 500.0),
];

/// Midpoint of the EPA band matching each OpenWeather index step.
const INDEX_MIDPOINTS: [u16; 5] = [25, 75, 125, 175, 250];

#[derive(Debug, Clone)]
pub struct OpenWeatherAirProvider {
    api_key: String,
    base_url: String,
    http: Client,
    clock: SharedClock,
}

impl OpenWeatherAirProvider {
    pub fn new(api_key: String, base_url: String, http: Client, clock: SharedClock) -> Self {
        Self { api_key, base_url, http, clock }
    }

    async fn fetch_current(&self, city: &City) -> Result<OwAirEntry, ProviderError> {
        let url = format!("{}/data/2.5/air_pollution", self.base_url.trim_end_matches('/'));
        let request = self.http.get(url).query(&[
            ("lat", city.coordinates.latitude.to_string()),
            ("lon", city.coordinates.longitude.to_string()),
            ("appid", self.api_key.clone()),
        ]);

        let parsed: OwAirResponse = http::send(request, SOURCE).await?.into_json(SOURCE)?;
        parsed
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound("pollution data not available".into()))
    }

    /// Current pollutant concentrations in µg/m³.
    pub async fn concentrations(
        &self,
        city: &City,
    ) -> Result<BTreeMap<Pollutant, f64>, ProviderError> {
        let entry = self.fetch_current(city).await?;
        Ok(concentrations(&entry))
    }
}

#[derive(Debug, Deserialize)]
struct OwAirResponse {
    #[serde(default)]
    list: Vec<OwAirEntry>,
}

#[derive(Debug, Deserialize)]
struct OwAirEntry {
    dt: i64,
    main: OwAirIndex,
    components: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct OwAirIndex {
    aqi: u8,
}

fn sub_index(concentration: f64, table: &[Breakpoint], precision: f64) -> Option<f64> {
    let c = (concentration * precision).trunc() / precision;
    if c < 0.0 {
        return None;
    }
    let top = table.last()?;
    if c > top.1 {
        return Some(top.3);
    }
    table
        .iter()
        .find(|(_, c_hi, _, _)| c <= *c_hi)
        .map(|&(c_lo, c_hi, i_lo, i_hi)| (i_hi - i_lo) / (c_hi - c_lo) * (c.max(c_lo) - c_lo) + i_lo)
}

/// US EPA AQI from PM concentrations in µg/m³: the larger of the two sub-indices.
pub fn epa_aqi(pm2_5: Option<f64>, pm10: Option<f64>) -> Option<u16> {
    let pm2_5 = pm2_5.and_then(|c| sub_index(c, PM2_5_BREAKPOINTS, 10.0));
    let pm10 = pm10.and_then(|c| sub_index(c, PM10_BREAKPOINTS, 1.0));

    match (pm2_5, pm10) {
        (Some(a), Some(b)) => Some(a.max(b).round() as u16),
        (Some(a), None) | (None, Some(a)) => Some(a.round() as u16),
        (None, None) => None,
    }
}

fn concentrations(entry: &OwAirEntry) -> BTreeMap<Pollutant, f64> {
    let mut pollutants = BTreeMap::new();
    for (key, value) in &entry.components {
        match Pollutant::parse(key) {
            Some(pollutant) => {
                pollutants.insert(pollutant, *value);
            }
            None => warn!(component = %key, "Dropping unrecognized pollutant component"),
        }
    }
    pollutants
}

fn normalize(entry: OwAirEntry) -> Result<AirQualityRecord, ProviderError> {
    let pollutants = concentrations(&entry);
    let pm2_5 = pollutants.get(&Pollutant::Pm2_5).copied();
    let pm10 = pollutants.get(&Pollutant::Pm10).copied();

    let aqi = match epa_aqi(pm2_5, pm10) {
        Some(aqi) => aqi,
        None => {
            let step = usize::from(entry.main.aqi);
            *INDEX_MIDPOINTS.get(step.wrapping_sub(1)).ok_or_else(|| {
                ProviderError::InvalidResponse(format!("air quality index {step} outside 1..=5"))
            })?
        }
    };

    let dominant_pollutant = match (pm2_5, pm10) {
        (Some(a), Some(b)) => {
            let a = sub_index(a, PM2_5_BREAKPOINTS, 10.0).unwrap_or(0.0);
            let b = sub_index(b, PM10_BREAKPOINTS, 1.0).unwrap_or(0.0);
            Some(if a >= b { Pollutant::Pm2_5 } else { Pollutant::Pm10 })
        }
        (Some(_), None) => Some(Pollutant::Pm2_5),
        (None, Some(_)) => Some(Pollutant::Pm10),
        (None, None) => None,
    };

    Ok(AirQualityRecord {
        aqi,
        category: AqiCategory::from_aqi(aqi),
        dominant_pollutant,
        pollutants,
        pollutant_unit: PollutantUnit::MicrogramsPerCubicMetre,
        station: None,
        observed_at: unix_to_utc(entry.dt),
    })
}

#[async_trait]
impl ProviderAdapter for OpenWeatherAirProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AirQuality
    }

    fn name(&self) -> &'static str {
        "openweather-air"
    }

    async fn fetch(&self, city: &City) -> Result<ProviderRecord, ProviderError> {
        let entry = self.fetch_current(city).await?;
        let record = normalize(entry)?;
        Ok(ProviderRecord::fresh(self.name(), self.clock.now(), RecordData::AirQuality(record)))
    }
}
