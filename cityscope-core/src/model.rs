use std::{collections::BTreeMap, convert::TryFrom};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// The three data sources a snapshot is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Traffic,
    AirQuality,
    Weather,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Traffic => "traffic",
            ProviderKind::AirQuality => "air_quality",
            ProviderKind::Weather => "weather",
        }
    }

    pub const fn all() -> &'static [ProviderKind] {
        &[ProviderKind::Traffic, ProviderKind::AirQuality, ProviderKind::Weather]
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderKind {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.trim().to_lowercase().replace('-', "_");

        match lower.as_str() {
            "traffic" => Ok(ProviderKind::Traffic),
            "air_quality" | "airquality" | "aqi" => Ok(ProviderKind::AirQuality),
            "weather" => Ok(ProviderKind::Weather),
            _ => Err(anyhow::anyhow!(
                "Unknown provider kind '{value}'. Supported kinds: traffic, air_quality, weather."
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> anyhow::Result<Self> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            anyhow::bail!("coordinates ({latitude}, {longitude}) are out of range");
        }
        Ok(Self { latitude, longitude })
    }

    /// Shifted by the same number of degrees on both axes, clamped to valid range.
    pub fn offset(&self, degrees: f64) -> Self {
        Self {
            latitude: (self.latitude + degrees).clamp(-90.0, 90.0),
            longitude: (self.longitude + degrees).clamp(-180.0, 180.0),
        }
    }
}

/// Location encodings that individual providers need beyond plain coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationTokens {
    /// WAQI feed token: a station slug, `@<idx>`, or `geo:<lat>;<lon>`.
    pub waqi_station: String,
    /// Destination of the route used to probe traffic around the city centre.
    pub traffic_probe: Option<Coordinates>,
}

impl LocationTokens {
    pub fn from_coordinates(coordinates: Coordinates) -> Self {
        Self {
            waqi_station: format!("geo:{};{}", coordinates.latitude, coordinates.longitude),
            traffic_probe: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: String,
    pub display_name: String,
    pub coordinates: Coordinates,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub tokens: LocationTokens,
}

/// One provider's normalized reading for one city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub fetched_at: DateTime<Utc>,
    /// Upstream service the record came from, e.g. `waqi`.
    pub backend: String,
    pub is_stale: bool,
    pub data: RecordData,
}

impl ProviderRecord {
    pub fn fresh(backend: impl Into<String>, fetched_at: DateTime<Utc>, data: RecordData) -> Self {
        Self { fetched_at, backend: backend.into(), is_stale: false, data }
    }

    pub fn source_provider(&self) -> ProviderKind {
        self.data.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum RecordData {
    Traffic(TrafficRecord),
    AirQuality(AirQualityRecord),
    Weather(WeatherRecord),
}

impl RecordData {
    pub fn kind(&self) -> ProviderKind {
        match self {
            RecordData::Traffic(_) => ProviderKind::Traffic,
            RecordData::AirQuality(_) => ProviderKind::AirQuality,
            RecordData::Weather(_) => ProviderKind::Weather,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    FreeFlow,
    Light,
    Moderate,
    Heavy,
    Severe,
}

impl CongestionLevel {
    /// Bands over the extra travel time relative to free flow, in percent.
    pub fn from_delay_pct(pct: f64) -> Self {
        match pct {
            p if p < 10.0 => CongestionLevel::FreeFlow,
            p if p < 30.0 => CongestionLevel::Light,
            p if p < 60.0 => CongestionLevel::Moderate,
            p if p < 100.0 => CongestionLevel::Heavy,
            _ => CongestionLevel::Severe,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::FreeFlow => "free flow",
            CongestionLevel::Light => "light",
            CongestionLevel::Moderate => "moderate",
            CongestionLevel::Heavy => "heavy",
            CongestionLevel::Severe => "severe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub congestion: CongestionLevel,
    pub congestion_pct: f64,
    pub average_speed_kmh: f64,
    /// `None` when the backend does not report incidents.
    pub incident_count: Option<u32>,
    pub route_duration_s: f64,
    pub route_distance_m: f64,
    pub free_flow_duration_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pollutant {
    Pm2_5,
    Pm10,
    O3,
    No2,
    No,
    So2,
    Co,
    Nh3,
}

impl Pollutant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pollutant::Pm2_5 => "pm2_5",
            Pollutant::Pm10 => "pm10",
            Pollutant::O3 => "o3",
            Pollutant::No2 => "no2",
            Pollutant::No => "no",
            Pollutant::So2 => "so2",
            Pollutant::Co => "co",
            Pollutant::Nh3 => "nh3",
        }
    }

    /// Accepts the spellings used by the supported backends (`pm25`, `pm2.5`, `pm2_5`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match key.as_str() {
            "pm25" => Some(Pollutant::Pm2_5),
            "pm10" => Some(Pollutant::Pm10),
            "o3" => Some(Pollutant::O3),
            "no2" => Some(Pollutant::No2),
            "no" => Some(Pollutant::No),
            "so2" => Some(Pollutant::So2),
            "co" => Some(Pollutant::Co),
            "nh3" => Some(Pollutant::Nh3),
            _ => None,
        }
    }
}

impl std::fmt::Display for Pollutant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollutantUnit {
    MicrogramsPerCubicMetre,
    /// Per-pollutant AQI sub-index as published by the station network.
    AqiSubIndex,
}

impl PollutantUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            PollutantUnit::MicrogramsPerCubicMetre => "µg/m³",
            PollutantUnit::AqiSubIndex => "AQI",
        }
    }
}

/// US EPA health bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthyForSensitiveGroups,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    pub fn from_aqi(aqi: u16) -> Self {
        match aqi {
            0..=50 => AqiCategory::Good,
            51..=100 => AqiCategory::Moderate,
            101..=150 => AqiCategory::UnhealthyForSensitiveGroups,
            151..=200 => AqiCategory::Unhealthy,
            201..=300 => AqiCategory::VeryUnhealthy,
            _ => AqiCategory::Hazardous,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityRecord {
    /// US EPA scale, 0..=500.
    pub aqi: u16,
    pub category: AqiCategory,
    pub dominant_pollutant: Option<Pollutant>,
    pub pollutants: BTreeMap<Pollutant, f64>,
    pub pollutant_unit: PollutantUnit,
    pub station: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionCode {
    Clear,
    Clouds,
    Atmosphere,
    Drizzle,
    Rain,
    Snow,
    Thunderstorm,
    Unknown,
}

impl ConditionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionCode::Clear => "clear",
            ConditionCode::Clouds => "clouds",
            ConditionCode::Atmosphere => "mist/haze",
            ConditionCode::Drizzle => "drizzle",
            ConditionCode::Rain => "rain",
            ConditionCode::Snow => "snow",
            ConditionCode::Thunderstorm => "thunderstorm",
            ConditionCode::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wind {
    pub speed_mps: f64,
    pub direction_deg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub temperature_c: f64,
    pub feels_like_c: f64,
    pub humidity_pct: u8,
    pub pressure_hpa: Option<f64>,
    pub wind: Wind,
    pub condition: ConditionCode,
    pub description: String,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Full,
    Partial,
    Degraded,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Full => "full",
            Completeness::Partial => "partial",
            Completeness::Degraded => "degraded",
        }
    }

    /// Full needs every provider present and fresh; a stale fallback only
    /// counts towards partial.
    pub fn from_counts(present: usize, fresh: usize) -> Self {
        match (present, fresh) {
            (0, _) => Completeness::Degraded,
            (_, n) if n >= ProviderKind::all().len() => Completeness::Full,
            _ => Completeness::Partial,
        }
    }
}

/// What a failed slot fell back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    Cached,
    Missing,
}

/// A provider failure that was absorbed while building a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDiagnostic {
    pub provider: ProviderKind,
    pub failure: FailureKind,
    pub message: String,
    pub fallback: Fallback,
}

/// Merged view of one city. Built once per aggregation cycle, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub city: City,
    pub generated_at: DateTime<Utc>,
    pub completeness: Completeness,
    records: BTreeMap<ProviderKind, ProviderRecord>,
    pub diagnostics: Vec<ProviderDiagnostic>,
}

impl Snapshot {
    /// Records are keyed by their own payload kind, so a later record for the
    /// same provider replaces an earlier one.
    pub fn new(
        city: City,
        generated_at: DateTime<Utc>,
        records: impl IntoIterator<Item = ProviderRecord>,
        diagnostics: Vec<ProviderDiagnostic>,
    ) -> Self {
        let records: BTreeMap<_, _> =
            records.into_iter().map(|record| (record.source_provider(), record)).collect();
        let fresh = records.values().filter(|r| !r.is_stale).count();
        let completeness = Completeness::from_counts(records.len(), fresh);

        Self { city, generated_at, completeness, records, diagnostics }
    }

    pub fn record(&self, kind: ProviderKind) -> Option<&ProviderRecord> {
        self.records.get(&kind)
    }

    pub fn records(&self) -> impl Iterator<Item = &ProviderRecord> {
        self.records.values()
    }

    pub fn traffic(&self) -> Option<&TrafficRecord> {
        match &self.record(ProviderKind::Traffic)?.data {
            RecordData::Traffic(traffic) => Some(traffic),
            _ => None,
        }
    }

    pub fn air_quality(&self) -> Option<&AirQualityRecord> {
        match &self.record(ProviderKind::AirQuality)?.data {
            RecordData::AirQuality(air) => Some(air),
            _ => None,
        }
    }

    pub fn weather(&self) -> Option<&WeatherRecord> {
        match &self.record(ProviderKind::Weather)?.data {
            RecordData::Weather(weather) => Some(weather),
            _ => None,
        }
    }

    pub fn diagnostic(&self, kind: ProviderKind) -> Option<&ProviderDiagnostic> {
        self.diagnostics.iter().find(|d| d.provider == kind)
    }
}
