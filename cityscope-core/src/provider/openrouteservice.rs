//! Traffic estimate from OpenRouteService driving directions.
//!
//! A short probe route from the city centre is requested and its travel time
//! compared to the time the same distance takes at a 50 km/h reference speed.
//! Only `features[0].properties.summary` is used; geometry, `bbox`,
//! `segments`, `way_points` and `metadata` are dropped. ORS reports no
//! incidents, so `incident_count` is always `None`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    clock::SharedClock,
    error::ProviderError,
    model::{
        City, CongestionLevel, Coordinates, ProviderKind, ProviderRecord, RecordData,
        TrafficRecord,
    },
};

use super::{ProviderAdapter, http};

pub const DEFAULT_BASE_URL: &str = "https://api.openrouteservice.org";
const SOURCE: &str = "OpenRouteService";

const REFERENCE_SPEED_KMH: f64 = 50.0;
/// Probe destination offset used when the city has no configured probe point.
pub const DEFAULT_PROBE_OFFSET_DEG: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct OpenRouteServiceProvider {
    api_key: String,
    base_url: String,
    http: Client,
    clock: SharedClock,
}

impl OpenRouteServiceProvider {
    pub fn new(api_key: String, base_url: String, http: Client, clock: SharedClock) -> Self {
        Self { api_key, base_url, http, clock }
    }

    async fn fetch_route(&self, city: &City) -> Result<OrsSummary, ProviderError> {
        let origin = city.coordinates;
        let destination = city
            .tokens
            .traffic_probe
            .unwrap_or_else(|| origin.offset(DEFAULT_PROBE_OFFSET_DEG));

        let url = format!("{}/v2/directions/driving-car", self.base_url.trim_end_matches('/'));
        let request = self.http.get(url).query(&[
            ("api_key", self.api_key.clone()),
            ("start", lon_lat(origin)),
            ("end", lon_lat(destination)),
        ]);

        let raw = http::send(request, SOURCE).await?;
        if !raw.status.is_success() {
            // Unroutable points come back as 404 with {"error": {"code": 2010, ...}}.
            if raw.status == reqwest::StatusCode::NOT_FOUND
                && let Ok(body) = serde_json::from_str::<OrsErrorResponse>(&raw.body)
            {
                return Err(ProviderError::NotFound(body.error.message));
            }
            return Err(raw.status_error(SOURCE));
        }

        let parsed: OrsResponse = http::parse_json(&raw.body, SOURCE)?;
        parsed
            .features
            .into_iter()
            .next()
            .map(|feature| feature.properties.summary)
            .ok_or_else(|| ProviderError::NotFound("no route found around the city centre".into()))
    }
}

/// ORS expects `lon,lat`.
fn lon_lat(point: Coordinates) -> String {
    format!("{},{}", point.longitude, point.latitude)
}

#[derive(Debug, Deserialize)]
struct OrsSummary {
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OrsProperties {
    summary: OrsSummary,
}

#[derive(Debug, Deserialize)]
struct OrsFeature {
    properties: OrsProperties,
}

#[derive(Debug, Deserialize)]
struct OrsResponse {
    #[serde(default)]
    features: Vec<OrsFeature>,
}

#[derive(Debug, Deserialize)]
struct OrsError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OrsErrorResponse {
    error: OrsError,
}

fn normalize(summary: OrsSummary) -> Result<TrafficRecord, ProviderError> {
    let (Some(distance_m), Some(duration_s)) = (summary.distance, summary.duration) else {
        return Err(ProviderError::NotFound("route summary is empty".into()));
    };
    if distance_m <= 0.0 || duration_s <= 0.0 {
        return Err(ProviderError::InvalidResponse(format!(
            "degenerate route: {distance_m} m in {duration_s} s"
        )));
    }

    let free_flow_duration_s = (distance_m / 1000.0) / REFERENCE_SPEED_KMH * 3600.0;
    let congestion_pct = (duration_s - free_flow_duration_s) / free_flow_duration_s * 100.0;

    Ok(TrafficRecord {
        congestion: CongestionLevel::from_delay_pct(congestion_pct),
        congestion_pct,
        average_speed_kmh: distance_m / duration_s * 3.6,
        incident_count: None,
        route_duration_s: duration_s,
        route_distance_m: distance_m,
        free_flow_duration_s,
    })
}

#[async_trait]
impl ProviderAdapter for OpenRouteServiceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Traffic
    }

    fn name(&self) -> &'static str {
        "openrouteservice"
    }

    async fn fetch(&self, city: &City) -> Result<ProviderRecord, ProviderError> {
        let summary = self.fetch_route(city).await?;
        let record = normalize(summary)?;

        Ok(ProviderRecord::fresh(self.name(), self.clock.now(), RecordData::Traffic(record)))
    }
}
