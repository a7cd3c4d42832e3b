//! City name → [`City`] resolution.
//!
//! Names are matched against the configured catalogue first, then (when
//! configured) against a remote geocoder. Successful resolutions are kept for
//! the lifetime of the process since city metadata does not change.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{ProviderError, ResolutionError},
    model::{City, Coordinates, LocationTokens},
    provider::{http, openweather},
};

/// A place returned by a remote geocoder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeoCandidate {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    pub country: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
}

impl GeoCandidate {
    fn label(&self) -> String {
        match &self.state {
            Some(state) => format!("{}, {}, {}", self.name, state, self.country),
            None => format!("{}, {}", self.name, self.country),
        }
    }

    fn same_place(&self, other: &GeoCandidate) -> bool {
        normalize_name(&self.name) == normalize_name(&other.name)
            && self.state == other.state
            && self.country == other.country
    }

    fn to_city(&self) -> Result<City, ResolutionError> {
        let coordinates = Coordinates::new(self.latitude, self.longitude)
            .map_err(|e| ResolutionError::GeocoderUnavailable(e.to_string()))?;
        let id = slug(&self.label());

        Ok(City {
            id,
            display_name: self.name.clone(),
            coordinates,
            aliases: vec![],
            tokens: LocationTokens::from_coordinates(coordinates),
        })
    }
}

#[async_trait]
pub trait CityLookup: Send + Sync + Debug {
    async fn candidates(&self, name: &str) -> Result<Vec<GeoCandidate>, ResolutionError>;
}

/// OpenWeather direct geocoding (`/geo/1.0/direct`).
#[derive(Debug, Clone)]
pub struct OpenWeatherGeocoder {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenWeatherGeocoder {
    const SOURCE: &'static str = "OpenWeather Geocoding";
    const LIMIT: &'static str = "5";

    pub fn new(api_key: String, base_url: Option<String>, http: Client) -> Self {
        let base_url = base_url.unwrap_or_else(|| openweather::DEFAULT_BASE_URL.to_string());
        Self { api_key, base_url, http }
    }
}

#[async_trait]
impl CityLookup for OpenWeatherGeocoder {
    async fn candidates(&self, name: &str) -> Result<Vec<GeoCandidate>, ResolutionError> {
        let url = format!("{}/geo/1.0/direct", self.base_url.trim_end_matches('/'));
        let request = self.http.get(url).query(&[
            ("q", name),
            ("limit", Self::LIMIT),
            ("appid", self.api_key.as_str()),
        ]);

        let unavailable = |e: ProviderError| ResolutionError::GeocoderUnavailable(e.to_string());
        http::send(request, Self::SOURCE)
            .await
            .map_err(unavailable)?
            .into_json(Self::SOURCE)
            .map_err(unavailable)
    }
}

#[derive(Debug)]
pub struct GeocodingResolver {
    catalogue: Vec<City>,
    remote: Option<Arc<dyn CityLookup>>,
    resolved: DashMap<String, City>,
}

impl GeocodingResolver {
    pub fn new(catalogue: Vec<City>) -> Self {
        Self { catalogue, remote: None, resolved: DashMap::new() }
    }

    pub fn with_remote(mut self, remote: Arc<dyn CityLookup>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn catalogue(&self) -> &[City] {
        &self.catalogue
    }

    pub async fn resolve(&self, name: &str) -> Result<City, ResolutionError> {
        let key = normalize_name(name);
        if key.is_empty() {
            return Err(ResolutionError::UnknownCity(name.to_string()));
        }
        if let Some(city) = self.resolved.get(&key) {
            return Ok(city.clone());
        }

        let city = match self.resolve_in_catalogue(name, &key)? {
            Some(city) => city,
            None => self.resolve_remote(name).await?,
        };

        debug!(query = name, city = %city.id, "Resolved city");
        self.resolved.insert(key, city.clone());
        Ok(city)
    }

    fn resolve_in_catalogue(&self, name: &str, key: &str) -> Result<Option<City>, ResolutionError> {
        let matches: Vec<&City> = self
            .catalogue
            .iter()
            .filter(|c| {
                normalize_name(&c.id) == key
                    || normalize_name(&c.display_name) == key
                    || c.aliases.iter().any(|alias| normalize_name(alias) == key)
            })
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [city] => Ok(Some((*city).clone())),
            several => Err(ResolutionError::AmbiguousCity {
                name: name.to_string(),
                candidates: several.iter().map(|c| c.id.clone()).collect(),
            }),
        }
    }

    async fn resolve_remote(&self, name: &str) -> Result<City, ResolutionError> {
        let Some(remote) = &self.remote else {
            return Err(ResolutionError::UnknownCity(name.to_string()));
        };

        let candidates = remote.candidates(name).await?;
        pick_candidate(name, candidates)?.to_city()
    }
}

fn pick_candidate(name: &str, candidates: Vec<GeoCandidate>) -> Result<GeoCandidate, ResolutionError> {
    let mut distinct: Vec<GeoCandidate> = Vec::new();
    for candidate in candidates {
        if !distinct.iter().any(|c| c.same_place(&candidate)) {
            distinct.push(candidate);
        }
    }

    if distinct.len() <= 1 {
        return distinct
            .pop()
            .ok_or_else(|| ResolutionError::UnknownCity(name.to_string()));
    }

    let key = normalize_name(name);
    let mut exact: Vec<GeoCandidate> =
        distinct.iter().filter(|c| normalize_name(&c.name) == key).cloned().collect();

    match exact.len() {
        1 => Ok(exact.remove(0)),
        0 => Err(ambiguous(name, &distinct)),
        _ => Err(ambiguous(name, &exact)),
    }
}

fn ambiguous(name: &str, candidates: &[GeoCandidate]) -> ResolutionError {
    ResolutionError::AmbiguousCity {
        name: name.to_string(),
        candidates: candidates.iter().map(GeoCandidate::label).collect(),
    }
}

/// Trimmed, lowercased, single-spaced.
fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn slug(label: &str) -> String {
    label
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}
