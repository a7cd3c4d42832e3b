//! Plain-text rendering of snapshots for the terminal.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use cityscope_core::{
    City, ProviderKind, ProviderRecord, RecordData, Snapshot,
    model::{AirQualityRecord, Fallback, TrafficRecord, WeatherRecord},
};

pub fn snapshot(snapshot: &Snapshot, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} ({}) at {}  [{}]",
        snapshot.city.display_name,
        snapshot.city.id,
        snapshot.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        snapshot.completeness.as_str()
    );

    for kind in ProviderKind::all() {
        let line = match snapshot.record(*kind) {
            Some(record) => format!("{}  {}", summary(record), provenance(record, now)),
            None => "unavailable".to_string(),
        };
        let _ = writeln!(out, "  {:<12} {line}", label(*kind));
    }

    for diagnostic in &snapshot.diagnostics {
        let fallback = match diagnostic.fallback {
            Fallback::Cached => "showing last known data",
            Fallback::Missing => "no data",
        };
        let _ = writeln!(out, "  ! {}: {} ({fallback})", diagnostic.provider, diagnostic.message);
    }
    out
}

pub fn city_table(cities: &[City]) -> String {
    let mut out = String::new();
    for city in cities {
        let _ = write!(
            out,
            "{:<12} {:<12} {:>8.4} {:>9.4}",
            city.id, city.display_name, city.coordinates.latitude, city.coordinates.longitude
        );
        if !city.aliases.is_empty() {
            let _ = write!(out, "  aka {}", city.aliases.join(", "));
        }
        out.push('\n');
    }
    out
}

fn label(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Traffic => "Traffic",
        ProviderKind::AirQuality => "Air quality",
        ProviderKind::Weather => "Weather",
    }
}

fn summary(record: &ProviderRecord) -> String {
    match &record.data {
        RecordData::Traffic(traffic) => traffic_summary(traffic),
        RecordData::AirQuality(air) => air_summary(air),
        RecordData::Weather(weather) => weather_summary(weather),
    }
}

fn traffic_summary(traffic: &TrafficRecord) -> String {
    let mut line = format!(
        "{} congestion ({:+.0}% vs free flow), avg {:.1} km/h",
        traffic.congestion.as_str(),
        traffic.congestion_pct,
        traffic.average_speed_kmh
    );
    if let Some(incidents) = traffic.incident_count {
        let _ = write!(line, ", {incidents} incidents");
    }
    line
}

fn air_summary(air: &AirQualityRecord) -> String {
    let mut line = format!("AQI {} ({})", air.aqi, air.category.label());
    if let Some(pollutant) = air.dominant_pollutant {
        let _ = write!(line, ", dominant {}", pollutant.as_str());
    }
    if !air.pollutants.is_empty() {
        let readings: Vec<String> = air
            .pollutants
            .iter()
            .map(|(pollutant, value)| format!("{pollutant} {value:.1}"))
            .collect();
        let _ = write!(line, "; {} ({})", readings.join(", "), air.pollutant_unit.symbol());
    }
    line
}

fn weather_summary(weather: &WeatherRecord) -> String {
    format!(
        "{:.1}°C (feels {:.1}°C), {}, humidity {}%, wind {:.1} m/s",
        weather.temperature_c,
        weather.feels_like_c,
        weather.description,
        weather.humidity_pct,
        weather.wind.speed_mps
    )
}

fn provenance(record: &ProviderRecord, now: DateTime<Utc>) -> String {
    let age = age(record.fetched_at, now);
    if record.is_stale {
        format!("[{}, {age}, STALE]", record.backend)
    } else {
        format!("[{}, {age}]", record.backend)
    }
}

fn age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=4 => "just now".to_string(),
        5..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};
    use cityscope_core::{
        FailureKind,
        model::{
            AqiCategory, ConditionCode, Coordinates, LocationTokens, Pollutant, PollutantUnit,
            ProviderDiagnostic, Wind,
        },
    };

    use super::*;

    fn pune() -> City {
        let coordinates = Coordinates::new(18.5204, 73.8567).unwrap();
        City {
            id: "pune".into(),
            display_name: "Pune".into(),
            coordinates,
            aliases: vec!["Poona".into()],
            tokens: LocationTokens::from_coordinates(coordinates),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 5, 9, 30, 0).unwrap()
    }

    #[test]
    fn renders_stale_and_missing_slots() {
        let mut air = ProviderRecord::fresh(
            "waqi",
            now() - TimeDelta::minutes(7),
            RecordData::AirQuality(AirQualityRecord {
                aqi: 162,
                category: AqiCategory::from_aqi(162),
                dominant_pollutant: Some(Pollutant::Pm2_5),
                pollutants: Default::default(),
                pollutant_unit: PollutantUnit::AqiSubIndex,
                station: None,
                observed_at: None,
            }),
        );
        air.is_stale = true;
        let weather = ProviderRecord::fresh(
            "openweather",
            now() - TimeDelta::seconds(30),
            RecordData::Weather(WeatherRecord {
                temperature_c: 27.04,
                feels_like_c: 28.6,
                humidity_pct: 61,
                pressure_hpa: None,
                wind: Wind { speed_mps: 2.5, direction_deg: None },
                condition: ConditionCode::Clouds,
                description: "scattered clouds".into(),
                observed_at: None,
            }),
        );
        let diagnostic = ProviderDiagnostic {
            provider: ProviderKind::Traffic,
            failure: FailureKind::Unreachable,
            message: "provider unreachable: connection refused".into(),
            fallback: Fallback::Missing,
        };
        let snapshot = Snapshot::new(pune(), now(), vec![air, weather], vec![diagnostic]);

        let text = snapshot_text(&snapshot);
        assert!(text.starts_with("Pune (pune) at 2024-11-05 09:30:00 UTC  [partial]"));
        assert!(text.contains("Traffic      unavailable"));
        assert!(text.contains("AQI 162 (Unhealthy), dominant pm2_5  [waqi, 7m ago, STALE]"));
        assert!(text.contains("27.0°C (feels 28.6°C), scattered clouds, humidity 61%"));
        assert!(text.contains("[openweather, 30s ago]"));
        assert!(text.contains("! traffic: provider unreachable: connection refused (no data)"));
    }

    #[test]
    fn air_quality_lists_pollutants_with_their_unit() {
        let air = AirQualityRecord {
            aqi: 250,
            category: AqiCategory::from_aqi(250),
            dominant_pollutant: Some(Pollutant::Pm2_5),
            pollutants: [(Pollutant::Pm2_5, 212.7), (Pollutant::Pm10, 301.2)].into(),
            pollutant_unit: PollutantUnit::MicrogramsPerCubicMetre,
            station: None,
            observed_at: None,
        };

        assert_eq!(
            air_summary(&air),
            "AQI 250 (Very Unhealthy), dominant pm2_5; pm2_5 212.7, pm10 301.2 (µg/m³)"
        );
    }

    fn snapshot_text(snapshot: &Snapshot) -> String {
        super::snapshot(snapshot, now())
    }

    #[test]
    fn ages_are_coarse() {
        assert_eq!(age(now(), now()), "just now");
        assert_eq!(age(now() - TimeDelta::seconds(75), now()), "1m ago");
        assert_eq!(age(now() - TimeDelta::hours(3), now()), "3h ago");
        assert_eq!(age(now() + TimeDelta::seconds(10), now()), "just now");
    }

    #[test]
    fn city_table_lists_aliases() {
        let table = city_table(&[pune()]);
        assert!(table.starts_with("pune"));
        assert!(table.trim_end().ends_with("aka Poona"));
    }
}
