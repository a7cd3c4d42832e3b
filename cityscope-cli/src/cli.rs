use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use cityscope_core::{
    Aggregator, Backend, Config, ProviderKind, ResolutionError, SnapshotStore, refresh,
};
use inquire::{Password, PasswordDisplayMode, Select};

use crate::render;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "cityscope", version, about = "Traffic, air quality and weather per city")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure the backend and credentials for a provider kind.
    Configure {
        /// Provider kind: "traffic", "air_quality" or "weather".
        kind: String,
    },

    /// Show the current snapshot for a city.
    Snapshot {
        /// City name, alias or id.
        city: String,

        /// Print the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Refresh cities on an interval until interrupted.
    Watch {
        /// Seconds between refreshes; defaults to the configured interval.
        #[arg(long)]
        interval: Option<u64>,

        /// Cities to watch; defaults to every monitored city.
        cities: Vec<String>,
    },

    /// List the monitored cities.
    Cities,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure { kind } => configure(&kind),
            Command::Snapshot { city, json } => snapshot(&city, json).await,
            Command::Watch { interval, cities } => watch(interval, cities).await,
            Command::Cities => list_cities(),
        }
    }
}

fn configure(kind: &str) -> anyhow::Result<()> {
    let kind = ProviderKind::try_from(kind)?;
    let mut config = Config::load()?;

    let backends: Vec<Backend> = Backend::for_kind(kind).collect();
    let current = config.backend(kind)?;
    let starting = backends.iter().position(|b| *b == current).unwrap_or(0);
    let backend = Select::new(&format!("Backend for {kind}:"), backends)
        .with_starting_cursor(starting)
        .prompt()?;

    let api_key = Password::new(&format!("API key for {backend} ({}):", backend.api_key_env()))
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()?;
    let api_key = api_key.trim().to_string();
    if api_key.is_empty() {
        return Err(anyhow!("API key must not be empty"));
    }

    config.upsert_provider_api_key(kind, Some(backend), api_key);
    config.save()?;

    println!("Saved {backend} credentials to {}", Config::config_file_path()?.display());
    Ok(())
}

async fn snapshot(city: &str, json: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let aggregator = Aggregator::from_config(&config)?;

    let snapshot = aggregator.get_snapshot(city).await.map_err(resolution_hint)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render::snapshot(&snapshot, chrono::Utc::now()));
    }
    Ok(())
}

async fn watch(interval: Option<u64>, cities: Vec<String>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let aggregator = Arc::new(Aggregator::from_config(&config)?);

    let names = if cities.is_empty() {
        aggregator.resolver().catalogue().iter().map(|c| c.id.clone()).collect()
    } else {
        cities
    };
    let period =
        Duration::from_secs(interval.unwrap_or(config.aggregator.refresh_interval_secs).max(1));

    let store = SnapshotStore::new();
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    refresh::run(aggregator, names, period, &store, shutdown, |report| {
        let now = chrono::Utc::now();
        for id in &report.refreshed {
            if let Some(snapshot) = store.latest(id) {
                println!("{}", render::snapshot(&snapshot, now));
            }
        }
        for (name, err) in &report.failed {
            eprintln!("{name}: {err}");
        }
    })
    .await;

    Ok(())
}

fn list_cities() -> anyhow::Result<()> {
    let config = Config::load()?;
    let cities = config.monitored_cities().context("Invalid city catalogue")?;
    print!("{}", render::city_table(&cities));
    Ok(())
}

fn resolution_hint(err: ResolutionError) -> anyhow::Error {
    let hint = match &err {
        ResolutionError::UnknownCity(_) => Some("run `cityscope cities` to list the monitored cities"),
        ResolutionError::AmbiguousCity { .. } => Some("use one of the listed names or a city id"),
        ResolutionError::GeocoderUnavailable(_) => None,
    };

    match hint {
        Some(hint) => anyhow!("{err}\nHint: {hint}."),
        None => anyhow!(err),
    }
}
