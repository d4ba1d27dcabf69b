//! # Tide Light Application Entry Point
//!
//! This binary wires the tide core together: the event cache, the update scheduler,
//! the config-file bridge, the status reporter, and the text LED render loop.
//!
//! ## Usage
//! - `tide-light [CONFIG]`: run the daemon (default config: `tide-light.toml`)
//! - `tide-light --status [CONFIG]`: print one status report from the cache and exit
//! - `tide-light --set-location LAT,LON [CONFIG]`: update the configured location
//!   and exit; a running daemon picks the change up from the file

use anyhow::Context;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tide_light_lib::bridge::{ConfigBridge, FileConfigBridge};
use tide_light_lib::calculator::TideCalculator;
use tide_light_lib::config::{Config, CONFIG_FILE};
use tide_light_lib::event_store::EventStore;
use tide_light_lib::renderer::TextVisualizer;
use tide_light_lib::scheduler::{SchedulerConfig, UpdateScheduler};
use tide_light_lib::status::StatusReporter;
use tide_light_lib::tide_data::KartverketFetcher;
use tide_light_lib::Location;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

enum Mode {
    Run,
    Status,
    SetLocation(Location),
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (mode, config_path) = parse_args(env::args().skip(1))?;

    match mode {
        Mode::SetLocation(location) => {
            let bridge = FileConfigBridge::open(&config_path);
            bridge
                .update_location(location)
                .with_context(|| format!("writing {config_path}"))?;
            println!("Location set to {location} in {}", bridge.path().display());
            Ok(())
        }
        Mode::Status => {
            let config = Config::load_from_path(&config_path);
            let store = Arc::new(EventStore::open_read_only(&config.cache.path)?);
            let report = StatusReporter::new(store).snapshot();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Mode::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(config_path))
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<(Mode, String)> {
    let mut mode = Mode::Run;
    let mut config_path = CONFIG_FILE.to_string();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" => mode = Mode::Status,
            "--set-location" => {
                let value = args.next().context("--set-location needs LAT,LON")?;
                mode = Mode::SetLocation(parse_location(&value)?);
            }
            other => config_path = other.to_string(),
        }
    }
    Ok((mode, config_path))
}

fn parse_location(value: &str) -> anyhow::Result<Location> {
    let (lat, lon) = value
        .split_once(',')
        .with_context(|| format!("expected LAT,LON, got {value:?}"))?;
    let latitude: f64 = lat.trim().parse().context("latitude")?;
    let longitude: f64 = lon.trim().parse().context("longitude")?;
    anyhow::ensure!(
        (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude),
        "location {value:?} out of range"
    );
    Ok(Location::new(latitude, longitude))
}

async fn run(config_path: String) -> anyhow::Result<()> {
    info!("starting tide light");

    let bridge = Arc::new(FileConfigBridge::open(&config_path));
    let config = bridge.config();

    let store = Arc::new(
        EventStore::open(&config.cache.path)
            .with_context(|| format!("opening tide cache {}", config.cache.path))?,
    );
    let fetcher = Arc::new(KartverketFetcher::new(config.api.base_url.clone()));
    let calculator = TideCalculator::new(store.clone());

    let visualizer = Arc::new(TextVisualizer::new(
        config.display.led_count,
        Duration::from_millis(config.display.tick_ms.max(10)),
        Duration::from_millis(config.display.blink_ms.max(10)),
    ));

    let mut scheduler = UpdateScheduler::new(
        store.clone(),
        fetcher,
        SchedulerConfig::from(&config),
        bridge.current_location(),
    );
    scheduler.add_listener(visualizer.clone());
    let scheduler = scheduler.spawn();

    let commands = scheduler.commands();
    bridge.on_location_changed(Box::new(move |location| commands.location_changed(location)));
    let watcher = bridge.clone().watch(config.config_poll_interval());

    let status = StatusReporter::new(store.clone()).spawn(config.status_interval());
    let render = {
        let visualizer = visualizer.clone();
        tokio::spawn(async move { visualizer.run(calculator).await })
    };

    info!(
        location = %bridge.current_location(),
        leds = config.display.led_count,
        "system initialized"
    );

    let commands = scheduler.commands();
    let finished = scheduler.join();
    tokio::pin!(finished);

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down tide light");
            commands.shutdown();
            finished.await
        }
        result = &mut finished => result,
    };

    watcher.abort();
    status.abort();
    render.abort();

    if let Err(e) = &result {
        error!(error = %e, "tide scheduler stopped");
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn parses_set_location() {
        let (mode, path) = parse_args(args(&["--set-location", "51.5,-0.1", "cfg.toml"])).unwrap();
        assert!(matches!(mode, Mode::SetLocation(l) if l == Location::new(51.5, -0.1)));
        assert_eq!(path, "cfg.toml");
    }

    #[test]
    fn defaults_to_run_with_default_config() {
        let (mode, path) = parse_args(args(&[])).unwrap();
        assert!(matches!(mode, Mode::Run));
        assert_eq!(path, CONFIG_FILE);
    }

    #[test]
    fn rejects_bad_locations() {
        assert!(parse_location("59.9").is_err());
        assert!(parse_location("north,10").is_err());
        assert!(parse_location("91,10").is_err());
        assert!(parse_location(" 59.9 , 10.7 ").is_ok());
    }
}
