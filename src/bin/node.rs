//! Picore-W node binary.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin node` (simulated radio, real portal sockets)
//! - **ESP32**: `cargo espflash flash --bin node --features esp32 --release`
//!
//! `node reset` deletes the stored network configuration and restarts.
//!
//! ## Environment
//!
//! - `PICORE_CONFIG_PATH` - config file on host (default `~/.picore-w/wifi_config.json`)
//! - `PICORE_DNS_ADDR`, `PICORE_HTTP_ADDR` - portal bind addresses
//! - `PICORE_MAX_RETRIES`, `PICORE_AP_SSID`, `PICORE_AP_PASSWORD`, `PICORE_AP_IP`
//!   and the other `PICORE_*` policy overrides
//!
//! The default portal ports (53 and 80) need elevated privileges on most
//! hosts; set the bind addresses to unprivileged ports for local testing.

use log::{error, info, warn};
use picore_w::portal::{DnsResponder, HttpServer, DEFAULT_DNS_ADDR, DEFAULT_HTTP_ADDR};
use picore_w::{ConfigStore, Event, EventKind, ManagerConfig, WifiManager, WifiManagerBuilder};
use std::net::SocketAddr;

type BoxError = Box<dyn std::error::Error>;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Open the config store and radio for this platform.
#[cfg(feature = "esp32")]
fn open_platform(config: ManagerConfig) -> Result<(ConfigStore, WifiManagerBuilder), BoxError> {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use picore_w::network::EspRadio;
    use picore_w::store::NvsStorage;

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let store = ConfigStore::new(NvsStorage::new(nvs.clone())?);
    let radio = EspRadio::new(peripherals.modem, sysloop, Some(nvs))?;
    let builder = WifiManager::builder(config, radio.station(), radio.access_point(), store.clone());
    Ok((store, builder))
}

#[cfg(not(feature = "esp32"))]
fn open_platform(config: ManagerConfig) -> Result<(ConfigStore, WifiManagerBuilder), BoxError> {
    use picore_w::network::{HostAccessPoint, HostStation};
    use picore_w::store::FileStorage;
    use std::path::PathBuf;

    let path = match std::env::var("PICORE_CONFIG_PATH") {
        Ok(path) => PathBuf::from(path),
        Err(_) => FileStorage::default_path()?,
    };
    info!("Config file: {}", path.display());

    let store = ConfigStore::new(FileStorage::new(path));
    let builder = WifiManager::builder(
        config,
        HostStation::new(),
        HostAccessPoint::new(),
        store.clone(),
    );
    Ok((store, builder))
}

#[cfg(feature = "esp32")]
fn restart_device() {
    use picore_w::network::{EspRestart, Restart};
    EspRestart.restart();
}

#[cfg(not(feature = "esp32"))]
fn restart_device() {
    use picore_w::network::{ProcessRestart, Restart};
    ProcessRestart.restart();
}

/// Bind address from `key`, falling back to `default` when unset or invalid.
fn bind_addr(key: &str, default: SocketAddr) -> SocketAddr {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}: {:?}", key, value);
            default
        }),
        Err(_) => default,
    }
}

fn log_events(manager: &WifiManager) {
    manager.on(EventKind::StateChange, |event| {
        if let Event::StateChange { old, new } = event {
            info!("WiFi state {} -> {}", old, new);
        }
    });
    manager.on(EventKind::Connected, |event| {
        if let Event::Connected { ip } = event {
            info!("Online at {}", ip);
        }
    });
    manager.on(EventKind::Disconnected, |_| warn!("WiFi link down"));
    manager.on(EventKind::ApModeStarted, |event| {
        if let Event::ApModeStarted { ssid } = event {
            info!("Join {:?} to configure WiFi", ssid);
        }
    });
    manager.on(EventKind::ConnectionFailed, |event| {
        if let Event::ConnectionFailed { retry_count } = event {
            warn!("Could not connect after {} attempts", retry_count);
        }
    });
}

#[cfg(feature = "esp32")]
async fn wait_for_shutdown() {
    std::future::pending::<()>().await;
}

#[cfg(not(feature = "esp32"))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

async fn run() -> Result<(), BoxError> {
    let config = ManagerConfig::default().apply_overrides(|key| std::env::var(key).ok())?;
    let (store, builder) = open_platform(config)?;

    if std::env::args().nth(1).as_deref() == Some("reset") {
        if store.delete_config()? {
            info!("Stored network configuration deleted");
        } else {
            info!("No stored network configuration");
        }
        restart_device();
        return Ok(());
    }

    let manager = builder
        .dns(DnsResponder::new(bind_addr("PICORE_DNS_ADDR", DEFAULT_DNS_ADDR)))
        .http(HttpServer::new(bind_addr("PICORE_HTTP_ADDR", DEFAULT_HTTP_ADDR)))
        .build()?;
    log_events(&manager);
    manager.start();

    wait_for_shutdown().await;
    manager.stop().await;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Picore-W node starting ===");

    #[cfg(feature = "esp32")]
    info!("Platform: ESP32");
    #[cfg(not(feature = "esp32"))]
    info!("Platform: Host");

    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}
