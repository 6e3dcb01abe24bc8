//! WiFi configuration utility.
//!
//! Writes station credentials into the config store so the next `node` boot
//! connects without going through the provisioning portal.
//!
//! Usage (ESP32, credentials baked in at compile time):
//!   WIFI_SSID="MyNetwork" WIFI_PASSWORD="secret" cargo configure-wifi
//!
//! Usage (host, read at run time):
//!   WIFI_SSID="MyNetwork" WIFI_PASSWORD="secret" cargo run --bin configure-wifi
//!
//! For open networks leave `WIFI_PASSWORD` empty.

use picore_w::{ConfigStore, Credentials, CredentialsError};

/// WiFi SSID - set via WIFI_SSID environment variable at compile time.
#[cfg(feature = "esp32")]
const WIFI_SSID: Option<&str> = option_env!("WIFI_SSID");

/// WiFi password - set via WIFI_PASSWORD environment variable at compile time.
/// Empty string for open networks.
#[cfg(feature = "esp32")]
const WIFI_PASSWORD: Option<&str> = option_env!("WIFI_PASSWORD");

const USAGE: &str = "Usage:\n  \
     WIFI_SSID=\"MyNetwork\" WIFI_PASSWORD=\"secret\" cargo configure-wifi\n\n\
     For open networks:\n  \
     WIFI_SSID=\"OpenNetwork\" WIFI_PASSWORD=\"\" cargo configure-wifi";

/// Print error message and exit. On ESP32 we pause briefly first so the
/// serial monitor shows the output.
fn halt_with_error(msg: &str) -> ! {
    eprintln!("\n{}", msg);
    eprintln!("\n=== Configuration failed ===\n");
    #[cfg(feature = "esp32")]
    std::thread::sleep(std::time::Duration::from_secs(2));
    std::process::exit(1);
}

fn describe(e: &CredentialsError) -> String {
    match e {
        CredentialsError::SsidEmpty => "Error: SSID cannot be empty".to_string(),
        CredentialsError::SsidTooLong { len, max } => {
            format!("Error: SSID too long ({} bytes, max {})", len, max)
        }
        CredentialsError::PasswordTooShort { len, min } => {
            format!("Error: Password too short ({} bytes, min {} for WPA)", len, min)
        }
        CredentialsError::PasswordTooLong { len, max } => {
            format!("Error: Password too long ({} bytes, max {})", len, max)
        }
    }
}

#[cfg(feature = "esp32")]
fn credentials_source() -> (Option<String>, String) {
    (
        WIFI_SSID.map(str::to_string),
        WIFI_PASSWORD.unwrap_or("").to_string(),
    )
}

#[cfg(not(feature = "esp32"))]
fn credentials_source() -> (Option<String>, String) {
    (
        std::env::var("WIFI_SSID").ok(),
        std::env::var("WIFI_PASSWORD").unwrap_or_default(),
    )
}

#[cfg(feature = "esp32")]
fn open_store() -> ConfigStore {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    match picore_w::store::NvsStorage::take() {
        Ok(storage) => ConfigStore::new(storage),
        Err(e) => halt_with_error(&format!("Error initializing NVS: {:?}", e)),
    }
}

#[cfg(not(feature = "esp32"))]
fn open_store() -> ConfigStore {
    use picore_w::store::FileStorage;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let path = match std::env::var("PICORE_CONFIG_PATH") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => match FileStorage::default_path() {
            Ok(path) => path,
            Err(e) => halt_with_error(&format!("Error locating config file: {}", e)),
        },
    };
    println!("Config file: {}", path.display());
    ConfigStore::new(FileStorage::new(path))
}

fn main() {
    let store = open_store();

    println!("\n=== WiFi Configuration Utility ===\n");

    let (ssid, password) = credentials_source();
    let ssid = match ssid {
        Some(s) if !s.is_empty() => s,
        _ => halt_with_error(&format!("Error: WIFI_SSID is not set.\n\n{}", USAGE)),
    };

    println!("SSID: {}", ssid);
    println!(
        "Password: {} ({} chars)",
        if password.is_empty() { "(none)" } else { "****" },
        password.len()
    );

    if let Err(e) = Credentials::new(ssid.as_str(), password.as_str()) {
        halt_with_error(&describe(&e));
    }

    if let Err(e) = store.save_wifi_credentials(&ssid, &password) {
        halt_with_error(&format!("Error saving configuration: {}", e));
    }

    println!("\n=== WiFi configuration saved (version {}) ===", store.get_version());
    println!("\nThe node will use these credentials on its next boot.");

    #[cfg(feature = "esp32")]
    {
        println!("\n=== Done - you can disconnect the device ===\n");
        std::thread::sleep(std::time::Duration::from_secs(2));
    }
}
