//! Radio abstraction layer.
//!
//! The connection manager drives the radio through three capabilities:
//! - [`Station`]: joins an existing network
//! - [`AccessPoint`]: hosts the provisioning hotspot
//! - [`Restart`]: resets the device after provisioning
//!
//! Implementations exist for:
//! - **ESP32** (`esp32` feature): [`EspRadio`] over the ESP-IDF WiFi driver
//! - **Host**: [`HostStation`], [`HostAccessPoint`] and [`ProcessRestart`],
//!   which let the whole lifecycle run on a development machine
//!
//! # Example
//!
//! ```ignore
//! use picore_w::network::{AccessPoint, Station};
//!
//! // Platform-specific initialization
//! #[cfg(feature = "esp32")]
//! let radio = network::EspRadio::new(modem, sysloop, nvs)?;
//! #[cfg(feature = "esp32")]
//! let (station, ap) = (radio.station(), radio.access_point());
//!
//! #[cfg(not(feature = "esp32"))]
//! let (station, ap) = (network::HostStation::new(), network::HostAccessPoint::new());
//! ```

use crate::config::Credentials;
use std::fmt;
use std::net::Ipv4Addr;

#[cfg(feature = "esp32")]
mod esp;
mod host;

#[cfg(feature = "esp32")]
pub use esp::{EspAccessPoint, EspRadio, EspRestart, EspStation};
pub use host::{HostAccessPoint, HostStation, ProcessRestart};

/// Link-layer status reported by a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Not connected and not trying.
    Idle,
    /// Association or DHCP in progress.
    Connecting,
    /// Associated with an address assigned.
    GotIp,
    /// Authentication rejected.
    WrongPassword,
    /// Network not found.
    NoApFound,
    /// Any other link failure.
    ConnectFailed,
}

impl LinkStatus {
    /// Whether this status ends a connection attempt early.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::WrongPassword | Self::NoApFound | Self::ConnectFailed
        )
    }
}

/// Station-mode radio.
///
/// `begin_connect` must return promptly; the caller polls [`status`] and
/// [`is_connected`] to follow the attempt.
///
/// [`status`]: Station::status
/// [`is_connected`]: Station::is_connected
pub trait Station: Send {
    /// Start joining the network described by `credentials`.
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError>;

    /// Leave the network and stop association attempts.
    fn disconnect(&mut self) -> Result<(), NetworkError>;

    /// Whether the link is up with an address.
    fn is_connected(&self) -> bool;

    /// Current link status.
    fn status(&self) -> LinkStatus;

    /// Assigned address while connected.
    fn ip_addr(&self) -> Option<Ipv4Addr>;
}

/// Hotspot parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct ApSettings {
    pub ssid: String,
    /// Empty for an open hotspot.
    pub password: String,
    pub ip: Ipv4Addr,
}

impl fmt::Debug for ApSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApSettings")
            .field("ssid", &self.ssid)
            .field("open", &self.password.is_empty())
            .field("ip", &self.ip)
            .finish()
    }
}

/// Access-point-mode radio.
pub trait AccessPoint: Send {
    /// Bring up the hotspot. May return before it is fully active; the
    /// caller polls [`AccessPoint::is_active`].
    fn activate(&mut self, settings: &ApSettings) -> Result<(), NetworkError>;

    /// Whether the hotspot is up.
    fn is_active(&self) -> bool;

    /// Take the hotspot down.
    fn deactivate(&mut self) -> Result<(), NetworkError>;

    /// Hotspot address while active.
    fn ip_addr(&self) -> Option<Ipv4Addr>;
}

/// Full device reset.
pub trait Restart: Send + Sync {
    /// Reset the device. Implementations normally do not return.
    fn restart(&self);
}

/// Radio errors.
#[derive(Debug)]
pub enum NetworkError {
    /// SSID rejected by the driver.
    InvalidSsid,
    /// Password rejected by the driver.
    InvalidPassword,
    /// ESP-IDF driver error.
    #[cfg(feature = "esp32")]
    Esp(esp_idf_sys::EspError),
    /// Generic I/O error.
    Io(std::io::Error),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "invalid SSID"),
            Self::InvalidPassword => write!(f, "invalid password"),
            #[cfg(feature = "esp32")]
            Self::Esp(e) => write!(f, "ESP error: {:?}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "esp32")]
            Self::Esp(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for NetworkError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Esp(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_statuses() {
        assert!(LinkStatus::WrongPassword.is_failure());
        assert!(LinkStatus::NoApFound.is_failure());
        assert!(LinkStatus::ConnectFailed.is_failure());
        assert!(!LinkStatus::Connecting.is_failure());
        assert!(!LinkStatus::GotIp.is_failure());
        assert!(!LinkStatus::Idle.is_failure());
    }

    #[test]
    fn test_ap_settings_debug_hides_password() {
        let settings = ApSettings {
            ssid: "Setup".into(),
            password: "12345678".into(),
            ip: Ipv4Addr::new(192, 168, 4, 1),
        };
        let debug = format!("{:?}", settings);
        assert!(debug.contains("Setup"));
        assert!(!debug.contains("12345678"));
    }
}
