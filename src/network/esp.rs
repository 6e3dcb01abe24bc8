//! ESP32 radio over the ESP-IDF WiFi driver.
//!
//! One [`EspRadio`] owns the driver; [`EspStation`] and [`EspAccessPoint`]
//! are handles onto it for the two roles. The driver calls used here do
//! not block: connection progress is observed by polling.

use super::{AccessPoint, ApSettings, LinkStatus, NetworkError, Restart, Station};
use crate::config::Credentials;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::ipv4::{
    Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet,
};
use esp_idf_svc::netif::{EspNetif, NetifConfiguration};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
};
use log::{info, warn};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Provisioning hotspot channel.
const AP_CHANNEL: u8 = 1;

type SharedWifi = Arc<Mutex<EspWifi<'static>>>;

fn lock(wifi: &SharedWifi) -> MutexGuard<'_, EspWifi<'static>> {
    wifi.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The WiFi driver, shared by the station and access point handles.
pub struct EspRadio {
    wifi: SharedWifi,
}

impl EspRadio {
    /// Create the WiFi driver.
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> Result<Self, NetworkError> {
        let wifi = EspWifi::new(modem, sysloop, nvs)?;
        Ok(Self {
            wifi: Arc::new(Mutex::new(wifi)),
        })
    }

    /// Station-role handle.
    pub fn station(&self) -> EspStation {
        EspStation {
            wifi: self.wifi.clone(),
        }
    }

    /// Access-point-role handle.
    pub fn access_point(&self) -> EspAccessPoint {
        EspAccessPoint {
            wifi: self.wifi.clone(),
            active: false,
        }
    }
}

/// Station handle onto [`EspRadio`].
pub struct EspStation {
    wifi: SharedWifi,
}

impl Station for EspStation {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        info!("Connecting to WiFi: {}", credentials.ssid());

        let auth_method = if credentials.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let config = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid()
                .try_into()
                .map_err(|_| NetworkError::InvalidSsid)?,
            password: credentials
                .password()
                .try_into()
                .map_err(|_| NetworkError::InvalidPassword)?,
            auth_method,
            ..Default::default()
        });

        let mut wifi = lock(&self.wifi);
        wifi.set_configuration(&config)?;
        if !wifi.is_started()? {
            wifi.start()?;
        }
        wifi.connect()?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), NetworkError> {
        let mut wifi = lock(&self.wifi);
        if wifi.is_connected()? {
            info!("Disconnecting from WiFi");
            wifi.disconnect()?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let wifi = lock(&self.wifi);
        wifi.is_connected().unwrap_or(false) && wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn status(&self) -> LinkStatus {
        let wifi = lock(&self.wifi);
        if !wifi.is_started().unwrap_or(false) {
            return LinkStatus::Idle;
        }
        if wifi.is_connected().unwrap_or(false) && wifi.sta_netif().is_up().unwrap_or(false) {
            LinkStatus::GotIp
        } else {
            LinkStatus::Connecting
        }
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        if !self.is_connected() {
            return None;
        }
        let wifi = lock(&self.wifi);
        wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }
}

/// Access point handle onto [`EspRadio`].
pub struct EspAccessPoint {
    wifi: SharedWifi,
    active: bool,
}

impl EspAccessPoint {
    fn router_netif(ip: Ipv4Addr) -> Result<EspNetif, NetworkError> {
        let mut conf = NetifConfiguration::wifi_default_router();
        conf.ip_configuration = Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway: ip,
                mask: Mask(24),
            },
            dhcp_enabled: true,
            dns: Some(ip),
            secondary_dns: None,
        }));
        Ok(EspNetif::new_with_conf(&conf)?)
    }
}

impl AccessPoint for EspAccessPoint {
    fn activate(&mut self, settings: &ApSettings) -> Result<(), NetworkError> {
        let auth_method = if settings.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let config = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: settings
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| NetworkError::InvalidSsid)?,
            password: settings
                .password
                .as_str()
                .try_into()
                .map_err(|_| NetworkError::InvalidPassword)?,
            auth_method,
            channel: AP_CHANNEL,
            ..Default::default()
        });

        let netif = Self::router_netif(settings.ip)?;

        let mut wifi = lock(&self.wifi);
        if wifi.is_started()? {
            wifi.stop()?;
        }
        wifi.swap_netif_ap(netif)?;
        wifi.set_configuration(&config)?;
        wifi.start()?;
        self.active = true;

        info!("Access point {:?} starting at {}", settings.ssid, settings.ip);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active && lock(&self.wifi).ap_netif().is_up().unwrap_or(false)
    }

    fn deactivate(&mut self) -> Result<(), NetworkError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let mut wifi = lock(&self.wifi);
        if let Err(e) = wifi.stop() {
            warn!("Failed to stop access point: {:?}", e);
            return Err(e.into());
        }
        info!("Access point stopped");
        Ok(())
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        if !self.active {
            return None;
        }
        lock(&self.wifi)
            .ap_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
    }
}

/// Reset the chip.
#[derive(Debug, Default, Clone, Copy)]
pub struct EspRestart;

impl Restart for EspRestart {
    fn restart(&self) {
        info!("Restarting device");
        esp_idf_hal::reset::restart();
    }
}
