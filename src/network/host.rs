//! Host radio implementations.
//!
//! On host systems the OS handles networking, so these are thin stand-ins
//! that let the connection lifecycle and the captive portal run on a
//! development machine.

use super::{AccessPoint, ApSettings, LinkStatus, NetworkError, Restart, Station};
use crate::config::Credentials;
use log::info;
use std::net::{IpAddr, Ipv4Addr};

/// Station backed by the host's own connectivity.
///
/// Any credentials "connect" immediately; the reported address is the
/// host's primary local IPv4 address.
#[derive(Debug, Default)]
pub struct HostStation {
    ip_addr: Option<Ipv4Addr>,
}

impl HostStation {
    /// Create a disconnected host station.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary local IP address.
    ///
    /// This uses a trick: create a UDP socket and "connect" to a public IP
    /// (doesn't actually send anything), then check which local address was chosen.
    fn detect_local_ip() -> Option<Ipv4Addr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }
}

impl Station for HostStation {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        let ip = Self::detect_local_ip().unwrap_or(Ipv4Addr::LOCALHOST);
        info!(
            "Host network ready for {:?}, local IP: {}",
            credentials.ssid(),
            ip
        );
        self.ip_addr = Some(ip);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), NetworkError> {
        self.ip_addr = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ip_addr.is_some()
    }

    fn status(&self) -> LinkStatus {
        if self.ip_addr.is_some() {
            LinkStatus::GotIp
        } else {
            LinkStatus::Idle
        }
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.ip_addr
    }
}

/// Simulated hotspot.
///
/// Activation only records the settings; the portal services bind to
/// whatever addresses they are configured with.
#[derive(Debug, Default)]
pub struct HostAccessPoint {
    active: Option<Ipv4Addr>,
}

impl HostAccessPoint {
    /// Create an inactive access point.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccessPoint for HostAccessPoint {
    fn activate(&mut self, settings: &ApSettings) -> Result<(), NetworkError> {
        info!(
            "Host access point {:?} simulated at {}",
            settings.ssid, settings.ip
        );
        self.active = Some(settings.ip);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn deactivate(&mut self) -> Result<(), NetworkError> {
        self.active = None;
        Ok(())
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.active
    }
}

/// Restart by exiting the process, leaving the relaunch to a supervisor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRestart;

impl Restart for ProcessRestart {
    fn restart(&self) {
        info!("Restarting: exiting process");
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_station_connects_immediately() {
        let mut station = HostStation::new();
        assert!(!station.is_connected());
        assert_eq!(station.status(), LinkStatus::Idle);

        let creds = Credentials::new("Home", "hunter22").unwrap();
        station.begin_connect(&creds).unwrap();
        assert!(station.is_connected());
        assert_eq!(station.status(), LinkStatus::GotIp);
        // IP detection might fall back to loopback in CI environments
        assert!(station.ip_addr().is_some());

        station.disconnect().unwrap();
        assert!(!station.is_connected());
        assert_eq!(station.ip_addr(), None);
    }

    #[test]
    fn test_host_access_point() {
        let mut ap = HostAccessPoint::new();
        assert!(!ap.is_active());
        ap.activate(&ApSettings {
            ssid: "Setup".into(),
            password: String::new(),
            ip: Ipv4Addr::new(192, 168, 4, 1),
        })
        .unwrap();
        assert!(ap.is_active());
        assert_eq!(ap.ip_addr(), Some(Ipv4Addr::new(192, 168, 4, 1)));
        ap.deactivate().unwrap();
        assert!(!ap.is_active());
    }

    #[test]
    fn test_detect_local_ip() {
        // May be None in air-gapped environments; must not panic
        let _ = HostStation::detect_local_ip();
    }
}
