//! Connection manager configuration.
//!
//! # Components
//!
//! - [`credentials`] - Station credentials and validation (host-testable)
//! - [`ManagerConfig`] - Retry/cooldown policy and access-point settings
//!
//! All policy values have defaults and can be overridden at construction,
//! either directly or from `PICORE_*` environment variables via
//! [`ManagerConfig::apply_overrides`].

mod credentials;

pub use credentials::{
    validate_password, validate_ssid, Credentials, CredentialsError, MAX_PASSWORD_LEN,
    MAX_SSID_LEN, MIN_PASSWORD_LEN,
};

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Connection attempts before entering the fail state.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Time allowed for a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Cooldown in the fail state before falling back to AP mode.
pub const DEFAULT_FAIL_RECOVERY_DELAY: Duration = Duration::from_secs(30);

/// Link polling period while connected.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Provisioning hotspot SSID.
pub const DEFAULT_AP_SSID: &str = "Picore-W-Setup";

/// Provisioning hotspot password.
pub const DEFAULT_AP_PASSWORD: &str = "12345678";

/// Provisioning hotspot address.
pub const DEFAULT_AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

/// Upper bound for the access point to come up.
pub const DEFAULT_AP_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between a successful provisioning save and the restart, so the
/// success page reaches the client.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(3);

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Connection attempts before declaring failure.
    pub max_retries: u32,
    /// Bound on each individual connection attempt.
    pub connect_timeout: Duration,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Cooldown before the fail state falls back to AP mode.
    pub fail_recovery_delay: Duration,
    /// Polling period used to detect silent drops while connected.
    pub health_check_interval: Duration,
    /// Provisioning hotspot SSID.
    pub ap_ssid: String,
    /// Provisioning hotspot password (empty for an open hotspot).
    pub ap_password: String,
    /// Provisioning hotspot address, also the captive DNS answer.
    pub ap_ip: Ipv4Addr,
    /// Bound on access point bring-up.
    pub ap_activation_timeout: Duration,
    /// Delay between persisting new credentials and restarting.
    pub restart_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            fail_recovery_delay: DEFAULT_FAIL_RECOVERY_DELAY,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            ap_ssid: DEFAULT_AP_SSID.to_string(),
            ap_password: DEFAULT_AP_PASSWORD.to_string(),
            ap_ip: DEFAULT_AP_IP,
            ap_activation_timeout: DEFAULT_AP_ACTIVATION_TIMEOUT,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl ManagerConfig {
    /// Check the retry budget and the access point settings.
    ///
    /// At least one attempt is required. The hotspot SSID and password
    /// follow the same rules as station credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        validate_ssid(&self.ap_ssid).map_err(ConfigError::ApSsid)?;
        validate_password(&self.ap_password).map_err(ConfigError::ApPassword)?;
        Ok(())
    }

    /// Apply `PICORE_*` overrides from a variable lookup.
    ///
    /// Durations are given in whole seconds. Unset variables keep the
    /// current value.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PICORE_MAX_RETRIES") {
            self.max_retries = parse_number("PICORE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PICORE_CONNECT_TIMEOUT") {
            self.connect_timeout = parse_secs("PICORE_CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("PICORE_RETRY_DELAY") {
            self.retry_delay = parse_secs("PICORE_RETRY_DELAY", &v)?;
        }
        if let Some(v) = lookup("PICORE_FAIL_RECOVERY_DELAY") {
            self.fail_recovery_delay = parse_secs("PICORE_FAIL_RECOVERY_DELAY", &v)?;
        }
        if let Some(v) = lookup("PICORE_HEALTH_CHECK_INTERVAL") {
            self.health_check_interval = parse_secs("PICORE_HEALTH_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("PICORE_AP_SSID") {
            self.ap_ssid = v;
        }
        if let Some(v) = lookup("PICORE_AP_PASSWORD") {
            self.ap_password = v;
        }
        if let Some(v) = lookup("PICORE_AP_IP") {
            self.ap_ip = parse_ipv4(&v)?;
        }
        self.validate()?;
        Ok(self)
    }
}

/// Parse a dotted-quad IPv4 address.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, ConfigError> {
    s.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidIp(s.to_string()))
}

fn parse_number(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_number(key, value).map(|secs| Duration::from_secs(u64::from(secs)))
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Access point SSID is invalid.
    ApSsid(CredentialsError),
    /// Access point password is invalid.
    ApPassword(CredentialsError),
    /// Not a valid IPv4 address.
    InvalidIp(String),
    /// A numeric override could not be parsed.
    InvalidValue { key: &'static str, value: String },
    /// `max_retries` is zero.
    NoRetries,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApSsid(e) => write!(f, "invalid AP SSID: {}", e),
            Self::ApPassword(e) => write!(f, "invalid AP password: {}", e),
            Self::InvalidIp(ip) => write!(f, "invalid IPv4 address: {:?}", ip),
            Self::InvalidValue { key, value } => {
                write!(f, "invalid value for {}: {:?}", key, value)
            }
            Self::NoRetries => write!(f, "max_retries must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ApSsid(e) | Self::ApPassword(e) => Some(e),
            _ => None,
        }
    }
}
