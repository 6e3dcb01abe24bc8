//! Connection state machine data.

use std::fmt;
use std::net::Ipv4Addr;
use tokio::time::Instant;

/// Lifecycle state of the wireless link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    #[default]
    Idle,
    /// Station connection attempt in progress.
    Connecting,
    /// Station link up with an assigned address.
    Connected,
    /// Retries exhausted; cooling down before AP fallback.
    Fail,
    /// Provisioning hotspot active.
    ApMode,
}

impl ConnectionState {
    /// All states, in numeric order.
    pub const ALL: [ConnectionState; 5] = [
        Self::Idle,
        Self::Connecting,
        Self::Connected,
        Self::Fail,
        Self::ApMode,
    ];

    /// Upper-case state name used in logs and status displays.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Fail => "FAIL",
            Self::ApMode => "AP_MODE",
        }
    }

    /// Stable numeric code (0 = IDLE .. 4 = AP_MODE).
    pub const fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Fail => 3,
            Self::ApMode => 4,
        }
    }

    /// Look up a state by numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Retry bookkeeping for station connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    attempt_count: u32,
    max_retries: u32,
    cooldown_deadline: Option<Instant>,
}

impl RetryContext {
    /// Create a context allowing `max_retries` attempts.
    pub fn new(max_retries: u32) -> Self {
        Self {
            attempt_count: 0,
            max_retries,
            cooldown_deadline: None,
        }
    }

    /// Attempts issued since the last reset.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Attempt budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a new attempt and return its 1-based number.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_count
    }

    /// Whether the attempt budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_retries
    }

    /// When the current cooldown ends, if one is running.
    pub fn cooldown_deadline(&self) -> Option<Instant> {
        self.cooldown_deadline
    }

    /// Start a cooldown ending at `deadline`.
    pub fn begin_cooldown(&mut self, deadline: Instant) {
        self.cooldown_deadline = Some(deadline);
    }

    /// Clear attempts and any cooldown.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.cooldown_deadline = None;
    }
}

/// The active provisioning hotspot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApSession {
    /// Hotspot SSID.
    pub ssid: String,
    /// Hotspot password (empty for an open hotspot).
    pub password: String,
    /// Hotspot address.
    pub ip: Ipv4Addr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Idle.name(), "IDLE");
        assert_eq!(ConnectionState::ApMode.name(), "AP_MODE");
        assert_eq!(ConnectionState::Fail.to_string(), "FAIL");
    }

    #[test]
    fn test_state_codes() {
        for state in ConnectionState::ALL {
            assert_eq!(ConnectionState::from_code(state.code()), Some(state));
        }
        assert_eq!(ConnectionState::from_code(5), None);
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn test_retry_budget() {
        let mut retry = RetryContext::new(3);
        assert!(!retry.is_exhausted());
        assert_eq!(retry.record_attempt(), 1);
        assert_eq!(retry.record_attempt(), 2);
        assert!(!retry.is_exhausted());
        assert_eq!(retry.record_attempt(), 3);
        assert!(retry.is_exhausted());

        retry.begin_cooldown(Instant::now() + Duration::from_secs(30));
        assert!(retry.cooldown_deadline().is_some());

        retry.reset();
        assert_eq!(retry.attempt_count(), 0);
        assert!(retry.cooldown_deadline().is_none());
        assert_eq!(retry.max_retries(), 3);
    }
}
