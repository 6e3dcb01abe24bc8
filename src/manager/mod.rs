//! WiFi connection manager.
//!
//! [`WifiManager`] keeps the device online. On start it loads stored
//! credentials and joins the network, retrying with a bounded budget. When
//! the budget is spent it cools down in `FAIL` and then opens the
//! provisioning hotspot with a captive portal. A successful submission is
//! persisted and the device restarts into the new configuration.
//!
//! ```text
//!            credentials             link up
//!   IDLE ───────────────► CONNECTING ───────► CONNECTED
//!     │                     │    ▲                │
//!     │ none                │    └── link lost ───┘
//!     │          exhausted  ▼
//!     │                    FAIL ── cooldown ──┐
//!     ▼                                       ▼
//!   AP_MODE ◄─────────────────────────────────┘
//!     │ credentials saved
//!     ▼
//!   restart
//! ```
//!
//! All radio and portal work happens on one lifecycle task spawned by
//! [`WifiManager::start`]. The handle only publishes status and forwards
//! commands, so its accessors never block on I/O.
//!
//! # Example
//!
//! ```ignore
//! let manager = WifiManager::builder(config, station, ap, store).build()?;
//! manager.on(EventKind::Connected, |event| info!("{:?}", event));
//! manager.start();
//! ```

mod driver;

use crate::config::{ConfigError, Credentials, ManagerConfig};
use crate::events::{Event, EventBus, EventKind, SubscriptionId};
use crate::network::{AccessPoint, NetworkError, Restart, Station};
use crate::portal::{DnsResponder, DnsService, HttpServer, HttpService, PortalError};
use crate::state::{ApSession, ConnectionState, RetryContext};
use crate::store::ConfigStore;
use driver::{Command, Driver};
use log::warn;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Status published by the lifecycle task.
#[derive(Debug, Default)]
struct Status {
    state: ConnectionState,
    attempts: u32,
    station_ip: Option<Ipv4Addr>,
    session: Option<ApSession>,
}

/// State shared between the handle and the lifecycle task.
#[derive(Debug, Default)]
struct Shared {
    status: Mutex<Status>,
    events: EventBus,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the connection manager.
pub struct WifiManager {
    config: ManagerConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<(Driver, mpsc::UnboundedReceiver<Command>)>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WifiManager {
    /// Start building a manager over the given radio and store.
    pub fn builder(
        config: ManagerConfig,
        station: impl Station + 'static,
        ap: impl AccessPoint + 'static,
        store: ConfigStore,
    ) -> WifiManagerBuilder {
        WifiManagerBuilder {
            config,
            station: Box::new(station),
            ap: Box::new(ap),
            store,
            dns: None,
            http: None,
            restart: None,
        }
    }

    /// Spawn the lifecycle task. Later calls are no-ops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((driver, commands)) = pending else {
            return;
        };
        let handle = tokio::spawn(driver.run(commands, self.cancel.clone()));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Whether the lifecycle task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the lifecycle task and tear down the radio and portal.
    ///
    /// A restart scheduled by provisioning is abandoned; the saved
    /// credentials still apply on the next boot.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Lifecycle task ended abnormally: {}", e);
            }
        }
    }

    /// Abandon any attempt and open the provisioning hotspot.
    ///
    /// If activation fails the manager moves to `FAIL` and retries after
    /// the cooldown.
    pub async fn enter_ap_mode(&self) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::EnterApMode(tx))?;
        rx.await.map_err(|_| ManagerError::NotRunning)?
    }

    /// Join a network with explicit credentials and a fresh retry budget.
    ///
    /// The credentials are not persisted.
    pub async fn connect(&self, credentials: Credentials) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Connect(credentials, tx))?;
        rx.await.map_err(|_| ManagerError::NotRunning)?
    }

    /// Leave the network and any AP session, returning to `IDLE`.
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Disconnect(tx))?;
        rx.await.map_err(|_| ManagerError::NotRunning)?
    }

    fn send(&self, command: Command) -> Result<(), ManagerError> {
        if !self.is_running() {
            return Err(ManagerError::NotRunning);
        }
        self.commands
            .send(command)
            .map_err(|_| ManagerError::NotRunning)
    }

    // ===== Status =====

    /// Current state.
    pub fn get_status(&self) -> ConnectionState {
        self.shared.status().state
    }

    /// Current state name, e.g. `"AP_MODE"`.
    pub fn get_status_name(&self) -> &'static str {
        self.get_status().name()
    }

    pub fn is_connected(&self) -> bool {
        self.get_status() == ConnectionState::Connected
    }

    pub fn is_ap_mode(&self) -> bool {
        self.get_status() == ConnectionState::ApMode
    }

    /// Hotspot details while in `AP_MODE`.
    pub fn get_ap_config(&self) -> Option<ApSession> {
        self.shared.status().session.clone()
    }

    /// Station address while connected.
    pub fn station_ip(&self) -> Option<Ipv4Addr> {
        self.shared.status().station_ip
    }

    /// Attempts made in the current connection cycle.
    pub fn retry_count(&self) -> u32 {
        self.shared.status().attempts
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ===== Events =====

    /// Subscribe to an event kind. Callbacks run on the lifecycle task.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, callback)
    }

    /// Remove one subscription.
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.shared.events.off(kind, id)
    }

    /// Remove every subscription for an event kind.
    pub fn off_all(&self, kind: EventKind) -> usize {
        self.shared.events.off_all(kind)
    }
}

impl Drop for WifiManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for WifiManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.status();
        f.debug_struct("WifiManager")
            .field("state", &status.state)
            .field("attempts", &status.attempts)
            .field("station_ip", &status.station_ip)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WifiManager`].
///
/// DNS and HTTP default to [`DnsResponder`] and [`HttpServer`] on their
/// standard ports; the restart hook defaults to the platform reset.
pub struct WifiManagerBuilder {
    config: ManagerConfig,
    station: Box<dyn Station>,
    ap: Box<dyn AccessPoint>,
    store: ConfigStore,
    dns: Option<Box<dyn DnsService>>,
    http: Option<Box<dyn HttpService>>,
    restart: Option<Arc<dyn Restart>>,
}

impl WifiManagerBuilder {
    pub fn dns(mut self, dns: impl DnsService + 'static) -> Self {
        self.dns = Some(Box::new(dns));
        self
    }

    pub fn http(mut self, http: impl HttpService + 'static) -> Self {
        self.http = Some(Box::new(http));
        self
    }

    pub fn restart(mut self, restart: impl Restart + 'static) -> Self {
        self.restart = Some(Arc::new(restart));
        self
    }

    /// Validate the configuration and assemble the manager.
    pub fn build(self) -> Result<WifiManager, ManagerError> {
        self.config.validate()?;

        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            config: self.config.clone(),
            shared: shared.clone(),
            station: self.station,
            ap: self.ap,
            store: self.store,
            dns: self
                .dns
                .unwrap_or_else(|| Box::new(DnsResponder::default())),
            http: self
                .http
                .unwrap_or_else(|| Box::new(HttpServer::default())),
            restart: self.restart.unwrap_or_else(default_restart),
            retry: RetryContext::new(self.config.max_retries),
            state: ConnectionState::Idle,
            credentials: None,
            session: None,
            saved_rx: None,
            restart_at: None,
            boot_pending: true,
        };

        Ok(WifiManager {
            config: self.config,
            shared,
            commands,
            pending: Mutex::new(Some((driver, command_rx))),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }
}

#[cfg(feature = "esp32")]
fn default_restart() -> Arc<dyn Restart> {
    Arc::new(crate::network::EspRestart)
}

#[cfg(not(feature = "esp32"))]
fn default_restart() -> Arc<dyn Restart> {
    Arc::new(crate::network::ProcessRestart)
}

/// Connection manager errors.
#[derive(Debug)]
pub enum ManagerError {
    /// The hotspot did not come up in time.
    ApActivationTimeout(Duration),
    /// Radio error.
    Network(NetworkError),
    /// Portal service error.
    Portal(PortalError),
    /// Invalid configuration.
    Config(ConfigError),
    /// The lifecycle task is not running.
    NotRunning,
    /// New credentials were saved and the device is about to restart.
    Restarting,
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApActivationTimeout(t) => {
                write!(f, "access point not active after {:?}", t)
            }
            Self::Network(e) => write!(f, "network error: {}", e),
            Self::Portal(e) => write!(f, "portal error: {}", e),
            Self::Config(e) => write!(f, "config error: {}", e),
            Self::NotRunning => write!(f, "connection manager is not running"),
            Self::Restarting => write!(f, "restart pending after provisioning"),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Network(e) => Some(e),
            Self::Portal(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NetworkError> for ManagerError {
    fn from(e: NetworkError) -> Self {
        Self::Network(e)
    }
}

impl From<PortalError> for ManagerError {
    fn from(e: PortalError) -> Self {
        Self::Portal(e)
    }
}

impl From<ConfigError> for ManagerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
