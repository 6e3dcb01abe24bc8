//! The lifecycle task.
//!
//! The driver owns the radio, the portal services and the retry context.
//! Each loop iteration races the current state's step against incoming
//! commands and cancellation; a step that loses the race is dropped at its
//! suspension point, so an abandoned connection attempt can never emit
//! events later.
//!
//! Once provisioning has saved new credentials the only way forward is the
//! restart: its deadline is kept on the driver, so a command arriving in
//! between is refused instead of dropping it.

use super::{ManagerError, Shared};
use crate::config::{Credentials, ManagerConfig};
use crate::events::Event;
use crate::network::{AccessPoint, ApSettings, Restart, Station};
use crate::portal::{DnsService, HttpService, ProvisioningHandler};
use crate::state::{ApSession, ConnectionState, RetryContext};
use crate::store::ConfigStore;
use log::{debug, error, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Link status polling period during a connection attempt.
pub(super) const LINK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Polling period while waiting for the access point to come up.
const AP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Requests from [`WifiManager`](super::WifiManager) handles.
pub(super) enum Command {
    EnterApMode(oneshot::Sender<Result<(), ManagerError>>),
    Connect(Credentials, oneshot::Sender<Result<(), ManagerError>>),
    Disconnect(oneshot::Sender<Result<(), ManagerError>>),
}

/// What the loop does after a step.
enum Flow {
    Continue,
    Finished,
}

pub(super) struct Driver {
    pub(super) config: ManagerConfig,
    pub(super) shared: Arc<Shared>,
    pub(super) station: Box<dyn Station>,
    pub(super) ap: Box<dyn AccessPoint>,
    pub(super) store: ConfigStore,
    pub(super) dns: Box<dyn DnsService>,
    pub(super) http: Box<dyn HttpService>,
    pub(super) restart: Arc<dyn Restart>,
    pub(super) retry: RetryContext,
    pub(super) state: ConnectionState,
    pub(super) credentials: Option<Credentials>,
    pub(super) session: Option<ApSession>,
    pub(super) saved_rx: Option<mpsc::UnboundedReceiver<String>>,
    pub(super) restart_at: Option<Instant>,
    pub(super) boot_pending: bool,
}

impl Driver {
    /// Run until cancelled or until provisioning hands over to a restart.
    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        info!("Connection manager started");
        loop {
            let flow = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command).await;
                    Flow::Continue
                }
                flow = self.step() => flow,
            };
            if let Flow::Finished = flow {
                debug!("Lifecycle task finished");
                return;
            }
        }
    }

    async fn step(&mut self) -> Flow {
        if let Some(deadline) = self.restart_at {
            return self.step_restart(deadline).await;
        }
        match self.state {
            ConnectionState::Idle => self.step_idle().await,
            ConnectionState::Connecting => self.step_connecting().await,
            ConnectionState::Connected => self.step_connected().await,
            ConnectionState::Fail => self.step_fail().await,
            ConnectionState::ApMode => self.step_ap_mode().await,
        }
    }

    // ===== State steps =====

    async fn step_idle(&mut self) -> Flow {
        if !self.boot_pending {
            std::future::pending::<()>().await;
        }
        self.boot_pending = false;

        match self.store.get_wifi_credentials() {
            Some(creds) => {
                info!("Found stored credentials for {:?}", creds.ssid());
                self.credentials = Some(creds);
                self.retry.reset();
                self.transition(ConnectionState::Connecting);
            }
            None => {
                info!("No stored credentials, starting provisioning");
                // Failure falls back to Fail and its cooldown
                let _ = self.activate_ap().await;
            }
        }
        Flow::Continue
    }

    async fn step_connecting(&mut self) -> Flow {
        let creds = match self.credentials.clone() {
            Some(creds) => creds,
            None => match self.store.get_wifi_credentials() {
                Some(creds) => {
                    self.credentials = Some(creds.clone());
                    creds
                }
                None => {
                    warn!("No credentials to connect with");
                    let _ = self.activate_ap().await;
                    return Flow::Continue;
                }
            },
        };

        let attempt = self.retry.record_attempt();
        self.publish_attempts();
        info!(
            "Connecting to {:?} (attempt {}/{})",
            creds.ssid(),
            attempt,
            self.retry.max_retries()
        );

        let linked = match self.station.begin_connect(&creds) {
            Ok(()) => self.wait_for_link().await,
            Err(e) => {
                warn!("Connect call failed: {}", e);
                false
            }
        };

        if linked {
            self.retry.reset();
            self.publish_attempts();
            self.transition(ConnectionState::Connected);
            return Flow::Continue;
        }

        if let Err(e) = self.station.disconnect() {
            debug!("Disconnect after failed attempt: {}", e);
        }

        if self.retry.is_exhausted() {
            warn!("Connection failed after {} attempts", self.retry.attempt_count());
            self.retry
                .begin_cooldown(Instant::now() + self.config.fail_recovery_delay);
            self.transition(ConnectionState::Fail);
        } else {
            sleep(self.config.retry_delay).await;
        }
        Flow::Continue
    }

    async fn step_connected(&mut self) -> Flow {
        sleep(self.config.health_check_interval).await;
        if !self.station.is_connected() {
            warn!("WiFi link lost, reconnecting");
            if let Err(e) = self.station.disconnect() {
                debug!("Disconnect after link loss: {}", e);
            }
            self.retry.reset();
            self.publish_attempts();
            self.transition(ConnectionState::Connecting);
        }
        Flow::Continue
    }

    async fn step_fail(&mut self) -> Flow {
        let deadline = match self.retry.cooldown_deadline() {
            Some(deadline) => deadline,
            None => {
                let deadline = Instant::now() + self.config.fail_recovery_delay;
                self.retry.begin_cooldown(deadline);
                deadline
            }
        };
        sleep_until(deadline).await;

        info!("Cooldown elapsed, falling back to AP mode");
        self.retry.reset();
        self.publish_attempts();
        let _ = self.activate_ap().await;
        Flow::Continue
    }

    async fn step_ap_mode(&mut self) -> Flow {
        let saved = match self.saved_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };
        match saved {
            Some(ssid) => {
                info!(
                    "Credentials for {:?} saved, restarting in {:?}",
                    ssid, self.config.restart_delay
                );
                self.restart_at = Some(Instant::now() + self.config.restart_delay);
                Flow::Continue
            }
            None => {
                self.saved_rx = None;
                std::future::pending::<()>().await;
                Flow::Continue
            }
        }
    }

    // ===== Commands =====

    async fn handle_command(&mut self, command: Command) {
        self.boot_pending = false;
        if self.restart_at.is_some() {
            warn!("Restart pending, ignoring command");
            let _ = match command {
                Command::EnterApMode(reply) => reply.send(Err(ManagerError::Restarting)),
                Command::Connect(_, reply) | Command::Disconnect(reply) => {
                    reply.send(Err(ManagerError::Restarting))
                }
            };
            return;
        }

        match command {
            Command::EnterApMode(reply) => {
                info!("Entering AP mode on request");
                self.retry.reset();
                self.publish_attempts();
                let _ = reply.send(self.activate_ap().await);
            }
            Command::Connect(creds, reply) => {
                info!("Connecting to {:?} on request", creds.ssid());
                self.leave_ap().await;
                if let Err(e) = self.station.disconnect() {
                    debug!("Disconnect before reconnect: {}", e);
                }
                self.credentials = Some(creds);
                self.retry.reset();
                self.publish_attempts();
                self.transition(ConnectionState::Connecting);
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect(reply) => {
                info!("Disconnecting on request");
                self.leave_ap().await;
                if let Err(e) = self.station.disconnect() {
                    warn!("Disconnect failed: {}", e);
                }
                self.retry.reset();
                self.publish_attempts();
                self.transition(ConnectionState::Idle);
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.restart_at.take().is_some() {
            warn!("Stopped with a restart pending; saved credentials apply on next boot");
        }
        self.leave_ap().await;
        if let Err(e) = self.station.disconnect() {
            debug!("Disconnect on shutdown: {}", e);
        }
        self.transition(ConnectionState::Idle);
        info!("Connection manager stopped");
    }

    // ===== Link =====

    /// Poll the station until it is up, fails, or the attempt times out.
    async fn wait_for_link(&mut self) -> bool {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            if self.station.is_connected() {
                return true;
            }
            let status = self.station.status();
            if status.is_failure() {
                warn!("Connection attempt failed: {:?}", status);
                return false;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Connection attempt timed out after {:?}",
                    self.config.connect_timeout
                );
                return false;
            }
            sleep(LINK_POLL_INTERVAL).await;
        }
    }

    // ===== Access point =====

    /// Bring up the hotspot and its portal.
    ///
    /// On failure everything is torn down and the manager waits out a
    /// cooldown in Fail before the next attempt. The error is returned for
    /// callers that asked for AP mode explicitly.
    async fn activate_ap(&mut self) -> Result<(), ManagerError> {
        let result = self.bring_up_ap().await;
        if let Err(e) = &result {
            error!("AP activation failed: {}", e);
            self.leave_ap().await;
            self.retry
                .begin_cooldown(Instant::now() + self.config.fail_recovery_delay);
            self.transition(ConnectionState::Fail);
        }
        result
    }

    async fn bring_up_ap(&mut self) -> Result<(), ManagerError> {
        self.leave_ap().await;
        if let Err(e) = self.station.disconnect() {
            debug!("Disconnect before AP activation: {}", e);
        }

        let settings = ApSettings {
            ssid: self.config.ap_ssid.clone(),
            password: self.config.ap_password.clone(),
            ip: self.config.ap_ip,
        };
        info!("Activating access point {:?}", settings.ssid);
        self.ap.activate(&settings)?;

        let deadline = Instant::now() + self.config.ap_activation_timeout;
        while !self.ap.is_active() {
            if Instant::now() >= deadline {
                return Err(ManagerError::ApActivationTimeout(
                    self.config.ap_activation_timeout,
                ));
            }
            sleep(AP_POLL_INTERVAL).await;
        }

        let ip = self.ap.ip_addr().unwrap_or(self.config.ap_ip);
        self.start_portal(ip).await?;

        self.session = Some(ApSession {
            ssid: settings.ssid.clone(),
            password: settings.password.clone(),
            ip,
        });
        info!("Access point {:?} active at {}", settings.ssid, ip);
        self.transition(ConnectionState::ApMode);
        Ok(())
    }

    async fn start_portal(&mut self, ip: Ipv4Addr) -> Result<(), ManagerError> {
        self.dns.start(ip).await?;

        let (saved_tx, saved_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ProvisioningHandler::new(self.store.clone(), saved_tx));
        self.http.start(Arc::new(handler.routes())).await?;
        self.saved_rx = Some(saved_rx);
        Ok(())
    }

    async fn stop_portal(&mut self) {
        self.saved_rx = None;
        self.http.stop().await;
        self.dns.stop().await;
    }

    fn deactivate_ap(&mut self) {
        if let Err(e) = self.ap.deactivate() {
            warn!("Failed to deactivate access point: {}", e);
        }
    }

    /// Tear down the portal services and the hotspot.
    async fn leave_ap(&mut self) {
        self.stop_portal().await;
        self.deactivate_ap();
        self.session = None;
    }

    /// Close the portal at once, then restart when `deadline` passes.
    async fn step_restart(&mut self, deadline: Instant) -> Flow {
        self.stop_portal().await;
        sleep_until(deadline).await;
        self.deactivate_ap();
        self.restart.restart();
        Flow::Finished
    }

    // ===== State publication =====

    fn publish_attempts(&self) {
        self.shared.status().attempts = self.retry.attempt_count();
    }

    /// Move to `new`, publish the status, then emit events.
    ///
    /// `state_change` comes first, then `disconnected` when leaving
    /// Connected, then the event specific to the new state. Re-entering the
    /// current state only refreshes the published status.
    fn transition(&mut self, new: ConnectionState) {
        let old = self.state;
        self.state = new;

        let ip = match new {
            ConnectionState::Connected => {
                Some(self.station.ip_addr().unwrap_or(Ipv4Addr::UNSPECIFIED))
            }
            _ => None,
        };
        let session = match new {
            ConnectionState::ApMode => self.session.clone(),
            _ => None,
        };

        {
            let mut status = self.shared.status();
            status.state = new;
            status.attempts = self.retry.attempt_count();
            status.station_ip = ip;
            status.session = session.clone();
        }

        if old == new {
            return;
        }
        info!("State: {} -> {}", old, new);

        let events = &self.shared.events;
        events.emit(&Event::StateChange { old, new });
        if old == ConnectionState::Connected {
            events.emit(&Event::Disconnected);
        }
        match new {
            ConnectionState::Connected => events.emit(&Event::Connected {
                ip: ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            }),
            ConnectionState::ApMode => {
                if let Some(session) = session {
                    events.emit(&Event::ApModeStarted { ssid: session.ssid });
                }
            }
            ConnectionState::Fail => events.emit(&Event::ConnectionFailed {
                retry_count: self.retry.attempt_count(),
            }),
            ConnectionState::Idle | ConnectionState::Connecting => {}
        }
    }
}
