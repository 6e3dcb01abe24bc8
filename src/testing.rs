//! Scriptable radio and portal doubles for lifecycle tests.
//!
//! Each double is a cheap clone over shared state: the test keeps one
//! clone to script and inspect, the manager owns the other.

use crate::config::Credentials;
use crate::network::{AccessPoint, ApSettings, LinkStatus, NetworkError, Restart, Station};
use crate::portal::{
    DnsService, HttpMethod, HttpRequest, HttpResponse, HttpService, PortalError, Router,
    ServiceFuture,
};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Address handed out by [`FakeStation`] once linked.
pub const STATION_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

// ===== Station =====

#[derive(Debug, Default)]
struct StationState {
    reachable: bool,
    failure: Option<LinkStatus>,
    connected: bool,
    connects: Vec<String>,
    disconnects: usize,
}

/// Station whose network is reachable, silent, or rejecting on demand.
#[derive(Debug, Clone, Default)]
pub struct FakeStation(Arc<Mutex<StationState>>);

impl FakeStation {
    /// Every attempt links up immediately.
    pub fn reachable() -> Self {
        let station = Self::default();
        station.set_reachable(true);
        station
    }

    /// Attempts never finish; each one runs into the connect timeout.
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Attempts end straight away with `status`.
    pub fn failing(status: LinkStatus) -> Self {
        let station = Self::default();
        station.0.lock().unwrap().failure = Some(status);
        station
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.0.lock().unwrap().reachable = reachable;
    }

    /// Drop the link without telling the manager.
    pub fn drop_link(&self) {
        self.0.lock().unwrap().connected = false;
    }

    /// SSIDs of every attempt, in order.
    pub fn connects(&self) -> Vec<String> {
        self.0.lock().unwrap().connects.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.0.lock().unwrap().connects.len()
    }

    pub fn disconnect_count(&self) -> usize {
        self.0.lock().unwrap().disconnects
    }

    pub fn is_linked(&self) -> bool {
        self.0.lock().unwrap().connected
    }
}

impl Station for FakeStation {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        let mut state = self.0.lock().unwrap();
        state.connects.push(credentials.ssid().to_string());
        state.connected = state.reachable;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), NetworkError> {
        let mut state = self.0.lock().unwrap();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.lock().unwrap().connected
    }

    fn status(&self) -> LinkStatus {
        let state = self.0.lock().unwrap();
        if state.connected {
            LinkStatus::GotIp
        } else {
            state.failure.unwrap_or(LinkStatus::Connecting)
        }
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.is_connected().then_some(STATION_IP)
    }
}

// ===== Access point =====

#[derive(Debug, Default)]
struct ApState {
    stuck: bool,
    active: bool,
    activations: usize,
    settings: Option<ApSettings>,
}

/// Access point that comes up instantly, or never when stuck.
#[derive(Debug, Clone, Default)]
pub struct FakeAccessPoint(Arc<Mutex<ApState>>);

impl FakeAccessPoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hotspot that never reports active.
    pub fn stuck() -> Self {
        let ap = Self::default();
        ap.0.lock().unwrap().stuck = true;
        ap
    }

    /// Make later activations hang, or come up again.
    pub fn set_stuck(&self, stuck: bool) {
        self.0.lock().unwrap().stuck = stuck;
    }

    pub fn is_up(&self) -> bool {
        self.0.lock().unwrap().active
    }

    pub fn activations(&self) -> usize {
        self.0.lock().unwrap().activations
    }

    pub fn settings(&self) -> Option<ApSettings> {
        self.0.lock().unwrap().settings.clone()
    }
}

impl AccessPoint for FakeAccessPoint {
    fn activate(&mut self, settings: &ApSettings) -> Result<(), NetworkError> {
        let mut state = self.0.lock().unwrap();
        state.activations += 1;
        state.settings = Some(settings.clone());
        state.active = !state.stuck;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.0.lock().unwrap().active
    }

    fn deactivate(&mut self) -> Result<(), NetworkError> {
        self.0.lock().unwrap().active = false;
        Ok(())
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        let state = self.0.lock().unwrap();
        match (&state.settings, state.active) {
            (Some(settings), true) => Some(settings.ip),
            _ => None,
        }
    }
}

// ===== Restart =====

/// Counts restart requests instead of resetting.
#[derive(Debug, Clone, Default)]
pub struct RecordingRestart(Arc<AtomicUsize>);

impl RecordingRestart {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Restart for RecordingRestart {
    fn restart(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ===== Portal =====

#[derive(Debug, Default)]
struct DnsState {
    running: bool,
    answers: Vec<Ipv4Addr>,
}

/// DNS service that records the answer address of each start.
#[derive(Debug, Clone, Default)]
pub struct FakeDns(Arc<Mutex<DnsState>>);

impl FakeDns {
    pub fn running(&self) -> bool {
        self.0.lock().unwrap().running
    }

    pub fn answers(&self) -> Vec<Ipv4Addr> {
        self.0.lock().unwrap().answers.clone()
    }
}

impl DnsService for FakeDns {
    fn start(&mut self, ip: Ipv4Addr) -> ServiceFuture<'_, Result<(), PortalError>> {
        let mut state = self.0.lock().unwrap();
        state.running = true;
        state.answers.push(ip);
        Box::pin(async { Ok(()) })
    }

    fn stop(&mut self) -> ServiceFuture<'_, ()> {
        self.0.lock().unwrap().running = false;
        Box::pin(async {})
    }

    fn is_running(&self) -> bool {
        self.running()
    }
}

#[derive(Default)]
struct HttpState {
    running: bool,
    starts: usize,
    router: Option<Arc<dyn Router>>,
}

/// HTTP service that keeps the last router so tests can drive it.
#[derive(Clone, Default)]
pub struct FakeHttp(Arc<Mutex<HttpState>>);

impl FakeHttp {
    pub fn running(&self) -> bool {
        self.0.lock().unwrap().running
    }

    pub fn starts(&self) -> usize {
        self.0.lock().unwrap().starts
    }

    /// Dispatch a request to the last router, as if a client sent it.
    pub fn request(&self, request: &HttpRequest) -> Option<HttpResponse> {
        let router = self.0.lock().unwrap().router.clone()?;
        Some(router.route(request))
    }

    /// Submit the provisioning form.
    pub fn submit(&self, ssid: &str, password: &str) -> Option<HttpResponse> {
        let body = format!(
            "ssid={}&password={}",
            urlencoding::encode(ssid),
            urlencoding::encode(password)
        );
        self.request(&HttpRequest::form(HttpMethod::Post, "/configure", body))
    }
}

impl HttpService for FakeHttp {
    fn start(&mut self, router: Arc<dyn Router>) -> ServiceFuture<'_, Result<(), PortalError>> {
        let mut state = self.0.lock().unwrap();
        state.running = true;
        state.starts += 1;
        state.router = Some(router);
        Box::pin(async { Ok(()) })
    }

    fn stop(&mut self) -> ServiceFuture<'_, ()> {
        self.0.lock().unwrap().running = false;
        Box::pin(async {})
    }

    fn is_running(&self) -> bool {
        self.running()
    }
}
