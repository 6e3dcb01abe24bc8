//! Provisioning routes: the setup form and credential submission.
//!
//! | Route | Response |
//! |---|---|
//! | `GET /`, `GET /hotspot-detect.html`, `GET /generate_204` | setup form |
//! | `POST /configure` | validate, persist, then success page |
//!
//! A successful submission is persisted through the [`ConfigStore`] and only
//! then reported on the `saved` channel, which is what makes the manager
//! schedule the restart. Later submissions get 503.

use super::http::{HttpMethod, HttpRequest, HttpResponse, RouteTable};
use crate::config::{Credentials, CredentialsError};
use crate::store::ConfigStore;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Placeholder in the form template replaced by the error banner.
const ERROR_PLACEHOLDER: &str = "{{error}}";

/// Embedded page templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Credential entry form.
    Provision,
    /// Shown after a successful save.
    Success,
}

impl Template {
    /// Every template.
    pub const ALL: [Template; 2] = [Self::Provision, Self::Success];

    /// Template name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Success => "success",
        }
    }

    /// Look up a template by name. Only the embedded names are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Raw template HTML.
    pub const fn source(self) -> &'static str {
        match self {
            Self::Provision => include_str!("../../templates/provision.html"),
            Self::Success => include_str!("../../templates/success.html"),
        }
    }
}

/// Render the setup form, optionally with an error banner.
fn render_form(error: Option<&'static str>) -> String {
    let banner = error
        .map(|msg| format!("<p class=\"error\">{}</p>", msg))
        .unwrap_or_default();
    Template::Provision
        .source()
        .replace(ERROR_PLACEHOLDER, &banner)
}

fn rejection_message(e: &CredentialsError) -> &'static str {
    match e {
        CredentialsError::SsidEmpty | CredentialsError::SsidTooLong { .. } => {
            "Invalid SSID (must be 1-32 characters)"
        }
        CredentialsError::PasswordTooShort { .. } | CredentialsError::PasswordTooLong { .. } => {
            "Invalid password (must be 8-63 characters or empty)"
        }
    }
}

/// Handles the provisioning routes.
#[derive(Debug)]
pub struct ProvisioningHandler {
    store: ConfigStore,
    saved_tx: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

impl ProvisioningHandler {
    /// Handler persisting to `store` and reporting saved SSIDs on `saved_tx`.
    pub fn new(store: ConfigStore, saved_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            store,
            saved_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a submission has been accepted.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Render a template by name. Unknown names are rejected.
    pub fn render(name: &str) -> Option<String> {
        match Template::from_name(name) {
            Some(Template::Provision) => Some(render_form(None)),
            Some(template) => Some(template.source().to_string()),
            None => {
                warn!("Invalid template name: {:?}", name);
                None
            }
        }
    }

    /// Serve the setup form.
    pub fn serve_page(&self, _request: &HttpRequest) -> HttpResponse {
        HttpResponse::html(200, render_form(None))
    }

    /// Process a form submission.
    pub fn handle_configure(&self, request: &HttpRequest) -> HttpResponse {
        if self.is_closed() {
            return HttpResponse::text(503, "Configuration already saved, restarting");
        }
        info!("Received configure request");

        let ssid = request.param("ssid").unwrap_or_default().trim();
        let password = request.param("password").unwrap_or_default();

        if let Err(e) = Credentials::new(ssid, password) {
            warn!("Rejected submission: {}", e);
            return HttpResponse::html(400, render_form(Some(rejection_message(&e))));
        }

        if let Err(e) = self.store.save_wifi_credentials(ssid, password) {
            error!("Failed to save config: {}", e);
            return HttpResponse::text(500, "Failed to save configuration");
        }

        self.closed.store(true, Ordering::Release);
        info!("Credentials saved for {:?}", ssid);
        if self.saved_tx.send(ssid.to_string()).is_err() {
            warn!("No manager listening for saved credentials");
        }

        HttpResponse::html(200, Template::Success.source())
    }

    /// Route table for the HTTP server.
    pub fn routes(self: Arc<Self>) -> RouteTable {
        let mut table = RouteTable::new();
        for path in ["/", "/hotspot-detect.html", "/generate_204"] {
            let handler = self.clone();
            table.add_route(HttpMethod::Get, path, move |req| handler.serve_page(req));
        }
        let handler = self;
        table.add_route(HttpMethod::Post, "/configure", move |req| {
            handler.handle_configure(req)
        });
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::http::Router;
    use crate::store::{MemoryStorage, Storage};
    use std::io;

    fn handler() -> (
        Arc<ProvisioningHandler>,
        ConfigStore,
        mpsc::UnboundedReceiver<String>,
    ) {
        let store = ConfigStore::new(MemoryStorage::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ProvisioningHandler::new(store.clone(), tx)),
            store,
            rx,
        )
    }

    fn submit(ssid: &str, password: &str) -> HttpRequest {
        let body = format!(
            "ssid={}&password={}",
            urlencoding::encode(ssid),
            urlencoding::encode(password)
        );
        HttpRequest::form(HttpMethod::Post, "/configure", body)
    }

    // ===== Templates =====

    #[test]
    fn test_template_allow_list() {
        assert_eq!(Template::from_name("provision"), Some(Template::Provision));
        assert_eq!(Template::from_name("success"), Some(Template::Success));
        assert_eq!(Template::from_name("../secrets"), None);
        assert_eq!(Template::from_name("Provision"), None);
        assert!(ProvisioningHandler::render("admin").is_none());
        assert!(ProvisioningHandler::render("success").is_some());
    }

    #[test]
    fn test_form_has_no_placeholder() {
        let page = ProvisioningHandler::render("provision").unwrap();
        assert!(page.contains("action=\"/configure\""));
        assert!(!page.contains(ERROR_PLACEHOLDER));
    }

    // ===== Routes =====

    #[test]
    fn test_detection_routes_serve_form() {
        let (handler, _, _) = handler();
        let routes = handler.routes();
        assert_eq!(routes.len(), 4);
        for path in ["/", "/hotspot-detect.html", "/generate_204"] {
            assert!(routes.contains(HttpMethod::Get, path));
            let resp = routes.route(&HttpRequest::new(HttpMethod::Get, path));
            assert_eq!(resp.status, 200);
            assert!(resp.body.contains("<form"));
        }
        assert!(routes.contains(HttpMethod::Post, "/configure"));
    }

    // ===== Submission =====

    #[test]
    fn test_valid_submission_saves_and_signals() {
        let (handler, store, mut rx) = handler();
        let routes = handler.clone().routes();

        let resp = routes.route(&submit("Home", "hunter22"));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Template::Success.source());

        let creds = store.get_wifi_credentials().unwrap();
        assert_eq!(creds.ssid(), "Home");
        assert_eq!(creds.password(), "hunter22");
        assert_eq!(store.get_version(), 2);

        assert_eq!(rx.try_recv().unwrap(), "Home");
        assert!(handler.is_closed());

        // Routes are closed afterwards
        let resp = routes.route(&submit("Other", "password1"));
        assert_eq!(resp.status, 503);
        assert_eq!(store.get_wifi_credentials().unwrap().ssid(), "Home");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ssid_is_trimmed() {
        let (handler, store, _rx) = handler();
        handler.handle_configure(&submit("  Home  ", ""));
        assert_eq!(store.get_wifi_credentials().unwrap().ssid(), "Home");
    }

    #[test]
    fn test_invalid_submissions_rejected() {
        let (handler, store, mut rx) = handler();

        for (ssid, password, message) in [
            ("", "hunter22", "Invalid SSID"),
            ("   ", "hunter22", "Invalid SSID"),
            (&*"a".repeat(33), "hunter22", "Invalid SSID"),
            ("Home", "1234567", "Invalid password"),
            ("Home", &*"p".repeat(64), "Invalid password"),
        ] {
            let resp = handler.handle_configure(&submit(ssid, password));
            assert_eq!(resp.status, 400, "ssid={:?} password={:?}", ssid, password);
            assert!(resp.body.contains(message));
            assert!(resp.body.contains("<form"));
        }

        assert!(store.get_wifi_credentials().is_none());
        assert!(rx.try_recv().is_err());
        assert!(!handler.is_closed());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let (handler, _, _) = handler();
        let resp = handler.handle_configure(&HttpRequest::new(HttpMethod::Post, "/configure"));
        assert_eq!(resp.status, 400);
    }

    struct FailingStorage;

    impl Storage for FailingStorage {
        fn read(&self) -> io::Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn write(&self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "flash error"))
        }
        fn remove(&self) -> io::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_save_failure_is_500() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = ProvisioningHandler::new(ConfigStore::new(FailingStorage), tx);

        let resp = handler.handle_configure(&submit("Home", "hunter22"));
        assert_eq!(resp.status, 500);
        assert!(!handler.is_closed());
        assert!(rx.try_recv().is_err());
    }
}
