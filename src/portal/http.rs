//! Size-bounded HTTP server for the captive portal.
//!
//! Uses `tiny_http` on a dedicated thread, polling a shutdown flag every
//! 100 ms. Requests are decoded into an [`HttpRequest`] and dispatched to
//! a [`Router`]; the portal only ever needs small form posts, so bodies
//! over [`MAX_CONTENT_LENGTH`] are refused before any of the body is read.

use super::{HttpService, PortalError, ServiceFuture};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::string::FromUtf8Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server};

/// Default listen address for the portal.
pub const DEFAULT_HTTP_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 80));

/// Largest accepted request body, in bytes.
pub const MAX_CONTENT_LENGTH: usize = 1024;

/// Shutdown flag polling period.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bind attempts on start. tiny_http closes a stopped server's listener
/// from its own accept thread, shortly after the server is dropped.
const BIND_ATTEMPTS: u32 = 10;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// HTML content type.
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";

/// Plain text content type.
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    /// Anything else; never matches a route.
    Other,
}

impl From<&Method> for HttpMethod {
    fn from(method: &Method) -> Self {
        match method {
            Method::Get => Self::Get,
            Method::Head => Self::Head,
            Method::Post => Self::Post,
            Method::Put => Self::Put,
            Method::Delete => Self::Delete,
            Method::Options => Self::Options,
            Method::Patch => Self::Patch,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Path without the query string.
    pub path: String,
    /// Header names are lower-cased.
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Form fields decoded from the body.
    pub params: HashMap<String, String>,
}

impl HttpRequest {
    /// Request with no headers or body.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: String::new(),
            params: HashMap::new(),
        }
    }

    /// Request carrying a url-encoded form body.
    ///
    /// A body that does not decode leaves `params` empty.
    pub fn form(method: HttpMethod, path: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            params: parse_form(&body).unwrap_or_default(),
            body,
            ..Self::new(method, path)
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// A form field.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// A response to write back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    /// HTML response.
    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_HTML,
            body: body.into(),
        }
    }

    /// Plain text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_TEXT,
            body: body.into(),
        }
    }

    /// 404 Not Found.
    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }
}

/// Maps requests to responses.
pub trait Router: Send + Sync {
    fn route(&self, request: &HttpRequest) -> HttpResponse;
}

type Handler = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Exact method + path routing.
///
/// Unmatched GET requests fall back to the `GET /` handler so every URL a
/// client checks lands on the portal page. Other unmatched requests get 404.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<(HttpMethod, String), Handler>,
}

impl RouteTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` and `path`, replacing any previous one.
    pub fn add_route<F>(&mut self, method: HttpMethod, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.routes
            .insert((method, path.to_string()), Box::new(handler));
    }

    /// Register a GET handler.
    pub fn get<F>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.add_route(HttpMethod::Get, path, handler);
        self
    }

    /// Register a POST handler.
    pub fn post<F>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.add_route(HttpMethod::Post, path, handler);
        self
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Whether `method` + `path` has its own handler.
    pub fn contains(&self, method: HttpMethod, path: &str) -> bool {
        self.routes.contains_key(&(method, path.to_string()))
    }
}

impl Router for RouteTable {
    fn route(&self, request: &HttpRequest) -> HttpResponse {
        let handler = self
            .routes
            .get(&(request.method, request.path.clone()))
            .or_else(|| match request.method {
                HttpMethod::Get => self.routes.get(&(HttpMethod::Get, "/".to_string())),
                _ => None,
            });
        match handler {
            Some(handler) => handler(request),
            None => HttpResponse::not_found(),
        }
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .routes
            .keys()
            .map(|(m, p)| format!("{} {}", m, p))
            .collect();
        keys.sort();
        f.debug_struct("RouteTable").field("routes", &keys).finish()
    }
}

/// Decode an `application/x-www-form-urlencoded` body.
///
/// `+` is a space and `%XX` is a byte escape. Pairs without `=` are
/// skipped; later duplicates win. Escapes that decode to invalid UTF-8
/// fail the whole body.
pub fn parse_form(body: &str) -> Result<HashMap<String, String>, FromUtf8Error> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| Ok((decode_component(key)?, decode_component(value)?)))
        .collect()
}

fn decode_component(s: &str) -> Result<String, FromUtf8Error> {
    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced).map(|decoded| decoded.into_owned())
}

/// Strip the query string from a request target.
fn request_path(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

/// Decode a tiny_http request, enforcing the body limit.
///
/// On failure the error response to send is returned instead.
fn read_request(request: &mut tiny_http::Request) -> Result<HttpRequest, HttpResponse> {
    if let Some(len) = request.body_length() {
        if len > MAX_CONTENT_LENGTH {
            warn!(
                "Rejecting {} {}: body of {} bytes exceeds {}",
                request.method(),
                request.url(),
                len,
                MAX_CONTENT_LENGTH
            );
            return Err(HttpResponse::text(413, "Payload Too Large"));
        }
    }

    // Length may be unknown for chunked bodies; read one byte past the limit
    let mut raw = Vec::new();
    Read::take(request.as_reader(), MAX_CONTENT_LENGTH as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| {
            debug!("Failed to read request body: {}", e);
            HttpResponse::text(400, "Bad Request")
        })?;
    if raw.len() > MAX_CONTENT_LENGTH {
        return Err(HttpResponse::text(413, "Payload Too Large"));
    }

    let body = String::from_utf8(raw).map_err(|_| {
        debug!("Rejecting non-UTF-8 body for {}", request.url());
        HttpResponse::text(400, "Bad Request")
    })?;

    let headers = request
        .headers()
        .iter()
        .map(|h| {
            (
                h.field.as_str().as_str().to_ascii_lowercase(),
                h.value.as_str().to_string(),
            )
        })
        .collect();

    let params = parse_form(&body).map_err(|_| {
        debug!("Rejecting undecodable form body for {}", request.url());
        HttpResponse::text(400, "Bad Request")
    })?;

    Ok(HttpRequest {
        method: HttpMethod::from(request.method()),
        path: request_path(request.url()).to_string(),
        headers,
        body,
        params,
    })
}

fn respond(request: tiny_http::Request, response: HttpResponse) {
    let mut reply = Response::from_string(response.body).with_status_code(response.status);
    match Header::from_bytes(&b"Content-Type"[..], response.content_type.as_bytes()) {
        Ok(header) => reply = reply.with_header(header),
        Err(()) => warn!("Invalid content type {:?}", response.content_type),
    }
    if let Err(e) = request.respond(reply) {
        warn!("Failed to send response: {}", e);
    }
}

struct Running {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

/// HTTP server thread.
pub struct HttpServer {
    bind_addr: SocketAddr,
    running: Option<Running>,
}

impl HttpServer {
    /// Server that will listen on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            running: None,
        }
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    async fn bind(&self) -> Result<Server, PortalError> {
        let mut attempt = 1;
        loop {
            match Server::http(self.bind_addr) {
                Ok(server) => return Ok(server),
                Err(e) if attempt < BIND_ATTEMPTS => {
                    debug!("Bind {} failed ({}), retrying", self.bind_addr, e);
                    attempt += 1;
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(PortalError::Bind {
                        addr: self.bind_addr,
                        source: io::Error::new(io::ErrorKind::AddrInUse, e.to_string()),
                    })
                }
            }
        }
    }

    async fn serve(&mut self, router: Arc<dyn Router>) -> Result<(), PortalError> {
        self.shutdown().await;

        let server = self.bind().await?;
        let local_addr = server.server_addr().to_ip().unwrap_or(self.bind_addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name("http-portal".into())
            .spawn(move || Self::run_server(server, router, shutdown_clone))?;

        info!("HTTP server listening on http://{}/", local_addr);
        self.running = Some(Running {
            handle: Some(handle),
            shutdown,
            local_addr,
        });
        Ok(())
    }

    /// Stop the server.
    ///
    /// The join may take up to 100ms due to the polling interval, so it
    /// runs on the blocking pool instead of the calling task.
    async fn shutdown(&mut self) {
        if let Some(mut running) = self.running.take() {
            // Use Release ordering to ensure the server thread sees this write
            running.shutdown.store(true, Ordering::Release);
            if let Some(handle) = running.handle.take() {
                match tokio::task::spawn_blocking(move || handle.join()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => error!("HTTP server thread panicked"),
                    Err(e) => warn!("Failed to join HTTP server thread: {}", e),
                }
            }
            info!("HTTP server stopped");
        }
    }

    fn run_server(server: Server, router: Arc<dyn Router>, shutdown: Arc<AtomicBool>) {
        loop {
            // Use Acquire ordering to ensure we see the shutdown flag from stop()
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            match server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(mut request)) => {
                    let response = match read_request(&mut request) {
                        Ok(decoded) => {
                            debug!("{} {}", decoded.method, decoded.path);
                            router.route(&decoded)
                        }
                        Err(response) => response,
                    };
                    respond(request, response);
                }
                Ok(None) => {
                    // Timeout, check shutdown flag and continue
                }
                Err(e) => {
                    error!("HTTP server error: {}", e);
                    break;
                }
            }
        }
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new(DEFAULT_HTTP_ADDR)
    }
}

impl HttpService for HttpServer {
    fn start(&mut self, router: Arc<dyn Router>) -> ServiceFuture<'_, Result<(), PortalError>> {
        Box::pin(self.serve(router))
    }

    fn stop(&mut self) -> ServiceFuture<'_, ()> {
        Box::pin(self.shutdown())
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .and_then(|r| r.handle.as_ref())
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.shutdown.store(true, Ordering::Release);
            if let Some(handle) = running.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
