//! Provider contracts consumed by the control layer
//!
//! The core never performs I/O itself: transports, persistence, and time
//! come in through these traits. Implementations are supplied by the
//! embedder; deterministic versions for tests live in the `weave-harness`
//! crate.
//!
//! All callbacks run on the single task runner, one at a time. Nothing
//! here is `Send`: the entire control layer is single-threaded
//! cooperative by design.

use std::rc::Rc;
use std::time::Duration;

use crate::error::Result;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Task Runner
// ----------------------------------------------------------------------------

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Serial executor for all core callbacks. Tasks with equal delays run in
/// FIFO order.
pub trait TaskRunner {
    fn post_delayed(&self, delay: Duration, task: Task);

    fn post(&self, task: Task) {
        self.post_delayed(Duration::ZERO, task);
    }
}

/// Production runner backed by a tokio `LocalSet`. Must be used from
/// within `LocalSet::run_until` (or an equivalent local context); tasks
/// are spawned with `spawn_local` so they stay on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskRunner;

impl TaskRunner for TokioTaskRunner {
    fn post_delayed(&self, delay: Duration, task: Task) {
        tokio::task::spawn_local(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}

// ----------------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------------

/// Wall-clock source. Injected so tests can drive time deterministically.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::from_millis(elapsed.as_millis() as u64)
    }
}

// ----------------------------------------------------------------------------
// HTTP Client
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.headers
            .push(("Content-Type".into(), "application/json".into()));
        self.body = Some(body.to_string().into_bytes());
        self
    }

    /// `application/x-www-form-urlencoded` body from key/value pairs.
    /// Values are percent-encoded conservatively (everything outside the
    /// unreserved set).
    pub fn with_form(mut self, fields: &[(&str, &str)]) -> Self {
        fn encode(value: &str) -> String {
            let mut out = String::with_capacity(value.len());
            for byte in value.bytes() {
                match byte {
                    b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                        out.push(byte as char)
                    }
                    _ => out.push_str(&format!("%{byte:02X}")),
                }
            }
            out
        }
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.headers.push((
            "Content-Type".into(),
            "application/x-www-form-urlencoded".into(),
        ));
        self.body = Some(body.into_bytes());
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body).map_err(|err| {
            crate::error::Error::object_expected(format!("Malformed response body: {err}"))
        })
    }
}

pub type HttpCallback = Box<dyn FnOnce(Result<HttpResponse>)>;

/// Asynchronous HTTP transport. The completion callback is posted on the
/// task runner; a transport-level failure (DNS, connect, timeout) arrives
/// as a `transport_error`.
pub trait HttpClient {
    fn send_request(&self, request: HttpRequest, callback: HttpCallback);
}

/// Default per-request timeout enforced by providers.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    /// Link-local or captive connectivity without internet reachability.
    Limited,
    Connected,
}

/// A connected TLS stream handed to the notification channel.
pub trait SslSocket {
    fn send(&self, data: &[u8], done: Box<dyn FnOnce(Result<()>)>);
    fn receive(&self, callback: Box<dyn FnOnce(Result<Vec<u8>>)>);
}

pub trait Network {
    fn connection_state(&self) -> ConnectionState;

    /// The callback fires (on the runner) whenever the connection state
    /// may have changed.
    fn add_connection_changed_callback(&self, callback: Rc<dyn Fn()>);

    fn open_ssl_socket(
        &self,
        host: &str,
        port: u16,
        callback: Box<dyn FnOnce(Result<Box<dyn SslSocket>>)>,
    );
}

// ----------------------------------------------------------------------------
// Config Store
// ----------------------------------------------------------------------------

/// Opaque named-blob persistence. The settings and the revocation list are
/// stored under separate names.
pub trait ConfigStore {
    fn load_settings(&self, name: &str) -> Option<String>;
    fn save_settings(&self, name: &str, value: &str) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Local Discovery / WiFi / HTTP Server
// ----------------------------------------------------------------------------

pub trait DnsServiceDiscovery {
    fn publish_service(&self, service_type: &str, port: u16, txt: &[String]);
    fn stop_publishing(&self, service_type: &str);
}

pub trait Wifi {
    fn start_access_point(&self, ssid: &str);
    fn stop_access_point(&self);
}

pub type HttpServerRequestCallback = Rc<dyn Fn(HttpRequest, Box<dyn FnOnce(HttpResponse)>)>;

/// Local HTTP(S) server surface. The core consumes the ports and the TLS
/// certificate fingerprint; request routing belongs to the embedder.
pub trait HttpServer {
    fn http_port(&self) -> u16;
    fn https_port(&self) -> u16;
    fn https_certificate_fingerprint(&self) -> Vec<u8>;
    fn add_request_handler(&self, path_prefix: &str, callback: HttpServerRequestCallback);
    fn add_on_state_changed_callback(&self, callback: Rc<dyn Fn()>);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_encoding_escapes_reserved_bytes() {
        let request = HttpRequest::new(HttpMethod::Post, "https://example.com/token")
            .with_form(&[("grant_type", "authorization_code"), ("code", "a b&c")]);
        let body = String::from_utf8(request.body.unwrap()).unwrap();
        assert_eq!(body, "grant_type=authorization_code&code=a%20b%26c");
    }

    #[test]
    fn response_success_range() {
        let ok = HttpResponse {
            status: 204,
            content_type: String::new(),
            body: Vec::new(),
        };
        assert!(ok.is_success());
        let not = HttpResponse {
            status: 404,
            ..ok.clone()
        };
        assert!(!not.is_success());
    }
}
