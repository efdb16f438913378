//! # Async HTTP Client
//!
//! Outbound-only POST client used for legacy and compatibility calls.
//!
//! ## Architecture
//!
//! - [`HttpClient`]: owning handle; submitting never blocks
//! - `HttpActor`: owns the transfer engine (a [`JoinSet`] of in-flight
//!   transfers) and the active-transfer map
//!
//! Every transfer the engine knows about has exactly one entry in the
//! active-transfer map, keyed by its task id. When the engine reports a
//! transfer finished, its entry is removed and its callback runs on the actor
//! task, exactly once, with either a response or an [`HttpError`].
//!
//! ## Teardown
//!
//! Dropping the client clears a shared liveness flag and tells the actor to
//! abort every active transfer. Callbacks of transfers still in flight are
//! **not** invoked: the code that submitted them may already be gone. The
//! actor checks the flag before every callback, so none fires once teardown
//! has begun.
//!
//! ## TLS
//!
//! All transfers use rustls with TLS 1.2 as the floor and no redirects.
//! Certificate validation can be disabled per request for pinned peer calls;
//! such requests run on a separate client so the bypass never leaks into
//! other requests. A host override on an IP-address URL replaces the URL host
//! (and so the SNI name and `Host` header) while still connecting to that
//! address. On a URL naming a host, the override only replaces the `Host`
//! header.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, HOST};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, Id as TransferId, JoinError, JoinSet};
use tracing::{debug, error, trace, warn};

use crate::config::HttpClientConfig;

// ============================================================================
// Requests and Outcomes
// ============================================================================

/// An outbound POST, immutable once submitted.
#[derive(Clone, Debug)]
pub struct PendingHttpRequest {
    url: String,
    payload: Vec<u8>,
    timeout: Duration,
    host_override: Option<String>,
    disable_tls_validation: bool,
}

impl PendingHttpRequest {
    pub fn new(url: impl Into<String>, payload: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            payload: payload.into(),
            timeout,
            host_override: None,
            disable_tls_validation: false,
        }
    }

    /// Present `host` as the TLS server name and `Host` header instead of the
    /// URL's host. The URL's host must be an IP address, which is where the
    /// request still connects.
    pub fn with_host_override(mut self, host: impl Into<String>) -> Self {
        self.host_override = Some(host.into());
        self
    }

    /// Skip certificate validation for this request only.
    /// SECURITY: meant for peers pinned by other means, never arbitrary hosts.
    pub fn disable_tls_validation(mut self) -> Self {
        self.disable_tls_validation = true;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure of a transfer. HTTP error statuses are not
/// failures; they arrive as an [`HttpResponse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpError {
    /// The request did not complete within its timeout.
    Timeout,
    /// DNS resolution or TCP connect failed.
    Connect(String),
    Tls(String),
    /// Any other failure while sending or receiving.
    Transport(String),
    /// The request could not be built (bad URL, bad host override).
    InvalidRequest(String),
    /// The client shut down before the transfer finished.
    Shutdown,
}

impl HttpError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return HttpError::Timeout;
        }
        if has_tls_cause(&err) {
            return HttpError::Tls(error_chain(&err));
        }
        if err.is_connect() {
            return HttpError::Connect(error_chain(&err));
        }
        if err.is_builder() {
            return HttpError::InvalidRequest(error_chain(&err));
        }
        HttpError::Transport(error_chain(&err))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Timeout => write!(f, "request timed out"),
            HttpError::Connect(e) => write!(f, "connect failed: {}", e),
            HttpError::Tls(e) => write!(f, "TLS failure: {}", e),
            HttpError::Transport(e) => write!(f, "transport error: {}", e),
            HttpError::InvalidRequest(e) => write!(f, "invalid request: {}", e),
            HttpError::Shutdown => write!(f, "HTTP client shut down"),
        }
    }
}

impl std::error::Error for HttpError {}

fn has_tls_cause(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if e.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        out.push_str(": ");
        out.push_str(&e.to_string());
        source = e.source();
    }
    out
}

pub type HttpCallback = Box<dyn FnOnce(Result<HttpResponse, HttpError>) + Send + 'static>;

// ============================================================================
// Actor Commands
// ============================================================================

enum HttpCommand {
    Post {
        request: PendingHttpRequest,
        callback: HttpCallback,
    },
    ActiveTransfers {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

// ============================================================================
// Actor (owns the transfer engine)
// ============================================================================

type TransferOutcome = Result<HttpResponse, HttpError>;

struct ActiveTransfer {
    handle: AbortHandle,
    url: String,
    started: Instant,
    callback: HttpCallback,
}

struct HttpActor {
    config: HttpClientConfig,
    strict: reqwest::Client,
    insecure: reqwest::Client,
    engine: JoinSet<TransferOutcome>,
    active: HashMap<TransferId, ActiveTransfer>,
    alive: Arc<AtomicBool>,
}

impl HttpActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<HttpCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(HttpCommand::Post { request, callback }) => {
                            self.start(request, callback);
                        }
                        Some(HttpCommand::ActiveTransfers { reply }) => {
                            let _ = reply.send(self.active.len());
                        }
                        Some(HttpCommand::Shutdown) | None => {
                            debug!("HTTP client actor shutting down");
                            break;
                        }
                    }
                }
                Some(finished) = self.engine.join_next_with_id(), if !self.engine.is_empty() => {
                    self.check_multi_info(finished);
                }
            }
        }

        self.shutdown();
    }

    fn start(&mut self, request: PendingHttpRequest, callback: HttpCallback) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }

        let prepared = match self.client_for(&request) {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(url = %request.url, error = %e, "rejecting HTTP request");
                self.complete(callback, Err(e));
                return;
            }
        };

        let PendingHttpRequest {
            url: original_url,
            payload,
            timeout,
            ..
        } = request;

        let handle = self.engine.spawn(transfer(prepared, payload, timeout));
        trace!(url = %original_url, id = %handle.id(), "transfer started");
        self.active.insert(
            handle.id(),
            ActiveTransfer {
                handle,
                url: original_url,
                started: Instant::now(),
                callback,
            },
        );
    }

    /// Pick the engine client for a request, the URL it should use and any
    /// explicit `Host` header.
    fn client_for(&self, request: &PendingHttpRequest) -> Result<PreparedTransfer, HttpError> {
        let url = Url::parse(&request.url)
            .map_err(|e| HttpError::InvalidRequest(format!("bad URL {}: {}", request.url, e)))?;
        let shared = if request.disable_tls_validation {
            self.insecure.clone()
        } else {
            self.strict.clone()
        };

        let Some(host) = &request.host_override else {
            return Ok(PreparedTransfer {
                client: shared,
                url,
                host_header: None,
            });
        };

        let ip = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .and_then(|h| h.parse::<IpAddr>().ok());
        let Some(ip) = ip else {
            // Named host: resolution stays with the engine, only `Host` changes.
            return Ok(PreparedTransfer {
                client: shared,
                url,
                host_header: Some(host.clone()),
            });
        };

        // Connect to the URL's address, present the override host.
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidRequest(format!("no port for {}", url)))?;

        let mut pinned = url.clone();
        pinned
            .set_host(Some(host.as_str()))
            .map_err(|e| HttpError::InvalidRequest(format!("bad host override {}: {}", host, e)))?;

        let client = client_builder(&self.config)
            .danger_accept_invalid_certs(request.disable_tls_validation)
            .resolve(host, SocketAddr::new(ip, port))
            .build()
            .map_err(|e| HttpError::InvalidRequest(error_chain(&e)))?;
        Ok(PreparedTransfer {
            client,
            url: pinned,
            host_header: None,
        })
    }

    /// Drain finished transfers: remove each from the active map, then hand
    /// its outcome to its callback.
    fn check_multi_info(&mut self, finished: Result<(TransferId, TransferOutcome), JoinError>) {
        let (id, outcome) = match finished {
            Ok((id, outcome)) => (id, outcome),
            Err(e) if e.is_cancelled() => {
                // Only shutdown aborts transfers, and it clears the map itself.
                self.active.remove(&e.id());
                return;
            }
            Err(e) => (e.id(), Err(HttpError::Transport(format!("transfer task failed: {}", e)))),
        };

        let Some(transfer) = self.active.remove(&id) else {
            warn!(id = %id, "finished transfer missing from active map, ignoring");
            return;
        };

        match &outcome {
            Ok(response) => trace!(
                url = %transfer.url,
                status = response.status,
                elapsed_ms = transfer.started.elapsed().as_millis() as u64,
                "transfer finished"
            ),
            Err(e) => debug!(
                url = %transfer.url,
                error = %e,
                elapsed_ms = transfer.started.elapsed().as_millis() as u64,
                "transfer failed"
            ),
        }
        self.complete(transfer.callback, outcome);
    }

    fn complete(&self, callback: HttpCallback, outcome: TransferOutcome) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        // A panicking callback must not take the engine down with it.
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
            error!("HTTP completion callback panicked");
        }
    }

    fn shutdown(&mut self) {
        self.alive.store(false, Ordering::Release);
        let dropped = self.active.len();
        for (_, transfer) in self.active.drain() {
            transfer.handle.abort();
        }
        self.engine.abort_all();
        if dropped > 0 {
            debug!(dropped, "aborted in-flight HTTP transfers");
        }
    }
}

struct PreparedTransfer {
    client: reqwest::Client,
    url: Url,
    host_header: Option<String>,
}

async fn transfer(prepared: PreparedTransfer, payload: Vec<u8>, timeout: Duration) -> TransferOutcome {
    let PreparedTransfer {
        client,
        url,
        host_header,
    } = prepared;

    let mut builder = client
        .post(url)
        .timeout(timeout)
        .header(CONTENT_TYPE, "application/octet-stream");
    if let Some(host) = host_header {
        builder = builder.header(HOST, host);
    }
    let response = builder
        .body(payload)
        .send()
        .await
        .map_err(HttpError::from_reqwest)?;

    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(HttpError::from_reqwest)?;
    Ok(HttpResponse {
        status,
        body: body.to_vec(),
    })
}

fn client_builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::none())
        .min_tls_version(reqwest::tls::Version::TLS_1_2);
    if let Some(timeout) = config.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder
}

// ============================================================================
// HttpClient Handle
// ============================================================================

pub struct HttpClient {
    cmd_tx: mpsc::UnboundedSender<HttpCommand>,
    alive: Arc<AtomicBool>,
}

impl HttpClient {
    /// Build the client and start its actor. Must be called inside a tokio
    /// runtime.
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let strict = client_builder(&config)
            .build()
            .context("failed to build HTTP client")?;
        let insecure = client_builder(&config)
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build unvalidated HTTP client")?;

        let alive = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let actor = HttpActor {
            config,
            strict,
            insecure,
            engine: JoinSet::new(),
            active: HashMap::new(),
            alive: alive.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Ok(Self { cmd_tx, alive })
    }

    /// Submit a POST. `callback` runs exactly once on the client's actor task
    /// with the outcome, unless the client is dropped first. It must not block.
    ///
    /// Returns `false` if the client has already shut down, in which case the
    /// callback is dropped without running.
    pub fn post<F>(&self, request: PendingHttpRequest, callback: F) -> bool
    where
        F: FnOnce(Result<HttpResponse, HttpError>) + Send + 'static,
    {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        self.cmd_tx
            .send(HttpCommand::Post {
                request,
                callback: Box::new(callback),
            })
            .is_ok()
    }

    /// Submit a POST and wait for its outcome.
    pub async fn post_async(&self, request: PendingHttpRequest) -> Result<HttpResponse, HttpError> {
        let (tx, rx) = oneshot::channel();
        if !self.post(request, move |outcome| {
            let _ = tx.send(outcome);
        }) {
            return Err(HttpError::Shutdown);
        }
        rx.await.unwrap_or(Err(HttpError::Shutdown))
    }

    /// Number of transfers currently known to the engine.
    pub async fn active_transfers(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(HttpCommand::ActiveTransfers { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.cmd_tx.send(HttpCommand::Shutdown);
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_flags() {
        let request = PendingHttpRequest::new("https://10.0.0.1:22021/storage_rpc", b"{}".to_vec(), Duration::from_secs(5))
            .with_host_override("snode.example")
            .disable_tls_validation();
        assert_eq!(request.url(), "https://10.0.0.1:22021/storage_rpc");
        assert_eq!(request.host_override.as_deref(), Some("snode.example"));
        assert!(request.disable_tls_validation);
        assert_eq!(request.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn error_display() {
        assert_eq!(HttpError::Timeout.to_string(), "request timed out");
        assert!(HttpError::Connect("refused".into()).to_string().contains("refused"));
        assert!(HttpError::Timeout.is_timeout());
    }

    #[test]
    fn success_statuses() {
        assert!(HttpResponse { status: 204, body: vec![] }.is_success());
        assert!(!HttpResponse { status: 404, body: vec![] }.is_success());
    }

    #[tokio::test]
    async fn invalid_url_fails_through_callback() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let outcome = client
            .post_async(PendingHttpRequest::new("not a url", vec![], Duration::from_secs(1)))
            .await;
        assert!(matches!(outcome, Err(HttpError::InvalidRequest(_))));
        assert_eq!(client.active_transfers().await, 0);
    }

    fn actor() -> HttpActor {
        let config = HttpClientConfig::default();
        HttpActor {
            strict: client_builder(&config).build().unwrap(),
            insecure: client_builder(&config)
                .danger_accept_invalid_certs(true)
                .build()
                .unwrap(),
            config,
            engine: JoinSet::new(),
            active: HashMap::new(),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    #[test]
    fn host_override_on_named_host_sets_host_header() {
        let prepared = actor()
            .client_for(
                &PendingHttpRequest::new("https://example.com/x", vec![], Duration::from_secs(1))
                    .with_host_override("other.example"),
            )
            .unwrap();
        assert_eq!(prepared.url.as_str(), "https://example.com/x");
        assert_eq!(prepared.host_header.as_deref(), Some("other.example"));
    }

    #[test]
    fn host_override_on_ip_rewrites_url_host() {
        let prepared = actor()
            .client_for(
                &PendingHttpRequest::new("https://10.0.0.1:22021/x", vec![], Duration::from_secs(1))
                    .with_host_override("snode.example"),
            )
            .unwrap();
        assert_eq!(prepared.url.as_str(), "https://snode.example:22021/x");
        assert_eq!(prepared.host_header, None);
    }

    #[tokio::test]
    async fn drop_clears_liveness_flag() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let alive = client.alive.clone();
        drop(client);
        assert!(!alive.load(Ordering::Acquire));
    }
}
