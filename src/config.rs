//! Construction-time configuration for the endpoint and the HTTP client.
//!
//! Both structs are consumed by value when the component is built and are
//! never mutated afterwards.

use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::Keypair;

// ============================================================================
// QUIC Endpoint Defaults
// ============================================================================

/// Time allowed for the QUIC handshake plus control stream setup.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time an outbound request may wait for its correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connections with no traffic for this long are closed by the transport.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest control-stream frame accepted from a peer (10 MiB).
/// SECURITY: Bounds the per-frame allocation a peer can force on us.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Handshake timeout used by reachability tests.
pub const REACHABILITY_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Local UDP address to bind.
    pub bind: SocketAddr,
    /// TLS identity key material.
    pub keypair: Keypair,
    /// Accept inbound connections. Client-only endpoints (reachability testers, tools)
    /// turn this off and only dial out.
    pub accept_inbound: bool,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_frame_size: usize,
}

impl EndpointConfig {
    pub fn new(bind: SocketAddr, keypair: Keypair) -> Self {
        Self {
            bind,
            keypair,
            accept_inbound: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn client_only(mut self) -> Self {
        self.accept_inbound = false;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }
}

// ============================================================================
// HTTP Client
// ============================================================================

#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub user_agent: String,
    /// Upper bound on TCP/TLS connect time, independent of the per-request
    /// timeout. `None` leaves it to the request timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("snode-net/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: None,
        }
    }
}

impl HttpClientConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults() {
        let cfg = EndpointConfig::new("127.0.0.1:0".parse().unwrap(), Keypair::generate());
        assert!(cfg.accept_inbound);
        assert_eq!(cfg.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(cfg.max_frame_size, DEFAULT_MAX_FRAME_SIZE);

        let cfg = cfg.client_only().with_request_timeout(Duration::from_secs(1));
        assert!(!cfg.accept_inbound);
        assert_eq!(cfg.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn http_user_agent_carries_version() {
        let cfg = HttpClientConfig::default();
        assert!(cfg.user_agent.starts_with("snode-net/"));
        assert_eq!(cfg.with_user_agent("x").user_agent, "x");
    }
}
