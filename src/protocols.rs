//! Contracts between the transport layer and the service node built on it.
//!
//! The transport never decides what an RPC means. It hands requests to the
//! collaborators defined here and writes back whatever they answer:
//!
//! | Trait | Consumed for |
//! |-------|--------------|
//! | [`RequestHandler`] | client RPC endpoints forwarded over QUIC |
//! | [`MonitorHandler`] | `monitor` subscriptions |
//! | [`ServiceNode`] | ping liveness updates, protocol version gates |
//! | [`PeerRpc`] | (provided) request/response calls towards a connected peer |
//!
//! Replies go through one-shot responders. A responder is consumed when used,
//! so it fires at most once; dropping it unanswered makes the transport send
//! the peer an error reply instead of leaving the request hanging.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::messages;
use crate::registry::ConnectionId;

/// HTTP-style status code attached to client RPC replies.
pub type StatusCode = u16;

/// Reply slot for a client RPC call.
#[derive(Debug)]
pub struct RpcResponder {
    tx: oneshot::Sender<Vec<u8>>,
}

impl RpcResponder {
    pub(crate) fn new(tx: oneshot::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Answer the call. The reply is wrapped as `[status, body]` on the wire.
    pub fn respond(self, status: StatusCode, body: impl AsRef<[u8]>) {
        let _ = self.tx.send(messages::wrap_response(status, body.as_ref()));
    }
}

/// Reply slot for a `monitor` request; the body is written back verbatim.
#[derive(Debug)]
pub struct MonitorResponder {
    tx: oneshot::Sender<Vec<u8>>,
}

impl MonitorResponder {
    pub(crate) fn new(tx: oneshot::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    pub fn respond(self, body: impl Into<Vec<u8>>) {
        let _ = self.tx.send(body.into());
    }
}

/// Correlates a monitor subscription with the connection that made it, so the
/// service node can later push `notify` messages down the same connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamRef {
    pub conn: ConnectionId,
}

/// Which transport delivered a liveness ping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReachType {
    Http,
    Quic,
}

/// Network protocol version (hardfork major, minor) used for feature gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Client RPC dispatcher.
pub trait RequestHandler: Send + Sync + 'static {
    /// Offer a client RPC call.
    ///
    /// Returns `false` if `endpoint` is not a client RPC name (the responder is
    /// then dropped unused). Returns `true` if it is, in which case the
    /// handler must eventually call `responder.respond` exactly once, from any
    /// thread.
    fn handle_client_rpc(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        remote_host: &str,
        responder: RpcResponder,
    ) -> bool;
}

/// External monitoring subsystem.
pub trait MonitorHandler: Send + Sync + 'static {
    /// Handle a `monitor` request. The reply may be produced synchronously or
    /// later; `stream` identifies the connection for future notifications.
    fn handle_monitor(&self, body: Vec<u8>, responder: MonitorResponder, stream: StreamRef);
}

/// Service-node state the transport reads or updates.
pub trait ServiceNode: Send + Sync + 'static {
    /// A peer pinged us over `reach`.
    fn update_last_ping(&self, reach: ReachType);

    /// Whether the network has reached `version`.
    fn hardfork_at_least(&self, version: ProtocolVersion) -> bool;
}

/// The collaborators an endpoint routes inbound traffic to.
#[derive(Clone)]
pub struct Handlers {
    pub requests: Arc<dyn RequestHandler>,
    pub monitor: Arc<dyn MonitorHandler>,
    pub service_node: Arc<dyn ServiceNode>,
}

impl Handlers {
    pub fn new(
        requests: Arc<dyn RequestHandler>,
        monitor: Arc<dyn MonitorHandler>,
        service_node: Arc<dyn ServiceNode>,
    ) -> Self {
        Self {
            requests,
            monitor,
            service_node,
        }
    }

    /// Handlers for endpoints that only dial out: no client RPC endpoints,
    /// monitor requests go unanswered, and every version gate is open.
    pub fn unhandled() -> Self {
        let noop = Arc::new(Unhandled);
        Self {
            requests: noop.clone(),
            monitor: noop.clone(),
            service_node: noop,
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

struct Unhandled;

impl RequestHandler for Unhandled {
    fn handle_client_rpc(&self, _: &str, _: Vec<u8>, _: &str, _: RpcResponder) -> bool {
        false
    }
}

impl MonitorHandler for Unhandled {
    fn handle_monitor(&self, _: Vec<u8>, _responder: MonitorResponder, _: StreamRef) {}
}

impl ServiceNode for Unhandled {
    fn update_last_ping(&self, _: ReachType) {}

    fn hardfork_at_least(&self, _: ProtocolVersion) -> bool {
        true
    }
}

/// Request/response calls towards a connected peer.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    /// Send `snode_ping` and wait for the acknowledgment.
    async fn ping(&self, to: ConnectionId) -> Result<()>;

    /// Send a named request and wait for its correlated reply body.
    async fn request(&self, to: ConnectionId, method: &str, body: Vec<u8>) -> Result<Vec<u8>>;
}
