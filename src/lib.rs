//! # snode-net - Storage Node Network Transport
//!
//! Moves RPC requests and responses between storage nodes, and from a node to
//! external services, over two transports:
//!
//! - **HTTP**: outbound-only async POST client for legacy/compatibility calls
//! - **QUIC**: peer transport carrying the node-to-node control plane (ping,
//!   monitoring, notifications, reachability testing)
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - Each component has a public handle and a private actor task
//! - Handles communicate with their actor over async channels
//! - Actors own all mutable state (connection registry, active transfers) and
//!   process commands sequentially, so no state is ever locked
//!
//! ## Security Model
//!
//! - All peer connections use mutual TLS with self-signed Ed25519 certificates
//! - Identity = Public Key; dialers pin the expected key through SNI
//! - Control-stream frames are size-bounded before allocation
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs, identities, `IP:PORT/PUBKEY` peer addresses |
//! | `crypto` | TLS certificate generation and verification |
//! | `config` | Endpoint and HTTP client configuration |
//! | `messages` | Control-stream wire frames |
//! | `protocols` | Contracts with the service node (handlers, liveness, versions) |
//! | `stream` | Per-connection control stream and request correlation |
//! | `registry` | Connection id → connection map with pending slots |
//! | `dispatch` | Inbound routing by method name |
//! | `endpoint` | QUIC endpoint: accept, dial, send, notify |
//! | `reachability` | QUIC reachability tests |
//! | `http` | Async HTTP client |

mod config;
mod crypto;
mod dispatch;
mod endpoint;
mod http;
mod identity;
mod messages;
mod protocols;
mod reachability;
mod registry;
mod stream;

pub use config::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_REQUEST_TIMEOUT,
    EndpointConfig, HttpClientConfig, REACHABILITY_HANDSHAKE_TIMEOUT,
};
pub use crypto::{ALPN, TlsIdentity};
pub use dispatch::{Dispatch, NOTIFICATION_CHANNEL_SIZE, Notification, Router};
pub use endpoint::{
    CLOSE_NORMAL, CLOSE_UNVERIFIED, CloseReason, ClosedCallback, ConnectOptions, EstablishedCallback,
    QuicEndpoint,
};
pub use http::{HttpCallback, HttpClient, HttpError, HttpResponse, PendingHttpRequest};
pub use identity::{Identity, Keypair, PeerAddress};
pub use messages::{MONITOR, NO_SUCH_ENDPOINT, NOTIFY, PONG, SNODE_PING, unwrap_response, wrap_response};
pub use protocols::{
    Handlers, MonitorHandler, MonitorResponder, PeerRpc, ProtocolVersion, ReachType, RequestHandler,
    RpcResponder, ServiceNode, StatusCode, StreamRef,
};
pub use reachability::{QUIC_REACHABILITY_TESTING, ReachabilityTest};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, ConnectionSlot};
pub use stream::{
    CLOSE_PROTOCOL_ERROR, CLOSE_STREAM_ENDED, ControlStream, MessageKind, PendingMessage, RequestError,
    ResponseCallback,
};
