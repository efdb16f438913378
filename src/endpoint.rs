//! # QUIC Endpoint
//!
//! Owns the QUIC listener/dialer, the TLS identity and the connection
//! registry.
//!
//! ## Architecture
//!
//! The endpoint uses the **Actor Pattern**:
//! - [`QuicEndpoint`]: public handle (cheap to clone)
//! - `EndpointActor`: owns the [`ConnectionRegistry`] and the per-dial callbacks
//! - driver tasks: one per connection, running the handshake, opening or
//!   accepting the control stream, then waiting for the connection to close
//!
//! Drivers report `Opened` / `Accepted` / `Closed` events through the actor's
//! command channel, so every registry mutation happens on the actor task and
//! events for one connection are applied in the order they occurred.
//!
//! ## Registry Lifecycle
//!
//! - Outbound: [`QuicEndpoint::establish_connection`] reserves a `Pending`
//!   slot before the handshake starts; `Opened` fills it.
//! - Inbound: the slot is inserted once the handshake and control stream are
//!   both up.
//! - `Closed` removes the slot in either state. It is the only removal path,
//!   and it fires for local, remote and timeout closures alike.
//!
//! ## Shutdown
//!
//! The actor runs until [`QuicEndpoint::quit`]. Quitting closes every
//! connection and the endpoint itself.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, Incoming, VarInt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::EndpointConfig;
use crate::crypto::{self, TlsIdentity, extract_verified_identity, identity_to_sni};
use crate::dispatch::{NOTIFICATION_CHANNEL_SIZE, Notification, Router};
use crate::identity::{Identity, PeerAddress};
use crate::messages::{NOTIFY, PONG, SNODE_PING};
use crate::protocols::{Handlers, PeerRpc};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, ConnectionSlot};
use crate::stream::{self, ControlStream, PendingMessage, RequestError, ResponseCallback, StreamLimits};

/// Command channel capacity for the endpoint actor.
const ENDPOINT_COMMAND_CHANNEL_SIZE: usize = 256;

/// Application close code for an orderly local close.
pub const CLOSE_NORMAL: u32 = 0;

/// Application close code used when an identity cannot be verified.
pub const CLOSE_UNVERIFIED: u32 = 3;

// ============================================================================
// Connection Events
// ============================================================================

/// Why a connection went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by either side with an application error code.
    Application(u64),
    /// Closed locally.
    Local,
    /// Idle timeout.
    TimedOut,
    /// Handshake plus control stream setup did not finish in time.
    HandshakeTimeout,
    Failed(String),
}

impl CloseReason {
    fn from_connection_error(err: &quinn::ConnectionError) -> Self {
        match err {
            quinn::ConnectionError::ApplicationClosed(close) => {
                CloseReason::Application(close.error_code.into_inner())
            }
            quinn::ConnectionError::LocallyClosed => CloseReason::Local,
            quinn::ConnectionError::TimedOut => CloseReason::TimedOut,
            other => CloseReason::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Application(code) => write!(f, "closed with code {}", code),
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::TimedOut => write!(f, "idle timeout"),
            CloseReason::HandshakeTimeout => write!(f, "handshake timed out"),
            CloseReason::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

pub type EstablishedCallback = Box<dyn FnOnce(&Arc<Connection>) + Send + 'static>;
pub type ClosedCallback = Box<dyn FnOnce(ConnectionId, &CloseReason) + Send + 'static>;

/// Per-dial options for [`QuicEndpoint::establish_connection`].
///
/// Callbacks run on the endpoint actor, after the registry has been updated:
/// `on_established` sees the connection already registered, `on_closed` sees
/// it already removed. `on_closed` fires for every dial that was started,
/// including ones that never got past the handshake.
#[derive(Default)]
pub struct ConnectOptions {
    handshake_timeout: Option<Duration>,
    on_established: Option<EstablishedCallback>,
    on_closed: Option<ClosedCallback>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn on_established<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Arc<Connection>) + Send + 'static,
    {
        self.on_established = Some(Box::new(callback));
        self
    }

    pub fn on_closed<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(ConnectionId, &CloseReason) + Send + 'static,
    {
        self.on_closed = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("on_established", &self.on_established.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}

// ============================================================================
// Actor Commands
// ============================================================================

enum EndpointCommand {
    /// Dial a peer and reserve its registry slot
    Establish {
        peer: PeerAddress,
        options: ConnectOptions,
        reply: oneshot::Sender<Result<ConnectionId>>,
    },
    /// Outbound handshake and control stream finished
    Opened { connection: Arc<Connection> },
    /// Inbound handshake and control stream finished
    Accepted { connection: Arc<Connection> },
    /// The transport reported the connection closed
    Closed { id: ConnectionId, reason: CloseReason },
    GetConn {
        id: ConnectionId,
        reply: oneshot::Sender<Option<Arc<Connection>>>,
    },
    Send {
        id: ConnectionId,
        message: PendingMessage,
        reply: oneshot::Sender<bool>,
    },
    Notify {
        ids: Vec<ConnectionId>,
        payload: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
    ConnectionCount { reply: oneshot::Sender<usize> },
    /// Close everything and stop the actor
    Quit,
}

/// State shared with per-connection driver tasks.
struct DriverContext {
    cmd_tx: mpsc::Sender<EndpointCommand>,
    router: Arc<Router>,
    limits: StreamLimits,
    handshake_timeout: Duration,
    next_id: AtomicU64,
}

impl DriverContext {
    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn report(&self, command: EndpointCommand) {
        // The actor only disappears after quit; late events are dropped.
        let _ = self.cmd_tx.send(command).await;
    }
}

// ============================================================================
// Actor (owns the registry)
// ============================================================================

#[derive(Default)]
struct DialCallbacks {
    on_established: Option<EstablishedCallback>,
    on_closed: Option<ClosedCallback>,
}

struct EndpointActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    registry: ConnectionRegistry<Arc<Connection>>,
    callbacks: HashMap<ConnectionId, DialCallbacks>,
    ctx: Arc<DriverContext>,
}

impl EndpointActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<EndpointCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                EndpointCommand::Establish {
                    peer,
                    options,
                    reply,
                } => {
                    let result = self.establish(peer, options);
                    let _ = reply.send(result);
                }
                EndpointCommand::Opened { connection } => self.on_opened(connection),
                EndpointCommand::Accepted { connection } => self.on_accepted(connection),
                EndpointCommand::Closed { id, reason } => self.on_closed(id, reason),
                EndpointCommand::GetConn { id, reply } => {
                    let _ = reply.send(self.registry.get(id).cloned());
                }
                EndpointCommand::Send { id, message, reply } => {
                    let sent = match self.registry.get(id) {
                        Some(connection) => connection.send(message),
                        None => {
                            message.fail(RequestError::NotConnected);
                            false
                        }
                    };
                    let _ = reply.send(sent);
                }
                EndpointCommand::Notify { ids, payload, reply } => {
                    let _ = reply.send(self.notify(&ids, &payload));
                }
                EndpointCommand::ConnectionCount { reply } => {
                    let _ = reply.send(self.registry.len());
                }
                EndpointCommand::Quit => {
                    debug!("endpoint actor shutting down");
                    self.shutdown();
                    break;
                }
            }
        }

        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let EndpointCommand::Send { message, reply, .. } = cmd {
                message.fail(RequestError::NotConnected);
                let _ = reply.send(false);
            }
        }
    }

    fn establish(&mut self, peer: PeerAddress, options: ConnectOptions) -> Result<ConnectionId> {
        let sni = identity_to_sni(&peer.identity);
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), peer.addr, &sni)
            .with_context(|| format!("failed to initiate connection to {}", peer.addr))?;

        let id = self.ctx.allocate_id();
        if !self.registry.reserve(id) {
            // Ids are never reused, so this cannot happen while the counter
            // is monotonic.
            anyhow::bail!("connection id {} already registered", id);
        }
        self.callbacks.insert(
            id,
            DialCallbacks {
                on_established: options.on_established,
                on_closed: options.on_closed,
            },
        );

        let handshake_timeout = options
            .handshake_timeout
            .unwrap_or(self.ctx.handshake_timeout);
        debug!(conn = %id, peer = %peer.identity.short(), addr = %peer.addr, "dialing");
        tokio::spawn(drive_outbound(
            id,
            peer,
            connecting,
            handshake_timeout,
            self.ctx.clone(),
        ));

        Ok(id)
    }

    fn on_opened(&mut self, connection: Arc<Connection>) {
        let id = connection.id();
        if let Err(connection) = self.registry.fill(id, connection.clone()) {
            // The slot is gone: the dial was abandoned (shutdown).
            warn!(conn = %id, "connection opened without a reserved slot, closing");
            connection.close(CLOSE_NORMAL, b"abandoned");
            return;
        }

        info!(
            conn = %id,
            peer = %connection.peer().short(),
            remote = %connection.remote_addr(),
            "outbound connection established"
        );

        let callback = self
            .callbacks
            .get_mut(&id)
            .and_then(|callbacks| callbacks.on_established.take());
        if let Some(callback) = callback {
            callback(&connection);
        }
    }

    fn on_accepted(&mut self, connection: Arc<Connection>) {
        let id = connection.id();
        let peer = connection.peer();
        let remote = connection.remote_addr();
        if let Err(connection) = self.registry.insert(id, connection) {
            warn!(conn = %id, "duplicate inbound connection id, closing");
            connection.close(CLOSE_NORMAL, b"duplicate");
            return;
        }
        info!(conn = %id, peer = %peer.short(), remote = %remote, "inbound connection established");
    }

    fn on_closed(&mut self, id: ConnectionId, reason: CloseReason) {
        match self.registry.remove(id) {
            Some(ConnectionSlot::Established(connection)) => {
                debug!(
                    conn = %id,
                    peer = %connection.peer().short(),
                    reason = %reason,
                    "connection closed"
                );
            }
            Some(ConnectionSlot::Pending) => {
                debug!(conn = %id, reason = %reason, "connection closed before it was established");
            }
            None => {
                trace!(conn = %id, "close event for unregistered connection");
            }
        }

        if let Some(callback) = self.callbacks.remove(&id).and_then(|c| c.on_closed) {
            callback(id, &reason);
        }
    }

    fn notify(&self, ids: &[ConnectionId], payload: &[u8]) -> usize {
        let mut delivered = 0;
        for &id in ids {
            match self.registry.get(id) {
                Some(connection) => {
                    if connection.send(PendingMessage::request(NOTIFY, payload.to_vec())) {
                        delivered += 1;
                    }
                }
                None => trace!(conn = %id, "skipping notify for disconnected peer"),
            }
        }
        delivered
    }

    fn shutdown(&mut self) {
        for (_, slot) in self.registry.drain() {
            if let ConnectionSlot::Established(connection) = slot {
                connection.close(CLOSE_NORMAL, b"shutdown");
            }
        }
        for (id, callbacks) in self.callbacks.drain() {
            if let Some(callback) = callbacks.on_closed {
                callback(id, &CloseReason::Local);
            }
        }
        self.endpoint.close(VarInt::from_u32(CLOSE_NORMAL), b"shutdown");
    }
}

// ============================================================================
// Connection Drivers
// ============================================================================

async fn drive_outbound(
    id: ConnectionId,
    peer: PeerAddress,
    connecting: quinn::Connecting,
    handshake_timeout: Duration,
    ctx: Arc<DriverContext>,
) {
    let setup = async {
        let conn = connecting
            .await
            .with_context(|| format!("failed to establish connection to {}", peer.addr))?;

        // SECURITY: the verifier already pins the key through SNI; check again
        // against the certificate we actually got.
        match extract_verified_identity(&conn) {
            Some(identity) if identity == peer.identity => {}
            _ => {
                conn.close(VarInt::from_u32(CLOSE_UNVERIFIED), b"identity mismatch");
                anyhow::bail!("peer identity does not match {}", peer.identity.short());
            }
        }

        let streams = stream::open_control_stream(&conn).await?;
        Ok::<_, anyhow::Error>((conn, streams))
    };

    let (conn, streams) = match tokio::time::timeout(handshake_timeout, setup).await {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            debug!(conn = %id, addr = %peer.addr, error = %format!("{:#}", e), "outbound connection failed");
            ctx.report(EndpointCommand::Closed {
                id,
                reason: CloseReason::Failed(format!("{:#}", e)),
            })
            .await;
            return;
        }
        Err(_) => {
            debug!(conn = %id, addr = %peer.addr, "outbound handshake timed out");
            ctx.report(EndpointCommand::Closed {
                id,
                reason: CloseReason::HandshakeTimeout,
            })
            .await;
            return;
        }
    };

    let control = ControlStream::spawn(id, conn.clone(), streams, ctx.router.clone(), ctx.limits);
    let connection = Arc::new(Connection::new(id, peer.identity, conn.clone(), control));
    ctx.report(EndpointCommand::Opened { connection }).await;

    let reason = CloseReason::from_connection_error(&conn.closed().await);
    ctx.report(EndpointCommand::Closed { id, reason }).await;
}

async fn drive_inbound(incoming: Incoming, ctx: Arc<DriverContext>) {
    let remote = incoming.remote_address();
    let setup = async {
        let conn = incoming
            .accept()
            .context("failed to accept connection")?
            .await
            .context("inbound handshake failed")?;

        let Some(peer) = extract_verified_identity(&conn) else {
            warn!(remote = %remote, "rejecting connection: could not verify peer identity");
            conn.close(VarInt::from_u32(CLOSE_UNVERIFIED), b"unverified");
            anyhow::bail!("could not verify peer identity from certificate");
        };

        let streams = stream::accept_control_stream(&conn).await?;
        Ok::<_, anyhow::Error>((conn, peer, streams))
    };

    let (conn, peer, streams) = match tokio::time::timeout(ctx.handshake_timeout, setup).await {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            debug!(remote = %remote, error = %format!("{:#}", e), "inbound connection failed");
            return;
        }
        Err(_) => {
            debug!(remote = %remote, "inbound handshake timed out");
            return;
        }
    };

    let id = ctx.allocate_id();
    let control = ControlStream::spawn(id, conn.clone(), streams, ctx.router.clone(), ctx.limits);
    let connection = Arc::new(Connection::new(id, peer, conn.clone(), control));
    ctx.report(EndpointCommand::Accepted { connection }).await;

    let reason = CloseReason::from_connection_error(&conn.closed().await);
    ctx.report(EndpointCommand::Closed { id, reason }).await;
}

async fn accept_loop(endpoint: Endpoint, ctx: Arc<DriverContext>) {
    while let Some(incoming) = endpoint.accept().await {
        trace!(remote = %incoming.remote_address(), "incoming connection");
        tokio::spawn(drive_inbound(incoming, ctx.clone()));
    }
    debug!("endpoint stopped accepting connections");
}

// ============================================================================
// QuicEndpoint Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct QuicEndpoint {
    endpoint: Endpoint,
    identity: Identity,
    router: Arc<Router>,
    cmd_tx: mpsc::Sender<EndpointCommand>,
    notifications: Arc<Mutex<Option<mpsc::Receiver<Notification>>>>,
}

impl QuicEndpoint {
    /// Bind the endpoint and start accepting connections.
    ///
    /// Fails if the TLS identity cannot be turned into a certificate or the
    /// UDP socket cannot be bound.
    pub async fn bind(config: EndpointConfig, handlers: Handlers) -> Result<Self> {
        let identity = config.keypair.identity();
        let tls = TlsIdentity::generate(&config.keypair).context("failed to build TLS identity")?;
        let client_config = crypto::create_client_config(&tls, &config)?;

        let endpoint = if config.accept_inbound {
            let server_config = crypto::create_server_config(&tls, &config)?;
            Endpoint::server(server_config, config.bind)
                .with_context(|| format!("failed to bind QUIC endpoint on {}", config.bind))?
        } else {
            Endpoint::client(config.bind)
                .with_context(|| format!("failed to bind QUIC client on {}", config.bind))?
        };

        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_CHANNEL_SIZE);
        let router = Arc::new(Router::new(handlers, notify_tx));

        let (cmd_tx, cmd_rx) = mpsc::channel(ENDPOINT_COMMAND_CHANNEL_SIZE);
        let ctx = Arc::new(DriverContext {
            cmd_tx: cmd_tx.clone(),
            router: router.clone(),
            limits: StreamLimits {
                request_timeout: config.request_timeout,
                max_frame_size: config.max_frame_size,
            },
            handshake_timeout: config.handshake_timeout,
            next_id: AtomicU64::new(1),
        });

        if config.accept_inbound {
            tokio::spawn(accept_loop(endpoint.clone(), ctx.clone()));
        }

        let actor = EndpointActor {
            endpoint: endpoint.clone(),
            client_config,
            registry: ConnectionRegistry::new(),
            callbacks: HashMap::new(),
            ctx,
        };
        tokio::spawn(actor.run(cmd_rx));

        let local = endpoint.local_addr().ok();
        info!(
            identity = %identity.short(),
            addr = ?local,
            inbound = config.accept_inbound,
            "QUIC endpoint started"
        );

        Ok(Self {
            endpoint,
            identity,
            router,
            cmd_tx,
            notifications: Arc::new(Mutex::new(Some(notify_rx))),
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("failed to read endpoint address")
    }

    /// Address a peer can use to dial this endpoint.
    pub fn peer_address(&self) -> Result<PeerAddress> {
        Ok(PeerAddress::new(self.identity, self.local_addr()?))
    }

    pub fn handlers(&self) -> &Handlers {
        self.router.handlers()
    }

    /// Inbound `notify` pushes and datagrams. Can be taken once.
    pub fn notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn command<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EndpointCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("endpoint actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("endpoint actor closed"))
    }

    /// Dial `peer` and reserve its registry slot.
    ///
    /// Returns as soon as the dial has started; the outcome arrives through
    /// the callbacks in `options`. Fails, registering nothing, if the dial
    /// cannot be started at all.
    pub async fn establish_connection(
        &self,
        peer: PeerAddress,
        options: ConnectOptions,
    ) -> Result<ConnectionId> {
        self.command(|reply| EndpointCommand::Establish {
            peer,
            options,
            reply,
        })
        .await?
    }

    /// Dial `peer` and wait until the connection is established.
    pub async fn connect(&self, peer: PeerAddress) -> Result<Arc<Connection>> {
        let (tx, rx) = oneshot::channel::<Result<Arc<Connection>, CloseReason>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let closed_tx = tx.clone();

        let options = ConnectOptions::new()
            .on_established(move |connection| {
                if let Some(tx) = take_sender(&tx) {
                    let _ = tx.send(Ok(connection.clone()));
                }
            })
            .on_closed(move |_, reason| {
                if let Some(tx) = take_sender(&closed_tx) {
                    let _ = tx.send(Err(reason.clone()));
                }
            });

        self.establish_connection(peer, options).await?;
        match rx.await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(reason)) => anyhow::bail!("connection to {} failed: {}", peer, reason),
            Err(_) => anyhow::bail!("endpoint actor closed"),
        }
    }

    /// Look up an established connection. Absence is normal: the peer is not
    /// (or no longer) connected.
    pub async fn get_conn(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.command(|reply| EndpointCommand::GetConn { id, reply })
            .await
            .ok()
            .flatten()
    }

    /// Send a named message on `id`'s control stream.
    ///
    /// With a callback, the message is a request and the callback receives the
    /// correlated reply; without one it is a command. Returns `false` if the
    /// connection is not registered, in which case the callback has already
    /// been completed with [`RequestError::NotConnected`].
    pub async fn send(
        &self,
        id: ConnectionId,
        method: &str,
        body: impl Into<Vec<u8>>,
        callback: Option<ResponseCallback>,
    ) -> bool {
        let message = PendingMessage::request(method, body).with_boxed_callback(callback);
        let (reply, sent) = oneshot::channel();
        if let Err(mpsc::error::SendError(command)) =
            self.cmd_tx.send(EndpointCommand::Send { id, message, reply }).await
        {
            if let EndpointCommand::Send { message, .. } = command {
                message.fail(RequestError::NotConnected);
            }
            return false;
        }
        // The actor answers or fails every queued send before it exits.
        sent.await.unwrap_or(false)
    }

    /// Best-effort `notify` fan-out. Ids that are not connected are skipped.
    /// Returns how many connections the notification was queued on.
    pub async fn notify(&self, ids: &[ConnectionId], payload: impl Into<Vec<u8>>) -> usize {
        let ids = ids.to_vec();
        let payload = payload.into();
        self.command(|reply| EndpointCommand::Notify { ids, payload, reply })
            .await
            .unwrap_or(0)
    }

    /// Number of established connections.
    pub async fn connection_count(&self) -> usize {
        self.command(|reply| EndpointCommand::ConnectionCount { reply })
            .await
            .unwrap_or(0)
    }

    /// Shut down the endpoint actor, closing every connection.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(EndpointCommand::Quit).await;
    }
}

impl fmt::Debug for QuicEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicEndpoint")
            .field("identity", &self.identity)
            .field("addr", &self.endpoint.local_addr().ok())
            .finish_non_exhaustive()
    }
}

fn take_sender<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

#[async_trait]
impl PeerRpc for QuicEndpoint {
    async fn ping(&self, to: ConnectionId) -> Result<()> {
        let reply = self.request(to, SNODE_PING, Vec::new()).await?;
        if reply != PONG {
            anyhow::bail!("unexpected ping reply from {}", to);
        }
        Ok(())
    }

    async fn request(&self, to: ConnectionId, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.send(to, method, body, Some(callback)).await;

        let result = rx
            .await
            .map_err(|_| anyhow::anyhow!("endpoint actor closed"))?;
        result.with_context(|| format!("{} request on {} failed", method, to))
    }
}
