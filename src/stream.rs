//! # Control Stream
//!
//! Each peer connection carries exactly one long-lived bidirectional stream.
//! Named requests, their replies, fire-and-forget commands and `notify` pushes
//! all share it; unsolicited datagrams ride QUIC's unreliable datagram channel
//! alongside.
//!
//! ## Architecture
//!
//! - [`ControlStream`]: cheap-to-clone handle that queues [`PendingMessage`]s
//! - `StreamActor`: owns the send half and the outstanding-request table
//! - reader task: decodes inbound frames and feeds them to the actor
//! - datagram task: forwards inbound datagrams to the router
//!
//! ## Request Lifecycle
//!
//! A request carrying a callback is assigned a stream-local id and written as
//! a `Request` frame. Its callback fires exactly once with one of:
//!
//! - the correlated `Response` body
//! - [`RequestError::NoSuchEndpoint`] / [`RequestError::Remote`] from an `Error` frame
//! - [`RequestError::TimedOut`] once the request timeout passes
//! - [`RequestError::ConnectionClosed`] if the stream ends first
//!
//! A message without a callback goes out as a `Command` frame; nothing comes
//! back for it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use quinn::{RecvStream, SendStream, VarInt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::dispatch::{Dispatch, Router};
use crate::messages::{self, CONTROL_STREAM_PREAMBLE, FRAME_HEADER_SIZE, Frame, NO_SUCH_ENDPOINT};
use crate::registry::ConnectionId;

/// Application close code: the peer finished or reset its control stream.
pub const CLOSE_STREAM_ENDED: u32 = 1;

/// Application close code: the peer violated the framing protocol.
pub const CLOSE_PROTOCOL_ERROR: u32 = 2;

/// How often outstanding requests are checked against their deadline.
const REQUEST_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Pending Messages
// ============================================================================

/// Failure delivered to a request callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// The peer does not serve the requested method.
    NoSuchEndpoint,
    /// The peer answered with an error reply.
    Remote(String),
    /// No reply arrived within the request timeout.
    TimedOut,
    /// The control stream ended before a reply arrived.
    ConnectionClosed,
    /// The target connection is not registered.
    NotConnected,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::NoSuchEndpoint => write!(f, "no such endpoint"),
            RequestError::Remote(message) => write!(f, "remote error: {}", message),
            RequestError::TimedOut => write!(f, "request timed out"),
            RequestError::ConnectionClosed => write!(f, "connection closed"),
            RequestError::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for RequestError {}

pub type ResponseCallback = Box<dyn FnOnce(Result<Vec<u8>, RequestError>) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Named message on the control stream.
    Request,
    /// Unnamed body sent as an unreliable datagram.
    Datagram,
}

/// A queued message, owned by the stream from enqueue until it is written.
pub struct PendingMessage {
    name: Option<String>,
    body: Vec<u8>,
    kind: MessageKind,
    callback: Option<ResponseCallback>,
}

impl PendingMessage {
    pub fn request(name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: Some(name.into()),
            body: body.into(),
            kind: MessageKind::Request,
            callback: None,
        }
    }

    pub fn datagram(body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: None,
            body: body.into(),
            kind: MessageKind::Datagram,
            callback: None,
        }
    }

    /// Ask for the correlated reply. Only meaningful for requests.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<Vec<u8>, RequestError>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub(crate) fn with_boxed_callback(mut self, callback: Option<ResponseCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn expects_reply(&self) -> bool {
        self.callback.is_some()
    }

    /// Complete the message's callback, if any, with `err`.
    pub(crate) fn fail(self, err: RequestError) {
        if let Some(callback) = self.callback {
            callback(Err(err));
        }
    }
}

impl fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMessage")
            .field("name", &self.name)
            .field("body_len", &self.body.len())
            .field("kind", &self.kind)
            .field("expects_reply", &self.callback.is_some())
            .finish()
    }
}

// ============================================================================
// ControlStream Handle
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamLimits {
    pub request_timeout: Duration,
    pub max_frame_size: usize,
}

#[derive(Clone)]
pub struct ControlStream {
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<PendingMessage>,
}

impl ControlStream {
    /// Start the tasks driving an open control stream and return its handle.
    pub(crate) fn spawn(
        id: ConnectionId,
        conn: quinn::Connection,
        (send, recv): (SendStream, RecvStream),
        router: Arc<Router>,
        limits: StreamLimits,
    ) -> Self {
        let (tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_frames(recv, limits.max_frame_size, events_tx.clone()));
        tokio::spawn(read_datagrams(id, conn.clone(), router.clone()));

        let actor = StreamActor {
            id,
            remote: conn.remote_address(),
            conn,
            send,
            router,
            limits,
            next_request_id: 0,
            pending: HashMap::new(),
            events_tx,
        };
        tokio::spawn(actor.run(outbound_rx, events_rx));

        Self { conn: id, tx }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    /// Queue a message. Returns `false` once the stream has shut down, in
    /// which case the message's callback has already been failed with
    /// [`RequestError::ConnectionClosed`].
    pub fn enqueue(&self, message: PendingMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(mpsc::error::SendError(message)) => {
                message.fail(RequestError::ConnectionClosed);
                false
            }
        }
    }

    /// Send a named request and hand its reply to `callback`.
    pub fn send<F>(&self, method: &str, body: impl Into<Vec<u8>>, callback: F) -> bool
    where
        F: FnOnce(Result<Vec<u8>, RequestError>) + Send + 'static,
    {
        self.enqueue(PendingMessage::request(method, body).with_callback(callback))
    }

    /// Send a named message that expects no reply.
    pub fn command(&self, method: &str, body: impl Into<Vec<u8>>) -> bool {
        self.enqueue(PendingMessage::request(method, body))
    }

    pub fn send_datagram(&self, body: impl Into<Vec<u8>>) -> bool {
        self.enqueue(PendingMessage::datagram(body))
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, method: &str, body: impl Into<Vec<u8>>) -> Result<Vec<u8>, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(method, body, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(RequestError::ConnectionClosed))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ControlStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlStream")
            .field("conn", &self.conn)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Open the control stream on a freshly dialed connection.
pub(crate) async fn open_control_stream(conn: &quinn::Connection) -> Result<(SendStream, RecvStream)> {
    let (mut send, recv) = conn
        .open_bi()
        .await
        .context("failed to open control stream")?;
    // A stream is invisible to the peer until data is written on it.
    send.write_all(&[CONTROL_STREAM_PREAMBLE])
        .await
        .context("failed to write control stream preamble")?;
    Ok((send, recv))
}

/// Accept the control stream the dialer opened.
pub(crate) async fn accept_control_stream(conn: &quinn::Connection) -> Result<(SendStream, RecvStream)> {
    let (send, mut recv) = conn
        .accept_bi()
        .await
        .context("failed to accept control stream")?;
    let mut preamble = [0u8; 1];
    recv.read_exact(&mut preamble)
        .await
        .context("failed to read control stream preamble")?;
    if preamble[0] != CONTROL_STREAM_PREAMBLE {
        anyhow::bail!("unexpected control stream preamble {:#04x}", preamble[0]);
    }
    Ok((send, recv))
}

// ============================================================================
// Inbound Readers
// ============================================================================

enum StreamEvent {
    Inbound(Frame),
    Reply { id: u64, reply: Result<Vec<u8>, String> },
    ReaderClosed { code: u32, reason: String },
}

async fn read_frames(
    mut recv: RecvStream,
    max_frame_size: usize,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let (code, reason) = loop {
        match read_frame(&mut recv, max_frame_size).await {
            Ok(Some(frame)) => {
                if events.send(StreamEvent::Inbound(frame)).is_err() {
                    return;
                }
            }
            Ok(None) => break (CLOSE_STREAM_ENDED, "control stream finished".to_string()),
            Err(ReadFailure::Transport(e)) => break (CLOSE_STREAM_ENDED, format!("{:#}", e)),
            Err(ReadFailure::Protocol(e)) => break (CLOSE_PROTOCOL_ERROR, format!("{:#}", e)),
        }
    };
    let _ = events.send(StreamEvent::ReaderClosed { code, reason });
}

enum ReadFailure {
    Transport(anyhow::Error),
    Protocol(anyhow::Error),
}

async fn read_frame(recv: &mut RecvStream, max_frame_size: usize) -> Result<Option<Frame>, ReadFailure> {
    let mut len_buf = [0u8; FRAME_HEADER_SIZE];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(ReadFailure::Transport(e.into())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    // SECURITY: reject before allocating.
    if len > max_frame_size {
        return Err(ReadFailure::Protocol(anyhow::anyhow!(
            "frame too large: {} bytes (max {})",
            len,
            max_frame_size
        )));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| ReadFailure::Transport(anyhow::Error::new(e).context("truncated frame")))?;

    messages::decode_frame(&buf, max_frame_size)
        .map(Some)
        .map_err(|e| ReadFailure::Protocol(anyhow::Error::new(e).context("malformed frame")))
}

async fn read_datagrams(id: ConnectionId, conn: quinn::Connection, router: Arc<Router>) {
    while let Ok(datagram) = conn.read_datagram().await {
        trace!(conn = %id, len = datagram.len(), "datagram received");
        router.route_datagram(id, datagram.to_vec());
    }
}

// ============================================================================
// Stream Actor
// ============================================================================

struct OutstandingRequest {
    deadline: Instant,
    callback: ResponseCallback,
}

struct StreamActor {
    id: ConnectionId,
    remote: SocketAddr,
    conn: quinn::Connection,
    send: SendStream,
    router: Arc<Router>,
    limits: StreamLimits,
    next_request_id: u64,
    pending: HashMap<u64, OutstandingRequest>,
    /// Handed to reply tasks so handler answers re-enter the actor.
    events_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamActor {
    async fn run(
        mut self,
        mut outbound_rx: mpsc::UnboundedReceiver<PendingMessage>,
        mut events_rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let mut sweep = tokio::time::interval(REQUEST_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let written = tokio::select! {
                message = outbound_rx.recv() => {
                    let Some(message) = message else {
                        trace!(conn = %self.id, "all control stream handles dropped");
                        break;
                    };
                    self.send_message(message).await
                }
                event = events_rx.recv() => {
                    match event {
                        Some(StreamEvent::Inbound(frame)) => self.handle_frame(frame).await,
                        Some(StreamEvent::Reply { id, reply }) => {
                            let frame = match reply {
                                Ok(body) => Frame::Response { id, body },
                                Err(message) => Frame::Error { id, message },
                            };
                            self.write_frame(&frame).await
                        }
                        Some(StreamEvent::ReaderClosed { code, reason }) => {
                            debug!(conn = %self.id, remote = %self.remote, reason = %reason, "control stream closed");
                            self.conn.close(VarInt::from_u32(code), reason.as_bytes());
                            break;
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.expire_requests();
                    Ok(())
                }
            };

            // A half-written stream cannot be resynchronized; drop the peer.
            if let Err(e) = written {
                debug!(conn = %self.id, error = %e, "control stream write failed");
                self.conn.close(VarInt::from_u32(CLOSE_STREAM_ENDED), b"write failed");
                break;
            }
        }

        self.shutdown(outbound_rx);
    }

    async fn send_message(&mut self, message: PendingMessage) -> Result<()> {
        let PendingMessage {
            name,
            body,
            kind,
            callback,
        } = message;

        if kind == MessageKind::Datagram {
            // Best-effort: a dropped datagram is not an error.
            if let Err(e) = self.conn.send_datagram(Bytes::from(body)) {
                debug!(conn = %self.id, error = %e, "datagram not sent");
            }
            return Ok(());
        }

        let method = name.unwrap_or_default();
        let Some(callback) = callback else {
            return self.write_frame(&Frame::Command { method, body }).await;
        };

        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let frame = Frame::Request {
            id,
            method,
            body,
        };
        if let Err(e) = self.write_frame(&frame).await {
            callback(Err(RequestError::ConnectionClosed));
            return Err(e);
        }

        self.pending.insert(
            id,
            OutstandingRequest {
                deadline: Instant::now() + self.limits.request_timeout,
                callback,
            },
        );
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        trace!(conn = %self.id, kind = frame.kind(), "frame received");
        match frame {
            Frame::Request { id, method, body } => {
                let remote_host = self.remote.ip().to_string();
                match self.router.route_request(self.id, &remote_host, &method, body) {
                    Dispatch::Handled(reply_rx) => {
                        self.await_reply(id, method, reply_rx);
                    }
                    Dispatch::NoSuchEndpoint => {
                        debug!(conn = %self.id, method = %method, "no such endpoint");
                        self.write_frame(&Frame::Error {
                            id,
                            message: NO_SUCH_ENDPOINT.to_string(),
                        })
                        .await?;
                    }
                }
            }
            Frame::Command { method, body } => {
                let remote_host = self.remote.ip().to_string();
                self.router.route_command(self.id, &remote_host, &method, body);
            }
            Frame::Response { id, body } => match self.pending.remove(&id) {
                Some(request) => (request.callback)(Ok(body)),
                None => debug!(conn = %self.id, id, "response for unknown or expired request"),
            },
            Frame::Error { id, message } => match self.pending.remove(&id) {
                Some(request) => {
                    let err = if message == NO_SUCH_ENDPOINT {
                        RequestError::NoSuchEndpoint
                    } else {
                        RequestError::Remote(message)
                    };
                    (request.callback)(Err(err));
                }
                None => debug!(conn = %self.id, id, "error reply for unknown or expired request"),
            },
        }
        Ok(())
    }

    /// Wait off-actor for a handler's answer, bounded by the request timeout.
    fn await_reply(&self, id: u64, method: String, reply_rx: oneshot::Receiver<Vec<u8>>) {
        let events = self.events_tx.clone();
        let timeout = self.limits.request_timeout;
        let conn = self.id;
        tokio::spawn(async move {
            let reply = match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(body)) => Ok(body),
                Ok(Err(_)) => {
                    warn!(conn = %conn, method = %method, "handler dropped request without replying");
                    Err("request was not answered".to_string())
                }
                Err(_) => {
                    warn!(conn = %conn, method = %method, "handler did not reply in time");
                    Err("request handling timed out".to_string())
                }
            };
            let _ = events.send(StreamEvent::Reply { id, reply });
        });
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = messages::encode_frame(frame).context("failed to encode frame")?;
        self.send
            .write_all(&bytes)
            .await
            .context("failed to write frame")?;
        Ok(())
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(request) = self.pending.remove(&id) {
                debug!(conn = %self.id, id, "request timed out");
                (request.callback)(Err(RequestError::TimedOut));
            }
        }
    }

    /// Fail everything still in flight or queued; each callback fires once.
    fn shutdown(mut self, mut outbound_rx: mpsc::UnboundedReceiver<PendingMessage>) {
        outbound_rx.close();
        while let Ok(message) = outbound_rx.try_recv() {
            message.fail(RequestError::ConnectionClosed);
        }
        for (_, request) in self.pending.drain() {
            (request.callback)(Err(RequestError::ConnectionClosed));
        }
        let _ = self.send.finish();
        trace!(conn = %self.id, "control stream actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::{DEFAULT_MAX_FRAME_SIZE, EndpointConfig};
    use crate::crypto::{self, TlsIdentity, identity_to_sni};
    use crate::dispatch::NOTIFICATION_CHANNEL_SIZE;
    use crate::identity::Keypair;
    use crate::protocols::{Handlers, RequestHandler, RpcResponder};

    #[test]
    fn pending_message_shapes() {
        let request = PendingMessage::request("store", b"data".to_vec());
        assert_eq!(request.name(), Some("store"));
        assert_eq!(request.kind(), MessageKind::Request);
        assert!(!request.expects_reply());

        let datagram = PendingMessage::datagram(b"x".to_vec());
        assert_eq!(datagram.name(), None);
        assert_eq!(datagram.kind(), MessageKind::Datagram);
        assert_eq!(datagram.body(), b"x");
    }

    #[test]
    fn failing_a_message_fires_its_callback_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let message = PendingMessage::request("info", vec![])
            .with_callback(move |result| sink.lock().unwrap().push(result));
        assert!(message.expects_reply());

        message.fail(RequestError::NotConnected);
        assert_eq!(*seen.lock().unwrap(), vec![Err(RequestError::NotConnected)]);
    }

    #[test]
    fn enqueue_on_dead_stream_fails_callback() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let stream = ControlStream {
            conn: ConnectionId(1),
            tx,
        };

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let sent = stream.send("info", vec![], move |result| {
            *sink.lock().unwrap() = Some(result);
        });

        assert!(!sent);
        assert!(stream.is_closed());
        assert_eq!(*seen.lock().unwrap(), Some(Err(RequestError::ConnectionClosed)));
    }

    /// Answers `slow` after a delay long enough for the caller to stop
    /// reading first.
    struct SlowReply;

    impl RequestHandler for SlowReply {
        fn handle_client_rpc(&self, endpoint: &str, _: Vec<u8>, _: &str, responder: RpcResponder) -> bool {
            if endpoint != "slow" {
                return false;
            }
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                responder.respond(200, b"late");
            });
            true
        }
    }

    /// Dial a raw QUIC connection whose accepting side runs a control stream
    /// actor. Returns the dialer's connection and its halves of the stream.
    async fn raw_control_pair(
        handlers: Handlers,
    ) -> (quinn::Endpoint, quinn::Endpoint, quinn::Connection, SendStream, RecvStream) {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server_keys = Keypair::generate();
        let server_config = EndpointConfig::new(loopback, server_keys.clone());
        let server_tls = TlsIdentity::generate(&server_keys).unwrap();
        let server = quinn::Endpoint::server(
            crypto::create_server_config(&server_tls, &server_config).unwrap(),
            loopback,
        )
        .unwrap();

        let client_keys = Keypair::generate();
        let client_config = EndpointConfig::new(loopback, client_keys.clone());
        let client_tls = TlsIdentity::generate(&client_keys).unwrap();
        let mut client = quinn::Endpoint::client(loopback).unwrap();
        client.set_default_client_config(crypto::create_client_config(&client_tls, &client_config).unwrap());

        let server_addr = server.local_addr().unwrap();
        let sni = identity_to_sni(&server_keys.identity());
        let (dialed, accepted) = tokio::join!(
            async { client.connect(server_addr, &sni).unwrap().await.unwrap() },
            async { server.accept().await.unwrap().await.unwrap() },
        );

        let (send, recv) = open_control_stream(&dialed).await.unwrap();
        let streams = accept_control_stream(&accepted).await.unwrap();

        let (notify_tx, _notify_rx) = mpsc::channel(NOTIFICATION_CHANNEL_SIZE);
        let router = Arc::new(Router::new(handlers, notify_tx));
        let limits = StreamLimits {
            request_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        };
        ControlStream::spawn(ConnectionId(1), accepted, streams, router, limits);

        (server, client, dialed, send, recv)
    }

    #[tokio::test]
    async fn failed_reply_write_closes_connection() {
        let mut handlers = Handlers::unhandled();
        handlers.requests = Arc::new(SlowReply);
        let (_server, _client, conn, mut send, mut recv) = raw_control_pair(handlers).await;

        let request = messages::encode_frame(&Frame::Request {
            id: 0,
            method: "slow".to_string(),
            body: Vec::new(),
        })
        .unwrap();
        send.write_all(&request).await.unwrap();
        // The reply now has nowhere to go.
        recv.stop(VarInt::from_u32(0)).unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .expect("connection stayed open after the reply write failed");
        match closed {
            quinn::ConnectionError::ApplicationClosed(close) => {
                assert_eq!(close.error_code, VarInt::from_u32(CLOSE_STREAM_ENDED));
                assert_eq!(&close.reason[..], b"write failed");
            }
            other => panic!("unexpected close: {:?}", other),
        }
        // Our send half is still open, so the close came from the write path.
        drop(send);
    }

    #[test]
    fn request_error_messages() {
        assert_eq!(RequestError::NoSuchEndpoint.to_string(), "no such endpoint");
        assert_eq!(RequestError::Remote("boom".into()).to_string(), "remote error: boom");
    }
}
