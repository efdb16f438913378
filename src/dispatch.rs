//! Inbound request routing.
//!
//! Every named frame that arrives on a control stream is classified by its
//! method name:
//!
//! | Method | Routed to |
//! |--------|-----------|
//! | `snode_ping` | [`ServiceNode::update_last_ping`], answered with `pong` |
//! | `monitor` | [`MonitorHandler`], reply written back verbatim |
//! | `notify` | the endpoint's notification channel |
//! | anything the [`RequestHandler`] recognizes | client RPC, reply wrapped as `[status, body]` |
//! | anything else | [`Dispatch::NoSuchEndpoint`] |
//!
//! Routing never fails the stream: an unknown method is a typed result the
//! caller turns into an error reply.
//!
//! [`ServiceNode::update_last_ping`]: crate::protocols::ServiceNode::update_last_ping
//! [`MonitorHandler`]: crate::protocols::MonitorHandler
//! [`RequestHandler`]: crate::protocols::RequestHandler

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::messages::{MONITOR, NOTIFY, PONG, SNODE_PING};
use crate::protocols::{Handlers, MonitorResponder, ReachType, RpcResponder, StreamRef};
use crate::registry::ConnectionId;

/// Capacity of the inbound notification channel.
pub const NOTIFICATION_CHANNEL_SIZE: usize = 1024;

/// Outcome of routing a named request.
#[derive(Debug)]
pub enum Dispatch {
    /// A handler took the request; its reply body arrives on the receiver.
    Handled(oneshot::Receiver<Vec<u8>>),
    NoSuchEndpoint,
}

/// An unsolicited message pushed to us by a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub conn: ConnectionId,
    /// `Some("notify")` for control-stream pushes, `None` for datagrams.
    pub method: Option<String>,
    pub body: Vec<u8>,
}

pub struct Router {
    handlers: Handlers,
    notifications: mpsc::Sender<Notification>,
}

impl Router {
    pub(crate) fn new(handlers: Handlers, notifications: mpsc::Sender<Notification>) -> Self {
        Self {
            handlers,
            notifications,
        }
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn route_request(
        &self,
        conn: ConnectionId,
        remote_host: &str,
        method: &str,
        body: Vec<u8>,
    ) -> Dispatch {
        let (tx, rx) = oneshot::channel();
        match method {
            SNODE_PING => {
                trace!(conn = %conn, "snode_ping");
                self.handlers.service_node.update_last_ping(ReachType::Quic);
                let _ = tx.send(PONG.to_vec());
                Dispatch::Handled(rx)
            }
            MONITOR => {
                self.handlers
                    .monitor
                    .handle_monitor(body, MonitorResponder::new(tx), StreamRef { conn });
                Dispatch::Handled(rx)
            }
            NOTIFY => {
                self.deliver(Notification {
                    conn,
                    method: Some(NOTIFY.to_string()),
                    body,
                });
                let _ = tx.send(Vec::new());
                Dispatch::Handled(rx)
            }
            _ => {
                let responder = RpcResponder::new(tx);
                if self
                    .handlers
                    .requests
                    .handle_client_rpc(method, body, remote_host, responder)
                {
                    Dispatch::Handled(rx)
                } else {
                    Dispatch::NoSuchEndpoint
                }
            }
        }
    }

    /// Route a message that expects no reply. Any answer a handler produces
    /// is discarded.
    pub fn route_command(&self, conn: ConnectionId, remote_host: &str, method: &str, body: Vec<u8>) {
        if method == NOTIFY {
            self.deliver(Notification {
                conn,
                method: Some(NOTIFY.to_string()),
                body,
            });
            return;
        }
        if let Dispatch::NoSuchEndpoint = self.route_request(conn, remote_host, method, body) {
            debug!(conn = %conn, method = %method, "dropping command for unknown endpoint");
        }
    }

    pub fn route_datagram(&self, conn: ConnectionId, body: Vec<u8>) {
        self.deliver(Notification {
            conn,
            method: None,
            body,
        });
    }

    fn deliver(&self, notification: Notification) {
        match self.notifications.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(conn = %n.conn, "notification channel full, dropping notification");
            }
            // Nobody is listening; notifications are best-effort.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
