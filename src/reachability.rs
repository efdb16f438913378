//! # Reachability Test
//!
//! Decides whether a peer can be reached over QUIC within a bounded time.
//!
//! ```text
//!   Started ──open──────────────► Succeeded  (test connection closed at once)
//!      │
//!      └──closed, never opened──► Failed
//! ```
//!
//! Both transport callbacks can fire for one test (a successful test is
//! closed right after it opens), so the first one to report wins and every
//! later one is a no-op. Each test produces exactly one result.
//!
//! Networks that predate QUIC reachability testing get a trivial pass without
//! any connection attempt.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::REACHABILITY_HANDSHAKE_TIMEOUT;
use crate::endpoint::{CLOSE_NORMAL, ConnectOptions, QuicEndpoint};
use crate::identity::PeerAddress;
use crate::protocols::ProtocolVersion;

/// First network version whose nodes answer QUIC reachability tests.
pub const QUIC_REACHABILITY_TESTING: ProtocolVersion = ProtocolVersion::new(19, 3);

type ResultSink = Box<dyn Fn(bool) + Send + Sync + 'static>;

/// One in-flight reachability test against one peer.
pub struct ReachabilityTest {
    target: PeerAddress,
    reported: AtomicBool,
    sink: ResultSink,
    handshake_timeout: Duration,
}

impl ReachabilityTest {
    pub fn new<F>(target: PeerAddress, sink: F) -> Arc<Self>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Arc::new(Self {
            target,
            reported: AtomicBool::new(false),
            sink: Box::new(sink),
            handshake_timeout: REACHABILITY_HANDSHAKE_TIMEOUT,
        })
    }

    /// Like [`ReachabilityTest::new`] with a custom handshake timeout.
    pub fn with_handshake_timeout<F>(target: PeerAddress, timeout: Duration, sink: F) -> Arc<Self>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Arc::new(Self {
            target,
            reported: AtomicBool::new(false),
            sink: Box::new(sink),
            handshake_timeout: timeout,
        })
    }

    pub fn target(&self) -> PeerAddress {
        self.target
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }

    /// Record the verdict. Only the first call reaches the sink; returns
    /// whether this call was it.
    pub fn report(&self, reachable: bool) -> bool {
        if self.reported.swap(true, Ordering::AcqRel) {
            return false;
        }
        if reachable {
            debug!(peer = %self.target.identity.short(), addr = %self.target.addr, "reachability test passed");
        } else {
            info!(peer = %self.target.identity.short(), addr = %self.target.addr, "reachability test failed");
        }
        (self.sink)(reachable);
        true
    }
}

impl fmt::Debug for ReachabilityTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReachabilityTest")
            .field("target", &self.target)
            .field("reported", &self.is_reported())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl QuicEndpoint {
    /// Start a reachability test. The result is delivered through the test's sink.
    pub async fn reachability_test(&self, test: Arc<ReachabilityTest>) {
        if !self
            .handlers()
            .service_node
            .hardfork_at_least(QUIC_REACHABILITY_TESTING)
        {
            debug!(
                peer = %test.target.identity.short(),
                required = %QUIC_REACHABILITY_TESTING,
                "network predates QUIC reachability testing, assuming reachable"
            );
            test.report(true);
            return;
        }

        let on_open = test.clone();
        let on_close = test.clone();
        let options = ConnectOptions::new()
            .with_handshake_timeout(test.handshake_timeout)
            .on_established(move |connection| {
                on_open.report(true);
                connection.close(CLOSE_NORMAL, b"reachability test done");
            })
            .on_closed(move |_, reason| {
                if !on_close.is_reported() {
                    debug!(peer = %on_close.target.identity.short(), reason = %reason, "reachability connection closed");
                }
                on_close.report(false);
            });

        if let Err(e) = self.establish_connection(test.target, options).await {
            debug!(peer = %test.target.identity.short(), error = %format!("{:#}", e), "reachability dial failed");
            test.report(false);
        }
    }

    /// Test whether `target` is reachable and wait for the verdict.
    pub async fn test_reachability(&self, target: PeerAddress) -> bool {
        self.test_reachability_with_timeout(target, REACHABILITY_HANDSHAKE_TIMEOUT)
            .await
    }

    pub async fn test_reachability_with_timeout(&self, target: PeerAddress, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let test = ReachabilityTest::with_handshake_timeout(target, timeout, move |reachable| {
            if let Some(tx) = tx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                let _ = tx.send(reachable);
            }
        });
        self.reachability_test(test).await;
        rx.await.unwrap_or(false)
    }
}
