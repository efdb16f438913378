use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

use snode_net::{
    CLOSE_NORMAL, EndpointConfig, Handlers, Keypair, PeerAddress, PeerRpc, QuicEndpoint,
    REACHABILITY_HANDSHAKE_TIMEOUT, unwrap_response,
};

/// Storage server QUIC connectivity test.
///
/// Prints one `PUBKEY: pass|FAIL` line per target.
#[derive(Parser, Debug)]
#[command(name = "snode-net")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local UDP address to dial from.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Print timing and node info for every target.
    #[arg(short, long)]
    verbose: bool,

    /// Connect timeout per target, in milliseconds.
    #[arg(short, long, value_name = "MS", default_value_t = REACHABILITY_HANDSHAKE_TIMEOUT.as_millis() as u64)]
    timeout: u64,

    /// Nodes to test.
    #[arg(value_name = "IP:PORT/PUBKEY", required = true)]
    targets: Vec<PeerAddress>,
}

#[derive(Debug)]
enum Outcome {
    Pass { info: String },
    Fail { reason: String },
}

/// Connect to `target` and ask it for `info`. The target passes only if the
/// request is answered with a well-formed reply in time.
async fn test_target(endpoint: &QuicEndpoint, target: PeerAddress, timeout: Duration) -> Outcome {
    let connection = match endpoint.connect(target).await {
        Ok(connection) => connection,
        Err(e) => {
            return Outcome::Fail {
                reason: format!("connection failed: {:#}", e),
            };
        }
    };

    let outcome = match time::timeout(timeout, endpoint.request(connection.id(), "info", Vec::new())).await {
        Ok(Ok(reply)) => match unwrap_response(&reply) {
            Ok((status, body)) => Outcome::Pass {
                info: format!("info: {} {}", status, String::from_utf8_lossy(&body)),
            },
            Err(e) => Outcome::Fail {
                reason: format!("request failed: undecodable reply ({})", e),
            },
        },
        Ok(Err(e)) => Outcome::Fail {
            reason: format!("request failed: {:#}", e),
        },
        Err(_) => Outcome::Fail {
            reason: "request failed: request timed out".to_string(),
        },
    };

    connection.close(CLOSE_NORMAL, b"test done");
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let timeout = Duration::from_millis(args.timeout);

    // Throwaway identity: the tester only dials out.
    let config = EndpointConfig::new(args.bind, Keypair::generate())
        .client_only()
        .with_handshake_timeout(timeout);
    let endpoint = QuicEndpoint::bind(config, Handlers::unhandled()).await?;
    info!(identity = %endpoint.identity(), "connectivity tester started");

    let mut seen = HashSet::new();
    let mut failures = 0usize;

    for target in args.targets {
        if !seen.insert(target.identity) {
            debug!(peer = %target.identity, "ignoring repeated target");
            continue;
        }

        let started = Instant::now();
        let outcome = test_target(&endpoint, target, timeout).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (verdict, extra) = match outcome {
            Outcome::Pass { info } => ("pass", info),
            Outcome::Fail { reason } => {
                failures += 1;
                ("FAIL", reason)
            }
        };

        println!("{}: {}", target.identity, verdict);
        if args.verbose {
            println!(" - request took {:.1}ms", elapsed_ms);
            println!(" - {}", extra);
            println!();
        }
    }

    endpoint.quit().await;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use snode_net::{
        MonitorHandler, MonitorResponder, ProtocolVersion, ReachType, RequestHandler, RpcResponder,
        ServiceNode, StreamRef,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Answers `info`, or nothing at all when `silent`.
    struct InfoNode {
        silent: bool,
    }

    impl RequestHandler for InfoNode {
        fn handle_client_rpc(&self, endpoint: &str, _: Vec<u8>, _: &str, responder: RpcResponder) -> bool {
            if endpoint != "info" {
                return false;
            }
            if self.silent {
                // Keep the request open past the caller's deadline.
                tokio::spawn(async move {
                    time::sleep(Duration::from_secs(2)).await;
                    drop(responder);
                });
            } else {
                responder.respond(200, br#"{"version":[2,8,0]}"#);
            }
            true
        }
    }

    impl MonitorHandler for InfoNode {
        fn handle_monitor(&self, _: Vec<u8>, _: MonitorResponder, _: StreamRef) {}
    }

    impl ServiceNode for InfoNode {
        fn update_last_ping(&self, _: ReachType) {}

        fn hardfork_at_least(&self, _: ProtocolVersion) -> bool {
            true
        }
    }

    async fn node(handlers: Handlers) -> QuicEndpoint {
        QuicEndpoint::bind(
            EndpointConfig::new("127.0.0.1:0".parse().unwrap(), Keypair::generate()),
            handlers,
        )
        .await
        .unwrap()
    }

    async fn tester() -> QuicEndpoint {
        QuicEndpoint::bind(
            EndpointConfig::new("127.0.0.1:0".parse().unwrap(), Keypair::generate()).client_only(),
            Handlers::unhandled(),
        )
        .await
        .unwrap()
    }

    fn info_handlers(silent: bool) -> Handlers {
        let node = Arc::new(InfoNode { silent });
        Handlers::new(node.clone(), node.clone(), node)
    }

    #[tokio::test]
    async fn answered_info_passes() {
        let server = node(info_handlers(false)).await;
        let endpoint = tester().await;

        let outcome = time::timeout(
            TEST_TIMEOUT,
            test_target(&endpoint, server.peer_address().unwrap(), Duration::from_secs(2)),
        )
        .await
        .unwrap();
        match outcome {
            Outcome::Pass { info } => assert!(info.starts_with("info: 200 "), "{}", info),
            other => panic!("expected pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejected_info_fails() {
        let server = node(Handlers::unhandled()).await;
        let endpoint = tester().await;

        let outcome = time::timeout(
            TEST_TIMEOUT,
            test_target(&endpoint, server.peer_address().unwrap(), Duration::from_secs(2)),
        )
        .await
        .unwrap();
        match outcome {
            Outcome::Fail { reason } => {
                assert!(reason.starts_with("request failed: "), "{}", reason);
                assert!(reason.contains("no such endpoint"), "{}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unanswered_info_fails() {
        let server = node(info_handlers(true)).await;
        let endpoint = tester().await;

        let outcome = time::timeout(
            TEST_TIMEOUT,
            test_target(&endpoint, server.peer_address().unwrap(), Duration::from_millis(300)),
        )
        .await
        .unwrap();
        match outcome {
            Outcome::Fail { reason } => assert_eq!(reason, "request failed: request timed out"),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
