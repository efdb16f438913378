//! Integration tests for the async HTTP client.
//!
//! Each test runs a minimal HTTP/1.1 server on a loopback `TcpListener` whose
//! behavior (echo, delay, fixed status) is chosen per test.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use snode_net::{HttpClient, HttpClientConfig, HttpError, PendingHttpRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum Behavior {
    /// Reply 200 with the request body.
    Echo,
    /// Reply 200 with the request head, lowercased.
    Headers,
    /// Wait, then echo.
    Delay(Duration),
    /// Reply with a fixed status.
    Status(u16),
}

async fn spawn_server(behavior: Behavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket, behavior));
        }
    });
    addr
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

async fn serve(mut socket: TcpStream, behavior: Behavior) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = buf[header_end..header_end + content_length].to_vec();

    let (status, reply) = match behavior {
        Behavior::Echo => (200, body),
        Behavior::Headers => (200, head.to_lowercase().into_bytes()),
        Behavior::Delay(delay) => {
            sleep(delay).await;
            (200, body)
        }
        Behavior::Status(code) => (code, b"nope".to_vec()),
    };

    let response = format!(
        "HTTP/1.1 {} X\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        status,
        reply.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.write_all(&reply).await;
    let _ = socket.shutdown().await;
}

fn client() -> HttpClient {
    HttpClient::new(HttpClientConfig::default()).expect("client construction failed")
}

#[tokio::test]
async fn echo_returns_exact_body() {
    let addr = spawn_server(Behavior::Echo).await;
    let client = client();

    let payload = b"{\"method\":\"info\",\"params\":{}}".to_vec();
    let response = timeout(
        TEST_TIMEOUT,
        client.post_async(PendingHttpRequest::new(format!("http://{}/storage_rpc/v1", addr), payload.clone(), REQUEST_TIMEOUT)),
    )
    .await
    .expect("post hung")
    .expect("post failed");

    assert_eq!(response.status, 200);
    assert!(response.is_success());
    assert_eq!(response.body, payload);
}

#[tokio::test]
async fn requests_carry_standard_headers() {
    let addr = spawn_server(Behavior::Headers).await;
    let client = client();

    let response = client
        .post_async(PendingHttpRequest::new(format!("http://{}/", addr), b"x".to_vec(), REQUEST_TIMEOUT))
        .await
        .unwrap();
    let head = String::from_utf8(response.body).unwrap();

    assert!(head.starts_with("post / http/1.1"), "unexpected request line: {}", head);
    assert!(head.contains("content-type: application/octet-stream"));
    assert!(head.contains("user-agent: snode-net/"));
}

#[tokio::test]
async fn host_override_replaces_host() {
    let addr = spawn_server(Behavior::Headers).await;
    let client = client();

    let request = PendingHttpRequest::new(format!("http://{}/ping", addr), Vec::new(), REQUEST_TIMEOUT)
        .with_host_override("snode.test");
    let response = client.post_async(request).await.expect("overridden request failed");
    let head = String::from_utf8(response.body).unwrap();

    assert!(
        head.contains(&format!("host: snode.test:{}", addr.port())),
        "override not applied: {}",
        head
    );
}

#[tokio::test]
async fn host_override_on_named_url_sets_host_header() {
    let addr = spawn_server(Behavior::Headers).await;
    let client = client();

    let request = PendingHttpRequest::new(format!("http://localhost:{}/ping", addr.port()), Vec::new(), REQUEST_TIMEOUT)
        .with_host_override("snode.test");
    let response = client.post_async(request).await.expect("named-host override must not be rejected");
    let head = String::from_utf8(response.body).unwrap();

    assert_eq!(response.status, 200);
    assert!(head.contains("host: snode.test\r\n"), "override not applied: {}", head);
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let addr = spawn_server(Behavior::Delay(Duration::from_secs(3))).await;
    let client = client();

    let outcome = timeout(
        Duration::from_secs(2),
        client.post_async(PendingHttpRequest::new(format!("http://{}/", addr), b"x".to_vec(), Duration::from_millis(200))),
    )
    .await
    .expect("timed-out request must complete, not hang");

    assert_eq!(outcome, Err(HttpError::Timeout));
    assert_eq!(client.active_transfers().await, 0);
}

#[tokio::test]
async fn refused_connection_is_a_failure_result() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client();
    let outcome = client
        .post_async(PendingHttpRequest::new(format!("http://{}/", addr), Vec::new(), REQUEST_TIMEOUT))
        .await;
    assert!(matches!(outcome, Err(HttpError::Connect(_))), "got {:?}", outcome);
}

#[tokio::test]
async fn error_status_is_a_response() {
    let addr = spawn_server(Behavior::Status(404)).await;
    let client = client();

    let response = client
        .post_async(PendingHttpRequest::new(format!("http://{}/", addr), Vec::new(), REQUEST_TIMEOUT))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert!(!response.is_success());
    assert_eq!(response.body, b"nope");
}

#[tokio::test]
async fn each_request_completes_exactly_once() {
    let addr = spawn_server(Behavior::Echo).await;
    let client = client();
    let completions = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    const REQUESTS: usize = 20;
    for i in 0..REQUESTS {
        let completions = completions.clone();
        let done_tx = done_tx.clone();
        let queued = client.post(
            PendingHttpRequest::new(format!("http://{}/{}", addr, i), vec![i as u8], REQUEST_TIMEOUT),
            move |outcome| {
                completions.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send((i, outcome));
            },
        );
        assert!(queued);
    }

    for _ in 0..REQUESTS {
        let (i, outcome) = timeout(TEST_TIMEOUT, done_rx.recv()).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap().body, vec![i as u8]);
    }

    // Nothing fires twice.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(completions.load(Ordering::SeqCst), REQUESTS);
    assert_eq!(client.active_transfers().await, 0);
}

#[tokio::test]
async fn in_flight_transfers_are_tracked() {
    let addr = spawn_server(Behavior::Delay(Duration::from_millis(500))).await;
    let client = client();

    for _ in 0..3 {
        client.post(
            PendingHttpRequest::new(format!("http://{}/", addr), Vec::new(), REQUEST_TIMEOUT),
            |_| {},
        );
    }
    assert_eq!(client.active_transfers().await, 3);

    timeout(TEST_TIMEOUT, async {
        while client.active_transfers().await != 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("transfers never drained");
}

#[tokio::test]
async fn no_callback_after_client_dropped() {
    let addr = spawn_server(Behavior::Delay(Duration::from_millis(300))).await;
    let client = client();
    let fired = Arc::new(AtomicBool::new(false));

    let flag = fired.clone();
    assert!(client.post(
        PendingHttpRequest::new(format!("http://{}/", addr), b"x".to_vec(), REQUEST_TIMEOUT),
        move |_| flag.store(true, Ordering::SeqCst),
    ));
    drop(client);

    sleep(Duration::from_millis(800)).await;
    assert!(!fired.load(Ordering::SeqCst), "callback fired after shutdown");
}
