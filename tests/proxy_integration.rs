//! Loopback integration tests: a real `Pool` accept loop in front of tiny
//! in-process origin/upstream fakes, driven with `smol::block_on` the way
//! the rest of this crate drives async code. No external network access.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_net::{TcpListener, TcpStream};
use bytes::Bytes;
use executor_core::async_executor::AsyncExecutor;
use executor_core::Executor;
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use http_body_util::{BodyExt, Full};

use px::auth::AuthScheme;
use px::debug::{DebugSink, Mode as DebugMode};
use px::handler::HandlerConfig;
use px::io::ConnectionWrapper;
use px::noproxy::NoProxy;
use px::proxylist::Upstream;
use px::resolver::{Mode, Resolver};
use px::server::{Admission, Pool};

/// Reads one HTTP request off `stream` up to the end of headers, returning
/// the raw bytes so fakes can string-search for the parts they care about
/// (method line, `Proxy-Authorization`) without a full parser.
async fn read_request_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn write_response(stream: &mut TcpStream, status_line: &str, headers: &str, body: &str) {
    let response = format!(
        "{status_line}\r\nContent-Length: {}\r\n{headers}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
}

/// A one-shot origin: accepts a single connection, replies `200` with a
/// fixed body regardless of what was asked, then closes.
async fn spawn_origin(executor: &AsyncExecutor, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    executor
        .spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = read_request_head(&mut stream).await;
                write_response(&mut stream, "HTTP/1.1 200 OK", "", body).await;
            }
        })
        .detach();
    addr
}

/// A fake corporate upstream proxy requiring Basic auth: the first request
/// on a connection gets `407`, the second (carrying `Proxy-Authorization`)
/// gets `200` with `body`.
async fn spawn_basic_upstream(executor: &AsyncExecutor, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    executor
        .spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let first = read_request_head(&mut stream).await;
                assert!(!first.contains("Proxy-Authorization"));
                write_response(
                    &mut stream,
                    "HTTP/1.1 407 Proxy Authentication Required",
                    "Proxy-Authenticate: Basic realm=\"px-test\"\r\n",
                    "",
                )
                .await;

                let second = read_request_head(&mut stream).await;
                assert!(second.contains("Proxy-Authorization: Basic"));
                write_response(&mut stream, "HTTP/1.1 200 OK", "", body).await;
            }
        })
        .detach();
    addr
}

fn handler_config(resolver: Resolver, auth_scheme: AuthScheme, username: &str) -> Arc<HandlerConfig> {
    Arc::new(HandlerConfig {
        resolver: Arc::new(resolver),
        auth_scheme,
        username: username.to_string(),
        useragent: None,
        idle: Duration::from_secs(5),
        debug: Arc::new(DebugSink::new(DebugMode::None, std::process::id(), 0).unwrap()),
    })
}

async fn spawn_px_pool(executor: &AsyncExecutor, handler_config: Arc<HandlerConfig>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let admission = Arc::new(Admission::new("*.*.*.*", false, vec![]));
    let pool = Pool::new(listener, admission, handler_config);
    let exec = executor.clone();
    executor.spawn(async move { pool.run(exec).await }).detach();
    addr
}

async fn get_through_px(executor: &AsyncExecutor, px_addr: SocketAddr, target_url: &str) -> (u16, Bytes) {
    let stream = TcpStream::connect(px_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(ConnectionWrapper(stream)).await.unwrap();
    executor
        .spawn(async move {
            let _ = conn.await;
        })
        .detach();

    let request = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(target_url)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[test]
fn direct_routing_relays_body_byte_for_byte() {
    smol::block_on(async {
        let executor = AsyncExecutor::new();
        let origin_addr = spawn_origin(&executor, "hello-direct").await;

        let resolver = Resolver::new(Mode::DirectOnly, NoProxy::parse(""), Duration::from_secs(60));
        let config = handler_config(resolver, AuthScheme::Any, "");
        let px_addr = spawn_px_pool(&executor, config).await;

        let (status, body) =
            get_through_px(&executor, px_addr, &format!("http://{origin_addr}/")).await;
        assert_eq!(status, 200);
        assert_eq!(body, Bytes::from_static(b"hello-direct"));
    });
}

#[test]
fn static_upstream_retries_with_basic_credentials() {
    smol::block_on(async {
        let executor = AsyncExecutor::new();
        let upstream_addr = spawn_basic_upstream(&executor, "hello-via-upstream").await;

        std::env::set_var("PX_PASSWORD", "s3cret");
        let resolver = Resolver::new(
            Mode::Static(vec![Upstream::Proxy { host: upstream_addr.ip().to_string(), port: upstream_addr.port() }]),
            NoProxy::parse(""),
            Duration::from_secs(60),
        );
        let config = handler_config(resolver, AuthScheme::Basic, "alice");
        let px_addr = spawn_px_pool(&executor, config).await;

        let (status, body) =
            get_through_px(&executor, px_addr, "http://example.invalid/anything").await;
        std::env::remove_var("PX_PASSWORD");

        assert_eq!(status, 200);
        assert_eq!(body, Bytes::from_static(b"hello-via-upstream"));
    });
}

#[test]
fn dead_upstream_falls_back_to_trailing_direct_entry() {
    smol::block_on(async {
        let executor = AsyncExecutor::new();
        let origin_addr = spawn_origin(&executor, "hello-fallback-direct").await;

        // Candidate list mirrors a PAC return of "PROXY a:1; DIRECT": the
        // first entry can't be connected to, so resolution must fall
        // through to the trailing DIRECT entry rather than giving up.
        let resolver = Resolver::new(
            Mode::Static(vec![
                Upstream::Proxy { host: "127.0.0.1".to_string(), port: 1 },
                Upstream::Direct,
            ]),
            NoProxy::parse(""),
            Duration::from_secs(60),
        );
        let config = handler_config(resolver, AuthScheme::Any, "");
        let px_addr = spawn_px_pool(&executor, config).await;

        let (status, body) =
            get_through_px(&executor, px_addr, &format!("http://{origin_addr}/")).await;
        assert_eq!(status, 200);
        assert_eq!(body, Bytes::from_static(b"hello-fallback-direct"));
    });
}

#[test]
fn loopback_target_bypasses_configured_upstream_even_without_a_noproxy_rule() {
    smol::block_on(async {
        let executor = AsyncExecutor::new();
        let origin_addr = spawn_origin(&executor, "direct-bypass").await;

        // No noproxy rule names the origin; the built-in loopback floor
        // must still route it DIRECT instead of through the (unreachable)
        // configured upstream.
        let dead_upstream = "127.0.0.1:1".to_string();
        let resolver = Resolver::new(
            Mode::Static(vec![Upstream::Proxy { host: dead_upstream, port: 1 }]),
            NoProxy::parse(""),
            Duration::from_secs(60),
        );
        let config = handler_config(resolver, AuthScheme::Any, "");
        let px_addr = spawn_px_pool(&executor, config).await;

        let (status, body) =
            get_through_px(&executor, px_addr, &format!("http://{origin_addr}/")).await;
        assert_eq!(status, 200);
        assert_eq!(body, Bytes::from_static(b"direct-bypass"));
    });
}

/// A target for `CONNECT` tunneling: echoes one line back uppercased, so
/// the test can tell the bytes really round-tripped through the splice.
async fn spawn_echo_target(executor: &AsyncExecutor) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    executor
        .spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 64];
                let n = stream.read(&mut buf).await.unwrap();
                let reply = String::from_utf8_lossy(&buf[..n]).to_uppercase();
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.flush().await.unwrap();
            }
        })
        .detach();
    addr
}

#[test]
fn connect_writes_200_then_splices_bytes_both_ways() {
    smol::block_on(async {
        let executor = AsyncExecutor::new();
        let target_addr = spawn_echo_target(&executor).await;

        let resolver = Resolver::new(Mode::DirectOnly, NoProxy::parse(""), Duration::from_secs(60));
        let config = handler_config(resolver, AuthScheme::Any, "");
        let px_addr = spawn_px_pool(&executor, config).await;

        let mut client = TcpStream::connect(px_addr).await.unwrap();
        let connect_line = format!("CONNECT {target_addr} HTTP/1.1\r\nHost: {target_addr}\r\n\r\n");
        client.write_all(connect_line.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = client.read(&mut chunk).await.unwrap();
            head.extend_from_slice(&chunk[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8_lossy(&head).into_owned();
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT response: {head}");

        client.write_all(b"hello-tunnel").await.unwrap();
        let mut body = [0u8; 64];
        let n = client.read(&mut body).await.unwrap();
        assert_eq!(&body[..n], b"HELLO-TUNNEL");
    });
}
