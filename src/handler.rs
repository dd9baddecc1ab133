//! Proxy request handler (C6): per-connection HTTP/1.1 server logic.
//! Parses each request, resolves an upstream via C4, drives C5 (direct
//! connect or through-upstream), and for CONNECT hands both ends to the
//! idle-timeout splice in `io.rs`.
//!
//! Dispatch routes CONNECT to a splice path and everything else to a
//! buffered forward path, each trying direct routing first and falling
//! back to upstream candidates with credential installation per attempt.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_net::TcpStream;
use bytes::Bytes;
use executor_core::Executor;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::rt::Executor as _;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};

use crate::auth::AuthScheme;
use crate::client;
use crate::credential::{self, Credential};
use crate::debug::DebugSink;
use crate::error::PxError;
use crate::io::{
    empty_body, full_body, splice_with_idle_timeout, ConnectionWrapper, ExecutorWrapper,
    UpgradedWrapper,
};
use crate::proxylist::Upstream;
use crate::resolver::Resolver;

/// Per-worker-process shared configuration the handler consults for every
/// request; immutable once built (see the process-shared-state note).
pub struct HandlerConfig {
    pub resolver: Arc<Resolver>,
    pub auth_scheme: AuthScheme,
    pub username: String,
    pub useragent: Option<String>,
    pub idle: Duration,
    pub debug: Arc<DebugSink>,
}

/// Drives one already-admitted connection to completion. The accept loop
/// and admission check live in `server.rs` (C7); this is the unit of work
/// it spawns per connection.
pub async fn serve_single<E: Executor + Clone + 'static>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<HandlerConfig>,
    executor: E,
) {
    if let Err(e) = handle_connection(stream, peer_addr, config, executor).await {
        tracing::debug!(peer = %peer_addr, error = %e, "handler: connection ended with error");
    }
}

async fn handle_connection<E: Executor + Clone + 'static>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<HandlerConfig>,
    executor: E,
) -> Result<(), hyper::Error> {
    let io = ConnectionWrapper(stream);
    let hyper_executor = ExecutorWrapper::new(executor);

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(
            io,
            service_fn(move |req| {
                let config = Arc::clone(&config);
                let exec = hyper_executor.clone();
                async move { dispatch(req, peer_addr, config, exec).await }
            }),
        )
        .with_upgrades()
        .await
}

async fn dispatch<E: Executor + 'static>(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    config: Arc<HandlerConfig>,
    executor: ExecutorWrapper<E>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    tracing::info!(
        peer = %peer_addr,
        method = %req.method(),
        uri = %req.uri(),
        "handler: request"
    );
    config.debug.write(&format!("{peer_addr} {} {}", req.method(), req.uri()));

    if req.method() == Method::CONNECT {
        handle_connect(req, config, executor).await
    } else {
        handle_http(req, config).await
    }
}

/// Builds the pseudo-URL C4 resolves against: CONNECT has no scheme of its
/// own, so `https://` is assumed (the data model's default for CONNECT).
fn resolve_url_for_connect(host: &str, port: u16) -> String {
    format!("https://{host}:{port}/")
}

/// For absolute-form request lines lacking a scheme, `https://` is
/// prepended before resolution, per the data model note; requests normally
/// already carry a scheme (`http://` for plain proxying).
fn resolve_url_for_request(uri: &hyper::Uri) -> String {
    if uri.scheme().is_some() {
        uri.to_string()
    } else {
        format!("https://{uri}")
    }
}

async fn handle_connect<E: Executor + 'static>(
    req: Request<Incoming>,
    config: Arc<HandlerConfig>,
    executor: ExecutorWrapper<E>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let authority = match req.uri().authority() {
        Some(a) => a.clone(),
        None => {
            return Ok(bad_request("Missing CONNECT authority"));
        }
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);

    let (upstreams, _, _) = config.resolver.find_proxy_for_url(&resolve_url_for_connect(&host, port));

    let idle = config.idle;

    if upstreams.iter().all(|u| matches!(u, Upstream::Direct)) {
        let target = match client::connect_direct(&host, port).await {
            Ok(stream) => stream,
            Err(e) => return Ok(bad_gateway(&e.to_string())),
        };

        executor.execute(async move {
            match hyper::upgrade::on(req).await {
                Ok(client_upgraded) => {
                    if let Err(e) = splice_with_idle_timeout(
                        UpgradedWrapper(client_upgraded),
                        target,
                        idle,
                    )
                    .await
                    {
                        tracing::debug!(error = %e, "handler: DIRECT CONNECT splice ended");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "handler: upgrade failed"),
            }
        });

        return Ok(connection_established());
    }

    let credential = build_credential(&config);
    let scheme = config.auth_scheme;

    for upstream in &upstreams {
        match upstream {
            Upstream::Direct => match client::connect_direct(&host, port).await {
                Ok(target) => {
                    executor.execute(async move {
                        match hyper::upgrade::on(req).await {
                            Ok(client_upgraded) => {
                                if let Err(e) = splice_with_idle_timeout(
                                    UpgradedWrapper(client_upgraded),
                                    target,
                                    idle,
                                )
                                .await
                                {
                                    tracing::debug!(error = %e, "handler: DIRECT CONNECT splice ended");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "handler: upgrade failed"),
                        }
                    });
                    return Ok(connection_established());
                }
                Err(e) => {
                    tracing::warn!(upstream = %upstream, error = %e, "handler: DIRECT CONNECT candidate failed");
                    continue;
                }
            },
            Upstream::Proxy { host: up_host, port: up_port } => {
                match client::connect_through_upstream(
                    up_host,
                    *up_port,
                    &host,
                    port,
                    scheme,
                    credential_for_attempt(&credential),
                )
                .await
                {
                    Ok(upstream_upgraded) => {
                        executor.execute(async move {
                            match hyper::upgrade::on(req).await {
                                Ok(client_upgraded) => {
                                    if let Err(e) = splice_with_idle_timeout(
                                        UpgradedWrapper(client_upgraded),
                                        UpgradedWrapper(upstream_upgraded),
                                        idle,
                                    )
                                    .await
                                    {
                                        tracing::debug!(error = %e, "handler: upstream CONNECT splice ended");
                                    }
                                }
                                Err(e) => tracing::warn!(error = %e, "handler: upgrade failed"),
                            }
                        });
                        return Ok(connection_established());
                    }
                    Err(e) => {
                        tracing::warn!(upstream = %upstream, error = %e, "handler: upstream CONNECT attempt failed");
                        continue;
                    }
                }
            }
        }
    }

    Ok(bad_gateway("all upstream candidates failed"))
}

async fn handle_http(
    req: Request<Incoming>,
    config: Arc<HandlerConfig>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let url = resolve_url_for_request(req.uri());
    let (upstreams, host, _) = config.resolver.find_proxy_for_url(&url);

    let uri = req.uri().clone();
    let port = uri.port_u16().unwrap_or(80);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();
    let method = req.method().clone();
    let version = req.version();
    let mut headers = req.headers().clone();
    if let Some(ua) = &config.useragent {
        headers.insert("User-Agent", match ua.parse() {
            Ok(v) => v,
            Err(_) => return Ok(bad_request("invalid configured User-Agent")),
        });
    }
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(bad_gateway(&e.to_string())),
    };

    if upstreams.iter().all(|u| matches!(u, Upstream::Direct)) {
        return Ok(forward_direct(&host, port, &path, method, version, headers, body).await);
    }

    let credential = build_credential(&config);
    let scheme = config.auth_scheme;

    for upstream in &upstreams {
        match upstream {
            Upstream::Direct => {
                match send_direct(&host, port, &path, method.clone(), version, headers.clone(), body.clone()).await {
                    Ok(response) => return Ok(relay(response)),
                    Err(e) => {
                        tracing::warn!(upstream = %upstream, error = %e, "handler: DIRECT candidate failed");
                        continue;
                    }
                }
            }
            Upstream::Proxy { host: up_host, port: up_port } => {
                let mut builder = Request::builder().method(method.clone()).uri(uri.clone()).version(version);
                for (name, value) in &headers {
                    builder = builder.header(name, value);
                }
                let request = match builder.body(Full::new(body.clone())) {
                    Ok(r) => r,
                    Err(e) => return Ok(bad_gateway(&e.to_string())),
                };

                match client::forward_through_upstream(up_host, *up_port, request, scheme, credential_for_attempt(&credential)).await {
                    Ok(response) => return Ok(relay(response)),
                    Err(e) => {
                        tracing::warn!(upstream = %upstream, error = %e, "handler: upstream request attempt failed");
                        if matches!(e, PxError::UpstreamAuthFailed { .. } | PxError::NoCredential) {
                            return Ok(error_response(&e));
                        }
                        continue;
                    }
                }
            }
        }
    }

    Ok(bad_gateway("all upstream candidates failed"))
}

async fn send_direct(
    host: &str,
    port: u16,
    path: &str,
    method: hyper::Method,
    version: hyper::Version,
    headers: hyper::HeaderMap,
    body: Bytes,
) -> Result<Response<Incoming>, PxError> {
    let target = client::connect_direct(host, port).await?;

    let io = ConnectionWrapper(target);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.map_err(PxError::Http)?;
    smol::spawn(async move {
        let _ = conn.await;
    })
    .detach();

    let mut builder = Request::builder().method(method).uri(path).version(version);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let request = builder.body(Full::new(body)).map_err(PxError::HttpProtocol)?;

    sender.send_request(request).await.map_err(PxError::Http)
}

async fn forward_direct(
    host: &str,
    port: u16,
    path: &str,
    method: hyper::Method,
    version: hyper::Version,
    headers: hyper::HeaderMap,
    body: Bytes,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match send_direct(host, port, path, method, version, headers, body).await {
        Ok(response) => relay(response),
        Err(e) => bad_gateway(&e.to_string()),
    }
}

fn relay(response: Response<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    response.map(|b| b.boxed())
}

fn build_credential(config: &HandlerConfig) -> Option<Credential> {
    match credential::get_credential(&config.username) {
        Ok(cred) => Some(cred),
        Err(e) => {
            tracing::debug!(error = %e, "handler: no credential available");
            None
        }
    }
}

fn credential_for_attempt(credential: &Option<Credential>) -> Option<Credential> {
    match credential {
        Some(Credential::Explicit { principal, secret }) => Some(Credential::Explicit {
            principal: principal.clone(),
            secret: secret.clone(),
        }),
        Some(Credential::PlatformSspi) => Some(Credential::PlatformSspi),
        None => None,
    }
}

fn connection_established() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Proxy-Agent", "px")
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn bad_request(msg: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(full_body(msg.to_string()))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn bad_gateway(msg: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(full_body(msg.to_string()))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn error_response(err: &PxError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (status, reason) = err.status();
    Response::builder()
        .status(status)
        .body(full_body(reason.to_string()))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_for_connect_defaults_to_https() {
        assert_eq!(resolve_url_for_connect("example.com", 443), "https://example.com:443/");
    }

    #[test]
    fn resolve_url_for_request_keeps_existing_scheme() {
        let uri: hyper::Uri = "http://example.com/a".parse().unwrap();
        assert_eq!(resolve_url_for_request(&uri), "http://example.com/a");
    }

    #[test]
    fn resolve_url_for_request_defaults_missing_scheme_to_https() {
        let uri: hyper::Uri = "/a".parse().unwrap();
        assert_eq!(resolve_url_for_request(&uri), "https:///a");
    }
}
