//! HTTP client driver (C5): performs one upstream request (or a CONNECT
//! handshake) with automatic Proxy-Authorization, and the raw DIRECT
//! connect used when no upstream is in the path.
//!
//! There is no persistent "multi handle" here the way a libcurl-backed
//! original would have one: each request opens (or is handed) one TCP
//! connection to the upstream and drives exactly the rounds its auth
//! scheme needs, mirroring the component's failure taxonomy
//! (`UpstreamAuthFailed`, `UpstreamConnect`) rather than libcurl's numeric
//! codes.

use std::time::Duration;

use async_net::TcpStream;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

use crate::auth::{self, AuthScheme};
use crate::credential::Credential;
use crate::error::{PxError, Result};
use crate::io::{format_target_addr, ConnectionWrapper};

/// Credential installed on an upstream request, resolved from C9's
/// [`Credential`] into the scheme-specific driving state.
pub enum Installed {
    Basic { principal: String, secret: String },
    Digest { principal: String, secret: String },
    Ntlm { principal: String, secret: String },
    None,
}

pub fn install_credential(scheme: AuthScheme, credential: Option<Credential>) -> Installed {
    let (principal, secret) = match credential {
        Some(Credential::Explicit { principal, secret }) => (principal, secret),
        Some(Credential::PlatformSspi) => (auth::SSPI_SENTINEL_PRINCIPAL.to_string(), String::new()),
        None => return Installed::None,
    };

    match scheme {
        AuthScheme::Basic => Installed::Basic { principal, secret },
        AuthScheme::Digest => Installed::Digest { principal, secret },
        AuthScheme::Ntlm | AuthScheme::Negotiate | AuthScheme::Any => {
            Installed::Ntlm { principal, secret }
        }
    }
}

/// Opens a direct TCP connection to `host:port`, used for DIRECT routing
/// (both plain HTTP bridging and CONNECT splicing).
pub async fn connect_direct(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format_target_addr(host, port);
    TcpStream::connect(&addr)
        .await
        .map_err(|source| PxError::UpstreamConnect { addr, source })
}

/// Drives one non-CONNECT request through `upstream`, retrying once with
/// credentials if the upstream answers `407`. Transfer decoding is left to
/// the caller: the response body is handed back as the raw `Incoming`
/// stream so C6 can relay it byte-for-byte.
pub async fn forward_through_upstream(
    upstream_host: &str,
    upstream_port: u16,
    template: Request<Full<Bytes>>,
    scheme: AuthScheme,
    credential: Option<Credential>,
) -> Result<Response<Incoming>> {
    let addr = format_target_addr(upstream_host, upstream_port);
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| PxError::UpstreamConnect { addr: addr.clone(), source })?;

    let io = ConnectionWrapper(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(PxError::Http)?;

    smol::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "client: upstream connection driver ended");
        }
    })
    .detach();

    let template = RequestTemplate::new(template).await?;
    let installed = install_credential(scheme, credential);

    let response = sender
        .send_request(template.build(None)?)
        .await
        .map_err(PxError::Http)?;

    if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Ok(response);
    }

    let challenges = proxy_authenticate_lines(&response);

    match installed {
        Installed::None => Err(PxError::NoCredential),
        Installed::Basic { principal, secret } => {
            let header = auth::basic_step(&principal, &secret).header_value;
            sender.send_request(template.build(Some(header))?).await.map_err(PxError::Http)
        }
        Installed::Digest { principal, secret } => {
            let challenge = auth::select_challenge(AuthScheme::Digest, &challenges)
                .ok_or(PxError::UpstreamAuthFailed { addr: placeholder_addr() })?;
            let header = auth::digest_step(
                challenge,
                template.method.as_str(),
                template.uri.path(),
                &principal,
                &secret,
            )?
            .header_value;
            sender.send_request(template.build(Some(header))?).await.map_err(PxError::Http)
        }
        Installed::Ntlm { principal, secret } => {
            let mut handshake = auth::NtlmHandshake::new(&principal, &secret)?;
            let mut server_token: Option<String> = None;

            loop {
                let step = handshake.step(server_token.as_deref())?;
                let resp = sender
                    .send_request(template.build(Some(step.header_value))?)
                    .await
                    .map_err(PxError::Http)?;
                if step.done || resp.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                    return Ok(resp);
                }
                server_token = proxy_authenticate_lines(&resp)
                    .into_iter()
                    .find_map(|line| line.strip_prefix("NTLM ").map(str::to_string));
            }
        }
    }
}

/// `hyper::Request` has no `Clone`, but an auth handshake may need to
/// resend the same request several times with a new `Proxy-Authorization`
/// value each round. This captures everything needed to rebuild it.
struct RequestTemplate {
    method: hyper::Method,
    uri: hyper::Uri,
    version: hyper::Version,
    headers: hyper::HeaderMap,
    body: Bytes,
}

impl RequestTemplate {
    /// Buffers the whole body so it can be replayed across auth rounds.
    /// Request bodies on a proxy request are small relative to a round
    /// trip to the upstream, so this trades a little memory for the
    /// ability to retry at all once credentials are required.
    async fn new(req: Request<Full<Bytes>>) -> Result<Self> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }

    fn build(&self, proxy_auth: Option<String>) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .version(self.version);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(header) = proxy_auth {
            builder = builder.header("Proxy-Authorization", header);
        }
        builder
            .body(Full::new(self.body.clone()))
            .map_err(PxError::HttpProtocol)
    }
}

/// Drives a CONNECT handshake against `upstream`, completing whatever auth
/// rounds are needed, then hands back the raw duplex stream for splicing
/// once the upstream answers `200`.
pub async fn connect_through_upstream(
    upstream_host: &str,
    upstream_port: u16,
    target_host: &str,
    target_port: u16,
    scheme: AuthScheme,
    credential: Option<Credential>,
) -> Result<hyper::upgrade::Upgraded> {
    let addr = format_target_addr(upstream_host, upstream_port);
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| PxError::UpstreamConnect { addr: addr.clone(), source })?;

    let io = ConnectionWrapper(stream);
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(io)
        .await
        .map_err(PxError::Http)?;

    smol::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(error = %e, "client: upstream CONNECT driver ended");
        }
    })
    .detach();

    let authority = format!("{target_host}:{target_port}");
    let installed = install_credential(scheme, credential);

    let mut attempt = connect_request(&authority, None)?;
    let mut response = sender.send_request(attempt).await.map_err(PxError::Http)?;

    if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        let challenges = proxy_authenticate_lines(&response);
        match installed {
            Installed::None => return Err(PxError::NoCredential),
            Installed::Basic { principal, secret } => {
                let header = auth::basic_step(&principal, &secret).header_value;
                attempt = connect_request(&authority, Some(header))?;
                response = sender.send_request(attempt).await.map_err(PxError::Http)?;
            }
            Installed::Digest { principal, secret } => {
                let challenge = auth::select_challenge(AuthScheme::Digest, &challenges)
                    .ok_or(PxError::UpstreamAuthFailed { addr: placeholder_addr() })?;
                let header = auth::digest_step(challenge, "CONNECT", &authority, &principal, &secret)?
                    .header_value;
                attempt = connect_request(&authority, Some(header))?;
                response = sender.send_request(attempt).await.map_err(PxError::Http)?;
            }
            Installed::Ntlm { principal, secret } => {
                let mut handshake = auth::NtlmHandshake::new(&principal, &secret)?;
                let mut server_token: Option<String> = None;
                loop {
                    let step = handshake.step(server_token.as_deref())?;
                    attempt = connect_request(&authority, Some(step.header_value))?;
                    response = sender.send_request(attempt).await.map_err(PxError::Http)?;
                    if step.done || response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                        break;
                    }
                    server_token = proxy_authenticate_lines(&response)
                        .into_iter()
                        .find_map(|line| line.strip_prefix("NTLM ").map(str::to_string));
                }
            }
        }
    }

    if response.status() != StatusCode::OK {
        return Err(PxError::UpstreamAuthFailed { addr: placeholder_addr() });
    }

    hyper::upgrade::on(response).await.map_err(PxError::Http)
}

fn connect_request(authority: &str, proxy_auth: Option<String>) -> Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method("CONNECT")
        .uri(authority)
        .version(hyper::Version::HTTP_11);
    if let Some(header) = proxy_auth {
        builder = builder.header("Proxy-Authorization", header);
    }
    builder.body(Full::new(Bytes::new())).map_err(PxError::HttpProtocol)
}

fn proxy_authenticate_lines(response: &Response<Incoming>) -> Vec<String> {
    response
        .headers()
        .get_all("Proxy-Authenticate")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

/// `UpstreamAuthFailed` carries an address for logging; when one isn't
/// cheaply at hand (mid auth-handshake) this unspecified placeholder is
/// used rather than threading the value through every call site.
fn placeholder_addr() -> std::net::SocketAddr {
    std::net::SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Default idle timeout for CONNECT splicing when not overridden by config.
pub const DEFAULT_IDLE: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_credential_none_when_no_credential_present() {
        assert!(matches!(install_credential(AuthScheme::Basic, None), Installed::None));
    }

    #[test]
    fn install_credential_maps_any_scheme_to_ntlm_driver() {
        let cred = Credential::Explicit { principal: "u".into(), secret: "p".into() };
        assert!(matches!(install_credential(AuthScheme::Any, Some(cred)), Installed::Ntlm { .. }));
    }

    #[test]
    fn connect_request_includes_proxy_authorization_when_present() {
        let req = connect_request("example.com:443", Some("Basic abc".to_string())).unwrap();
        assert_eq!(req.method(), "CONNECT");
        assert_eq!(
            req.headers().get("Proxy-Authorization").unwrap(),
            "Basic abc"
        );
    }

    #[test]
    fn connect_request_without_auth_omits_header() {
        let req = connect_request("example.com:443", None).unwrap();
        assert!(req.headers().get("Proxy-Authorization").is_none());
    }
}
