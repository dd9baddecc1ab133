//! Server pool (C7): accept loop, IP admission control, bounded worker
//! pool. One `Pool` runs per worker process (see `supervisor.rs`) per bound
//! listening socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_net::TcpListener;
use executor_core::{Executor, Task};

use crate::error::PxError;
use crate::handler::{self, HandlerConfig};
use crate::noproxy::NoProxy;

/// Admission rule set: an `allow` list plus an optional "only addresses
/// that resolve to a local interface" restriction.
pub struct Admission {
    allow: NoProxy,
    hostonly: bool,
    local_ips: Vec<IpAddr>,
}

impl Admission {
    pub fn new(allow_rules: &str, hostonly: bool, local_ips: Vec<IpAddr>) -> Self {
        Self {
            allow: NoProxy::parse(allow_rules),
            hostonly,
            local_ips,
        }
    }

    /// True if `addr` should be admitted, per the component design: allow
    /// list first, then (if `hostonly`) the precomputed local-interface set
    /// plus loopback.
    pub fn admit(&self, addr: IpAddr) -> bool {
        if self.allow.matches(&addr.to_string()) {
            return true;
        }
        if self.hostonly && (addr.is_loopback() || self.local_ips.contains(&addr)) {
            return true;
        }
        false
    }
}

/// One bound listening socket plus the pool that serves it.
pub struct Pool {
    listener: TcpListener,
    admission: Arc<Admission>,
    handler_config: Arc<HandlerConfig>,
}

impl Pool {
    pub fn new(listener: TcpListener, admission: Arc<Admission>, handler_config: Arc<HandlerConfig>) -> Self {
        Self {
            listener,
            admission,
            handler_config,
        }
    }

    /// Runs the accept loop until the executor is shut down or the socket
    /// errors unrecoverably. Admission is checked before any byte is read
    /// from the connection; a denied client's socket is dropped
    /// immediately, producing zero bytes of response.
    pub async fn run<E: Executor + Clone + 'static>(self, executor: E) {
        let Pool { listener, admission, handler_config } = self;

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "server pool: accept error");
                    continue;
                }
            };

            if !admission.admit(peer_addr.ip()) {
                let err = PxError::AdmissionDenied { addr: peer_addr };
                tracing::info!(error = %err, "server pool: connection rejected");
                drop(stream);
                continue;
            }

            let config = Arc::clone(&handler_config);
            let exec = executor.clone();
            executor
                .spawn(async move {
                    handler::serve_single(stream, peer_addr, config, exec).await;
                })
                .detach();
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Enumerates the host's non-loopback interface addresses once at startup,
/// for the `hostonly` admission check. Best-effort: platforms without a
/// convenient interface-enumeration API fall back to an empty set (meaning
/// `hostonly` degrades to loopback-only, which is still safe).
pub fn local_interface_ips() -> Vec<IpAddr> {
    #[cfg(unix)]
    {
        if let Ok(addrs) = nix::ifaddrs::getifaddrs() {
            return addrs
                .filter_map(|ifaddr| ifaddr.address)
                .filter_map(|addr| addr.as_sockaddr_in().map(|a| IpAddr::V4(a.ip())))
                .collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_admits_matching_ip() {
        let admission = Admission::new("192.168.1.0/24", false, vec![]);
        assert!(admission.admit("192.168.1.5".parse().unwrap()));
        assert!(!admission.admit("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn hostonly_admits_loopback_even_without_allow_match() {
        let admission = Admission::new("10.0.0.0/24", true, vec![]);
        assert!(admission.admit("127.0.0.1".parse().unwrap()));
        assert!(!admission.admit("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn hostonly_admits_precomputed_local_interface() {
        let local: IpAddr = "192.168.50.7".parse().unwrap();
        let admission = Admission::new("", true, vec![local]);
        assert!(admission.admit(local));
        assert!(!admission.admit("192.168.50.8".parse().unwrap()));
    }
}
