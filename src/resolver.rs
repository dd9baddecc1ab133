//! Upstream resolution (C4): given a target URL, decide the ordered list of
//! candidate upstreams, consulting the no-proxy matcher (C1), PAC evaluator
//! (C3) and proxy-list parser (C2), with TTL'd refresh for system/PAC
//! discovery.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use url::Url;

use crate::noproxy::NoProxy;
use crate::pac::PacScript;
use crate::proxylist::{parse_static_list, Upstream};

/// How upstreams are selected, mirroring the four listed resolution modes.
#[derive(Debug, Clone)]
pub enum Mode {
    DirectOnly,
    Static(Vec<Upstream>),
    PacStatic(PacSource),
    PacSystem(PacSource),
}

/// Where a PAC script text comes from; `resolver` only needs the rendered
/// body, loading is the caller's concern (kept a leaf per the
/// resolver/handler cyclic-interaction note: the resolver never calls back
/// into connection-handling code).
#[derive(Debug, Clone)]
pub struct PacSource {
    pub url: String,
    pub body: String,
}

/// A swappable source of "what does the OS think the proxy settings are."
/// The concrete desktop-integration implementation (reading
/// `http_proxy`/`https_proxy`/`no_proxy` env vars, or shelling out to
/// `gsettings` on GNOME) lives in `main`/`config`; tests substitute a fake.
pub trait SystemProxyDiscovery: Send + Sync {
    /// Returns a PAC-equivalent autoconfig URL, if the platform advertises
    /// one (e.g. WPAD), else `None` meaning "use the env-var proxies
    /// directly as a static list."
    fn discover(&self) -> Option<PacSource>;
}

/// Environment-variable based discovery: `http_proxy`/`https_proxy`.
/// Used when no `--pac`/`--server` is configured and the platform has no
/// richer source; returns a synthetic one-line PAC body so it flows
/// through the same `PacSource` plumbing as a real WPAD response.
pub struct EnvProxyDiscovery;

impl SystemProxyDiscovery for EnvProxyDiscovery {
    fn discover(&self) -> Option<PacSource> {
        let proxy = std::env::var("https_proxy")
            .or_else(|_| std::env::var("HTTPS_PROXY"))
            .or_else(|_| std::env::var("http_proxy"))
            .or_else(|_| std::env::var("HTTP_PROXY"))
            .ok()?;
        let host_port = proxy
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        Some(PacSource {
            url: "env:proxy".to_string(),
            body: format!(
                "function FindProxyForURL(url, host) {{ return \"PROXY {host_port}; DIRECT\"; }}"
            ),
        })
    }
}

struct Snapshot {
    mode: Mode,
    last_refresh: Instant,
}

/// Resolver state shared by all connection handlers in one worker process.
/// Holds the mutex-guarded snapshot the design notes call for: handler
/// threads read an immutable clone, the refresh path is the only writer.
pub struct Resolver {
    noproxy: NoProxy,
    refresh_interval: Duration,
    snapshot: Mutex<Snapshot>,
    discovery: Box<dyn SystemProxyDiscovery>,
}

impl Resolver {
    pub fn new(mode: Mode, noproxy: NoProxy, refresh_interval: Duration) -> Self {
        Self::with_discovery(mode, noproxy, refresh_interval, Box::new(EnvProxyDiscovery))
    }

    pub fn with_discovery(
        mode: Mode,
        noproxy: NoProxy,
        refresh_interval: Duration,
        discovery: Box<dyn SystemProxyDiscovery>,
    ) -> Self {
        Self {
            noproxy,
            refresh_interval,
            snapshot: Mutex::new(Snapshot {
                mode,
                last_refresh: Instant::now(),
            }),
            discovery,
        }
    }

    /// Resolve the upstream candidates for `url`, per the algorithm in
    /// the component design: no-proxy check first, then mode dispatch,
    /// with a passive at-most-once-per-interval refresh for `PacSystem`.
    pub fn find_proxy_for_url(&self, url: &str) -> (Vec<Upstream>, String, String) {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => return (vec![Upstream::Direct], String::new(), url.to_string()),
        };
        let host = parsed.host_str().unwrap_or("").to_string();
        let path = parsed.path().to_string();

        if self.noproxy.matches(&host) {
            return (vec![Upstream::Direct], host, path);
        }

        self.maybe_refresh();

        let guard = self.snapshot.lock().expect("resolver mutex poisoned");
        let upstreams = match &guard.mode {
            Mode::DirectOnly => vec![Upstream::Direct],
            Mode::Static(list) => list.clone(),
            Mode::PacStatic(src) | Mode::PacSystem(src) => {
                evaluate_pac(src, url, &host).unwrap_or_else(|| vec![Upstream::Direct])
            }
        };
        drop(guard);

        (upstreams, host, path)
    }

    /// At-most-once-per-`refresh_interval` reload, only meaningful for
    /// `PacSystem`. Any caller past the interval attempts the refresh under
    /// the mutex; a caller that loses the race simply observes the
    /// already-fresh snapshot another thread just installed.
    fn maybe_refresh(&self) {
        let mut guard = self.snapshot.lock().expect("resolver mutex poisoned");
        let Mode::PacSystem(_) = &guard.mode else {
            return;
        };
        if guard.last_refresh.elapsed() < self.refresh_interval {
            return;
        }

        match self.discovery.discover() {
            Some(src) => {
                debug!(source = %src.url, "resolver: refreshed system proxy settings");
                guard.mode = Mode::PacSystem(src);
            }
            None => {
                warn!("resolver: system proxy discovery found nothing, keeping prior snapshot");
            }
        }
        guard.last_refresh = Instant::now();
    }
}

fn evaluate_pac(src: &PacSource, url: &str, host: &str) -> Option<Vec<Upstream>> {
    match PacScript::new(src.body.clone()).find_proxy_for_url(url, host) {
        Ok(list) if !list.is_empty() => Some(list),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "resolver: PAC evaluation failed, falling back to DIRECT");
            None
        }
    }
}

/// Convenience used by the CLI/config layer: builds a `Mode` from the
/// `--server`/`--pac` config surface (mutually informative, `--server`
/// wins per the static-before-PAC precedence the original gives `--server`).
pub fn mode_from_config(server: &str, pac: Option<PacSource>, use_system: bool) -> Mode {
    if !server.trim().is_empty() {
        return Mode::Static(parse_static_list(server));
    }
    if let Some(src) = pac {
        return if use_system {
            Mode::PacSystem(src)
        } else {
            Mode::PacStatic(src)
        };
    }
    Mode::DirectOnly
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noproxy(rules: &str) -> NoProxy {
        NoProxy::parse(rules)
    }

    #[test]
    fn noproxy_host_short_circuits_to_direct() {
        let resolver = Resolver::new(
            Mode::Static(vec![Upstream::Proxy { host: "up".into(), port: 8080 }]),
            noproxy("example.com"),
            Duration::from_secs(60),
        );
        let (upstreams, host, _) = resolver.find_proxy_for_url("http://example.com/a");
        assert_eq!(upstreams, vec![Upstream::Direct]);
        assert_eq!(host, "example.com");
    }

    #[test]
    fn static_mode_returns_configured_list() {
        let resolver = Resolver::new(
            Mode::Static(vec![Upstream::Proxy { host: "up".into(), port: 8080 }]),
            noproxy(""),
            Duration::from_secs(60),
        );
        let (upstreams, _, _) = resolver.find_proxy_for_url("http://example.com/a");
        assert_eq!(upstreams, vec![Upstream::Proxy { host: "up".into(), port: 8080 }]);
    }

    #[test]
    fn direct_only_mode_ignores_noproxy_emptiness() {
        let resolver = Resolver::new(Mode::DirectOnly, noproxy(""), Duration::from_secs(60));
        let (upstreams, _, _) = resolver.find_proxy_for_url("http://example.com/a");
        assert_eq!(upstreams, vec![Upstream::Direct]);
    }

    #[test]
    fn pac_static_evaluates_script() {
        let src = PacSource {
            url: "file:///proxy.pac".into(),
            body: "function FindProxyForURL(url, host) { return \"PROXY a:1; DIRECT\"; }".into(),
        };
        let resolver = Resolver::new(Mode::PacStatic(src), noproxy(""), Duration::from_secs(60));
        let (upstreams, _, _) = resolver.find_proxy_for_url("http://example.com/a");
        assert_eq!(
            upstreams,
            vec![Upstream::Proxy { host: "a".into(), port: 1 }, Upstream::Direct]
        );
    }

    #[test]
    fn pac_evaluation_failure_falls_back_to_direct() {
        let src = PacSource {
            url: "file:///proxy.pac".into(),
            body: "not valid javascript {{{".into(),
        };
        let resolver = Resolver::new(Mode::PacStatic(src), noproxy(""), Duration::from_secs(60));
        let (upstreams, _, _) = resolver.find_proxy_for_url("http://example.com/a");
        assert_eq!(upstreams, vec![Upstream::Direct]);
    }

    struct FakeDiscovery {
        src: PacSource,
    }
    impl SystemProxyDiscovery for FakeDiscovery {
        fn discover(&self) -> Option<PacSource> {
            Some(self.src.clone())
        }
    }

    #[test]
    fn pac_system_refreshes_at_most_once_per_interval() {
        let initial = PacSource {
            url: "initial".into(),
            body: "function FindProxyForURL(url, host) { return \"PROXY old:1; DIRECT\"; }".into(),
        };
        let refreshed = PacSource {
            url: "refreshed".into(),
            body: "function FindProxyForURL(url, host) { return \"PROXY new:2; DIRECT\"; }".into(),
        };
        let resolver = Resolver::with_discovery(
            Mode::PacSystem(initial),
            noproxy(""),
            Duration::from_secs(3600),
            Box::new(FakeDiscovery { src: refreshed }),
        );
        let (upstreams, _, _) = resolver.find_proxy_for_url("http://example.com/a");
        assert_eq!(upstreams, vec![Upstream::Proxy { host: "old".into(), port: 1 }, Upstream::Direct]);
    }

    #[test]
    fn mode_from_config_prefers_server_over_pac() {
        let src = PacSource { url: "x".into(), body: String::new() };
        let mode = mode_from_config("up:8080", Some(src), false);
        assert!(matches!(mode, Mode::Static(_)));
    }

    #[test]
    fn mode_from_config_falls_back_to_direct_only() {
        let mode = mode_from_config("", None, false);
        assert!(matches!(mode, Mode::DirectOnly));
    }
}
