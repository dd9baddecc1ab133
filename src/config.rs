//! Four-layer config precedence (defaults -> INI -> env -> CLI), merged
//! once into an immutable [`Config`]. Re-architected from the source's
//! single mutated-in-place state bag into a struct built once and passed
//! down, per the design notes.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::AuthScheme;
use crate::cli::Cli;
use crate::error::{PxError, Result};
use crate::ini::IniConfig;

const DEFAULT_ALLOW: &str = "*.*.*.*";

/// The fully resolved, immutable configuration every component reads from.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub pac: Option<String>,
    pub pac_encoding: String,
    pub port: u16,
    pub listen: Vec<String>,
    pub allow: String,
    pub gateway: bool,
    pub hostonly: bool,
    pub noproxy: String,
    pub useragent: Option<String>,
    pub username: String,
    pub auth: AuthScheme,
    pub workers: u32,
    pub threads: u32,
    pub idle: Duration,
    pub socktimeout: Duration,
    pub proxyreload: Duration,
    pub foreground: bool,
    pub log: u8,
    pub config_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: String::new(),
            pac: None,
            pac_encoding: "utf-8".to_string(),
            port: 3128,
            listen: vec!["127.0.0.1".to_string()],
            allow: DEFAULT_ALLOW.to_string(),
            gateway: false,
            hostonly: false,
            noproxy: String::new(),
            useragent: None,
            username: String::new(),
            auth: AuthScheme::Any,
            workers: 2,
            threads: 32,
            idle: Duration::from_secs(30),
            socktimeout: Duration::from_secs_f64(20.0),
            proxyreload: Duration::from_secs(60),
            foreground: false,
            log: 0,
            config_path: None,
        }
    }
}

macro_rules! layer {
    ($base:expr, $ini:expr, $env:expr, $cli:expr) => {
        $cli.or($env).or($ini).unwrap_or($base)
    };
}

/// Merges defaults, an already-loaded INI snapshot, `PX_*` env vars and
/// parsed CLI flags into one `Config`. INI/env malformed values are
/// skipped (default layer below them wins) rather than treated as fatal,
/// per the error table's "keep default, log" policy.
pub fn merge(cli: &Cli, ini: &IniConfig) -> Config {
    let base = Config::default();

    let gateway = layer!(base.gateway, ini.gateway, env_bool("PX_GATEWAY"), cli.gateway);
    let hostonly = layer!(base.hostonly, ini.hostonly, env_bool("PX_HOSTONLY"), cli.hostonly);

    let listen_configured = layer!(
        base.listen.join(","),
        ini.listen.clone(),
        env_str("PX_LISTEN"),
        cli.listen.clone()
    );
    let allow_configured = layer!(base.allow.clone(), ini.allow.clone(), env_str("PX_ALLOW"), cli.allow.clone());

    // Gateway+hostonly redesign note: gateway forces "all interfaces" and
    // an emptied allow rule so only hostonly's local-interface check gates
    // admission.
    let (listen, allow) = if gateway {
        ("0.0.0.0".to_string(), if hostonly { String::new() } else { allow_configured })
    } else {
        (listen_configured, allow_configured)
    };

    Config {
        server: layer!(base.server, ini.server.clone(), env_str("PX_SERVER"), cli.server.clone()),
        pac: cli.pac.clone().or_else(|| env_str("PX_PAC")).or_else(|| ini.pac.clone()),
        pac_encoding: layer!(
            base.pac_encoding,
            ini.pac_encoding.clone(),
            env_str("PX_PAC_ENCODING"),
            cli.pac_encoding.clone()
        ),
        port: layer!(base.port, ini.port, env_parse("PX_PORT"), cli.port),
        listen: listen.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect(),
        allow,
        gateway,
        hostonly,
        noproxy: layer!(base.noproxy, ini.noproxy.clone(), env_str("PX_NOPROXY"), cli.noproxy.clone()),
        useragent: cli.useragent.clone().or_else(|| env_str("PX_USERAGENT")).or_else(|| ini.useragent.clone()),
        username: layer!(base.username, ini.username.clone(), env_str("PX_USERNAME"), cli.username.clone()),
        auth: layer!(base.auth, ini.auth.as_deref().and_then(AuthScheme::parse), env_str("PX_AUTH").as_deref().and_then(AuthScheme::parse), cli.auth.as_deref().and_then(AuthScheme::parse)),
        workers: layer!(base.workers, ini.workers, env_parse("PX_WORKERS"), cli.workers),
        threads: layer!(base.threads, ini.threads, env_parse("PX_THREADS"), cli.threads),
        idle: Duration::from_secs(layer!(base.idle.as_secs(), ini.idle, env_parse("PX_IDLE"), cli.idle)),
        socktimeout: Duration::from_secs_f64(layer!(
            base.socktimeout.as_secs_f64(),
            ini.socktimeout,
            env_parse("PX_SOCKTIMEOUT"),
            cli.socktimeout
        )),
        proxyreload: Duration::from_secs(layer!(
            base.proxyreload.as_secs(),
            ini.proxyreload,
            env_parse("PX_PROXYRELOAD"),
            cli.proxyreload
        )),
        foreground: layer!(base.foreground, ini.foreground, env_bool("PX_FOREGROUND"), cli.foreground),
        log: layer!(base.log, ini.log, env_parse("PX_LOG_LEVEL"), cli.log),
        config_path: cli.config.clone(),
    }
}

impl Config {
    /// Resolves `listen` interfaces + `port` into concrete socket
    /// addresses for C8 to bind.
    pub fn listen_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listen
            .iter()
            .map(|host| {
                let ip: IpAddr = host.parse().map_err(|_| PxError::ConfigValue {
                    section: "proxy",
                    key: "listen",
                    value: host.clone(),
                    reason: "not a valid IP address".to_string(),
                })?;
                Ok(SocketAddr::new(ip, self.port))
            })
            .collect()
    }

    /// Serializes back into the INI shape for `--save`.
    pub fn to_ini(&self) -> IniConfig {
        IniConfig {
            server: non_empty(&self.server),
            pac: self.pac.clone(),
            pac_encoding: Some(self.pac_encoding.clone()),
            port: Some(self.port),
            listen: Some(self.listen.join(",")),
            allow: non_empty(&self.allow),
            gateway: Some(self.gateway),
            hostonly: Some(self.hostonly),
            noproxy: non_empty(&self.noproxy),
            useragent: self.useragent.clone(),
            username: non_empty(&self.username),
            auth: Some(auth_scheme_name(self.auth).to_string()),
            workers: Some(self.workers),
            threads: Some(self.threads),
            idle: Some(self.idle.as_secs()),
            socktimeout: Some(self.socktimeout.as_secs_f64()),
            proxyreload: Some(self.proxyreload.as_secs()),
            foreground: Some(self.foreground),
            log: Some(self.log),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn auth_scheme_name(scheme: AuthScheme) -> &'static str {
    match scheme {
        AuthScheme::Ntlm => "NTLM",
        AuthScheme::Negotiate => "NEGOTIATE",
        AuthScheme::Digest => "DIGEST",
        AuthScheme::Basic => "BASIC",
        AuthScheme::Any => "ANY",
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> Cli {
        Cli::default()
    }

    #[test]
    fn defaults_apply_when_nothing_configured() {
        let config = merge(&cli(), &IniConfig::default());
        assert_eq!(config.port, 3128);
        assert_eq!(config.workers, 2);
        assert_eq!(config.allow, DEFAULT_ALLOW);
    }

    #[test]
    fn cli_wins_over_env_and_ini() {
        let ini = IniConfig { port: Some(1000), ..Default::default() };
        std::env::set_var("PX_PORT", "2000");
        let mut c = cli();
        c.port = Some(3000);
        let config = merge(&c, &ini);
        std::env::remove_var("PX_PORT");
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn env_wins_over_ini_when_cli_unset() {
        let ini = IniConfig { port: Some(1000), ..Default::default() };
        std::env::set_var("PX_PORT", "2000");
        let config = merge(&cli(), &ini);
        std::env::remove_var("PX_PORT");
        assert_eq!(config.port, 2000);
    }

    #[test]
    fn ini_wins_over_default_when_nothing_else_set() {
        let ini = IniConfig { port: Some(1000), ..Default::default() };
        let config = merge(&cli(), &ini);
        assert_eq!(config.port, 1000);
    }

    #[test]
    fn gateway_overrides_listen_to_all_interfaces() {
        let mut c = cli();
        c.gateway = Some(true);
        c.hostonly = Some(true);
        let config = merge(&c, &IniConfig::default());
        assert_eq!(config.listen, vec!["0.0.0.0".to_string()]);
        assert!(config.allow.is_empty());
    }

    #[test]
    fn round_trip_through_ini_is_stable() {
        let config = merge(&cli(), &IniConfig::default());
        let ini = config.to_ini();
        let reconstituted = merge(&cli(), &ini);
        assert_eq!(reconstituted.port, config.port);
        assert_eq!(reconstituted.workers, config.workers);
        assert_eq!(reconstituted.allow, config.allow);
    }
}
