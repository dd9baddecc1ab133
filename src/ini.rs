//! INI config file layer: loads `[proxy]`/`[settings]` sections into the
//! same optional-field shape `cli.rs` uses, and serializes the effective
//! config back out for `--save`.

use std::path::Path;

use ini::Ini;

use crate::error::{PxError, Result};

/// Mirrors every layered key in `cli::Cli`, minus the action flags (which
/// are never persisted). `None` means "key absent from this file."
#[derive(Debug, Default, Clone)]
pub struct IniConfig {
    pub server: Option<String>,
    pub pac: Option<String>,
    pub pac_encoding: Option<String>,
    pub port: Option<u16>,
    pub listen: Option<String>,
    pub allow: Option<String>,
    pub gateway: Option<bool>,
    pub hostonly: Option<bool>,
    pub noproxy: Option<String>,
    pub useragent: Option<String>,
    pub username: Option<String>,
    pub auth: Option<String>,
    pub workers: Option<u32>,
    pub threads: Option<u32>,
    pub idle: Option<u64>,
    pub socktimeout: Option<f64>,
    pub proxyreload: Option<u64>,
    pub foreground: Option<bool>,
    pub log: Option<u8>,
}

pub fn load(path: &Path) -> Result<IniConfig> {
    if !path.exists() {
        return Ok(IniConfig::default());
    }
    let ini = Ini::load_from_file(path).map_err(|e| PxError::ConfigValue {
        section: "ini",
        key: "file",
        value: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let proxy = ini.section(Some("proxy"));
    let settings = ini.section(Some("settings"));

    Ok(IniConfig {
        server: str_of(proxy, "server"),
        pac: str_of(proxy, "pac"),
        pac_encoding: str_of(proxy, "pac_encoding"),
        port: parse_of(proxy, "port", "proxy"),
        listen: str_of(proxy, "listen"),
        allow: str_of(proxy, "allow"),
        gateway: bool_of(proxy, "gateway", "proxy"),
        hostonly: bool_of(proxy, "hostonly", "proxy"),
        noproxy: str_of(proxy, "noproxy"),
        useragent: str_of(proxy, "useragent"),
        username: str_of(proxy, "username"),
        auth: str_of(proxy, "auth"),
        workers: parse_of(settings, "workers", "settings"),
        threads: parse_of(settings, "threads", "settings"),
        idle: parse_of(settings, "idle", "settings"),
        socktimeout: parse_of(settings, "socktimeout", "settings"),
        proxyreload: parse_of(settings, "proxyreload", "settings"),
        foreground: bool_of(settings, "foreground", "settings"),
        log: parse_of(settings, "log", "settings"),
    })
}

/// Serializes `config` back out to `path`. Round-trip stability (`--save`
/// twice produces the same file with no CLI/env overrides in effect) holds
/// because every key that was `None` stays absent rather than being
/// written as an empty string.
pub fn save(path: &Path, config: &IniConfig) -> Result<()> {
    let mut ini = Ini::new();

    {
        let mut proxy = ini.with_section(Some("proxy"));
        set_str(&mut proxy, "server", &config.server);
        set_str(&mut proxy, "pac", &config.pac);
        set_str(&mut proxy, "pac_encoding", &config.pac_encoding);
        set_disp(&mut proxy, "port", &config.port);
        set_str(&mut proxy, "listen", &config.listen);
        set_str(&mut proxy, "allow", &config.allow);
        set_disp(&mut proxy, "gateway", &config.gateway.map(|b| b as u8));
        set_disp(&mut proxy, "hostonly", &config.hostonly.map(|b| b as u8));
        set_str(&mut proxy, "noproxy", &config.noproxy);
        set_str(&mut proxy, "useragent", &config.useragent);
        set_str(&mut proxy, "username", &config.username);
        set_str(&mut proxy, "auth", &config.auth);
    }
    {
        let mut settings = ini.with_section(Some("settings"));
        set_disp(&mut settings, "workers", &config.workers);
        set_disp(&mut settings, "threads", &config.threads);
        set_disp(&mut settings, "idle", &config.idle);
        set_disp(&mut settings, "socktimeout", &config.socktimeout);
        set_disp(&mut settings, "proxyreload", &config.proxyreload);
        set_disp(&mut settings, "foreground", &config.foreground.map(|b| b as u8));
        set_disp(&mut settings, "log", &config.log);
    }

    ini.write_to_file(path).map_err(|e| PxError::ConfigValue {
        section: "ini",
        key: "file",
        value: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn str_of(section: Option<&ini::Properties>, key: &str) -> Option<String> {
    section.and_then(|s| s.get(key)).map(str::to_string)
}

fn bool_of(section: Option<&ini::Properties>, key: &str, section_name: &'static str) -> Option<bool> {
    section.and_then(|s| s.get(key)).and_then(|v| match v {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => {
            tracing::warn!(section = section_name, key, value = v, "ini: malformed bool, ignoring key");
            None
        }
    })
}

fn parse_of<T: std::str::FromStr>(
    section: Option<&ini::Properties>,
    key: &str,
    section_name: &'static str,
) -> Option<T> {
    let raw = section.and_then(|s| s.get(key))?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(section = section_name, key, value = raw, "ini: malformed value, keeping default");
            None
        }
    }
}

fn set_str(section: &mut ini::SectionSetter<'_>, key: &'static str, value: &Option<String>) {
    if let Some(v) = value {
        section.set(key, v.as_str());
    }
}

fn set_disp<T: std::fmt::Display>(section: &mut ini::SectionSetter<'_>, key: &'static str, value: &Option<T>) {
    if let Some(v) = value {
        section.set(key, v.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default_config() {
        let config = load(Path::new("/nonexistent/px.ini")).unwrap();
        assert!(config.port.is_none());
    }

    #[test]
    fn round_trip_save_then_load() {
        let dir = std::env::temp_dir().join(format!("px-ini-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("px.ini");

        let config = IniConfig {
            server: Some("up.corp:8080".to_string()),
            port: Some(3129),
            hostonly: Some(true),
            ..Default::default()
        };
        save(&path, &config).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.server, config.server);
        assert_eq!(loaded.port, config.port);
        assert_eq!(loaded.hostonly, config.hostonly);
        assert!(loaded.pac.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
