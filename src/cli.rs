//! CLI surface (clap derive). Every config field is `Option<T>` so "the
//! user didn't pass this flag" is distinguishable from "the user passed
//! the default value" — required for correct four-layer precedence in
//! `config.rs`. Actions (`--save`, `--test`, …) are plain bools/strings
//! since they aren't part of the layered config at all.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "px")]
#[command(version)]
#[command(about = "Local HTTP/HTTPS proxy that authenticates through a corporate upstream proxy")]
pub struct Cli {
    // --- proxy section ---
    /// Static upstream list: host:port[,host:port...]
    #[arg(long)]
    pub server: Option<String>,

    /// PAC URL or local file path
    #[arg(long)]
    pub pac: Option<String>,

    #[arg(long)]
    pub pac_encoding: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Comma-separated listen interfaces
    #[arg(long)]
    pub listen: Option<String>,

    /// Admission IP rule set
    #[arg(long)]
    pub allow: Option<String>,

    #[arg(long, num_args(0..=1), default_missing_value("true"))]
    pub gateway: Option<bool>,

    #[arg(long, num_args(0..=1), default_missing_value("true"))]
    pub hostonly: Option<bool>,

    /// Hosts that bypass the upstream proxy
    #[arg(long)]
    pub noproxy: Option<String>,

    /// Override the outgoing User-Agent header
    #[arg(long)]
    pub useragent: Option<String>,

    /// Principal used for credential lookup
    #[arg(long)]
    pub username: Option<String>,

    /// NTLM / NEGOTIATE / DIGEST / BASIC / ANY
    #[arg(long)]
    pub auth: Option<String>,

    // --- settings section ---
    #[arg(long)]
    pub workers: Option<u32>,

    #[arg(long)]
    pub threads: Option<u32>,

    #[arg(long)]
    pub idle: Option<u64>,

    #[arg(long)]
    pub socktimeout: Option<f64>,

    #[arg(long)]
    pub proxyreload: Option<u64>,

    #[arg(long, num_args(0..=1), default_missing_value("true"))]
    pub foreground: Option<bool>,

    /// Debug sink level 0..4
    #[arg(long)]
    pub log: Option<u8>,

    /// INI config file to load (also the `--save` destination)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    // --- actions (not persisted config) ---
    /// Write the effective configuration to the INI file and exit
    #[arg(long)]
    pub save: bool,

    #[arg(long)]
    pub install: bool,

    #[arg(long)]
    pub uninstall: bool,

    #[arg(long)]
    pub quit: bool,

    #[arg(long)]
    pub restart: bool,

    /// Interactively set the stored password for `--username`
    #[arg(long)]
    pub password: bool,

    /// With `--password`, delete the stored credential instead of setting one
    #[arg(long)]
    pub remove: bool,

    /// Run a self-check GET through the freshly started proxy, then exit
    #[arg(long)]
    pub test: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn unset_fields_default_to_none() {
        let cli = Cli::parse_from(["px"]);
        assert!(cli.port.is_none());
        assert!(cli.server.is_none());
        assert!(!cli.save);
    }

    #[test]
    fn bare_flag_parses_explicit_value() {
        let cli = Cli::parse_from(["px", "--port=3129", "--hostonly=1"]);
        assert_eq!(cli.port, Some(3129));
        assert_eq!(cli.hostonly, Some(true));
    }

    #[test]
    fn truly_bare_boolean_flags_default_to_true() {
        let cli = Cli::parse_from(["px", "--gateway", "--hostonly", "--foreground"]);
        assert_eq!(cli.gateway, Some(true));
        assert_eq!(cli.hostonly, Some(true));
        assert_eq!(cli.foreground, Some(true));
    }
}
