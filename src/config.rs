//! CLI flags, the INI configuration file, and the immutable [`Config`]
//! record built from them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "uds-tunnel", version, about = "UDS tunnel relay")]
pub struct Cli {
    /// Path to the INI configuration file.
    #[arg(long, default_value = "tunnel.conf")]
    pub config: PathBuf,

    /// Overrides the `log_level` key from the configuration file.
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub ipv6: bool,

    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub tls_ciphers: Option<String>,

    /// Backend (upstream desktop service) CA file. When set, the relay
    /// dials the resolved `host:port` with TLS instead of plain TCP.
    pub backend_tls_ca: Option<String>,

    pub uds_server: String,
    pub uds_token: String,
    pub uds_timeout: Duration,
    pub uds_verify_ssl: bool,

    pub allow: HashSet<IpAddr>,
    pub secret: String,

    pub workers: usize,

    pub log_level: String,
    pub log_file: String,

    pub allowed_fails: usize,
    pub fail_window: Duration,
}

impl Config {
    /// Listen address, with IPv6 bracketing applied only if not already
    /// present — matching the idiom used by the Rust tunnel-server port in
    /// the reference pack.
    pub fn listen_address(&self) -> String {
        if self.ipv6 {
            let host = if self.listen_host.starts_with('[') {
                self.listen_host.clone()
            } else {
                format!("[{}]", self.listen_host)
            };
            format!("{host}:{}", self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }
}

/// Parse a `key=value` INI-style file into a lookup table, skipping blank
/// lines and `#`/`;`-prefixed comments.
fn parse_ini(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

fn get_or(map: &HashMap<String, String>, key: &'static str, default: &str) -> String {
    map.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn get_required(map: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    map.get(key).cloned().ok_or(ConfigError::MissingKey(key))
}

fn parse_bool(map: &HashMap<String, String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key,
                reason: format!("{other:?} is not a boolean"),
            }),
        },
    }
}

fn parse_u16(map: &HashMap<String, String>, key: &'static str, default: u16) -> Result<u16, ConfigError> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            reason: format!("{v:?} is not a valid port"),
        }),
    }
}

fn parse_usize(map: &HashMap<String, String>, key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            reason: format!("{v:?} is not a number"),
        }),
    }
}

fn parse_allow(map: &HashMap<String, String>) -> Result<HashSet<IpAddr>, ConfigError> {
    let raw = get_or(map, "allow", "127.0.0.1");
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>().map_err(|_| ConfigError::InvalidValue {
                key: "allow",
                reason: format!("{s:?} is not an IP address"),
            })
        })
        .collect()
}

/// Build a [`Config`] from the file at `cli.config`, with CLI flags applied
/// as overrides.
pub fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(&cli.config).map_err(|source| ConfigError::Read {
        path: cli.config.clone(),
        source,
    })?;
    let map = parse_ini(&contents);

    let uds_server = get_required(&map, "uds_server")?;
    let uds_token = get_required(&map, "uds_token")?;
    let secret = get_required(&map, "secret")?;

    let mut log_level = get_or(&map, "log_level", "INFO");
    if let Some(override_level) = &cli.log_level {
        log_level = override_level.clone();
    }

    let ssl_certificate = get_or(&map, "ssl_certificate", "");
    let ssl_certificate_key = get_or(&map, "ssl_certificate_key", "");
    let ssl_ciphers = get_or(&map, "ssl_ciphers", "");
    let backend_tls_ca = get_or(&map, "backend_tls_ca", "");

    Ok(Config {
        listen_host: get_or(&map, "address", "0.0.0.0"),
        listen_port: parse_u16(&map, "port", 7777)?,
        ipv6: parse_bool(&map, "ipv6", false)?,

        tls_cert_path: (!ssl_certificate.is_empty()).then_some(ssl_certificate),
        tls_key_path: (!ssl_certificate_key.is_empty()).then_some(ssl_certificate_key),
        tls_ciphers: (!ssl_ciphers.is_empty()).then_some(ssl_ciphers),
        backend_tls_ca: (!backend_tls_ca.is_empty()).then_some(backend_tls_ca),

        uds_server,
        uds_token,
        uds_timeout: Duration::from_secs(parse_usize(&map, "uds_timeout", 10)? as u64),
        uds_verify_ssl: parse_bool(&map, "uds_verify_ssl", true)?,

        allow: parse_allow(&map)?,
        secret,

        workers: parse_usize(&map, "workers", 128)?,

        log_level,
        log_file: get_or(&map, "log_file", "-"),

        allowed_fails: parse_usize(&map, "allowed_fails", 5)?,
        fail_window: Duration::from_secs(parse_usize(&map, "fail_window", 60)? as u64),
    })
}
