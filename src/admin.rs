//! TEST/STAT/INFO admin command handlers. These share the listener but
//! never open a backend socket.

use std::net::IpAddr;

use crate::config::Config;
use crate::error::AuthError;
use crate::stats::Registry;

/// Check that `source` is allowed to run admin commands. STAT/INFO from a
/// source outside `allow` is forbidden before any password is even read.
pub fn check_source(cfg: &Config, source: IpAddr) -> Result<(), AuthError> {
    if cfg.allow.contains(&source) {
        Ok(())
    } else {
        Err(AuthError::SourceNotAllowed(source))
    }
}

/// Constant-time-irrelevant password check — the admin secret is a
/// configuration value, not a cryptographic key, so a plain comparison is
/// sufficient.
pub fn check_secret(cfg: &Config, password: &str) -> Result<(), AuthError> {
    if password == cfg.secret {
        Ok(())
    } else {
        Err(AuthError::WrongPassword)
    }
}

/// One summary line for `INFO`: total sessions, total bytes sent, total
/// bytes received, uptime.
pub fn summary_line(registry: &Registry) -> String {
    let (live, total, sent, recv, uptime) = registry.summary();
    format!(
        "sessions={total} live={live} sent={sent} recv={recv} uptime={uptime}\n"
    )
}

/// One line per live session for `STAT`: source, destination, sent, recv,
/// duration.
pub fn detailed_lines(registry: &Registry) -> String {
    let mut out = String::new();
    for (source, destination, sent, recv, duration) in registry.detailed() {
        let destination = destination
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{source} {destination} sent={sent} recv={recv} duration={duration}\n"
        ));
    }
    out
}
