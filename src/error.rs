use thiserror::Error;

/// Errors raised while parsing or validating the command/ticket phase of a
/// connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command {0:?}")]
    UnknownCommand([u8; 4]),

    #[error("ticket has invalid length {0} (want 48)")]
    BadTicketLength(usize),

    #[error("ticket contains a non-alphanumeric byte at position {0}")]
    BadTicketChar(usize),
}

/// Errors raised by the admin-command (`STAT`/`INFO`) authorization check.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("source {0} is not in the allow list")]
    SourceNotAllowed(std::net::IpAddr),

    #[error("wrong admin password")]
    WrongPassword,
}

/// Errors raised talking to the upstream broker.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to upstream broker failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream broker returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream broker response was malformed: {0}")]
    MalformedResponse(String),
}

/// Errors detected at startup; always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required configuration key {0:?}")]
    MissingKey(&'static str),

    #[error("invalid value for configuration key {key:?}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("failed to load TLS material: {0}")]
    Tls(#[from] anyhow::Error),
}
