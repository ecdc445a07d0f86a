//! Accept loop, optional TLS termination, concurrency ceiling, and clean
//! shutdown: a concurrency-limiting semaphore and a failure-counting
//! accept-time filter sit in front of per-connection task spawning.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::error::ConfigError;
use crate::failguard::FailGuard;
use crate::session::{self, BoxedStream, SharedContext};
use crate::stats::Registry;
use crate::tls;

pub struct Listener {
    ctx: Arc<SharedContext>,
    tls_acceptor: Option<TlsAcceptor>,
    permits: Arc<Semaphore>,
}

impl Listener {
    /// Build a fully-initialised [`Listener`] from configuration, loading
    /// any TLS material up front. Any failure here is TLS/material related
    /// — binding the socket is a separate step (see [`Listener::bind`]) so
    /// the two failure modes map to distinct process exit codes.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let config = Arc::new(config);

        let broker = BrokerClient::new(&config)
            .map(Arc::new)
            .map_err(ConfigError::Tls)?;
        let registry = Registry::new();
        let failguard = Arc::new(FailGuard::new(config.allowed_fails, config.fail_window));

        let tls_acceptor = if config.tls_cert_path.is_some() {
            let server_cfg = tls::build_server_config(&config).map_err(ConfigError::Tls)?;
            Some(TlsAcceptor::from(Arc::new(server_cfg)))
        } else {
            None
        };

        let backend_tls = match &config.backend_tls_ca {
            Some(ca_path) => Some(Arc::new(
                tls::build_backend_client_config(ca_path).map_err(ConfigError::Tls)?,
            )),
            None => None,
        };

        let permits = Arc::new(Semaphore::new(config.workers));

        let ctx = Arc::new(SharedContext {
            config,
            broker,
            registry,
            failguard,
            backend_tls,
            shutdown: CancellationToken::new(),
        });

        Ok(Listener {
            ctx,
            tls_acceptor,
            permits,
        })
    }

    /// Bind the listening socket. Kept separate from [`Listener::new`] so
    /// callers can tell a bind failure apart from a TLS material failure.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let address = self.ctx.config.listen_address();
        let listener = TcpListener::bind(&address).await?;
        info!("Tunnel server running on {}", address);
        Ok(listener)
    }

    /// Run the accept loop against an already-bound socket until a
    /// shutdown signal arrives, then stop accepting and wait a bounded
    /// grace period for live sessions to drain.
    pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
        tokio::select! {
            res = self.accept_loop(&listener) => res,
            _ = shutdown_signal() => {
                info!("Shutdown signal received. Closing listener.");
                self.ctx.shutdown.cancel();
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            }
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> anyhow::Result<()> {
        loop {
            let (socket, source) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            if self.ctx.failguard.is_blocked(source.ip()) {
                debug!("Dropping connection from blocked source {}", source.ip());
                continue;
            }

            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    info!("Concurrency ceiling reached, closing connection from {}", source);
                    drop(socket);
                    continue;
                }
            };

            let ctx = self.ctx.clone();
            let tls_acceptor = self.tls_acceptor.clone();

            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = accept_one(ctx, tls_acceptor, socket, source).await {
                    error!("Connection from {} ended with error: {:?}", source, e);
                }
            });
        }
    }
}

async fn accept_one(
    ctx: Arc<SharedContext>,
    tls_acceptor: Option<TlsAcceptor>,
    socket: TcpStream,
    source: SocketAddr,
) -> anyhow::Result<()> {
    let stream: BoxedStream = match tls_acceptor {
        None => Box::new(socket),
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => Box::new(tls_stream),
            Err(e) => {
                warn!("TLS handshake failed for {}: {}", source, e);
                return Ok(());
            }
        },
    };

    session::handle_connection(ctx, stream, source).await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn base_config(workers: usize) -> Config {
        Config {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            ipv6: false,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ciphers: None,
            backend_tls_ca: None,
            uds_server: "http://127.0.0.1:1".to_string(),
            uds_token: "tok".to_string(),
            uds_timeout: Duration::from_secs(2),
            uds_verify_ssl: true,
            allow: HashSet::new(),
            secret: "s".to_string(),
            workers,
            log_level: "INFO".to_string(),
            log_file: "-".to_string(),
            allowed_fails: 5,
            fail_window: Duration::from_secs(60),
        }
    }

    /// B3: `workers=0` causes every connection to be refused immediately —
    /// the accept loop never even replies `OK` to a `TEST` probe.
    #[tokio::test]
    async fn zero_workers_refuses_every_connection() {
        let listener = Listener::new(base_config(0)).expect("listener config should build");
        let bound = listener.bind().await.expect("bind should succeed on an ephemeral port");
        let addr = bound.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = listener.accept_loop(&bound).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(b"TEST").await;

        let mut buf = [0u8; 2];
        let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .expect("read should not hang")
            .unwrap_or(0);
        assert_eq!(n, 0, "a connection should be closed with no reply when workers=0");
    }

    /// Scenario 6: with `workers=1`, a second connection held open while the
    /// first still holds its permit is refused at accept time.
    #[tokio::test]
    async fn concurrency_ceiling_rejects_connections_beyond_workers() {
        let listener = Listener::new(base_config(1)).expect("listener config should build");
        let bound = listener.bind().await.expect("bind should succeed on an ephemeral port");
        let addr = bound.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = listener.accept_loop(&bound).await;
        });

        // First connection: send a partial command so its task holds the
        // permit open without completing.
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"TE").await.unwrap();

        // Give the accept loop a moment to spawn the first connection's task
        // and acquire its permit before the second connection is attempted.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_millis(500), second.read(&mut buf))
            .await
            .expect("read should not hang")
            .unwrap_or(0);
        assert_eq!(n, 0, "second connection should be refused while the first holds the only permit");

        drop(first);
    }
}
