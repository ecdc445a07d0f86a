//! The tunnel protocol engine: command parsing and the full-duplex relay
//! state machine for one accepted connection.
//!
//! The connection states (`READING_COMMAND` → `READING_TICKET` →
//! `AWAITING_BACKEND` → `PROXYING`) are expressed as a straight-line
//! sequence of awaited steps in a single `async fn` rather than a
//! dispatched callback with an explicit state field — a more natural fit
//! for Rust's ownership model, while preserving the same transitions.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin;
use crate::broker::BrokerClient;
use crate::config::Config;
use crate::failguard::FailGuard;
use crate::proto::{self, Command};
use crate::stats::{Registry, Stats};
use crate::ticket::Ticket;

/// Any duplex byte stream the engine can proxy — a plain `TcpStream` or a
/// `tokio_rustls` `TlsStream` wrapping one.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

pub type BoxedStream = Box<dyn AsyncDuplex>;

/// Everything a connection handler needs that is shared across the whole
/// listener.
pub struct SharedContext {
    pub config: Arc<Config>,
    pub broker: Arc<BrokerClient>,
    pub registry: Arc<Registry>,
    pub failguard: Arc<FailGuard>,
    pub backend_tls: Option<Arc<rustls::ClientConfig>>,
    pub shutdown: CancellationToken,
}

fn pretty(addr: SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

/// Handle one accepted connection end-to-end. `stream` has already had any
/// listener-side TLS handshake applied.
pub async fn handle_connection(ctx: Arc<SharedContext>, mut stream: BoxedStream, source: SocketAddr) {
    info!("CONNECT FROM {}", pretty(source));

    let mut head = [0u8; proto::COMMAND_LENGTH];
    if stream.read_exact(&mut head).await.is_err() {
        debug!("connection from {} closed before a command arrived", pretty(source));
        info!("TERMINATED {}", pretty(source));
        return;
    }

    let command = match Command::parse(&head) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("ERROR {} from {}", e, pretty(source));
            ctx.failguard.record_failure(source.ip());
            let _ = stream.write_all(proto::REPLY_ERROR_COMMAND).await;
            let _ = stream.shutdown().await;
            info!("TERMINATED {}", pretty(source));
            return;
        }
    };

    match command {
        Command::Test => handle_test(stream, source).await,
        Command::Stat => handle_admin(ctx, stream, source, true).await,
        Command::Info => handle_admin(ctx, stream, source, false).await,
        Command::Open => handle_open(ctx, stream, source).await,
    }
}

async fn handle_test(mut stream: BoxedStream, source: SocketAddr) {
    info!("COMMAND TEST from {}", pretty(source));
    let _ = stream.write_all(proto::REPLY_OK).await;
    let _ = stream.write_all(b"\n").await;
    let _ = stream.shutdown().await;
    info!("TERMINATED {}", pretty(source));
}

async fn handle_admin(ctx: Arc<SharedContext>, mut stream: BoxedStream, source: SocketAddr, detailed: bool) {
    info!("COMMAND {} from {}", if detailed { "STAT" } else { "INFO" }, pretty(source));

    if let Err(e) = admin::check_source(&ctx.config, source.ip()) {
        warn!("{} from {}", e, pretty(source));
        ctx.failguard.record_failure(source.ip());
        let _ = stream.write_all(proto::REPLY_FORBIDDEN).await;
        let _ = stream.shutdown().await;
        info!("TERMINATED {}", pretty(source));
        return;
    }

    let mut password_buf = [0u8; proto::PASSWORD_LENGTH];
    if stream.read_exact(&mut password_buf).await.is_err() {
        debug!("connection from {} closed before password arrived", pretty(source));
        info!("TERMINATED {}", pretty(source));
        return;
    }
    let password = String::from_utf8_lossy(&password_buf).trim_end_matches('\0').to_string();

    if let Err(e) = admin::check_secret(&ctx.config, &password) {
        warn!("{} from {}", e, pretty(source));
        ctx.failguard.record_failure(source.ip());
        let _ = stream.write_all(proto::REPLY_FORBIDDEN).await;
        let _ = stream.shutdown().await;
        info!("TERMINATED {}", pretty(source));
        return;
    }

    let body = if detailed {
        admin::detailed_lines(&ctx.registry)
    } else {
        admin::summary_line(&ctx.registry)
    };
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.write_all(b"\n").await;
    let _ = stream.shutdown().await;
    info!("TERMINATED {}", pretty(source));
}

async fn handle_open(ctx: Arc<SharedContext>, mut stream: BoxedStream, source: SocketAddr) {
    let ticket_buf = match read_ticket_argument(&mut stream).await {
        Ok(buf) => buf,
        Err(_) => {
            debug!("connection from {} closed before ticket arrived", pretty(source));
            info!("TERMINATED {}", pretty(source));
            return;
        }
    };

    let ticket = match Ticket::parse(&ticket_buf) {
        Ok(t) => t,
        Err(e) => {
            warn!("ERROR {} from {}", e, pretty(source));
            ctx.failguard.record_failure(source.ip());
            reject(stream, proto::REPLY_ERROR_TICKET, source).await;
            return;
        }
    };

    // READING_TICKET complete: reading is implicitly paused here — we do not
    // touch `stream` again until the resolver returns, so no further bytes
    // are consumed from the client while the upstream call is in flight.
    let resolution = match ctx.broker.resolve(&ticket, source.ip()).await {
        Ok(r) => r,
        Err(e) => {
            warn!("TICKET COMMS ERROR: resolve failed for {}: {}", pretty(source), e);
            debug!("TICKET COMMS ERROR: {} resolve {}", ticket, e);
            ctx.failguard.record_failure(source.ip());
            reject(stream, proto::REPLY_ERROR_TICKET, source).await;
            return;
        }
    };

    let destination = format!("{}:{}", resolution.host, resolution.port);
    info!("OPEN TUNNEL FROM {} to {}", pretty(source), destination);

    let backend = match connect_backend(&ctx, &resolution.host, resolution.port).await {
        Ok(b) => b,
        Err(e) => {
            error!("ERROR backend connect to {} failed: {}", destination, e);
            let _ = stream.shutdown().await;
            info!("TERMINATED {}", pretty(source));
            return;
        }
    };

    if stream.write_all(proto::REPLY_OK).await.is_err() {
        return;
    }

    let stats = Stats::new(source);
    if let Ok(dest_addr) = destination.parse::<SocketAddr>() {
        stats.set_destination(dest_addr);
    }
    ctx.registry.insert(&stats);

    let session_cancel = ctx.shutdown.child_token();

    proxy(stream, backend, stats.clone(), session_cancel).await;

    // Either peer closing or the process shutting down always funnels
    // through this single point once `proxy` returns, so the notify call
    // below fires exactly once per session without needing a separate
    // one-shot flag.
    stats.close();
    if let Err(e) = ctx.broker.notify(&resolution.notify, stats.sent(), stats.recv()).await {
        warn!("TICKET COMMS ERROR: {} notify {}", resolution.notify, e);
    }

    info!(
        "TERMINATED {} to {}, s:{}, r:{}, t:{}",
        pretty(source),
        destination,
        stats.sent(),
        stats.recv(),
        stats.duration_secs()
    );
}

/// Read the `OPEN` argument off the wire without ever trusting the fixed
/// 48-byte framing to silently drop trailing bytes. A plain
/// `read_exact(&mut [0u8; 48])` would happily consume the first 48 bytes of
/// a 49-byte ticket and leave the 49th sitting unread, letting an
/// over-length ticket reach the broker as if it were valid. Instead this
/// reads in whatever chunks the kernel hands back until at least
/// `TICKET_LENGTH` bytes have arrived (or the peer closes), then returns
/// everything read — so a client that stuffs extra bytes into the same
/// write as its ticket shows up here as a too-long buffer and is rejected by
/// `Ticket::parse` before any upstream call is made.
async fn read_ticket_argument(stream: &mut BoxedStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(crate::ticket::TICKET_LENGTH + 1);
    let mut chunk = [0u8; crate::ticket::TICKET_LENGTH + 1];
    while buf.len() < crate::ticket::TICKET_LENGTH {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before any ticket bytes arrived",
        ));
    }
    Ok(buf)
}

async fn reject(mut stream: BoxedStream, reply: &[u8], source: SocketAddr) {
    let _ = stream.write_all(reply).await;
    let _ = stream.shutdown().await;
    info!("TERMINATED {}", pretty(source));
}

async fn connect_backend(ctx: &SharedContext, host: &str, port: u16) -> std::io::Result<BoxedStream> {
    let tcp = TcpStream::connect((host, port)).await?;

    match &ctx.backend_tls {
        None => Ok(Box::new(tcp)),
        Some(client_cfg) => {
            let connector = TlsConnector::from(client_cfg.clone());
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid backend server name"))?;
            let tls = connector.connect(server_name, tcp).await?;
            Ok(Box::new(tls))
        }
    }
}

/// Full-duplex byte pump between `client` and `backend`. Each direction runs
/// as its own task so one side's write-backpressure never stalls the other;
/// a chunked `read` → `write_all` loop pauses reading on a direction
/// exactly while its peer's write is in flight, which is the pause/resume
/// discipline reactive flow control calls for, expressed without an
/// explicit flag. Either half finishing (EOF, error, or external
/// cancellation) cancels the other, so one transport closing always closes
/// its peer's transport too.
async fn proxy(client: BoxedStream, backend: BoxedStream, stats: Arc<Stats>, cancel: CancellationToken) {
    let (client_r, client_w) = tokio::io::split(client);
    let (backend_r, backend_w) = tokio::io::split(backend);

    let to_backend = {
        let cancel = cancel.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            run_direction(client_r, backend_w, stats, Direction::Sent, cancel.clone()).await;
            cancel.cancel();
        })
    };

    let to_client = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_direction(backend_r, client_w, stats, Direction::Recv, cancel.clone()).await;
            cancel.cancel();
        })
    };

    let _ = tokio::join!(to_backend, to_client);
}

#[derive(Clone, Copy)]
enum Direction {
    Sent,
    Recv,
}

async fn run_direction<R, W>(mut reader: R, mut writer: W, stats: Arc<Stats>, direction: Direction, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copy = async {
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if writer.write_all(&buf[..n]).await.is_err() {
                break;
            }
            match direction {
                Direction::Sent => stats.add_sent(n as u64),
                Direction::Recv => stats.add_recv(n as u64),
            }
        }
    };

    tokio::select! {
        _ = copy => {}
        _ = cancel.cancelled() => {}
    }
    let _ = writer.shutdown().await;
}
