//! Connection supervisor and per-connection pipeline.
//!
//! One accept loop; every accepted socket gets its own task and proceeds
//! through `Accepted → TlsNegotiated → ExportRequested → Authenticated →
//! VolumeResolved → Attached → Serving → Closing → Closed`. A failure jumps
//! straight to `Closing`; once a volume is attached, release runs exactly
//! once on every exit path, panics included. Nothing a single connection
//! does can take down the accept loop or another connection.

use super::protocol::*;
use super::{parse_export_uri, volume_id_from_uri};
use crate::control::{ControlError, ControlPlane};
use crate::identity::{authenticate, AuthError, IdentityService};
use crate::lease::orchestrator::{AttachError, AttachmentOrchestrator};
use crate::lease::registry::LeaseRegistry;
use crate::lease::AccessMode;
use crate::task::spawn_named;
use deku::prelude::*;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    SeekFrom,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client does not support fixed newstyle negotiation")]
    IncompatibleClient,

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("cannot resolve volume '{volume_id}': {source}")]
    Resolution {
        volume_id: String,
        source: ControlError,
    },

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error("connection handler panicked while serving")]
    HandlerPanic,
}

/// Where a connection is in its pipeline. Carried in error logs so a failed
/// connection names the step it died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepted,
    TlsNegotiated,
    ExportRequested,
    Authenticated,
    VolumeResolved,
    Attached,
    Serving,
    Closing,
    Closed,
}

/// Everything a connection handler needs, constructed once at startup and
/// shared immutably.
pub struct GatewayContext {
    pub identity: Arc<dyn IdentityService>,
    pub control: Arc<dyn ControlPlane>,
    pub orchestrator: AttachmentOrchestrator,
    /// `None` means the operator explicitly disabled TLS.
    pub tls: Option<TlsAcceptor>,
}

impl GatewayContext {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        control: Arc<dyn ControlPlane>,
        registry: Arc<LeaseRegistry>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        let orchestrator = AttachmentOrchestrator::new(registry, Arc::clone(&control));
        Self {
            identity,
            control,
            orchestrator,
            tls,
        }
    }
}

/// NBD gateway front end: accept loop plus per-connection tasks.
pub struct NbdServer {
    ctx: Arc<GatewayContext>,
    addr: SocketAddr,
}

impl NbdServer {
    pub fn new(ctx: Arc<GatewayContext>, addr: SocketAddr) -> Self {
        Self { ctx, addr }
    }

    /// Bind the listening socket and serve until the shutdown token fires.
    pub async fn start(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("NBD gateway listening on {}", listener.local_addr()?);
        self.accept_loop(listener, shutdown).await
    }

    /// Serve on an already-bound listener. The listener is dropped (closed)
    /// on every exit path, including errors.
    pub async fn accept_loop(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("NBD gateway shutting down, no longer accepting connections");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, peer) = result?;
                    debug!(peer = %peer, "client connected");
                    stream.set_nodelay(true)?;
                    self.spawn_connection(stream, peer);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        let acceptor = self.ctx.tls.clone();

        spawn_named("nbd-conn", async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        handle_connection(stream, peer, ctx, Phase::TlsNegotiated).await
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "TLS handshake failed"),
                },
                None => handle_connection(stream, peer, ctx, Phase::Accepted).await,
            }
        });
    }
}

/// Run one connection to completion. Errors are logged here and go no
/// further; the socket closes when the halves drop.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<GatewayContext>,
    phase: Phase,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut session = Session {
        reader: BufReader::new(reader),
        writer: BufWriter::new(writer),
        ctx: &ctx,
        conn_id: Uuid::new_v4(),
        peer,
        client_no_zeroes: false,
        phase,
    };

    match session.run().await {
        Ok(()) => debug!(peer = %peer, "connection closed cleanly"),
        Err(ConnectionError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!(peer = %peer, phase = ?session.phase, "client disconnected");
        }
        Err(e) => {
            warn!(peer = %peer, phase = ?session.phase, error = %e, "connection failed");
        }
    }
    session.phase = Phase::Closed;
}

struct Session<'a, R, W> {
    reader: R,
    writer: W,
    ctx: &'a GatewayContext,
    conn_id: Uuid,
    peer: SocketAddr,
    client_no_zeroes: bool,
    phase: Phase,
}

impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> Session<'_, R, W> {
    async fn run(&mut self) -> Result<(), ConnectionError> {
        self.perform_handshake().await?;

        let uri = self.read_export_request().await?;
        self.phase = Phase::ExportRequested;

        // authentication strictly precedes resolution, which precedes attach
        let identity = authenticate(self.ctx.identity.as_ref(), &uri).await?;
        self.phase = Phase::Authenticated;

        let volume_id = volume_id_from_uri(&uri).ok_or_else(|| {
            ConnectionError::Protocol(format!(
                "export name '{}' names no volume",
                uri.path()
            ))
        })?;
        let volume = self
            .ctx
            .control
            .resolve_volume(&volume_id)
            .await
            .map_err(|source| ConnectionError::Resolution { volume_id, source })?;
        self.phase = Phase::VolumeResolved;

        let mode = if volume.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let (lease, device) = self
            .ctx
            .orchestrator
            .acquire(&identity, self.conn_id, &volume, mode)
            .await?;
        self.phase = Phase::Attached;

        // From here, release must run exactly once on every path. catch_unwind
        // keeps that true even if the serve loop panics.
        let serve_result = AssertUnwindSafe(self.serve(&device, mode)).catch_unwind().await;
        self.phase = Phase::Closing;
        self.ctx.orchestrator.release(lease).await;

        match serve_result {
            Ok(result) => result,
            Err(_panic) => Err(ConnectionError::HandlerPanic),
        }
    }

    async fn perform_handshake(&mut self) -> Result<(), ConnectionError> {
        let handshake = NBDServerHandshake::new(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES);
        let handshake_bytes = handshake
            .to_bytes()
            .map_err(|e| ConnectionError::Protocol(format!("handshake encode: {e}")))?;
        self.writer.write_all(&handshake_bytes).await?;
        self.writer.flush().await?;

        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf).await?;
        let client_flags = NBDClientFlags::from_bytes((&buf, 0))
            .map_err(|e| ConnectionError::Protocol(format!("invalid client flags: {e}")))?
            .1;

        if (client_flags.flags & NBD_FLAG_C_FIXED_NEWSTYLE) == 0 {
            return Err(ConnectionError::IncompatibleClient);
        }
        self.client_no_zeroes = (client_flags.flags & NBD_FLAG_C_NO_ZEROES) != 0;

        Ok(())
    }

    /// Drive option negotiation until the client names its export. The
    /// export name is the volume URI; anything other than EXPORT_NAME is
    /// answered unsupported so conforming clients fall back.
    async fn read_export_request(&mut self) -> Result<Url, ConnectionError> {
        loop {
            let mut header_buf = [0u8; NBD_OPTION_HEADER_SIZE];
            self.reader.read_exact(&mut header_buf).await?;
            let header = NBDOptionHeader::from_bytes((&header_buf, 0))
                .map_err(|e| ConnectionError::Protocol(format!("invalid option header: {e}")))?
                .1;

            match header.option {
                NBD_OPT_EXPORT_NAME => {
                    let mut name_buf = vec![0u8; header.length as usize];
                    self.reader.read_exact(&mut name_buf).await?;
                    let name = String::from_utf8_lossy(&name_buf).into_owned();
                    debug!(peer = %self.peer, export = %name, "client requested export");

                    return parse_export_uri(&name).map_err(|e| {
                        ConnectionError::Protocol(format!("export name is not a valid URI: {e}"))
                    });
                }
                NBD_OPT_ABORT => {
                    self.send_option_reply(header.option, NBD_REP_ACK, &[]).await?;
                    self.writer.flush().await?;
                    return Err(ConnectionError::Protocol("client aborted".to_string()));
                }
                other => {
                    debug!(peer = %self.peer, option = other, "unsupported option");
                    self.drain(header.length as usize).await?;
                    self.send_option_reply(other, NBD_REP_ERR_UNSUP, &[]).await?;
                    self.writer.flush().await?;
                }
            }
        }
    }

    async fn send_option_reply(
        &mut self,
        option: u32,
        reply_type: u32,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        let reply = NBDOptionReply::new(option, reply_type, data.len() as u32);
        let reply_bytes = reply
            .to_bytes()
            .map_err(|e| ConnectionError::Protocol(format!("option reply encode: {e}")))?;
        self.writer.write_all(&reply_bytes).await?;
        if !data.is_empty() {
            self.writer.write_all(data).await?;
        }
        Ok(())
    }

    async fn drain(&mut self, length: usize) -> Result<(), ConnectionError> {
        if length > 0 {
            let mut buf = vec![0u8; length];
            self.reader.read_exact(&mut buf).await?;
        }
        Ok(())
    }

    /// Serve block I/O against the attached device until the client
    /// disconnects. Runs with the lease held; the caller releases it.
    async fn serve(&mut self, device: &Path, mode: AccessMode) -> Result<(), ConnectionError> {
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::ReadWrite)
            .open(device)
            .await?;
        let size = file.seek(SeekFrom::End(0)).await?;

        self.send_export_info(size, mode).await?;
        self.phase = Phase::Serving;
        info!(
            peer = %self.peer,
            device = %device.display(),
            size,
            mode = ?mode,
            "serving device"
        );

        loop {
            let mut request_buf = [0u8; NBD_REQUEST_HEADER_SIZE];
            self.reader.read_exact(&mut request_buf).await?;
            let request = NBDRequest::from_bytes((&request_buf, 0))
                .map_err(|e| ConnectionError::Protocol(format!("invalid request: {e}")))?
                .1;

            let fua = (request.flags & NBD_CMD_FLAG_FUA) != 0;
            let end = request.offset.checked_add(request.length as u64);

            match request.cmd_type {
                NBDCommand::Read => {
                    if request.length > NBD_MAX_IO_LENGTH || end.map_or(true, |e| e > size) {
                        self.send_simple_reply(request.cookie, NBD_EINVAL, &[]).await?;
                        continue;
                    }
                    file.seek(SeekFrom::Start(request.offset)).await?;
                    let mut data = vec![0u8; request.length as usize];
                    match file.read_exact(&mut data).await {
                        Ok(_) => {
                            self.send_simple_reply(request.cookie, NBD_SUCCESS, &data).await?;
                        }
                        Err(e) => {
                            warn!(peer = %self.peer, error = %e, "device read failed");
                            self.send_simple_reply(request.cookie, NBD_EIO, &[]).await?;
                        }
                    }
                }
                NBDCommand::Write => {
                    if request.length > NBD_MAX_IO_LENGTH {
                        self.send_simple_reply(request.cookie, NBD_EINVAL, &[]).await?;
                        return Err(ConnectionError::Protocol(
                            "oversized write request".to_string(),
                        ));
                    }
                    // the payload is on the wire either way; consume it first
                    let mut data = vec![0u8; request.length as usize];
                    self.reader.read_exact(&mut data).await?;

                    if mode == AccessMode::ReadOnly {
                        self.send_simple_reply(request.cookie, NBD_EPERM, &[]).await?;
                    } else if end.map_or(true, |e| e > size) {
                        self.send_simple_reply(request.cookie, NBD_ENOSPC, &[]).await?;
                    } else {
                        let result = async {
                            file.seek(SeekFrom::Start(request.offset)).await?;
                            file.write_all(&data).await?;
                            if fua {
                                file.sync_data().await?;
                            }
                            Ok::<(), std::io::Error>(())
                        }
                        .await;
                        match result {
                            Ok(()) => {
                                self.send_simple_reply(request.cookie, NBD_SUCCESS, &[]).await?;
                            }
                            Err(e) => {
                                warn!(peer = %self.peer, error = %e, "device write failed");
                                self.send_simple_reply(request.cookie, NBD_EIO, &[]).await?;
                            }
                        }
                    }
                }
                NBDCommand::Flush => match file.sync_all().await {
                    Ok(()) => self.send_simple_reply(request.cookie, NBD_SUCCESS, &[]).await?,
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "device flush failed");
                        self.send_simple_reply(request.cookie, NBD_EIO, &[]).await?;
                    }
                },
                NBDCommand::Disconnect => {
                    debug!(peer = %self.peer, "client disconnecting");
                    return Ok(());
                }
                NBDCommand::Unknown(cmd) => {
                    warn!(peer = %self.peer, cmd, "unknown NBD command");
                    self.send_simple_reply(request.cookie, NBD_EINVAL, &[]).await?;
                }
            }
        }
    }

    async fn send_export_info(&mut self, size: u64, mode: AccessMode) -> Result<(), ConnectionError> {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_FUA;
        if mode == AccessMode::ReadOnly {
            flags |= NBD_FLAG_READ_ONLY;
        }

        self.writer.write_all(&size.to_be_bytes()).await?;
        self.writer.write_all(&flags.to_be_bytes()).await?;
        if !self.client_no_zeroes {
            self.writer.write_all(&[0u8; NBD_EXPORT_NAME_PADDING]).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_simple_reply(
        &mut self,
        cookie: u64,
        error: u32,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        let reply = NBDSimpleReply::new(cookie, error);
        let reply_bytes = reply
            .to_bytes()
            .map_err(|e| ConnectionError::Protocol(format!("reply encode: {e}")))?;
        self.writer.write_all(&reply_bytes).await?;
        if !data.is_empty() {
            self.writer.write_all(data).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }
}
