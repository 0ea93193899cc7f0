//! TCP tunnel.
//!
//! The listener accepts connections indefinitely; every accepted client
//! gets its own session task and its own upstream IPv6 socket. There is no
//! mapping table on this side: the TCP connection's lifetime is the flow's
//! lifetime, and a read error, decode error or close on either socket tears
//! the session down. Frames travel back-to-back on the stream with no extra
//! delimiter.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::frame::{Frame, FrameError, MAX_PAYLOAD, PROTOCOL_VERSION};
use crate::resolver::{resolve_destination, CoordinatorResolver};
use crate::upstream::upstream_socket;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct TcpTunnel {
    listener: TcpListener,
    resolver: Arc<dyn CoordinatorResolver>,
    config: Config,
    shutdown: watch::Receiver<bool>,
    sessions: Arc<Semaphore>,
}

impl TcpTunnel {
    pub async fn bind(
        config: Config,
        resolver: Arc<dyn CoordinatorResolver>,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_socket_addr()).await?;
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Ok(TcpTunnel {
            listener,
            resolver,
            config,
            shutdown,
            sessions,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until shutdown or a fatal listener error.
    pub async fn run(mut self) -> io::Result<()> {
        info!(
            "waiting for TCP connections on {}",
            self.listener.local_addr()?
        );

        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("TCP accept failed: {e}");
                            return Err(e);
                        }
                    };

                    let Ok(permit) = self.sessions.clone().try_acquire_owned() else {
                        // Dropping the stream closes the connection
                        warn!("refusing TCP client {peer}: session limit reached");
                        continue;
                    };

                    info!("got TCP client from {peer}");

                    let resolver = self.resolver.clone();
                    let config = self.config.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        match run_session(stream, peer, resolver, config, shutdown).await {
                            Ok(()) => info!("TCP client {peer} disconnected"),
                            Err(e) => warn!("TCP session for {peer} ended: {e}"),
                        }
                        drop(permit);
                    });
                }
                _ = self.shutdown.changed() => {
                    info!("TCP tunnel shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Shuttles frames between one client connection and its upstream socket
/// until either side closes or fails.
///
/// The stream is split and each direction runs on its own half, so a quiet
/// client never delays device replies and a frame read is never cancelled
/// mid-frame by upstream traffic. Either direction ending ends the session.
async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    resolver: Arc<dyn CoordinatorResolver>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let upstream = upstream_socket(&config.tunnel_interface)?;
    let (mut rd, mut wr) = stream.into_split();

    tokio::select! {
        res = client_to_device(&mut rd, &upstream, resolver.as_ref(), &config, peer) => res,
        res = device_to_client(&mut wr, &upstream, peer) => res,
        _ = shutdown.changed() => Ok(()),
    }
}

/// Client half: decode frames off the stream, resolve, forward upstream.
/// Returns `Ok(())` on a clean close at a frame boundary.
async fn client_to_device(
    rd: &mut OwnedReadHalf,
    upstream: &UdpSocket,
    resolver: &dyn CoordinatorResolver,
    config: &Config,
    peer: SocketAddr,
) -> Result<(), SessionError> {
    loop {
        let Some(frame) = read_frame(rd).await? else {
            return Ok(());
        };

        debug!("data from client {peer}: {} payload bytes", frame.payload.len());

        let dest = match resolve_destination(frame.address, resolver) {
            Ok(dest) => dest,
            Err(e) => {
                // Only this frame is lost; the session carries on
                warn!("dropping frame from {peer}: {e}");
                continue;
            }
        };

        upstream
            .send_to(&frame.payload, SocketAddr::new(IpAddr::V6(dest), config.jip_port))
            .await?;
    }
}

/// Device half: frame every upstream datagram with its sender's address
/// and write it back to the client.
async fn device_to_client(
    wr: &mut OwnedWriteHalf,
    upstream: &UdpSocket,
    peer: SocketAddr,
) -> Result<(), SessionError> {
    let mut buf = vec![0u8; MAX_PAYLOAD];

    loop {
        let (len, from) = upstream.recv_from(&mut buf).await?;
        let IpAddr::V6(sender) = from.ip() else {
            continue;
        };

        debug!("data to client {peer}: {len} bytes from {sender}");

        let frame = Frame::new(sender, buf[..len].to_vec());
        wr.write_all(&frame.encode()).await?;
    }
}

/// Reads one length-prefixed frame: version byte, 2-byte length, then
/// exactly that many further bytes. Returns `Ok(None)` on a clean close at
/// a frame boundary.
async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Option<Frame>, SessionError> {
    let mut version = [0u8; 1];
    if stream.read(&mut version).await? == 0 {
        return Ok(None);
    }
    if version[0] != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version[0]).into());
    }

    let mut length = [0u8; 2];
    stream.read_exact(&mut length).await?;
    let length = u16::from_be_bytes(length);
    if length < 16 {
        return Err(FrameError::LengthTooShort(length).into());
    }

    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;

    let mut octets = [0u8; 16];
    octets.copy_from_slice(&body[..16]);
    let payload = body.split_off(16);

    Ok(Some(Frame::new(octets.into(), payload)))
}
