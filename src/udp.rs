//! UDP tunnel.
//!
//! One IPv4 listen socket, one mapping per client flow. A mapping binds the
//! client's (address, port) to a dedicated upstream IPv6 socket so device
//! replies can be routed back to the right client. UDP has no connection
//! teardown, so mappings are reclaimed by an idle-eviction sweep instead.
//!
//! A single worker owns the whole table; every readiness wait spans the
//! listen socket, all live upstream sockets and the sweep tick, so eviction
//! stays timely even with no traffic.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::frame::{Frame, HEADER_LEN, MAX_PAYLOAD};
use crate::resolver::{resolve_destination, CoordinatorResolver};
use crate::upstream::upstream_socket;

/// One client flow: its dedicated upstream socket and the time of the last
/// packet in either direction.
struct Mapping {
    upstream: UdpSocket,
    last_activity: Instant,
}

impl Mapping {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Keyed mapping store, owned exclusively by the UDP tunnel worker.
struct MappingTable {
    entries: HashMap<SocketAddr, Mapping>,
    idle_timeout: Duration,
}

impl MappingTable {
    fn new(idle_timeout: Duration) -> Self {
        MappingTable {
            entries: HashMap::new(),
            idle_timeout,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get_mut(&mut self, client: &SocketAddr) -> Option<&mut Mapping> {
        self.entries.get_mut(client)
    }

    fn remove(&mut self, client: &SocketAddr) {
        self.entries.remove(client);
    }

    /// Returns the mapping for `client`, allocating an upstream socket on
    /// first contact.
    fn get_or_create(
        &mut self,
        client: SocketAddr,
        interface: &str,
    ) -> io::Result<&mut Mapping> {
        use std::collections::hash_map::Entry;

        match self.entries.entry(client) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!("creating mapping for new client {client}");
                let upstream = upstream_socket(interface)?;
                Ok(entry.insert(Mapping {
                    upstream,
                    last_activity: Instant::now(),
                }))
            }
        }
    }

    /// Drops every mapping idle past the threshold, closing its upstream
    /// socket. Collect-then-remove so the scan tolerates deletion.
    fn sweep(&mut self, now: Instant) {
        let expired: Vec<SocketAddr> = self
            .entries
            .iter()
            .filter(|(_, mapping)| now.duration_since(mapping.last_activity) > self.idle_timeout)
            .map(|(client, _)| *client)
            .collect();

        for client in expired {
            debug!(
                "deleting client {client}: over {}s since last data",
                self.idle_timeout.as_secs()
            );
            self.entries.remove(&client);
        }
    }

    /// Resolves with the key of the first upstream socket that has a
    /// datagram pending. Pends forever while the table is empty.
    async fn upstream_readable(&self) -> SocketAddr {
        if self.entries.is_empty() {
            return std::future::pending().await;
        }
        std::future::poll_fn(|cx| {
            for (client, mapping) in &self.entries {
                if mapping.upstream.poll_recv_ready(cx).is_ready() {
                    return Poll::Ready(*client);
                }
            }
            Poll::Pending
        })
        .await
    }
}

pub struct UdpTunnel {
    socket: UdpSocket,
    table: MappingTable,
    resolver: Arc<dyn CoordinatorResolver>,
    config: Config,
    shutdown: watch::Receiver<bool>,
}

impl UdpTunnel {
    pub async fn bind(
        config: Config,
        resolver: Arc<dyn CoordinatorResolver>,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.listen_socket_addr()).await?;
        Ok(UdpTunnel {
            socket,
            table: MappingTable::new(config.idle_timeout),
            resolver,
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs the tunnel until shutdown or a fatal listen-socket error.
    pub async fn run(mut self) -> io::Result<()> {
        enum Event {
            Client(usize, SocketAddr),
            Upstream(SocketAddr),
            Tick,
        }

        let mut buf = vec![0u8; HEADER_LEN + MAX_PAYLOAD];

        loop {
            let event = tokio::select! {
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, from)) => Event::Client(len, from),
                        Err(e) => {
                            error!("UDP listen socket failed: {e}");
                            return Err(e);
                        }
                    }
                }
                client = self.table.upstream_readable() => Event::Upstream(client),
                _ = tokio::time::sleep(self.config.sweep_interval) => Event::Tick,
                _ = self.shutdown.changed() => {
                    info!("UDP tunnel shutting down, dropping {} mappings", self.table.len());
                    return Ok(());
                }
            };

            match event {
                Event::Client(len, from) => {
                    // Mapping state survives bad input; only this datagram
                    // is dropped.
                    self.forward_to_network(&buf[..len], from).await;
                }
                Event::Upstream(client) => self.forward_to_client(client).await?,
                Event::Tick => {}
            }

            self.table.sweep(Instant::now());
        }
    }

    /// Handles one datagram from an IPv4 client: decode, map, resolve,
    /// forward the payload into the device network.
    async fn forward_to_network(&mut self, datagram: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding datagram from {from}: {e}");
                return;
            }
        };

        let mapping = match self.table.get_or_create(from, &self.config.tunnel_interface) {
            Ok(mapping) => mapping,
            Err(e) => {
                error!("could not create IPv6 socket for client {from}: {e}");
                return;
            }
        };
        mapping.touch();

        let dest = match resolve_destination(frame.address, self.resolver.as_ref()) {
            Ok(dest) => dest,
            Err(e) => {
                warn!("dropping datagram from {from}: {e}");
                return;
            }
        };

        debug!(
            "data from client {from}: {} payload bytes for {dest}",
            frame.payload.len()
        );

        let target = SocketAddr::new(IpAddr::V6(dest), self.config.jip_port);
        match mapping.upstream.send_to(&frame.payload, target).await {
            Ok(sent) => debug!("sent {sent} bytes to {target}"),
            // Upstream delivery failures are absorbed, matching UDP
            // end-to-end semantics.
            Err(e) => warn!("upstream send to {target} failed: {e}"),
        }
    }

    /// Handles one datagram pending on a mapping's upstream socket: wrap it
    /// with the sender's address and return it to the IPv4 client.
    async fn forward_to_client(&mut self, client: SocketAddr) -> io::Result<()> {
        let mut buf = [0u8; MAX_PAYLOAD];

        let received = match self.table.get_mut(&client) {
            Some(mapping) => match mapping.upstream.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    mapping.touch();
                    Ok(Some((len, from)))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        };

        let (len, from) = match received {
            Ok(Some(received)) => received,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("dropping mapping for {client} after upstream socket error: {e}");
                self.table.remove(&client);
                return Ok(());
            }
        };

        let IpAddr::V6(sender) = from.ip() else {
            return Ok(());
        };

        debug!("data to client {client}: {len} bytes from {sender}");

        let frame = Frame::new(sender, buf[..len].to_vec());
        if let Err(e) = self.socket.send_to(&frame.encode(), client).await {
            error!("UDP listen socket send failed: {e}");
            return Err(e);
        }
        Ok(())
    }
}
