//! # Link Layer
//!
//! Framed message transport between routers over QUIC.
//!
//! The core consumes a narrow seam, [`LinkSender`]: fire-and-forget frame
//! sends addressed by router id, a connection-persistence hint, and a
//! drop-on-protocol-error hammer. Inbound frames arrive on an mpsc channel
//! as `(source rid, source addr, frame)` and are consumed by the router's
//! event loop; the link never touches loop state directly.
//!
//! ## QUIC implementation
//!
//! [`QuicLink`] follows the actor pattern: a public handle posts commands
//! to a private actor owning the connection cache. Connections use mutual
//! TLS with self-signed Ed25519 certificates (see `crypto`); each frame
//! travels on its own unidirectional stream, FIN-delimited, bincode
//! encoded under [`messages::MAX_FRAME_SIZE`]. A peer that sends an
//! undecodable frame gets its connection closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use anyhow::{Context, Result};
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::crypto::{
    create_client_config, create_server_config, extract_verified_router_id, generate_link_cert,
    router_id_to_sni,
};
use crate::identity::{Keypair, RouterId};
use crate::messages::{self, LinkFrame};

/// Cached connections kept per link.
const MAX_CACHED_CONNECTIONS: usize = 256;

/// Connections idle longer than this are eligible for cleanup, unless a
/// persist deadline is still in the future.
const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval for the connection cleanup sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound frame channel depth.
const INBOUND_CHANNEL_SIZE: usize = 1024;

/// Sending side of the link as seen by the core.
///
/// Sends are fire-and-forget: delivery failures surface as missing replies
/// and are handled by transaction timeouts, never by the caller blocking.
pub trait LinkSender: Send + Sync {
    /// Queue a frame to `to`. Dropped with a log line if the peer has no
    /// known address and no live connection.
    fn send(&self, to: RouterId, frame: LinkFrame);

    /// Bias the connection to `to` against closure until `deadline`.
    fn persist_until(&self, to: RouterId, deadline: Instant);

    /// Teach the link how to dial a router.
    fn add_address(&self, to: RouterId, addr: SocketAddr);

    /// Drop the peer's connection (protocol error).
    fn drop_peer(&self, to: RouterId);
}

/// One inbound frame with its authenticated source.
#[derive(Debug)]
pub struct InboundFrame {
    pub from: RouterId,
    pub remote_addr: SocketAddr,
    pub frame: LinkFrame,
}

enum LinkCommand {
    Send { to: RouterId, frame: LinkFrame },
    AddAddress { to: RouterId, addr: SocketAddr },
    PersistUntil { to: RouterId, deadline: Instant },
    DropPeer { to: RouterId },
}

/// Public handle; cheap to clone.
#[derive(Clone)]
pub struct QuicLink {
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    local_addr: SocketAddr,
}

impl QuicLink {
    /// Bind the endpoint and start the actor and accept loop. Returns the
    /// handle and the inbound frame channel for the event loop.
    pub fn spawn(
        keypair: &Keypair,
        bind: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<InboundFrame>)> {
        let (certs, key) = generate_link_cert(keypair)?;
        let server_config = create_server_config(certs.clone(), key.clone_key())?;
        let client_config = create_client_config(certs, key)?;

        let endpoint = Endpoint::server(server_config, bind)
            .with_context(|| format!("failed to bind link endpoint on {bind}"))?;
        let local_addr = endpoint.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let actor = QuicLinkActor {
            endpoint: endpoint.clone(),
            client_config,
            connections: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("cache capacity is non-zero"),
            ),
            addresses: HashMap::new(),
            persist: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        tokio::spawn(accept_loop(endpoint, inbound_tx));

        Ok((Self { cmd_tx, local_addr }, inbound_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl LinkSender for QuicLink {
    fn send(&self, to: RouterId, frame: LinkFrame) {
        let _ = self.cmd_tx.send(LinkCommand::Send { to, frame });
    }

    fn persist_until(&self, to: RouterId, deadline: Instant) {
        let _ = self.cmd_tx.send(LinkCommand::PersistUntil { to, deadline });
    }

    fn add_address(&self, to: RouterId, addr: SocketAddr) {
        let _ = self.cmd_tx.send(LinkCommand::AddAddress { to, addr });
    }

    fn drop_peer(&self, to: RouterId) {
        let _ = self.cmd_tx.send(LinkCommand::DropPeer { to });
    }
}

struct CachedConnection {
    connection: Connection,
    last_success: Instant,
}

impl CachedConnection {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            last_success: Instant::now(),
        }
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn is_stale(&self) -> bool {
        self.last_success.elapsed() > CONNECTION_STALE_TIMEOUT
    }

    fn mark_success(&mut self) {
        self.last_success = Instant::now();
    }
}

struct QuicLinkActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connections: LruCache<RouterId, CachedConnection>,
    addresses: HashMap<RouterId, SocketAddr>,
    /// Connections biased against closure until the stored deadline.
    persist: HashMap<RouterId, Instant>,
}

impl QuicLinkActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Send { to, frame }) => self.send_frame(to, frame).await,
                        Some(LinkCommand::AddAddress { to, addr }) => {
                            self.addresses.insert(to, addr);
                        }
                        Some(LinkCommand::PersistUntil { to, deadline }) => {
                            let entry = self.persist.entry(to).or_insert(deadline);
                            if deadline > *entry {
                                *entry = deadline;
                            }
                        }
                        Some(LinkCommand::DropPeer { to }) => {
                            if let Some(cached) = self.connections.pop(&to) {
                                cached.connection.close(1u32.into(), b"protocol error");
                                debug!(peer = %to, "dropped peer connection");
                            }
                        }
                        None => break,
                    }
                }
                _ = cleanup.tick() => self.cleanup_stale_connections(),
            }
        }
    }

    fn cleanup_stale_connections(&mut self) {
        let now = Instant::now();
        self.persist.retain(|_, deadline| *deadline > now);
        let stale: Vec<RouterId> = self
            .connections
            .iter()
            .filter(|(rid, cached)| {
                cached.is_closed() || (cached.is_stale() && !self.persist.contains_key(rid))
            })
            .map(|(rid, _)| *rid)
            .collect();
        for rid in stale {
            self.connections.pop(&rid);
            trace!(peer = %rid, "cleaned up stale link connection");
        }
    }

    async fn send_frame(&mut self, to: RouterId, frame: LinkFrame) {
        let conn = match self.get_or_connect(to).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(peer = %to, error = %err, "link send dropped: no connection");
                return;
            }
        };
        let bytes = match messages::encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame");
                return;
            }
        };
        if let Some(cached) = self.connections.get_mut(&to) {
            cached.mark_success();
        }
        // One uni stream per frame; FIN delimits. Spawned so a slow peer
        // never stalls the actor.
        let peer = to;
        tokio::spawn(async move {
            let result = async {
                let mut stream = conn.open_uni().await?;
                stream.write_all(&bytes).await?;
                stream.finish()?;
                Ok::<_, anyhow::Error>(())
            }
            .await;
            if let Err(err) = result {
                trace!(peer = %peer, error = %err, "frame send failed");
            }
        });
    }

    async fn get_or_connect(&mut self, to: RouterId) -> Result<Connection> {
        if let Some(cached) = self.connections.get(&to) {
            if !cached.is_closed() {
                return Ok(cached.connection.clone());
            }
            self.connections.pop(&to);
        }

        let addr = *self
            .addresses
            .get(&to)
            .context("no known address for peer")?;
        let sni = router_id_to_sni(&to);
        let conn = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)
            .with_context(|| format!("failed to initiate connection to {addr}"))?
            .await
            .with_context(|| format!("failed to establish connection to {addr}"))?;

        self.connections.put(to, CachedConnection::new(conn.clone()));
        Ok(conn)
    }
}

/// Accept inbound connections, authenticate the peer identity from its
/// certificate and pump frames into the event loop.
async fn accept_loop(endpoint: Endpoint, inbound_tx: mpsc::Sender<InboundFrame>) {
    while let Some(incoming) = endpoint.accept().await {
        let inbound_tx = inbound_tx.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(err) => {
                    trace!(error = %err, "inbound handshake failed");
                    return;
                }
            };
            let Some(from) = extract_verified_router_id(&conn) else {
                debug!("inbound connection without a valid router identity, closing");
                conn.close(2u32.into(), b"no identity");
                return;
            };
            let remote_addr = conn.remote_address();
            loop {
                let mut stream = match conn.accept_uni().await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let bytes = match stream
                    .read_to_end(messages::MAX_FRAME_SIZE + 4096)
                    .await
                {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        trace!(peer = %from, error = %err, "frame read failed");
                        continue;
                    }
                };
                match messages::decode_frame(&bytes) {
                    Ok(frame) => {
                        if inbound_tx
                            .send(InboundFrame {
                                from,
                                remote_addr,
                                frame,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        // Framing errors cost the peer its connection.
                        debug!(peer = %from, error = %err, "undecodable frame, dropping connection");
                        conn.close(1u32.into(), b"protocol error");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory link double: records everything the core tries to send.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingLink {
        sent: Mutex<Vec<(RouterId, LinkFrame)>>,
        persisted: Mutex<Vec<(RouterId, Instant)>>,
        dropped: Mutex<Vec<RouterId>>,
    }

    impl RecordingLink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<(RouterId, LinkFrame)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_to(&self, rid: &RouterId) -> Vec<LinkFrame> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to == rid)
                .map(|(_, frame)| frame.clone())
                .collect()
        }

        pub fn persisted(&self) -> Vec<(RouterId, Instant)> {
            self.persisted.lock().unwrap().clone()
        }

        pub fn dropped(&self) -> Vec<RouterId> {
            self.dropped.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.sent.lock().unwrap().clear();
            self.persisted.lock().unwrap().clear();
            self.dropped.lock().unwrap().clear();
        }
    }

    impl LinkSender for RecordingLink {
        fn send(&self, to: RouterId, frame: LinkFrame) {
            self.sent.lock().unwrap().push((to, frame));
        }

        fn persist_until(&self, to: RouterId, deadline: Instant) {
            self.persisted.lock().unwrap().push((to, deadline));
        }

        fn add_address(&self, _to: RouterId, _addr: SocketAddr) {}

        fn drop_peer(&self, to: RouterId) {
            self.dropped.lock().unwrap().push(to);
        }
    }
}
