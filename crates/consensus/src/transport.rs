//! Peer transport - one message per TCP connection
//!
//! Every node listens for inbound updates and fans its own updates out to
//! a fixed, explicitly managed peer set. Inbound messages are decoded by a
//! per-connection task and published on a bounded channel (the `Inbox`).

use crate::error::{ConsensusError, Result};
use crate::types::{NodeConfig, Peer, WireMessage};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// A decoded message and the remote socket it came from
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: SocketAddr,
    pub message: WireMessage,
}

/// Receiving side of the transport
pub type Inbox = mpsc::Receiver<InboundMessage>;

/// Result of one fan-out
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub send_failures: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub dropped_messages: u64,
}

/// Point-to-point transport for consensus updates
pub struct PeerTransport {
    /// Configured listen address
    listen_addr: SocketAddr,
    /// Address actually bound, once started
    local_addr: RwLock<Option<SocketAddr>>,
    /// Known peers
    peers: Arc<RwLock<HashMap<SocketAddr, Peer>>>,
    /// Inbound message publisher
    inbox_tx: mpsc::Sender<InboundMessage>,
    /// Shutdown signal for the accept loop
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<TransportStats>>,
    io_timeout: Duration,
    max_message_bytes: usize,
}

impl PeerTransport {
    /// Create a transport and the inbox it publishes to
    pub fn new(config: &NodeConfig) -> (Self, Inbox) {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let transport = Self {
            listen_addr: config.listen_addr,
            local_addr: RwLock::new(None),
            peers: Arc::new(RwLock::new(HashMap::new())),
            inbox_tx,
            shutdown,
            accept_task: Mutex::new(None),
            stats: Arc::new(RwLock::new(TransportStats::default())),
            io_timeout: config.io_timeout(),
            max_message_bytes: config.max_message_bytes,
        };
        (transport, inbox_rx)
    }

    /// Bind and start accepting connections. Returns the bound address.
    ///
    /// Failure to bind is the one unrecoverable error in this crate and is
    /// returned immediately.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            if self.accept_task.lock().is_some() {
                return Ok(addr);
            }
        }

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| ConsensusError::Bind {
                addr: self.listen_addr,
                source,
            })?;
        let local = listener.local_addr().map_err(|source| ConsensusError::Bind {
            addr: self.listen_addr,
            source,
        })?;
        *self.local_addr.write() = Some(local);
        tracing::info!("Peer transport listening on {}", local);

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let inbox_tx = self.inbox_tx.clone();
        let peers = self.peers.clone();
        let stats = self.stats.clone();
        let io_timeout = self.io_timeout;
        let max_message_bytes = self.max_message_bytes;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                tracing::trace!("Connection from {}", remote);
                                let inbox_tx = inbox_tx.clone();
                                let peers = peers.clone();
                                let stats = stats.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream,
                                        remote,
                                        inbox_tx,
                                        peers,
                                        stats.clone(),
                                        io_timeout,
                                        max_message_bytes,
                                    )
                                    .await
                                    {
                                        if matches!(e, ConsensusError::MalformedMessage(_)) {
                                            stats.write().malformed_messages += 1;
                                        }
                                        tracing::warn!("Dropped message from {}: {}", remote, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::info!("Peer transport on {} stopped accepting", local);
        });

        *self.accept_task.lock() = Some(handle);
        Ok(local)
    }

    /// Stop accepting and release the listening endpoint.
    ///
    /// Connections already accepted are allowed to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.accept_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.lock().is_some()
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Resolve `host:port` and add it to the peer set
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<bool> {
        let resolution_error = |reason: String| ConsensusError::AddressResolution {
            host: host.to_string(),
            port,
            reason,
        };
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| resolution_error(e.to_string()))?
            .next()
            .ok_or_else(|| resolution_error("no addresses".to_string()))?;
        self.add_peer(addr)
    }

    /// Add a peer. Idempotent; returns whether the set changed.
    pub fn add_peer(&self, addr: SocketAddr) -> Result<bool> {
        if self.is_self(addr) {
            return Err(ConsensusError::SelfPeer(addr));
        }
        let mut peers = self.peers.write();
        if peers.contains_key(&addr) {
            return Ok(false);
        }
        peers.insert(addr, Peer::new(addr));
        tracing::info!("Added peer {}", addr);
        Ok(true)
    }

    /// Remove a peer. Peers are never dropped automatically.
    pub fn remove_peer(&self, addr: &SocketAddr) -> bool {
        let removed = self.peers.write().remove(addr).is_some();
        if removed {
            tracing::info!("Removed peer {}", addr);
        }
        removed
    }

    /// Snapshot of the peer set, ordered by address
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.address);
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }

    /// Send one message to one address
    pub async fn send_to_peer(&self, addr: SocketAddr, message: &WireMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        let result = send_bytes(addr, &bytes, self.io_timeout).await;
        self.record_send(addr, &result);
        result
    }

    /// Best-effort fan-out to every known peer.
    ///
    /// Peers are contacted concurrently, each bounded by the I/O timeout.
    /// Unreachable peers are logged and skipped.
    pub async fn broadcast(&self, message: &WireMessage) -> Result<BroadcastReport> {
        let bytes = message.to_bytes()?;
        // Snapshot so no lock is held across I/O
        let targets: Vec<SocketAddr> = self.peers.read().keys().copied().collect();

        let results = join_all(
            targets
                .iter()
                .map(|addr| send_bytes(*addr, &bytes, self.io_timeout)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (addr, result) in targets.into_iter().zip(results) {
            self.record_send(addr, &result);
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!("{}", e);
                    report.failed.push(addr);
                }
            }
        }

        tracing::debug!(
            "Broadcast round {} to {} peers ({} failed)",
            message.round_id(),
            report.delivered,
            report.failed.len()
        );
        Ok(report)
    }

    fn record_send(&self, addr: SocketAddr, result: &Result<()>) {
        if result.is_ok() {
            self.stats.write().messages_sent += 1;
            if let Some(peer) = self.peers.write().get_mut(&addr) {
                peer.last_contact = Some(Utc::now());
            }
        } else {
            self.stats.write().send_failures += 1;
        }
    }

    fn is_self(&self, addr: SocketAddr) -> bool {
        let own = [Some(self.listen_addr), self.local_addr()];
        own.iter().flatten().any(|own| {
            if *own == addr {
                return true;
            }
            // Wildcard listener: any loopback or wildcard address on our port
            own.ip().is_unspecified()
                && own.port() == addr.port()
                && (addr.ip().is_loopback() || addr.ip().is_unspecified())
        })
    }
}

/// Connect, write, close. The whole exchange is bounded by `io_timeout`.
async fn send_bytes(addr: SocketAddr, bytes: &[u8], io_timeout: Duration) -> Result<()> {
    let unreachable = |reason: String| ConsensusError::NetworkUnreachable { peer: addr, reason };

    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(bytes).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    match timeout(io_timeout, exchange).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(unreachable(e.to_string())),
        Err(_) => Err(unreachable(format!("timed out after {:?}", io_timeout))),
    }
}

/// Read one message to EOF, decode it, publish it
async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    inbox_tx: mpsc::Sender<InboundMessage>,
    peers: Arc<RwLock<HashMap<SocketAddr, Peer>>>,
    stats: Arc<RwLock<TransportStats>>,
    io_timeout: Duration,
    max_message_bytes: usize,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut limited = stream.take(max_message_bytes as u64 + 1);
    match timeout(io_timeout, limited.read_to_end(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            return Err(ConsensusError::MalformedMessage(format!("read failed: {}", e)));
        }
        Err(_) => {
            return Err(ConsensusError::MalformedMessage(format!(
                "read timed out after {:?}",
                io_timeout
            )));
        }
    }
    if buf.len() > max_message_bytes {
        return Err(ConsensusError::MalformedMessage(format!(
            "message exceeds {} bytes",
            max_message_bytes
        )));
    }

    let message = WireMessage::from_bytes(&buf)?;
    stats.write().messages_received += 1;

    let WireMessage::AdmmUpdate(ref update) = message;
    if let Some(addr) = update.listen_addr {
        if let Some(peer) = peers.write().get_mut(&addr) {
            peer.last_contact = Some(Utc::now());
        }
    }

    match inbox_tx.try_send(InboundMessage { from: remote, message }) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            stats.write().dropped_messages += 1;
            tracing::warn!("Inbox full, dropping message from {}", remote);
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!("Inbox closed, dropping message from {}", remote);
            Ok(())
        }
    }
}
