//! Node-to-node transport: TCP server (incoming), TCP client (outbound), hello exchange, then
//! length-prefixed envelope frames in both directions. Peers are addressed by node name.
//! Envelope handling does file and audio-device work, so it runs on the blocking pool.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use murmur_core::wire::{self, FrameDecodeError};
use murmur_core::{Envelope, Hello, Outbound, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::node::Node;

const LEN_SIZE: usize = 4;

/// Per-peer outbound queues. Shared with the audio capture path.
pub type PeerSenders = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>;

pub struct Transport {
    node: Arc<Node>,
    name: String,
    peers: PeerSenders,
    writers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Transport {
    pub fn new(node: Arc<Node>, name: String, peers: PeerSenders) -> Arc<Self> {
        Arc::new(Self {
            node,
            name,
            peers,
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Accept incoming connections on `port` until the listener fails.
    pub async fn listen(self: Arc<Self>, port: u16) -> io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, name = %self.name, "listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                match this.hello(stream).await {
                    Ok((peer, stream)) => this.run_connection(stream, peer).await,
                    Err(e) => warn!(%addr, error = %e, "hello failed"),
                }
            });
        }
    }

    /// Connect to `addr`, exchange hellos and start serving the connection.
    /// Returns the peer's node name once it is ready for envelopes.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> io::Result<String> {
        let stream = TcpStream::connect(addr).await?;
        let (peer, stream) = self.hello(stream).await?;
        let (reader, tx) = self.register(stream, &peer).await;
        let this = self.clone();
        let name = peer.clone();
        tokio::spawn(async move { this.read_loop(reader, tx, name).await });
        debug!(%addr, peer = %peer, "connected");
        Ok(peer)
    }

    async fn hello(&self, mut stream: TcpStream) -> io::Result<(String, TcpStream)> {
        write_frame(&mut stream, &Hello::new(self.name.clone())).await?;
        let theirs: Hello = read_frame(&mut stream).await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before hello")
        })?;
        if theirs.protocol_version != PROTOCOL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported protocol version {}", theirs.protocol_version),
            ));
        }
        Ok((theirs.node_name, stream))
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, peer: String) {
        let (reader, tx) = self.register(stream, &peer).await;
        self.read_loop(reader, tx, peer).await;
    }

    /// Install the writer side of a connection. Returns the read half and the queue registered
    /// for it.
    async fn register(
        &self,
        stream: TcpStream,
        peer: &str,
    ) -> (OwnedReadHalf, mpsc::UnboundedSender<Envelope>) {
        let (reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let writer_peer = peer.to_string();
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &envelope).await {
                    warn!(peer = %writer_peer, error = %e, "write failed, dropping connection");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
        if self
            .peers
            .lock()
            .await
            .insert(peer.to_string(), tx.clone())
            .is_some()
        {
            info!(peer, "replacing existing connection");
        }
        self.writers.lock().await.insert(peer.to_string(), handle);
        info!(peer, "peer connected");
        (reader, tx)
    }

    async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        tx: mpsc::UnboundedSender<Envelope>,
        peer: String,
    ) {
        loop {
            let envelope: Envelope = match read_frame(&mut reader).await {
                Ok(Some(env)) => env,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "read failed");
                    break;
                }
            };
            let node = self.node.clone();
            let from = peer.clone();
            let outbound =
                match tokio::task::spawn_blocking(move || node.on_envelope(&from, envelope)).await {
                    Ok(outbound) => outbound,
                    Err(e) => {
                        error!(peer = %peer, error = %e, "envelope handler failed");
                        break;
                    }
                };
            self.deliver(outbound).await;
        }
        if !self.release(&peer, &tx).await {
            debug!(peer = %peer, "superseded connection closed");
            return;
        }
        let node = self.node.clone();
        let lost = peer.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || node.on_peer_lost(&lost)).await {
            error!(peer = %peer, error = %e, "peer cleanup failed");
        }
        info!(peer = %peer, "peer disconnected");
    }

    /// Drop the routing entry of a closed connection. Returns false, touching nothing, when a
    /// reconnect from the same peer has already replaced `tx`.
    async fn release(&self, peer: &str, tx: &mpsc::UnboundedSender<Envelope>) -> bool {
        {
            let mut peers = self.peers.lock().await;
            if peers
                .get(peer)
                .is_some_and(|current| !current.same_channel(tx))
            {
                return false;
            }
            peers.remove(peer);
        }
        self.writers.lock().await.remove(peer);
        true
    }

    /// Queue envelopes for their peers. Envelopes for unknown peers are dropped.
    pub async fn deliver(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let peers = self.peers.lock().await;
        for out in outbound {
            match peers.get(&out.to) {
                Some(tx) => {
                    let _ = tx.send(out.envelope);
                }
                None => warn!(peer = %out.to, kind = out.envelope.kind(), "no connection to peer"),
            }
        }
    }

    /// Flush everything queued for `peer` and close the connection.
    pub async fn disconnect(&self, peer: &str) {
        self.peers.lock().await.remove(peer);
        let handle = self.writers.lock().await.remove(peer);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn write_frame<W, T>(writer: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame =
        wire::encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` on a clean close between frames.
async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; LEN_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = wire::frame_len(header).map_err(invalid)?;
    let mut frame = vec![0u8; LEN_SIZE + len];
    frame[..LEN_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[LEN_SIZE..]).await?;
    let (msg, _) = wire::decode_frame(&frame).map_err(invalid)?;
    Ok(Some(msg))
}

fn invalid(e: FrameDecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
