//! File server: stores writes locally, replicates them to every peer, and fetches
//! local misses from whichever peer streams the file first.
//!
//! Store: local write, `StoreFile` broadcast, settling delay, then one `Stream`
//! frame carrying the whole file to each peer. Get: local hit, or `GetFile`
//! broadcast, settling delay, then a race among peers for a sized stream.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::peer::{Peer, PeerStream};
use crate::protocol::Envelope;
use crate::registry::PeerRegistry;
use crate::store::{plain_path_transform, PathTransformFunc, Store, StoreOpts, DEFAULT_ROOT};
use crate::transport::{PeerHandler, Rpc, Transport, TransportError};
use crate::wire;

/// Namespace used when no node id is configured.
pub const DEFAULT_NAMESPACE: &str = "1234";
pub const DEFAULT_STORE_SETTLE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_GET_SETTLE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
const PEER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct FileServerOpts {
    /// Node identity; every key this node writes lives under it. Empty means default.
    pub id: String,
    pub storage_root: PathBuf,
    pub path_transform: PathTransformFunc,
    /// Addresses dialed on start. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
    /// Wait between the `StoreFile` broadcast and streaming the bytes.
    pub store_settle_delay: Duration,
    /// Wait between the `GetFile` broadcast and reading responses.
    pub get_settle_delay: Duration,
    /// Upper bound on waiting for, and reading, any single inbound stream.
    pub stream_timeout: Duration,
}

impl Default for FileServerOpts {
    fn default() -> Self {
        Self {
            id: DEFAULT_NAMESPACE.to_string(),
            storage_root: PathBuf::from(DEFAULT_ROOT),
            path_transform: plain_path_transform,
            bootstrap_nodes: Vec::new(),
            store_settle_delay: DEFAULT_STORE_SETTLE_DELAY,
            get_settle_delay: DEFAULT_GET_SETTLE_DELAY,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Running,
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Idle => "idle",
            ServerState::Listening => "listening",
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
        }
    }
}

pub struct FileServer<T: Transport> {
    namespace: String,
    opts: FileServerOpts,
    store: Store,
    transport: Arc<T>,
    peers: Arc<PeerRegistry>,
    state: Mutex<ServerState>,
    quit_tx: Mutex<Option<oneshot::Sender<()>>>,
    quit_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

fn lock<U>(m: &Mutex<U>) -> MutexGuard<'_, U> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Transport> FileServer<T> {
    pub fn new(opts: FileServerOpts, transport: T) -> Self {
        let namespace = if opts.id.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            opts.id.clone()
        };
        let store = Store::new(StoreOpts {
            root: opts.storage_root.clone(),
            path_transform: opts.path_transform,
        });
        let (quit_tx, quit_rx) = oneshot::channel();
        Self {
            namespace,
            opts,
            store,
            transport: Arc::new(transport),
            peers: Arc::new(PeerRegistry::new()),
            state: Mutex::new(ServerState::Idle),
            quit_tx: Mutex::new(Some(quit_tx)),
            quit_rx: Mutex::new(Some(quit_rx)),
        }
    }

    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The local content store backing this node.
    pub fn content_store(&self) -> &Store {
        &self.store
    }

    /// Whether this node holds `key` locally.
    pub async fn has(&self, key: &str) -> bool {
        self.store.has(&self.namespace, key).await
    }

    fn transition(&self, from: ServerState, to: ServerState) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(Error::InvalidState {
                expected: from.as_str(),
                actual: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Listen, dial bootstrap nodes in the background, then run the control loop
    /// until [`stop`](Self::stop). Only a listener failure is returned as an error.
    pub async fn start(&self) -> Result<()> {
        self.transition(ServerState::Idle, ServerState::Listening)?;
        let handler: Arc<dyn PeerHandler> = self.peers.clone();
        if let Err(e) = self.transport.listen_and_accept(handler).await {
            error!(addr = %self.addr(), error = %e, "failed to listen");
            *lock(&self.state) = ServerState::Stopped;
            return Err(e.into());
        }
        let (rpcs, quit) = match (self.transport.consume(), lock(&self.quit_rx).take()) {
            (Some(rpcs), Some(quit)) => (rpcs, quit),
            _ => {
                *lock(&self.state) = ServerState::Stopped;
                return Err(TransportError::AlreadyConsumed.into());
            }
        };
        self.bootstrap_network();
        self.transition(ServerState::Listening, ServerState::Running)?;
        info!(addr = %self.addr(), namespace = %self.namespace, "file server running");
        self.run_loop(rpcs, quit).await;
        Ok(())
    }

    /// Signal the control loop to exit. The transport is closed on the way out.
    pub fn stop(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, ServerState::Listening | ServerState::Running) {
            return Err(Error::InvalidState {
                expected: ServerState::Running.as_str(),
                actual: state.as_str(),
            });
        }
        match lock(&self.quit_tx).take() {
            Some(tx) => {
                let _ = tx.send(());
                Ok(())
            }
            None => Err(Error::InvalidState {
                expected: ServerState::Running.as_str(),
                actual: ServerState::Stopped.as_str(),
            }),
        }
    }

    fn bootstrap_network(&self) {
        for addr in self.opts.bootstrap_nodes.iter().filter(|a| !a.is_empty()) {
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                info!(remote = %addr, "attempting to connect with remote");
                if let Err(e) = transport.dial(&addr).await {
                    error!(remote = %addr, error = %e, "error bootstrapping network");
                }
            });
        }
    }

    async fn run_loop(&self, mut rpcs: mpsc::Receiver<Rpc>, mut quit: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                rpc = rpcs.recv() => match rpc {
                    Some(rpc) => self.handle_rpc(rpc).await,
                    None => {
                        warn!(addr = %self.addr(), "control channel closed");
                        break;
                    }
                },
                _ = &mut quit => {
                    info!(addr = %self.addr(), "user quit action");
                    break;
                }
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "failed to close transport");
        }
        // Read loops are gone, but the write halves live on in the registry.
        // Shut them down so remotes see the disconnect.
        for peer in self.peers.drain() {
            match tokio::time::timeout(PEER_SHUTDOWN_TIMEOUT, peer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(peer = %peer.remote_addr(), error = %e, "peer shutdown failed"),
                Err(_) => warn!(peer = %peer.remote_addr(), "peer shutdown timed out"),
            }
        }
        *lock(&self.state) = ServerState::Stopped;
        info!(addr = %self.addr(), "file server stopped");
    }

    async fn handle_rpc(&self, rpc: Rpc) {
        let msg = match wire::decode_envelope(&rpc.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %rpc.from, error = %e, "decoding error, message dropped");
                return;
            }
        };
        if let Err(e) = self.handle_message(&rpc.from, msg).await {
            error!(peer = %rpc.from, error = %e, "failed to handle message");
        }
    }

    async fn handle_message(&self, from: &str, msg: Envelope) -> Result<()> {
        match msg {
            Envelope::StoreFile {
                namespace,
                key,
                size,
            } => {
                info!(peer = %from, %namespace, %key, size, "received key for storing");
                self.handle_store_file(from, &namespace, &key, size).await
            }
            Envelope::GetFile { namespace, key } => {
                self.handle_get_file(from, &namespace, &key).await
            }
        }
    }

    /// Read exactly `size` bytes of the sender's next stream into the store.
    async fn handle_store_file(&self, from: &str, namespace: &str, key: &str, size: u64) -> Result<()> {
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| Error::PeerNotFound(from.to_string()))?;
        let timeout = self.opts.stream_timeout;
        if let Err(e) = self.store.check(namespace, key) {
            // The bytes are on the wire regardless; skip them to stay in sync.
            let discard = async {
                let mut stream = open_stream(&peer).await?;
                let n = tokio::io::copy(&mut (&mut stream).take(size), &mut tokio::io::sink())
                    .await
                    .map_err(|source| Error::PeerStream {
                        addr: from.to_string(),
                        source,
                    })?;
                if n == size {
                    stream.close_stream();
                }
                Ok::<_, Error>(())
            };
            if tokio::time::timeout(timeout, discard).await.is_err() {
                warn!(peer = %from, "timed out discarding rejected stream");
            }
            return Err(e.into());
        }
        let copy = async {
            let mut stream = open_stream(&peer).await?;
            let n = self
                .store
                .write(namespace, key, &mut (&mut stream).take(size))
                .await?;
            Ok::<_, Error>((stream, n))
        };
        let result = match tokio::time::timeout(timeout, copy).await {
            Ok(r) => r,
            Err(_) => Err(Error::StreamTimeout {
                addr: from.to_string(),
                timeout,
            }),
        };
        let (stream, n) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = self.store.delete(namespace, key).await;
                return Err(e);
            }
        };
        if n != size {
            drop(stream);
            let _ = self.store.delete(namespace, key).await;
            return Err(Error::ShortStream {
                addr: from.to_string(),
                expected: size,
                got: n,
            });
        }
        stream.close_stream();
        info!(addr = %self.addr(), peer = %from, %key, bytes = n, "written bytes to disk");
        Ok(())
    }

    /// Answer with `Stream | u64 size | bytes`, or send nothing if the file is absent.
    async fn handle_get_file(&self, from: &str, namespace: &str, key: &str) -> Result<()> {
        if !self.store.has(namespace, key).await {
            return Err(Error::FileNotServed {
                key: key.to_string(),
            });
        }
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| Error::PeerNotFound(from.to_string()))?;
        info!(addr = %self.addr(), peer = %from, %key, "serving file over the network");

        let (size, file) = self.store.read(namespace, key).await?;
        let n = peer
            .send_stream(&wire::sized_stream_header(size), &mut file.take(size))
            .await
            .map_err(|source| Error::PeerSend {
                addr: from.to_string(),
                source,
            })?;
        info!(addr = %self.addr(), peer = %from, bytes = n, "written bytes over the network");
        Ok(())
    }

    /// Send `msg` as a control frame to every registered peer.
    pub async fn broadcast(&self, msg: &Envelope) -> Result<()> {
        let peers = self.peers.snapshot();
        self.broadcast_to(&peers, msg).await
    }

    /// Encode once, write to each peer in order. The first failed write aborts the rest.
    async fn broadcast_to(&self, peers: &[Arc<Peer>], msg: &Envelope) -> Result<()> {
        let body = wire::encode_envelope(msg)?;
        let frame = wire::control_frame(&body);
        for peer in peers {
            if let Err(source) = peer.send(&frame).await {
                error!(peer = %peer.remote_addr(), error = %source, "broadcast failed");
                return Err(Error::PeerSend {
                    addr: peer.remote_addr().to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Persist `reader` locally, then replicate it to every peer. Returns the stored size.
    ///
    /// Local durability comes first: with no peers this is a plain local write.
    /// A failed peer write is returned but nothing is rolled back.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.map_err(Error::Input)?;
        let size = self
            .store
            .write(&self.namespace, key, &mut buf.as_slice())
            .await?;

        // One snapshot for both phases: a peer that joins mid-store gets neither.
        let peers = self.peers.snapshot();
        if peers.is_empty() {
            info!(addr = %self.addr(), %key, size, "stored locally, no peers to replicate to");
            return Ok(size);
        }
        let msg = Envelope::StoreFile {
            namespace: self.namespace.clone(),
            key: key.to_string(),
            size,
        };
        self.broadcast_to(&peers, &msg).await?;
        tokio::time::sleep(self.opts.store_settle_delay).await;

        let header = wire::stream_header();
        for peer in &peers {
            if let Err(source) = peer.send_stream(&header, &mut buf.as_slice()).await {
                error!(peer = %peer.remote_addr(), error = %source, "failed to stream data");
                return Err(Error::PeerSend {
                    addr: peer.remote_addr().to_string(),
                    source,
                });
            }
        }
        info!(addr = %self.addr(), %key, size, peers = peers.len(), "stored and replicated");
        Ok(size)
    }

    /// Read `key`, fetching and caching it from the network on a local miss.
    /// Returns the size and a reader over the local copy.
    pub async fn get(&self, key: &str) -> Result<(u64, File)> {
        if self.store.has(&self.namespace, key).await {
            info!(addr = %self.addr(), %key, "serving file from local disk");
            return Ok(self.store.read(&self.namespace, key).await?);
        }
        info!(addr = %self.addr(), %key, "file not held locally, fetching from network");

        let peers = self.peers.snapshot();
        if !peers.is_empty() {
            let msg = Envelope::GetFile {
                namespace: self.namespace.clone(),
                key: key.to_string(),
            };
            self.broadcast_to(&peers, &msg).await?;
            tokio::time::sleep(self.opts.get_settle_delay).await;
            self.fetch_first(&peers, key).await;
        }

        match self.store.read(&self.namespace, key).await {
            Ok(r) => Ok(r),
            Err(e) => {
                error!(addr = %self.addr(), %key, error = %e, "cannot read from the store");
                Err(e.into())
            }
        }
    }

    /// Race one fetch per peer; the first complete stream is written to the store.
    ///
    /// Returning drops the result receiver, which cancels every fetch still waiting
    /// for a stream. A fetch already mid-stream drains it so the connection stays
    /// in sync.
    async fn fetch_first(&self, peers: &[Arc<Peer>], key: &str) {
        let (result_tx, mut result_rx) = mpsc::channel(peers.len());
        for peer in peers {
            let peer = peer.clone();
            let result_tx = result_tx.clone();
            let timeout = self.opts.stream_timeout;
            tokio::spawn(async move {
                let res = fetch_from(&peer, timeout, result_tx.closed()).await;
                if let Some(res) = res.transpose() {
                    let _ = result_tx.send((peer.remote_addr().to_string(), res)).await;
                }
            });
        }
        drop(result_tx);

        while let Some((addr, res)) = result_rx.recv().await {
            match res {
                Ok(bytes) => {
                    match self
                        .store
                        .write(&self.namespace, key, &mut bytes.as_slice())
                        .await
                    {
                        Ok(n) => info!(
                            addr = %self.addr(),
                            peer = %addr,
                            bytes = n,
                            "received bytes over the network"
                        ),
                        Err(e) => error!(
                            peer = %addr,
                            error = %e,
                            "unable to write the data fetched over the network"
                        ),
                    }
                    return;
                }
                Err(e) => debug!(peer = %addr, error = %e, "fetch attempt failed"),
            }
        }
        warn!(addr = %self.addr(), %key, "no peer served the file");
    }
}

async fn open_stream(peer: &Peer) -> Result<PeerStream> {
    peer.open_stream().await.map_err(|source| Error::PeerStream {
        addr: peer.remote_addr().to_string(),
        source,
    })
}

/// Wait for one sized stream from `peer` and read it fully. Resolves to `None`
/// if `cancelled` fires before the stream starts.
async fn fetch_from<C>(peer: &Peer, timeout: Duration, cancelled: C) -> Result<Option<Vec<u8>>>
where
    C: Future<Output = ()>,
{
    let addr = peer.remote_addr();
    let stream_err = |source: std::io::Error| Error::PeerStream {
        addr: addr.to_string(),
        source,
    };
    let read = async {
        // `open_stream` is cancel-safe: an unclaimed handoff stays queued for
        // whoever reads from this peer next.
        let mut stream = tokio::select! {
            biased;
            _ = cancelled => {
                debug!(peer = %addr, "fetch cancelled before any stream");
                return Ok(None);
            }
            s = open_stream(peer) => s?,
        };
        let size = stream.read_u64_le().await.map_err(stream_err)?;
        let mut buf = Vec::new();
        (&mut stream)
            .take(size)
            .read_to_end(&mut buf)
            .await
            .map_err(stream_err)?;
        if buf.len() as u64 != size {
            return Err(Error::ShortStream {
                addr: addr.to_string(),
                expected: size,
                got: buf.len() as u64,
            });
        }
        stream.close_stream();
        Ok(Some(buf))
    };
    match tokio::time::timeout(timeout, read).await {
        Ok(r) => r,
        Err(_) => Err(Error::StreamTimeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}
