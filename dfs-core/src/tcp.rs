//! TCP transport: accept loop (incoming), dial (outbound), version handshake,
//! one read loop task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::peer::{Peer, DEFAULT_HANDOFF_TIMEOUT};
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::{PeerHandler, Rpc, Transport, TransportError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the control-frame channel shared by all connections.
pub const DEFAULT_RPC_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct TcpTransportOpts {
    /// Address to bind, e.g. `127.0.0.1:3000`. Port 0 picks a free port.
    pub listen_addr: String,
    pub rpc_buffer: usize,
    /// How long an inbound stream may wait to be claimed before the connection drops.
    pub handoff_timeout: Duration,
}

impl Default for TcpTransportOpts {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            rpc_buffer: DEFAULT_RPC_BUFFER,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

type Tasks = Arc<Mutex<JoinSet<()>>>;

pub struct TcpTransport {
    listen_addr: String,
    handoff_timeout: Duration,
    local_addr: Mutex<Option<SocketAddr>>,
    handler: OnceLock<Arc<dyn PeerHandler>>,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    tasks: Tasks,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(opts.rpc_buffer.max(1));
        Self {
            listen_addr: opts.listen_addr,
            handoff_timeout: opts.handoff_timeout,
            local_addr: Mutex::new(None),
            handler: OnceLock::new(),
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_tracked<F>(tasks: &Tasks, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut set = lock(tasks);
    // Reap finished connections so the set does not grow without bound.
    while set.try_join_next().is_some() {}
    set.spawn(fut);
}

#[async_trait]
impl Transport for TcpTransport {
    fn addr(&self) -> String {
        match *lock(&self.local_addr) {
            Some(a) => a.to_string(),
            None => self.listen_addr.clone(),
        }
    }

    async fn listen_and_accept(&self, handler: Arc<dyn PeerHandler>) -> Result<(), TransportError> {
        if self.handler.set(handler.clone()).is_err() {
            return Err(TransportError::AlreadyListening);
        }
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local = listener.local_addr()?;
        *lock(&self.local_addr) = Some(local);
        info!(addr = %local, "transport listening");

        let rpc_tx = self.rpc_tx.clone();
        let tasks = self.tasks.clone();
        let handoff_timeout = self.handoff_timeout;
        spawn_tracked(&self.tasks, async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(peer = %remote, "accepted connection");
                        let handler = handler.clone();
                        let rpc_tx = rpc_tx.clone();
                        let conn_tasks = tasks.clone();
                        spawn_tracked(&tasks, async move {
                            let conn = Conn {
                                outbound: false,
                                handoff_timeout,
                            };
                            if let Err(e) =
                                setup_connection(stream, conn, &handler, rpc_tx, &conn_tasks).await
                            {
                                warn!(peer = %remote, error = %e, "inbound connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, stopping accept loop");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let handler = self
            .handler
            .get()
            .cloned()
            .ok_or(TransportError::NotListening)?;
        let stream = TcpStream::connect(addr).await?;
        let conn = Conn {
            outbound: true,
            handoff_timeout: self.handoff_timeout,
        };
        setup_connection(stream, conn, &handler, self.rpc_tx.clone(), &self.tasks).await
    }

    fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        lock(&self.rpc_rx).take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.tasks).abort_all();
        info!(addr = %self.addr(), "transport closed");
        Ok(())
    }
}

/// Per-connection settings.
#[derive(Clone, Copy)]
struct Conn {
    outbound: bool,
    handoff_timeout: Duration,
}

async fn setup_connection(
    mut stream: TcpStream,
    conn: Conn,
    handler: &Arc<dyn PeerHandler>,
    rpc_tx: mpsc::Sender<Rpc>,
    tasks: &Tasks,
) -> Result<(), TransportError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream)).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(TransportError::Rejected("handshake timed out".to_string()));
        }
    }
    let remote = stream.peer_addr()?.to_string();
    let (reader, writer) = stream.into_split();
    let (peer, read_loop) = Peer::new(remote, conn.outbound, reader, writer);
    let read_loop = read_loop.with_handoff_timeout(conn.handoff_timeout);
    handler.on_peer(peer.clone())?;

    let handler = handler.clone();
    spawn_tracked(tasks, async move {
        read_loop.run(rpc_tx).await;
        handler.on_peer_closed(&peer);
    });
    Ok(())
}

/// Both sides send their version byte, then read the other's.
async fn handshake(stream: &mut TcpStream) -> Result<(), TransportError> {
    stream.write_all(&[PROTOCOL_VERSION]).await?;
    stream.flush().await?;
    let got = stream.read_u8().await?;
    if got != PROTOCOL_VERSION {
        return Err(TransportError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        peers: Mutex<Vec<Arc<Peer>>>,
        closed: Mutex<Vec<String>>,
    }

    impl PeerHandler for Recorder {
        fn on_peer(&self, peer: Arc<Peer>) -> Result<(), TransportError> {
            self.peers.lock().unwrap().push(peer);
            Ok(())
        }

        fn on_peer_closed(&self, peer: &Arc<Peer>) {
            self.closed
                .lock()
                .unwrap()
                .push(peer.remote_addr().to_string());
        }
    }

    fn loopback() -> TcpTransport {
        TcpTransport::new(TcpTransportOpts {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn dial_registers_both_sides() {
        let a = loopback();
        let b = loopback();
        let ha = Arc::new(Recorder::default());
        let hb = Arc::new(Recorder::default());
        a.listen_and_accept(ha.clone()).await.unwrap();
        b.listen_and_accept(hb.clone()).await.unwrap();
        assert_ne!(a.addr(), "127.0.0.1:0");

        b.dial(&a.addr()).await.unwrap();
        {
            let peers = hb.peers.lock().unwrap();
            assert_eq!(peers.len(), 1);
            assert!(peers[0].is_outbound());
            assert_eq!(peers[0].remote_addr(), a.addr());
        }
        eventually(|| ha.peers.lock().unwrap().len() == 1).await;
        assert!(!ha.peers.lock().unwrap()[0].is_outbound());
    }

    #[tokio::test]
    async fn version_mismatch_rejected() {
        let a = loopback();
        let ha = Arc::new(Recorder::default());
        a.listen_and_accept(ha.clone()).await.unwrap();

        let mut raw = TcpStream::connect(a.addr()).await.unwrap();
        raw.write_all(&[PROTOCOL_VERSION + 1]).await.unwrap();
        assert_eq!(raw.read_u8().await.unwrap(), PROTOCOL_VERSION);
        // Rejected side closes without registering.
        let mut rest = Vec::new();
        let _ = raw.read_to_end(&mut rest).await;
        assert!(ha.peers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_notifies_handler() {
        let a = loopback();
        let ha = Arc::new(Recorder::default());
        a.listen_and_accept(ha.clone()).await.unwrap();

        let mut raw = TcpStream::connect(a.addr()).await.unwrap();
        raw.write_all(&[PROTOCOL_VERSION]).await.unwrap();
        raw.read_u8().await.unwrap();
        eventually(|| ha.peers.lock().unwrap().len() == 1).await;
        drop(raw);
        eventually(|| ha.closed.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let a = loopback();
        let ha = Arc::new(Recorder::default());
        a.listen_and_accept(ha.clone()).await.unwrap();
        assert!(matches!(
            a.listen_and_accept(ha).await,
            Err(TransportError::AlreadyListening)
        ));
    }

    #[tokio::test]
    async fn dial_before_listen_fails() {
        let a = loopback();
        assert!(matches!(
            a.dial("127.0.0.1:1").await,
            Err(TransportError::NotListening)
        ));
    }

    #[test]
    fn consume_only_once() {
        let a = loopback();
        assert!(a.consume().is_some());
        assert!(a.consume().is_none());
    }
}
