//! Transport abstraction for secure, multiplexed peer sessions
//!
//! The DHT and pubsub engines only need to open protocol-tagged byte
//! streams to peers and to accept streams opened by peers. Encryption,
//! authentication and multiplexing are the transport's concern; this trait
//! lets the engines run over:
//! - the in-memory [`memory::MemoryTransport`] in tests and simulations
//! - the plain [`crate::TcpTransport`] for local demos
//! - any secure transport implemented outside this workspace

use crate::{Multiaddr, PeerId, PeerInfo, Result};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// A stream opened by a remote peer
#[derive(Debug)]
pub struct InboundStream<S> {
    /// The remote peer and the addresses it listens on
    pub remote: PeerInfo,
    /// Protocol id requested by the remote
    pub protocol: String,
    pub stream: S,
}

/// Transport trait for peer sessions
pub trait Transport: Send + Sync + 'static {
    /// A bidirectional byte stream to one peer
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Our own peer id
    fn local_peer_id(&self) -> PeerId;

    /// Addresses other peers can reach us at
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Connect to an address and learn the peer id listening there
    fn dial(&self, addr: &Multiaddr) -> impl Future<Output = Result<PeerId>> + Send;

    /// Open a new logical stream to a peer, negotiating `protocol`
    fn open_stream(
        &self,
        peer: &PeerInfo,
        protocol: &str,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Take the receiver of inbound streams; may only be called once
    fn incoming(&self) -> Result<mpsc::Receiver<InboundStream<Self::Stream>>>;

    /// Our peer id with our listen addresses
    fn local_info(&self) -> PeerInfo {
        PeerInfo::new(self.local_peer_id(), self.listen_addrs())
    }
}

pub mod memory {
    //! In-memory transport for tests and simulations
    //!
    //! Every [`MemoryTransport`] registers a `/memory/<n>` address on a shared
    //! [`MemoryNetwork`]; opening a stream hands one half of a duplex pipe to
    //! the listener.

    use super::*;
    use crate::{Error, IDENTIFY_PROTOCOL};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    /// Buffer size of each in-memory pipe
    const PIPE_CAPACITY: usize = 64 * 1024;

    /// Inbound queue depth per transport
    const INBOUND_QUEUE: usize = 256;

    type Listener = (PeerId, mpsc::Sender<InboundStream<DuplexStream>>);

    #[derive(Default)]
    struct NetworkState {
        next_port: u64,
        listeners: HashMap<Multiaddr, Listener>,
    }

    /// A shared registry of in-memory listeners
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        state: Arc<Mutex<NetworkState>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a new peer and return its transport
        pub async fn add_peer(&self, peer_id: PeerId) -> MemoryTransport {
            let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
            let mut state = self.state.lock().await;
            state.next_port += 1;
            let addr = Multiaddr::memory(state.next_port);
            state.listeners.insert(addr.clone(), (peer_id, tx));

            MemoryTransport {
                peer_id,
                addr,
                network: self.clone(),
                incoming: Mutex::new(Some(rx)),
            }
        }

        /// Take an address offline; later dials to it fail
        pub async fn disconnect(&self, addr: &Multiaddr) -> bool {
            self.state.lock().await.listeners.remove(addr).is_some()
        }

        async fn listener(&self, addr: &Multiaddr) -> Option<Listener> {
            self.state.lock().await.listeners.get(addr).cloned()
        }
    }

    /// One peer's view of a [`MemoryNetwork`]
    pub struct MemoryTransport {
        peer_id: PeerId,
        addr: Multiaddr,
        network: MemoryNetwork,
        incoming: Mutex<Option<mpsc::Receiver<InboundStream<DuplexStream>>>>,
    }

    impl MemoryTransport {
        pub fn addr(&self) -> &Multiaddr {
            &self.addr
        }

        async fn connect(
            &self,
            addr: &Multiaddr,
            expected: Option<&PeerId>,
            protocol: &str,
        ) -> Result<(PeerId, DuplexStream)> {
            let addr = addr.without_peer_id();
            let (remote_id, tx) = self
                .network
                .listener(&addr)
                .await
                .ok_or_else(|| Error::ConnectionFailed(format!("no listener at {}", addr)))?;

            if let Some(expected) = expected {
                if expected != &remote_id {
                    return Err(Error::ConnectionFailed(format!(
                        "{} is {:?}, expected {:?}",
                        addr, remote_id, expected
                    )));
                }
            }

            let (local_half, remote_half) = tokio::io::duplex(PIPE_CAPACITY);
            let inbound = InboundStream {
                remote: self.local_info(),
                protocol: protocol.to_string(),
                stream: remote_half,
            };
            tx.send(inbound)
                .await
                .map_err(|_| Error::ConnectionFailed(format!("listener at {} closed", addr)))?;

            Ok((remote_id, local_half))
        }
    }

    impl Transport for MemoryTransport {
        type Stream = DuplexStream;

        fn local_peer_id(&self) -> PeerId {
            self.peer_id
        }

        fn listen_addrs(&self) -> Vec<Multiaddr> {
            vec![self.addr.clone()]
        }

        fn dial(&self, addr: &Multiaddr) -> impl Future<Output = Result<PeerId>> + Send {
            async move {
                let expected = addr.peer_id();
                let (remote_id, _stream) =
                    self.connect(addr, expected.as_ref(), IDENTIFY_PROTOCOL).await?;
                Ok(remote_id)
            }
        }

        fn open_stream(
            &self,
            peer: &PeerInfo,
            protocol: &str,
        ) -> impl Future<Output = Result<DuplexStream>> + Send {
            async move {
                let mut last_err = Error::ConnectionFailed(format!("{:?} has no addresses", peer.peer_id));
                for addr in &peer.addrs {
                    match self.connect(addr, Some(&peer.peer_id), protocol).await {
                        Ok((_, stream)) => return Ok(stream),
                        Err(e) => last_err = e,
                    }
                }
                Err(last_err)
            }
        }

        fn incoming(&self) -> Result<mpsc::Receiver<InboundStream<DuplexStream>>> {
            self.incoming
                .try_lock()
                .map_err(|_| Error::Transport("incoming receiver is busy".to_string()))?
                .take()
                .ok_or_else(|| Error::Transport("incoming receiver already taken".to_string()))
        }
    }

}
