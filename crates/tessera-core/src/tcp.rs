//! Plain TCP transport for local demos
//!
//! Every logical stream is its own TCP connection. Both sides open the
//! connection with a [`Handshake`] frame carrying their peer id, listen
//! addresses and the requested protocol. Nothing here is encrypted or
//! authenticated: production deployments plug a secure transport in behind
//! the [`Transport`] trait instead.

use crate::codec;
use crate::proto::Handshake;
use crate::transport::{InboundStream, Transport};
use crate::{Error, Multiaddr, PeerId, PeerInfo, Result, IDENTIFY_PROTOCOL, PROTOCOL_VERSION};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const INBOUND_QUEUE: usize = 256;

pub struct TcpTransport {
    peer_id: PeerId,
    listen_addr: Multiaddr,
    incoming: Mutex<Option<mpsc::Receiver<InboundStream<TcpStream>>>>,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind a listener and start accepting streams
    ///
    /// Port 0 picks a free port. An unspecified ip is advertised as loopback,
    /// which other hosts cannot reach; see [`TcpTransport::bind_with_external`].
    pub async fn bind(peer_id: PeerId, addr: &Multiaddr) -> Result<Self> {
        Self::bind_with_external(peer_id, addr, None).await
    }

    /// Bind a listener that advertises `external` instead of the bound address
    ///
    /// Use this behind NAT or when binding an unspecified ip. `external` must
    /// be a TCP address.
    pub async fn bind_with_external(
        peer_id: PeerId,
        addr: &Multiaddr,
        external: Option<Multiaddr>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr.to_socket_addr()?).await?;
        let mut local = listener.local_addr()?;
        let listen_addr = match external {
            Some(external) => {
                external.to_socket_addr()?;
                external.without_peer_id()
            }
            None => {
                if local.ip().is_unspecified() {
                    tracing::warn!(
                        "Bound to {}; advertising loopback, set an external address to be reachable from other hosts",
                        local
                    );
                    let loopback = match local.ip() {
                        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                    };
                    local.set_ip(loopback);
                }
                Multiaddr::from_socket_addr(local)
            }
        };

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let accept_task = tokio::spawn(accept_loop(listener, peer_id, listen_addr.clone(), tx));

        tracing::info!("Listening on {} as {}", listen_addr, peer_id);

        Ok(Self {
            peer_id,
            listen_addr,
            incoming: Mutex::new(Some(rx)),
            accept_task,
        })
    }

    fn hello(&self, protocol: &str) -> Handshake {
        Handshake {
            version: PROTOCOL_VERSION as u32,
            peer_id: self.peer_id.to_vec(),
            listen_addrs: vec![self.listen_addr.to_string()],
            protocol: protocol.to_string(),
        }
    }

    async fn connect(
        &self,
        addr: &Multiaddr,
        expected: Option<&PeerId>,
        protocol: &str,
    ) -> Result<(PeerId, TcpStream)> {
        let socket = addr.to_socket_addr()?;
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(socket))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        codec::write_message(&mut stream, &self.hello(protocol)).await?;
        let reply: Handshake =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, codec::read_message(&mut stream))
                .await
                .map_err(|_| Error::Timeout)??
                .ok_or_else(|| Error::ConnectionFailed(format!("{} closed during handshake", addr)))?;

        check_version(&reply)?;
        let remote_id = PeerId::from_slice(&reply.peer_id)?;
        if let Some(expected) = expected {
            if expected != &remote_id {
                return Err(Error::ConnectionFailed(format!(
                    "{} is {:?}, expected {:?}",
                    addr, remote_id, expected
                )));
            }
        }

        Ok((remote_id, stream))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        vec![self.listen_addr.clone()]
    }

    fn dial(&self, addr: &Multiaddr) -> impl Future<Output = Result<PeerId>> + Send {
        async move {
            let expected = addr.peer_id();
            let (remote_id, _stream) = self
                .connect(&addr.without_peer_id(), expected.as_ref(), IDENTIFY_PROTOCOL)
                .await?;
            Ok(remote_id)
        }
    }

    fn open_stream(
        &self,
        peer: &PeerInfo,
        protocol: &str,
    ) -> impl Future<Output = Result<TcpStream>> + Send {
        async move {
            let mut last_err =
                Error::ConnectionFailed(format!("{:?} has no addresses", peer.peer_id));
            for addr in &peer.addrs {
                match self.connect(addr, Some(&peer.peer_id), protocol).await {
                    Ok((_, stream)) => return Ok(stream),
                    Err(e) => last_err = e,
                }
            }
            Err(last_err)
        }
    }

    fn incoming(&self) -> Result<mpsc::Receiver<InboundStream<TcpStream>>> {
        self.incoming
            .try_lock()
            .map_err(|_| Error::Transport("incoming receiver is busy".to_string()))?
            .take()
            .ok_or_else(|| Error::Transport("incoming receiver already taken".to_string()))
    }
}

fn check_version(handshake: &Handshake) -> Result<()> {
    if handshake.version != PROTOCOL_VERSION as u32 {
        return Err(Error::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: handshake.version,
        });
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    local_id: PeerId,
    listen_addr: Multiaddr,
    tx: mpsc::Sender<InboundStream<TcpStream>>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let tx = tx.clone();
        let listen_addr = listen_addr.clone();
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                accept_handshake(stream, local_id, &listen_addr),
            )
            .await;

            match handshake {
                Ok(Ok(inbound)) => {
                    if tx.send(inbound).await.is_err() {
                        tracing::debug!("Inbound receiver dropped");
                    }
                }
                Ok(Err(e)) => tracing::debug!("Handshake with {} failed: {}", remote_addr, e),
                Err(_) => tracing::debug!("Handshake with {} timed out", remote_addr),
            }
        });
    }
}

async fn accept_handshake(
    mut stream: TcpStream,
    local_id: PeerId,
    listen_addr: &Multiaddr,
) -> Result<InboundStream<TcpStream>> {
    let hello: Handshake = codec::read_message(&mut stream)
        .await?
        .ok_or_else(|| Error::ConnectionFailed("closed during handshake".to_string()))?;
    check_version(&hello)?;

    let remote_id = PeerId::from_slice(&hello.peer_id)?;
    let addrs = hello
        .listen_addrs
        .iter()
        .filter_map(|a| a.parse::<Multiaddr>().ok())
        .collect();

    let reply = Handshake {
        version: PROTOCOL_VERSION as u32,
        peer_id: local_id.to_vec(),
        listen_addrs: vec![listen_addr.to_string()],
        protocol: hello.protocol.clone(),
    };
    codec::write_message(&mut stream, &reply).await?;
    stream.set_nodelay(true)?;

    Ok(InboundStream {
        remote: PeerInfo::new(remote_id, addrs),
        protocol: hello.protocol,
        stream,
    })
}
