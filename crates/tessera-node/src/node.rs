//! Overlay node: one transport shared by the DHT and the pubsub router
//!
//! [`Node::new`] takes the inbound stream receiver from the transport and
//! dispatches each stream by protocol id. A peer we dial, or that dials us or
//! opens a pubsub stream to us, counts as connected: it is recorded in the
//! address book, added to the routing table and becomes a pubsub flood
//! target. DHT requests alone only refresh the routing table.

use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::address_book::SharedAddressBook;
use tessera_core::{
    AddressBook, ContentId, InboundStream, Multiaddr, PeerId, PeerInfo, Topic, Transport,
    FLOODSUB_PROTOCOL, IDENTIFY_PROTOCOL, KAD_PROTOCOL,
};
use tessera_dht::{DhtConfig, Kademlia};
use tessera_pubsub::{FloodSub, Message, MessageId, PubSubConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Explicit wiring of a node's components
///
/// Leaving a component's config out disables it; inbound streams for a
/// disabled protocol are dropped.
pub struct NodeConfig<T: Transport> {
    pub transport: T,
    pub dht: Option<DhtConfig>,
    pub pubsub: Option<PubSubConfig>,
}

impl<T: Transport> NodeConfig<T> {
    /// DHT and pubsub with default settings
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            dht: Some(DhtConfig::default()),
            pubsub: Some(PubSubConfig::default()),
        }
    }
}

/// Components shared with the dispatcher task
struct Components<T: Transport> {
    addresses: SharedAddressBook,
    dht: Option<Kademlia<T>>,
    pubsub: Option<FloodSub<T>>,
}

impl<T: Transport> Clone for Components<T> {
    fn clone(&self) -> Self {
        Self {
            addresses: self.addresses.clone(),
            dht: self.dht.clone(),
            pubsub: self.pubsub.clone(),
        }
    }
}

impl<T: Transport> Components<T> {
    async fn peer_connected(&self, peer: PeerInfo) {
        if self.addresses.write().await.mark_connected(&peer) {
            tracing::info!("Peer connected: {:?}", peer.peer_id);
        }
        if let Some(dht) = &self.dht {
            dht.add_address(peer.clone()).await;
        }
        if let Some(pubsub) = &self.pubsub {
            pubsub.add_peer(peer).await;
        }
    }
}

pub struct Node<T: Transport> {
    transport: Arc<T>,
    components: Components<T>,
    dispatcher: JoinHandle<()>,
}

impl<T: Transport> Node<T> {
    /// Assemble a node and start serving inbound streams
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: NodeConfig<T>) -> Result<Self> {
        let transport = Arc::new(config.transport);
        let incoming = transport.incoming()?;
        let addresses = AddressBook::shared(transport.local_info());

        let components = Components {
            dht: config
                .dht
                .map(|c| Kademlia::new(transport.clone(), addresses.clone(), c)),
            pubsub: config
                .pubsub
                .map(|c| FloodSub::new(transport.clone(), addresses.clone(), c)),
            addresses,
        };
        let dispatcher = tokio::spawn(dispatch(incoming, components.clone()));

        tracing::info!("Node {} started", transport.local_peer_id());
        Ok(Self {
            transport,
            components,
            dispatcher,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub fn local_info(&self) -> PeerInfo {
        self.transport.local_info()
    }

    /// Listen addresses suffixed with our peer id, ready to share
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        let peer_id = self.local_peer_id();
        self.transport
            .listen_addrs()
            .iter()
            .map(|a| a.with_peer_id(&peer_id).unwrap_or_else(|_| a.clone()))
            .collect()
    }

    pub fn dht(&self) -> Option<&Kademlia<T>> {
        self.components.dht.as_ref()
    }

    pub fn pubsub(&self) -> Option<&FloodSub<T>> {
        self.components.pubsub.as_ref()
    }

    /// Dial an address and treat the peer behind it as connected
    pub async fn connect(&self, addr: &Multiaddr) -> Result<PeerId> {
        let peer_id = self.transport.dial(addr).await?;
        let peer = PeerInfo::new(peer_id, vec![addr.without_peer_id()]);
        self.components.peer_connected(peer).await;
        Ok(peer_id)
    }

    /// Connect to bootstrap peers, then populate the routing table
    ///
    /// Fails only if none of the addresses could be dialed. Returns the
    /// number of bootstrap peers reached.
    pub async fn bootstrap(&self, addrs: &[Multiaddr]) -> Result<usize> {
        let mut connected = 0;
        for addr in addrs {
            match self.connect(addr).await {
                Ok(peer_id) => {
                    tracing::info!("Connected to bootstrap peer {:?} at {}", peer_id, addr);
                    connected += 1;
                }
                Err(e) => tracing::warn!("Bootstrap peer {} unreachable: {}", addr, e),
            }
        }
        if connected == 0 {
            bail!("No bootstrap peer reachable");
        }

        if let Some(dht) = self.dht() {
            if let Err(e) = dht.bootstrap().await {
                tracing::warn!("DHT bootstrap lookup failed: {}", e);
            }
        }
        Ok(connected)
    }

    /// Stop treating a peer as connected
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let was_connected = self
            .components
            .addresses
            .write()
            .await
            .mark_disconnected(peer_id);
        if let Some(pubsub) = self.pubsub() {
            pubsub.remove_peer(peer_id).await;
        }
        was_connected
    }

    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        self.components.addresses.read().await.connected_peers()
    }

    fn require_dht(&self) -> Result<&Kademlia<T>> {
        self.dht().ok_or_else(|| anyhow!("DHT is disabled on this node"))
    }

    fn require_pubsub(&self) -> Result<&FloodSub<T>> {
        self.pubsub()
            .ok_or_else(|| anyhow!("PubSub is disabled on this node"))
    }

    /// Announce that we provide `cid`; see [`Kademlia::provide`]
    pub async fn provide(&self, cid: &ContentId, duration: Option<Duration>) -> Result<usize> {
        Ok(self.require_dht()?.provide(cid, duration).await?)
    }

    pub async fn stop_providing(&self, cid: &ContentId) -> Result<bool> {
        Ok(self.require_dht()?.stop_providing(cid).await)
    }

    pub async fn find_providers(
        &self,
        cid: &ContentId,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<PeerInfo>> {
        Ok(self.require_dht()?.find_providers(cid, max, timeout).await?)
    }

    pub async fn subscribe(&self, topic: impl Into<Topic>) -> Result<bool> {
        Ok(self.require_pubsub()?.subscribe(topic).await)
    }

    pub async fn unsubscribe(&self, topic: impl Into<Topic>) -> Result<bool> {
        Ok(self.require_pubsub()?.unsubscribe(topic).await)
    }

    pub async fn publish(&self, topic: impl Into<Topic>, data: Vec<u8>) -> Result<MessageId> {
        Ok(self.require_pubsub()?.publish(topic, data).await?)
    }

    pub async fn on_message<F>(&self, topic: impl Into<Topic>, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.require_pubsub()?.on_message(topic, handler).await;
        Ok(())
    }
}

impl<T: Transport> Drop for Node<T> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Route inbound streams to the component serving their protocol
async fn dispatch<T: Transport>(
    mut incoming: mpsc::Receiver<InboundStream<T::Stream>>,
    components: Components<T>,
) {
    while let Some(inbound) = incoming.recv().await {
        let InboundStream {
            remote,
            protocol,
            stream,
        } = inbound;

        match protocol.as_str() {
            KAD_PROTOCOL => match &components.dht {
                Some(dht) => {
                    let dht = dht.clone();
                    tokio::spawn(async move { dht.handle_inbound(remote, stream).await });
                }
                None => tracing::debug!("DHT disabled, dropping stream from {:?}", remote.peer_id),
            },
            FLOODSUB_PROTOCOL => {
                components.peer_connected(remote.clone()).await;
                match &components.pubsub {
                    Some(pubsub) => {
                        let pubsub = pubsub.clone();
                        tokio::spawn(async move { pubsub.handle_inbound(remote, stream).await });
                    }
                    None => {
                        tracing::debug!("PubSub disabled, dropping stream from {:?}", remote.peer_id)
                    }
                }
            }
            // A dial only needs the peer to be recorded
            IDENTIFY_PROTOCOL => {
                drop(stream);
                components.peer_connected(remote).await;
            }
            other => {
                tracing::warn!("Unsupported protocol {} from {:?}", other, remote.peer_id);
            }
        }
    }
    tracing::debug!("Inbound stream dispatcher stopped");
}
