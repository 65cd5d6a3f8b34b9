//! FloodSub engine
//!
//! Each connected peer gets one long-lived outbound `/tessera/floodsub/1.0.0`
//! stream fed by a queue, so RPCs to one peer arrive in the order they were
//! sent. Inbound streams carry a sequence of `PubSubRpc` envelopes and are
//! served by [`FloodSub::handle_inbound`].

use crate::seen::{MessageId, SeenCache};
use crate::{FloodPolicy, PubSubConfig, PubSubError, Result};
use prost::Message as _;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tessera_core::address_book::SharedAddressBook;
use tessera_core::codec;
use tessera_core::proto::{self, Envelope, Payload, PubSubRpc, SubOpts};
use tessera_core::{PeerId, PeerInfo, Topic, Transport, FLOODSUB_PROTOCOL, MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};

/// RPCs queued per peer before new ones are dropped
const OUTBOUND_QUEUE: usize = 1024;

/// Consecutive undeliverable RPCs after which a peer is dropped
const MAX_SEND_FAILURES: u32 = 3;

/// A message delivered to local handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The peer that published the message
    pub from: PeerId,
    pub seqno: u64,
    pub topics: Vec<Topic>,
    pub data: Vec<u8>,
}

impl Message {
    pub fn id(&self) -> MessageId {
        MessageId::new(self.from, self.seqno)
    }

    fn to_proto(&self) -> proto::PubSubMessage {
        proto::PubSubMessage {
            from: self.from.to_vec(),
            seqno: self.seqno,
            topics: self.topics.iter().map(|t| t.as_str().to_string()).collect(),
            data: self.data.clone(),
        }
    }

    fn from_proto(msg: proto::PubSubMessage, max_size: usize) -> Result<Self> {
        let from = PeerId::from_slice(&msg.from)
            .map_err(|e| PubSubError::MalformedMessage(format!("origin: {}", e)))?;
        if msg.topics.is_empty() || msg.topics.iter().any(|t| t.is_empty()) {
            return Err(PubSubError::MalformedMessage("missing topic".to_string()));
        }
        if msg.data.len() > max_size {
            return Err(PubSubError::MessageTooLarge {
                size: msg.data.len(),
                max: max_size,
            });
        }
        Ok(Self {
            from,
            seqno: msg.seqno,
            topics: msg.topics.into_iter().map(Topic::from).collect(),
            data: msg.data,
        })
    }
}

/// Callback invoked for each new message on a subscribed topic
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

struct PeerState {
    info: PeerInfo,
    /// Topics the peer announced
    topics: HashSet<Topic>,
    outbound: mpsc::Sender<PubSubRpc>,
    /// Identifies the sender task feeding `outbound`
    session: u64,
}

impl PeerState {
    fn send(&self, rpc: PubSubRpc) {
        if self.outbound.try_send(rpc).is_err() {
            tracing::debug!("Outbound queue to {:?} full or closed", self.info.peer_id);
        }
    }
}

#[derive(Default)]
struct State {
    subscriptions: HashSet<Topic>,
    peers: HashMap<PeerId, PeerState>,
    handlers: HashMap<Topic, Vec<MessageHandler>>,
}

/// Handle to a FloodSub router; cheap to clone
pub struct FloodSub<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for FloodSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    config: PubSubConfig,
    transport: Arc<T>,
    local: PeerInfo,
    addresses: SharedAddressBook,
    state: RwLock<State>,
    seen: Mutex<SeenCache>,
    /// Next sequence number to publish with
    seqno: AtomicU64,
    next_session: AtomicU64,
}

impl<T: Transport> FloodSub<T> {
    pub fn new(transport: Arc<T>, addresses: SharedAddressBook, config: PubSubConfig) -> Self {
        let local = transport.local_info();
        Self {
            inner: Arc::new(Inner {
                seen: Mutex::new(SeenCache::new(config.seen_ttl, config.seen_capacity)),
                state: RwLock::new(State::default()),
                seqno: AtomicU64::new(1),
                next_session: AtomicU64::new(0),
                config,
                transport,
                local,
                addresses,
            }),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local.peer_id
    }

    /// Subscribe to a topic; returns false if already subscribed
    pub async fn subscribe(&self, topic: impl Into<Topic>) -> bool {
        self.set_subscription(topic.into(), true).await
    }

    /// Unsubscribe from a topic; returns false if not subscribed
    pub async fn unsubscribe(&self, topic: impl Into<Topic>) -> bool {
        self.set_subscription(topic.into(), false).await
    }

    async fn set_subscription(&self, topic: Topic, subscribe: bool) -> bool {
        let mut state = self.inner.state.write().await;
        let changed = if subscribe {
            state.subscriptions.insert(topic.clone())
        } else {
            state.subscriptions.remove(&topic)
        };
        if !changed {
            return false;
        }

        tracing::info!(
            "{} {}",
            if subscribe { "Subscribed to" } else { "Unsubscribed from" },
            topic
        );
        let rpc = PubSubRpc {
            subscriptions: vec![SubOpts {
                subscribe,
                topic: topic.as_str().to_string(),
            }],
            messages: Vec::new(),
        };
        for peer in state.peers.values() {
            peer.send(rpc.clone());
        }
        true
    }

    pub async fn is_subscribed(&self, topic: &Topic) -> bool {
        self.inner.state.read().await.subscriptions.contains(topic)
    }

    pub async fn subscriptions(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .inner
            .state
            .read()
            .await
            .subscriptions
            .iter()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Register a handler for messages on `topic`
    ///
    /// Handlers only fire while the node is subscribed to the topic.
    pub async fn on_message<F>(&self, topic: impl Into<Topic>, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner
            .state
            .write()
            .await
            .handlers
            .entry(topic.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Publish `data` on `topic` to every flood target
    ///
    /// Having no peers is not an error; the message is simply not forwarded.
    pub async fn publish(&self, topic: impl Into<Topic>, data: Vec<u8>) -> Result<MessageId> {
        let max = self.inner.config.max_message_size;
        if data.len() > max {
            return Err(PubSubError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let mut message = Message {
            from: self.inner.local.peer_id,
            seqno: u64::MAX,
            topics: vec![topic.into()],
            data,
        };
        let frame_len = self.inner.rpc_envelope(message_rpc(&message)).encoded_len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(PubSubError::MessageTooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }
        message.seqno = self.inner.seqno.fetch_add(1, Ordering::SeqCst);

        let id = message.id();
        self.inner.seen.lock().await.insert(id, Instant::now());
        tracing::debug!("Publishing {} on {:?}", id, message.topics);

        self.inner.deliver(&message).await;
        self.inner.flood(&message, &[]).await;
        Ok(id)
    }

    /// Start exchanging messages with a connected peer
    ///
    /// A new peer is sent our subscription set. Returns false if the peer was
    /// already known, in which case only its addresses are refreshed.
    pub async fn add_peer(&self, peer: PeerInfo) -> bool {
        if peer.peer_id == self.inner.local.peer_id {
            return false;
        }
        let mut state = self.inner.state.write().await;
        if let Some(existing) = state.peers.get_mut(&peer.peer_id) {
            existing.info.merge_addrs(&peer.addrs);
            return false;
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(run_sender(
            Arc::downgrade(&self.inner),
            peer.clone(),
            session,
            rx,
        ));

        let peer_state = PeerState {
            info: peer,
            topics: HashSet::new(),
            outbound: tx,
            session,
        };
        if !state.subscriptions.is_empty() {
            let hello = PubSubRpc {
                subscriptions: state
                    .subscriptions
                    .iter()
                    .map(|t| SubOpts {
                        subscribe: true,
                        topic: t.as_str().to_string(),
                    })
                    .collect(),
                messages: Vec::new(),
            };
            peer_state.send(hello);
        }
        tracing::debug!("PubSub peer added: {:?}", peer_state.info.peer_id);
        state.peers.insert(peer_state.info.peer_id, peer_state);
        true
    }

    /// Stop exchanging messages with a peer; its outbound stream is closed
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let removed = self.inner.state.write().await.peers.remove(peer_id).is_some();
        if removed {
            tracing::debug!("PubSub peer removed: {:?}", peer_id);
        }
        removed
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.state.read().await.peers.keys().copied().collect()
    }

    /// Topics a peer announced, sorted
    pub async fn peer_topics(&self, peer_id: &PeerId) -> Vec<Topic> {
        let state = self.inner.state.read().await;
        let mut topics: Vec<Topic> = state
            .peers
            .get(peer_id)
            .map(|p| p.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Serve a pubsub stream opened by `remote`
    ///
    /// The remote becomes a connected peer if it was not one already.
    /// Malformed frames are logged and skipped.
    pub async fn handle_inbound<S>(&self, remote: PeerInfo, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.add_peer(remote.clone()).await;
        loop {
            let envelope = match codec::read_envelope(&mut stream).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e @ (tessera_core::Error::Io(_) | tessera_core::Error::FrameTooLarge { .. })) => {
                    tracing::debug!("PubSub stream from {:?} closed: {}", remote.peer_id, e);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Malformed pubsub frame from {:?}: {}", remote.peer_id, e);
                    continue;
                }
            };
            match envelope.payload {
                Some(Payload::PubSubRpc(rpc)) => self.inner.handle_rpc(&remote.peer_id, rpc).await,
                other => {
                    tracing::warn!(
                        "Unexpected message on pubsub stream from {:?}: {:?}",
                        remote.peer_id,
                        other
                    );
                }
            }
        }
    }
}

impl<T: Transport> Inner<T> {
    /// Drop a peer whose sender gave up, unless it was re-added since
    async fn drop_unreachable(&self, peer_id: &PeerId, session: u64) {
        {
            let mut state = self.state.write().await;
            match state.peers.get(peer_id) {
                Some(peer) if peer.session == session => {
                    state.peers.remove(peer_id);
                }
                _ => return,
            }
        }
        self.addresses.write().await.mark_disconnected(peer_id);
        tracing::info!("Dropped unreachable pubsub peer {:?}", peer_id);
    }

    fn rpc_envelope(&self, rpc: PubSubRpc) -> Envelope {
        Envelope::new(0, Payload::PubSubRpc(rpc)).with_origin(&self.local)
    }

    async fn handle_rpc(&self, sender: &PeerId, rpc: PubSubRpc) {
        if !rpc.subscriptions.is_empty() {
            let mut state = self.state.write().await;
            if let Some(peer) = state.peers.get_mut(sender) {
                for sub in rpc.subscriptions {
                    if sub.topic.is_empty() {
                        continue;
                    }
                    let topic = Topic::from(sub.topic);
                    tracing::debug!(
                        "{:?} {} {}",
                        sender,
                        if sub.subscribe { "subscribed to" } else { "unsubscribed from" },
                        topic
                    );
                    if sub.subscribe {
                        peer.topics.insert(topic);
                    } else {
                        peer.topics.remove(&topic);
                    }
                }
            }
        }

        for raw in rpc.messages {
            let message = match Message::from_proto(raw, self.config.max_message_size) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Dropping message from {:?}: {}", sender, e);
                    continue;
                }
            };
            if !self.seen.lock().await.insert(message.id(), Instant::now()) {
                tracing::trace!("Duplicate {} from {:?}", message.id(), sender);
                continue;
            }
            self.deliver(&message).await;
            self.flood(&message, &[*sender, message.from]).await;
        }
    }

    /// Run the handlers of every subscribed topic the message carries
    async fn deliver(&self, message: &Message) {
        let handlers: Vec<MessageHandler> = {
            let state = self.state.read().await;
            message
                .topics
                .iter()
                .filter(|t| state.subscriptions.contains(*t))
                .filter_map(|t| state.handlers.get(t))
                .flatten()
                .cloned()
                .collect()
        };
        for handler in handlers {
            handler(message);
        }
    }

    /// Queue the message to every flood target not in `exclude`
    async fn flood(&self, message: &Message, exclude: &[PeerId]) {
        let rpc = message_rpc(message);
        let state = self.state.read().await;
        let mut forwarded = 0;
        for (peer_id, peer) in &state.peers {
            if exclude.contains(peer_id) {
                continue;
            }
            if self.config.flood_policy == FloodPolicy::Interested
                && !message.topics.iter().any(|t| peer.topics.contains(t))
            {
                continue;
            }
            peer.send(rpc.clone());
            forwarded += 1;
        }
        tracing::trace!("Forwarded {} to {} peers", message.id(), forwarded);
    }
}

fn message_rpc(message: &Message) -> PubSubRpc {
    PubSubRpc {
        subscriptions: Vec::new(),
        messages: vec![message.to_proto()],
    }
}

/// Write queued RPCs to one peer over a long-lived stream
///
/// A broken stream is reopened once per RPC; an RPC that cannot be written
/// after that is dropped. After `MAX_SEND_FAILURES` dropped RPCs in a row the
/// peer is removed and marked disconnected.
async fn run_sender<T: Transport>(
    inner: Weak<Inner<T>>,
    mut peer: PeerInfo,
    session: u64,
    mut rx: mpsc::Receiver<PubSubRpc>,
) {
    let mut stream: Option<T::Stream> = None;
    let mut failures = 0;
    while let Some(rpc) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let envelope = inner.rpc_envelope(rpc);
        let mut delivered = false;
        for _ in 0..2 {
            if stream.is_none() {
                if let Some(known) = inner.addresses.read().await.peer_info(&peer.peer_id) {
                    peer.merge_addrs(&known.addrs);
                }
                match inner.transport.open_stream(&peer, FLOODSUB_PROTOCOL).await {
                    Ok(s) => stream = Some(s),
                    Err(e) => {
                        tracing::debug!("Cannot open pubsub stream to {:?}: {}", peer.peer_id, e);
                        break;
                    }
                }
            }
            if let Some(s) = stream.as_mut() {
                match codec::write_envelope(s, &envelope).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("PubSub stream to {:?} broke: {}", peer.peer_id, e);
                        stream = None;
                    }
                }
            }
        }

        if delivered {
            failures = 0;
            continue;
        }
        failures += 1;
        if failures >= MAX_SEND_FAILURES {
            inner.drop_unreachable(&peer.peer_id, session).await;
            break;
        }
    }
    if let Some(mut s) = stream {
        let _ = s.shutdown().await;
    }
}
