//! Kademlia engine: content routing and peer routing over a [`Transport`]
//!
//! Every request opens a fresh `/tessera/kad/1.0.0` stream, writes one
//! envelope and reads one response. Inbound streams are served by
//! [`Kademlia::handle_inbound`] until the remote closes them.

use crate::lookup::Shortlist;
use crate::routing::{InsertOutcome, RoutingTable};
use crate::storage::ProviderStore;
use crate::{next_request_id, DhtConfig, DhtError, Result};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tessera_core::address_book::SharedAddressBook;
use tessera_core::codec;
use tessera_core::proto::{self, error_codes, Envelope, Payload, PeerRecord};
use tessera_core::{peer_key, ContentId, Key, PeerId, PeerInfo, Transport, KAD_PROTOCOL};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;

/// Pending liveness checks queued before new full-bucket candidates are dropped
const CHALLENGE_QUEUE: usize = 64;

/// A full bucket's least-recently-seen entry and the peer waiting to replace it
#[derive(Debug)]
struct Challenge {
    oldest: PeerInfo,
    candidate: PeerInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Query {
    FindNode,
    GetProviders,
}

/// What an iterative lookup learned
#[derive(Debug, Default)]
struct LookupOutcome {
    /// Peers that answered, closest to the target first
    closest: Vec<PeerInfo>,
    providers: Vec<PeerInfo>,
    /// Number of peers that answered at all
    responded: usize,
}

/// Handle to a Kademlia DHT node; cheap to clone
pub struct Kademlia<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Kademlia<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    config: DhtConfig,
    transport: Arc<T>,
    local: PeerInfo,
    addresses: SharedAddressBook,
    routing: RwLock<RoutingTable>,
    providers: RwLock<ProviderStore>,
    /// Re-announce task per provided key
    republish: Mutex<HashMap<Key, JoinHandle<()>>>,
    /// Oldest entries currently being pinged
    challenged: Mutex<HashSet<PeerId>>,
    challenge_tx: mpsc::Sender<Challenge>,
}

impl<T: Transport> Kademlia<T> {
    /// Create a DHT node and start its maintenance tasks
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<T>, addresses: SharedAddressBook, config: DhtConfig) -> Self {
        let local = transport.local_info();
        let (challenge_tx, challenge_rx) = mpsc::channel(CHALLENGE_QUEUE);
        let inner = Arc::new(Inner {
            routing: RwLock::new(RoutingTable::new(
                local.peer_id,
                config.k,
                config.max_failures,
            )),
            providers: RwLock::new(ProviderStore::new(
                config.max_providers_per_key,
                config.provider_ttl,
            )),
            republish: Mutex::new(HashMap::new()),
            challenged: Mutex::new(HashSet::new()),
            challenge_tx,
            config,
            transport,
            local,
            addresses,
        });

        tokio::spawn(run_challenges(Arc::downgrade(&inner), challenge_rx));
        tokio::spawn(run_cleanup(
            Arc::downgrade(&inner),
            inner.config.cleanup_interval,
        ));

        tracing::debug!("DHT node {:?} started", inner.local.peer_id);
        Self { inner }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local.peer_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Record a peer learned out of band, e.g. by dialing it
    pub async fn add_address(&self, peer: PeerInfo) {
        self.inner.note_contact(peer).await;
    }

    /// Forget a peer entirely
    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        let removed = self.inner.routing.write().await.remove_peer(peer_id);
        self.inner.forget(peer_id).await;
        removed
    }

    /// Populate the routing table by looking up our own id
    ///
    /// Returns the number of peers in the routing table afterwards.
    pub async fn bootstrap(&self) -> Result<usize> {
        let found = self.find_node(peer_key(&self.inner.local.peer_id)).await?;
        let size = self.routing_table_size().await;
        tracing::info!(
            "Bootstrap complete: {} peers answered, {} in routing table",
            found.len(),
            size
        );
        Ok(size)
    }

    /// Iterative lookup for the K closest responsive peers to `target`
    pub async fn find_node(&self, target: Key) -> Result<Vec<PeerInfo>> {
        let deadline = time::Instant::now() + self.inner.config.lookup_timeout;
        let outcome = self
            .inner
            .lookup(target, Query::FindNode, 0, Vec::new(), deadline)
            .await;
        if outcome.responded == 0 {
            return Err(DhtError::NoPeersReachable);
        }
        Ok(outcome.closest)
    }

    /// Announce that this node provides `cid`
    ///
    /// The announcement is repeated every `republish_interval` until
    /// `duration` elapses, or until [`Kademlia::stop_providing`] when
    /// `duration` is `None`. Returns the number of peers that stored the
    /// record.
    pub async fn provide(&self, cid: &ContentId, duration: Option<Duration>) -> Result<usize> {
        let key = cid.key();
        let acks = self.inner.announce(key).await?;
        tracing::info!("Providing {} ({} peers stored the record)", cid, acks);

        let task = tokio::spawn(run_republish(
            Arc::downgrade(&self.inner),
            key,
            self.inner.config.republish_interval,
            duration,
        ));
        if let Some(previous) = self.inner.republish.lock().await.insert(key, task) {
            previous.abort();
        }
        Ok(acks)
    }

    /// Stop re-announcing `cid`; returns false if it was not being provided
    ///
    /// Records already stored by other peers expire on their own.
    pub async fn stop_providing(&self, cid: &ContentId) -> bool {
        let key = cid.key();
        self.inner
            .providers
            .write()
            .await
            .remove_provider(&key, &self.inner.local.peer_id);
        match self.inner.republish.lock().await.remove(&key) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Find up to `max` peers providing `cid`
    ///
    /// An empty result means no provider was found before `timeout`.
    pub async fn find_providers(
        &self,
        cid: &ContentId,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<PeerInfo>> {
        let key = cid.key();
        let mut found = self
            .inner
            .providers
            .read()
            .await
            .providers(&key, Instant::now());
        found.truncate(max);
        if found.len() >= max {
            return Ok(found);
        }

        let deadline = time::Instant::now() + timeout.min(self.inner.config.lookup_timeout);
        let outcome = self
            .inner
            .lookup(key, Query::GetProviders, max, found, deadline)
            .await;

        if outcome.providers.is_empty() && outcome.responded == 0 {
            return Err(DhtError::NoPeersReachable);
        }
        tracing::debug!(
            "Found {} providers for {} ({} peers answered)",
            outcome.providers.len(),
            cid,
            outcome.responded
        );
        Ok(outcome.providers)
    }

    /// Check that a peer answers within `ping_timeout`
    pub async fn ping(&self, peer: &PeerInfo) -> Result<()> {
        self.inner.ping(peer).await
    }

    /// Unexpired providers of `cid` held by this node
    pub async fn local_providers(&self, cid: &ContentId) -> Vec<PeerInfo> {
        self.inner
            .providers
            .read()
            .await
            .providers(&cid.key(), Instant::now())
    }

    pub async fn closest_peers(&self, target: &Key, count: usize) -> Vec<PeerInfo> {
        self.inner.routing.read().await.closest_peers(target, count)
    }

    pub async fn routing_table_size(&self) -> usize {
        self.inner.routing.read().await.len()
    }

    /// Serve DHT requests on a stream opened by `remote`
    ///
    /// Malformed frames are answered with an error response; the loop only
    /// ends when the stream closes or can no longer be framed.
    pub async fn handle_inbound<S>(&self, remote: PeerInfo, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let envelope = match codec::read_envelope(&mut stream).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e @ (tessera_core::Error::Io(_) | tessera_core::Error::FrameTooLarge { .. })) => {
                    tracing::debug!("DHT stream from {:?} closed: {}", remote.peer_id, e);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Malformed DHT message from {:?}: {}", remote.peer_id, e);
                    let code = match &e {
                        tessera_core::Error::VersionMismatch { .. } => error_codes::VERSION_MISMATCH,
                        _ => error_codes::INVALID_MESSAGE,
                    };
                    let response = proto::error_response(0, code, e.to_string())
                        .with_origin(&self.inner.local);
                    if codec::write_envelope(&mut stream, &response).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let response = self
                .inner
                .handle_request(&remote, envelope)
                .await
                .with_origin(&self.inner.local);
            if let Err(e) = codec::write_envelope(&mut stream, &response).await {
                tracing::debug!("Failed to answer {:?}: {}", remote.peer_id, e);
                break;
            }
        }
    }
}

impl<T: Transport> Inner<T> {
    /// Refresh a peer in the address book and routing table
    ///
    /// A full bucket queues a liveness check of its oldest entry.
    async fn note_contact(&self, peer: PeerInfo) {
        if peer.peer_id == self.local.peer_id {
            return;
        }
        self.addresses.write().await.add_addrs(&peer);
        let outcome = self.routing.write().await.record_contact(peer.clone());
        if let InsertOutcome::Full { oldest } = outcome {
            let challenge = Challenge {
                oldest,
                candidate: peer,
            };
            if self.challenge_tx.try_send(challenge).is_err() {
                tracing::debug!("Liveness check queue full, dropping candidate");
            }
        }
    }

    /// Count a failed exchange; an evicted peer is dropped from the address book too
    async fn note_failure(&self, peer_id: &PeerId) {
        let evicted = self.routing.write().await.record_failure(peer_id);
        if evicted {
            self.forget(peer_id).await;
        }
    }

    /// Drop the addresses of a peer we no longer route to, unless it is connected
    async fn forget(&self, peer_id: &PeerId) {
        if self.addresses.write().await.forget(peer_id) {
            tracing::debug!("Forgot addresses of {:?}", peer_id);
        }
    }

    /// Ping a full bucket's oldest entry; replace it if it does not answer
    async fn challenge(&self, challenge: Challenge) {
        let oldest_id = challenge.oldest.peer_id;
        if !self.challenged.lock().await.insert(oldest_id) {
            return;
        }
        match self.ping(&challenge.oldest).await {
            Ok(()) => {
                let candidate_id = challenge.candidate.peer_id;
                tracing::debug!("Kept {:?}, rejected {:?}", oldest_id, candidate_id);
                let routed = self.routing.read().await.get(&candidate_id).is_some();
                if !routed {
                    self.forget(&candidate_id).await;
                }
            }
            Err(e) => {
                tracing::debug!("Oldest entry {:?} unresponsive: {}", oldest_id, e);
                let mut routing = self.routing.write().await;
                // The failed ping may already have evicted it
                if !routing.replace(&oldest_id, challenge.candidate.clone()) {
                    routing.record_contact(challenge.candidate);
                }
                let gone = routing.get(&oldest_id).is_none();
                drop(routing);
                if gone {
                    self.forget(&oldest_id).await;
                }
            }
        }
        self.challenged.lock().await.remove(&oldest_id);
    }

    async fn ping(&self, peer: &PeerInfo) -> Result<()> {
        let nonce = next_request_id();
        let request = proto::ping_request(next_request_id(), nonce);
        self.request(peer, request, self.config.ping_timeout, |response| {
            match response.payload {
                Some(Payload::PingResponse(pong)) if pong.nonce == nonce => Ok(()),
                _ => Err(DhtError::MalformedMessage("unexpected ping response".to_string())),
            }
        })
        .await
    }

    /// Send one request and hand the answer to `parse`
    ///
    /// Only an answer `parse` accepts refreshes the peer in the routing
    /// table. Anything else counts as a failure.
    async fn request<R>(
        &self,
        peer: &PeerInfo,
        envelope: Envelope,
        timeout: Duration,
        parse: impl FnOnce(Envelope) -> Result<R>,
    ) -> Result<R> {
        let result = time::timeout(timeout, self.exchange(peer, envelope))
            .await
            .unwrap_or(Err(DhtError::Timeout))
            .and_then(parse);
        match &result {
            Ok(_) => self.note_contact(peer.clone()).await,
            Err(e) => {
                tracing::debug!("Request to {:?} failed: {}", peer.peer_id, e);
                self.note_failure(&peer.peer_id).await;
            }
        }
        result
    }

    async fn exchange(&self, peer: &PeerInfo, envelope: Envelope) -> Result<Envelope> {
        let request_id = envelope.request_id;
        let mut stream = self.transport.open_stream(peer, KAD_PROTOCOL).await?;
        codec::write_envelope(&mut stream, &envelope.with_origin(&self.local)).await?;
        let response = codec::read_envelope(&mut stream)
            .await?
            .ok_or(DhtError::PeerUnreachable(peer.peer_id))?;

        // Verify request ID matches
        if response.request_id != request_id {
            tracing::warn!(
                "Request ID mismatch from {:?}: expected {}, got {}",
                peer.peer_id,
                request_id,
                response.request_id
            );
        }
        if let Some(Payload::ErrorResponse(err)) = &response.payload {
            return Err(DhtError::MalformedMessage(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }
        Ok(response)
    }

    /// Iterative lookup towards `target`
    ///
    /// Answers are folded in as they arrive. Ends once every candidate in
    /// the shortlist has been queried. For [`Query::GetProviders`] it also
    /// ends as soon as `max_providers` unique providers are known. Reaching
    /// `deadline` keeps everything learned so far and abandons the queries
    /// still in flight.
    async fn lookup(
        &self,
        target: Key,
        query: Query,
        max_providers: usize,
        known_providers: Vec<PeerInfo>,
        deadline: time::Instant,
    ) -> LookupOutcome {
        let seeds = self
            .routing
            .read()
            .await
            .closest_peers(&target, self.config.k);
        let mut shortlist = Shortlist::new(target, self.config.k, self.local.peer_id, seeds);

        let mut provider_ids: HashSet<PeerId> =
            known_providers.iter().map(|p| p.peer_id).collect();
        let mut outcome = LookupOutcome {
            providers: known_providers,
            ..Default::default()
        };
        let enough = |outcome: &LookupOutcome| {
            query == Query::GetProviders && outcome.providers.len() >= max_providers
        };

        'rounds: loop {
            let round = shortlist.next_round(self.config.alpha);
            if round.is_empty() {
                break;
            }

            let mut pending: FuturesUnordered<_> = round
                .into_iter()
                .map(|peer| {
                    let request = match query {
                        Query::FindNode => {
                            proto::find_node_request(next_request_id(), target.to_vec())
                        }
                        Query::GetProviders => {
                            proto::get_providers_request(next_request_id(), target.to_vec())
                        }
                    };
                    async move {
                        let result = self
                            .request(&peer, request, self.config.query_timeout, |r| {
                                parse_lookup_response(query, r)
                            })
                            .await;
                        (peer.peer_id, result)
                    }
                })
                .collect();

            loop {
                let next = time::timeout_at(deadline, pending.next()).await;
                let (peer_id, result) = match next {
                    Ok(Some(answer)) => answer,
                    Ok(None) => break,
                    Err(_) => {
                        tracing::debug!(
                            "Lookup deadline reached with {} queries in flight",
                            pending.len()
                        );
                        break 'rounds;
                    }
                };
                match result {
                    Ok((closer, providers)) => {
                        outcome.responded += 1;
                        for provider in providers {
                            if provider_ids.insert(provider.peer_id) {
                                outcome.providers.push(provider);
                            }
                        }
                        shortlist.on_success(&peer_id, closer);
                    }
                    Err(e) => {
                        tracing::debug!("Lookup query to {:?} failed: {}", peer_id, e);
                        shortlist.on_failure(&peer_id);
                    }
                }
                if enough(&outcome) {
                    break 'rounds;
                }
            }
        }

        if query == Query::GetProviders {
            outcome.providers.truncate(max_providers);
        }
        outcome.closest = shortlist.succeeded();
        outcome
    }

    /// Store our own record and send ADD_PROVIDER to the K closest peers
    async fn announce(&self, key: Key) -> Result<usize> {
        self.providers
            .write()
            .await
            .add_provider(key, self.local.clone(), Instant::now());

        let deadline = time::Instant::now() + self.config.lookup_timeout;
        let targets = self
            .lookup(key, Query::FindNode, 0, Vec::new(), deadline)
            .await
            .closest;
        if targets.is_empty() {
            return Err(DhtError::NoPeersReachable);
        }

        let record = PeerRecord::from(&self.local);
        let sends = targets.iter().map(|peer| {
            let request = proto::add_provider_request(next_request_id(), key.to_vec(), record.clone());
            self.request(peer, request, self.config.query_timeout, |response| {
                match response.payload {
                    Some(Payload::AddProviderResponse(proto::AddProviderResponse {
                        accepted: true,
                    })) => Ok(()),
                    _ => Err(DhtError::MalformedMessage(
                        "provider record not accepted".to_string(),
                    )),
                }
            })
        });
        let acks = join_all(sends)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();

        if acks == 0 {
            return Err(DhtError::NoPeersReachable);
        }
        Ok(acks)
    }

    /// Answer one inbound request
    async fn handle_request(&self, remote: &PeerInfo, envelope: Envelope) -> Envelope {
        let request_id = envelope.request_id;
        let sender = self.sender_info(remote, envelope.origin);
        self.note_contact(sender.clone()).await;

        match envelope.payload {
            Some(Payload::FindNodeRequest(req)) => {
                let target = match proto::key_from_bytes(&req.target) {
                    Ok(target) => target,
                    Err(e) => return invalid_data(request_id, &sender, e),
                };
                tracing::debug!("FIND_NODE from {:?}", sender.peer_id);
                let peers = self.closest_records(&target, &sender.peer_id).await;
                proto::find_node_response(request_id, peers)
            }
            Some(Payload::GetProvidersRequest(req)) => {
                let key = match proto::key_from_bytes(&req.key) {
                    Ok(key) => key,
                    Err(e) => return invalid_data(request_id, &sender, e),
                };
                let providers: Vec<PeerRecord> = self
                    .providers
                    .read()
                    .await
                    .providers(&key, Instant::now())
                    .iter()
                    .map(PeerRecord::from)
                    .collect();
                tracing::debug!(
                    "GET_PROVIDERS from {:?}: {} providers",
                    sender.peer_id,
                    providers.len()
                );
                let closer_peers = self.closest_records(&key, &sender.peer_id).await;
                Envelope::new(
                    request_id,
                    Payload::GetProvidersResponse(proto::GetProvidersResponse {
                        providers,
                        closer_peers,
                    }),
                )
            }
            Some(Payload::AddProviderRequest(req)) => {
                self.handle_add_provider(request_id, &sender, req).await
            }
            Some(Payload::PingRequest(ping)) => Envelope::new(
                request_id,
                Payload::PingResponse(proto::PingResponse { nonce: ping.nonce }),
            ),
            Some(other) => {
                tracing::warn!("Unexpected DHT message from {:?}: {:?}", sender.peer_id, other);
                proto::error_response(
                    request_id,
                    error_codes::UNEXPECTED_MESSAGE,
                    "unexpected message type".to_string(),
                )
            }
            None => {
                tracing::warn!("Empty payload from {:?}", sender.peer_id);
                proto::error_response(
                    request_id,
                    error_codes::INVALID_MESSAGE,
                    "empty payload".to_string(),
                )
            }
        }
    }

    async fn handle_add_provider(
        &self,
        request_id: u64,
        sender: &PeerInfo,
        req: proto::AddProviderRequest,
    ) -> Envelope {
        let key = match proto::key_from_bytes(&req.key) {
            Ok(key) => key,
            Err(e) => return invalid_data(request_id, sender, e),
        };
        let provider = match req.provider.map(PeerInfo::try_from) {
            Some(Ok(provider)) => provider,
            Some(Err(e)) => return invalid_data(request_id, sender, e),
            None => return invalid_data(request_id, sender, "missing provider"),
        };

        // Peers may only announce themselves
        if provider.peer_id != sender.peer_id {
            tracing::warn!(
                "Rejected ADD_PROVIDER from {:?} naming {:?}",
                sender.peer_id,
                provider.peer_id
            );
            return proto::error_response(
                request_id,
                error_codes::PROVIDER_MISMATCH,
                "provider does not match sender".to_string(),
            );
        }

        let mut provider = provider;
        provider.merge_addrs(&sender.addrs);
        self.providers
            .write()
            .await
            .add_provider(key, provider, Instant::now());
        tracing::debug!("Stored provider {:?}", sender.peer_id);

        Envelope::new(
            request_id,
            Payload::AddProviderResponse(proto::AddProviderResponse { accepted: true }),
        )
    }

    /// The remote as described by the envelope origin, if it names the same peer
    fn sender_info(&self, remote: &PeerInfo, origin: Option<PeerRecord>) -> PeerInfo {
        let mut sender = remote.clone();
        match origin.map(PeerInfo::try_from) {
            Some(Ok(origin)) if origin.peer_id == remote.peer_id => {
                sender.merge_addrs(&origin.addrs);
            }
            Some(Ok(origin)) => {
                tracing::warn!(
                    "Origin {:?} does not match stream peer {:?}",
                    origin.peer_id,
                    remote.peer_id
                );
            }
            Some(Err(e)) => tracing::debug!("Ignoring bad origin record: {}", e),
            None => {}
        }
        sender
    }

    async fn closest_records(&self, target: &Key, exclude: &PeerId) -> Vec<PeerRecord> {
        self.routing
            .read()
            .await
            .closest_peers(target, self.config.k + 1)
            .iter()
            .filter(|p| &p.peer_id != exclude)
            .take(self.config.k)
            .map(PeerRecord::from)
            .collect()
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        for (_, task) in self.republish.get_mut().drain() {
            task.abort();
        }
    }
}

fn invalid_data(request_id: u64, sender: &PeerInfo, e: impl std::fmt::Display) -> Envelope {
    tracing::warn!("Invalid DHT request from {:?}: {}", sender.peer_id, e);
    proto::error_response(request_id, error_codes::INVALID_DATA, e.to_string())
}

/// Closer peers and providers carried by a lookup response
fn parse_lookup_response(query: Query, response: Envelope) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
    match (query, response.payload) {
        (Query::FindNode, Some(Payload::FindNodeResponse(resp))) => {
            Ok((proto::peer_infos(resp.peers), Vec::new()))
        }
        (Query::GetProviders, Some(Payload::GetProvidersResponse(resp))) => {
            let providers = proto::peer_infos(resp.providers)
                .into_iter()
                .filter(|p| !p.addrs.is_empty())
                .collect();
            Ok((proto::peer_infos(resp.closer_peers), providers))
        }
        _ => Err(DhtError::MalformedMessage("unexpected response type".to_string())),
    }
}

async fn run_challenges<T: Transport>(inner: Weak<Inner<T>>, mut rx: mpsc::Receiver<Challenge>) {
    while let Some(challenge) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tokio::spawn(async move { inner.challenge(challenge).await });
    }
}

async fn run_cleanup<T: Transport>(inner: Weak<Inner<T>>, period: Duration) {
    let mut ticker = time::interval(period);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let removed = inner.providers.write().await.cleanup(Instant::now());
        if removed > 0 {
            tracing::debug!("Expired {} provider records", removed);
        }
    }
}

async fn run_republish<T: Transport>(
    inner: Weak<Inner<T>>,
    key: Key,
    interval: Duration,
    duration: Option<Duration>,
) {
    let until = duration.map(|d| time::Instant::now() + d);
    loop {
        time::sleep(interval).await;
        if until.is_some_and(|until| time::Instant::now() >= until) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match inner.announce(key).await {
            Ok(acks) => tracing::debug!("Re-announced provider record to {} peers", acks),
            Err(e) => tracing::warn!("Re-announce failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::transport::memory::{MemoryNetwork, MemoryTransport};
    use tessera_core::AddressBook;

    async fn spawn_node(network: &MemoryNetwork, seed: &[u8]) -> Kademlia<MemoryTransport> {
        let transport = Arc::new(network.add_peer(PeerId::from_public_key(seed)).await);
        let addresses = AddressBook::shared(transport.local_info());
        let mut incoming = transport.incoming().unwrap();
        let dht = Kademlia::new(transport, addresses, DhtConfig::default());

        let server = dht.clone();
        tokio::spawn(async move {
            while let Some(inbound) = incoming.recv().await {
                let server = server.clone();
                tokio::spawn(async move {
                    server.handle_inbound(inbound.remote, inbound.stream).await;
                });
            }
        });
        dht
    }

    fn info<T: Transport>(dht: &Kademlia<T>) -> PeerInfo {
        dht.inner.local.clone()
    }

    #[tokio::test]
    async fn test_ping_refreshes_both_tables() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, b"a").await;
        let b = spawn_node(&network, b"b").await;

        a.ping(&info(&b)).await.unwrap();

        assert_eq!(a.routing_table_size().await, 1);
        assert_eq!(b.routing_table_size().await, 1);
    }

    #[tokio::test]
    async fn test_find_node_with_empty_table() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, b"a").await;
        let err = a.find_node([0u8; 32]).await.unwrap_err();
        assert!(matches!(err, DhtError::NoPeersReachable));
    }

    #[tokio::test]
    async fn test_add_provider_must_name_sender() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, b"a").await;
        let b = spawn_node(&network, b"b").await;

        let someone_else = PeerInfo::new(PeerId::from_public_key(b"c"), info(&a).addrs);
        let request = proto::add_provider_request(1, vec![9u8; 32], PeerRecord::from(&someone_else));
        let err = a
            .inner
            .request(&info(&b), request, Duration::from_secs(5), Ok)
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::MalformedMessage(_)));

        let request = proto::add_provider_request(2, vec![9u8; 32], PeerRecord::from(&info(&a)));
        let response = a
            .inner
            .request(&info(&b), request, Duration::from_secs(5), Ok)
            .await
            .unwrap();
        assert!(matches!(
            response.payload,
            Some(Payload::AddProviderResponse(proto::AddProviderResponse { accepted: true }))
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_response() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, b"a").await;
        let raw = network.add_peer(PeerId::from_public_key(b"raw")).await;

        let mut stream = raw.open_stream(&info(&a), KAD_PROTOCOL).await.unwrap();
        let mut bad = proto::ping_request(3, 3);
        bad.version = 42;
        codec::write_envelope(&mut stream, &bad).await.unwrap();
        let response = codec::read_envelope(&mut stream).await.unwrap().unwrap();
        assert!(matches!(
            response.payload,
            Some(Payload::ErrorResponse(proto::ErrorResponse { code: error_codes::VERSION_MISMATCH, .. }))
        ));

        // The session survives and keeps answering
        codec::write_envelope(&mut stream, &proto::ping_request(4, 7)).await.unwrap();
        let response = codec::read_envelope(&mut stream).await.unwrap().unwrap();
        assert!(matches!(
            response.payload,
            Some(Payload::PingResponse(proto::PingResponse { nonce: 7 }))
        ));
    }

    #[tokio::test]
    async fn test_ping_with_wrong_nonce_is_a_failure() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, b"a").await;
        let liar = network.add_peer(PeerId::from_public_key(b"liar")).await;
        let liar_info = liar.local_info();
        let mut incoming = liar.incoming().unwrap();
        tokio::spawn(async move {
            while let Some(mut inbound) = incoming.recv().await {
                while let Ok(Some(request)) = codec::read_envelope(&mut inbound.stream).await {
                    let nonce = match request.payload {
                        Some(Payload::PingRequest(ping)) => ping.nonce.wrapping_add(1),
                        _ => 0,
                    };
                    let response = Envelope::new(
                        request.request_id,
                        Payload::PingResponse(proto::PingResponse { nonce }),
                    );
                    if codec::write_envelope(&mut inbound.stream, &response).await.is_err() {
                        break;
                    }
                }
            }
        });

        let err = a.ping(&liar_info).await.unwrap_err();
        assert!(matches!(err, DhtError::MalformedMessage(_)));
        assert_eq!(a.routing_table_size().await, 0);
        assert!(a.inner.addresses.read().await.peer_info(&liar_info.peer_id).is_none());
    }

    #[tokio::test]
    async fn test_repeated_failures_forget_addresses() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, b"a").await;
        let b = spawn_node(&network, b"b").await;
        a.add_address(info(&b)).await;
        assert!(network.disconnect(&info(&b).addrs[0]).await);

        for _ in 0..DhtConfig::default().max_failures {
            assert!(a.ping(&info(&b)).await.is_err());
        }
        assert_eq!(a.routing_table_size().await, 0);
        assert!(a.inner.addresses.read().await.peer_info(&info(&b).peer_id).is_none());
    }

    #[tokio::test]
    async fn test_stop_providing() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, b"a").await;
        let b = spawn_node(&network, b"b").await;
        a.add_address(info(&b)).await;

        let cid = ContentId::raw(b"hello");
        assert_eq!(a.provide(&cid, None).await.unwrap(), 1);
        assert_eq!(a.local_providers(&cid).await, vec![info(&a)]);
        assert_eq!(b.local_providers(&cid).await.len(), 1);

        assert!(a.stop_providing(&cid).await);
        assert!(!a.stop_providing(&cid).await);
        assert!(a.local_providers(&cid).await.is_empty());
    }
}
