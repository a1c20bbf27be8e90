//! Gossip-backed node over `iroh` + `iroh-gossip`.
//!
//! A room channel maps to one gossip topic (SHA-256 of the channel name).
//! Bootstrap endpoints are iroh endpoint ids; dialing one opens a
//! connection to it, and subscribing joins the topic through every peer
//! dialed so far. The peer count is the neighbor set of the joined topics,
//! or the dialed peers before any topic is joined.
//!
//! One [`GossipNodeFactory`] owns the endpoint, the gossip actor and the
//! router accepting gossip connections. Nodes it creates are topic handles
//! on that shared actor, so a room switch does not rebind the endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_lite::StreamExt;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointId};
use iroh_gossip::api::{Event, GossipSender};
use iroh_gossip::{Gossip, TopicId};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::node::{NodeFactory, Protocol, PubSubNode, Subscription};
use crate::TransportError;

/// Capacity of the mpsc handed to a subscriber.
const SUBSCRIPTION_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Gossip topic for a channel name.
pub fn topic_for(channel: &str) -> TopicId {
    let digest: [u8; 32] = Sha256::digest(channel.as_bytes()).into();
    TopicId::from_bytes(digest)
}

/// Parse a bootstrap endpoint string as an iroh endpoint id.
pub fn parse_endpoint(endpoint: &str) -> Result<EndpointId, TransportError> {
    endpoint
        .trim()
        .parse::<EndpointId>()
        .map_err(|e| TransportError::Dial {
            endpoint: endpoint.to_string(),
            reason: format!("not an endpoint id: {e}"),
        })
}

// ── Factory ───────────────────────────────────────────────────────────

struct Stack {
    endpoint: Endpoint,
    gossip: Gossip,
    _router: Router,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("endpoint", &self.endpoint.id())
            .finish_non_exhaustive()
    }
}

/// [`NodeFactory`] producing [`GossipNode`]s on one iroh endpoint.
#[derive(Debug, Clone)]
pub struct GossipNodeFactory {
    stack: Arc<Stack>,
}

impl GossipNodeFactory {
    /// Spawn the gossip actor on `endpoint` and register it for incoming
    /// gossip connections. Must be called inside a tokio runtime.
    pub fn new(endpoint: Endpoint) -> Self {
        let gossip = Gossip::builder().spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(iroh_gossip::ALPN, gossip.clone())
            .spawn();
        Self {
            stack: Arc::new(Stack {
                endpoint,
                gossip,
                _router: router,
            }),
        }
    }

    /// Our own endpoint id, to hand to peers as a bootstrap entry.
    pub fn endpoint_id(&self) -> EndpointId {
        self.stack.endpoint.id()
    }
}

#[async_trait::async_trait]
impl NodeFactory for GossipNodeFactory {
    async fn create(&self) -> Result<Arc<dyn PubSubNode>, TransportError> {
        Ok(Arc::new(GossipNode::new(self.stack.clone())))
    }
}

// ── Node ──────────────────────────────────────────────────────────────

struct Topic {
    sender: GossipSender,
    neighbors: Arc<Mutex<HashSet<EndpointId>>>,
    cancel: CancellationToken,
}

/// A room-scoped handle on the shared gossip actor.
pub struct GossipNode {
    stack: Arc<Stack>,
    dialed: Mutex<Vec<EndpointId>>,
    topics: Mutex<HashMap<String, Topic>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for GossipNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipNode")
            .field("dialed", &lock(&self.dialed).len())
            .field("topics", &lock(&self.topics).len())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl GossipNode {
    fn new(stack: Arc<Stack>) -> Self {
        Self {
            stack,
            dialed: Mutex::new(Vec::new()),
            topics: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        Ok(())
    }

    fn drop_topic(&self, channel: &str) {
        if let Some(topic) = lock(&self.topics).remove(channel) {
            topic.cancel.cancel();
        }
    }
}

#[async_trait::async_trait]
impl PubSubNode for GossipNode {
    async fn dial(&self, endpoint: &str) -> Result<(), TransportError> {
        self.ensure_running()?;
        let id = parse_endpoint(endpoint)?;
        if id == self.stack.endpoint.id() {
            return Err(TransportError::Dial {
                endpoint: endpoint.to_string(),
                reason: "refusing to dial ourselves".into(),
            });
        }
        let _conn = self
            .stack
            .endpoint
            .connect(id, iroh_gossip::ALPN)
            .await
            .map_err(|e| TransportError::Dial {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let mut dialed = lock(&self.dialed);
        if !dialed.contains(&id) {
            dialed.push(id);
        }
        tracing::debug!(endpoint, "gossip node dialed");
        Ok(())
    }

    /// Gossip carries both push and subscription over the same connection,
    /// so one reachable peer is enough.
    async fn wait_for_protocols(&self, protocols: &[Protocol]) -> Result<(), TransportError> {
        self.ensure_running()?;
        if protocols.is_empty() || !lock(&self.dialed).is_empty() {
            return Ok(());
        }
        Err(TransportError::ProtocolUnavailable(
            "no gossip peer dialed".into(),
        ))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        self.ensure_running()?;
        self.drop_topic(channel);

        let bootstrap = lock(&self.dialed).clone();
        let topic = self
            .stack
            .gossip
            .subscribe(topic_for(channel), bootstrap)
            .await
            .map_err(|e| TransportError::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        let (sender, mut receiver) = topic.split();

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let neighbors = Arc::new(Mutex::new(HashSet::new()));
        let cancel = CancellationToken::new();

        let name = channel.to_string();
        let seen = neighbors.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.next() => event,
                };
                match event {
                    Some(Ok(Event::Received(message))) => {
                        if tx.send(message.content.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Event::NeighborUp(id))) => {
                        lock(&seen).insert(id);
                    }
                    Some(Ok(Event::NeighborDown(id))) => {
                        lock(&seen).remove(&id);
                    }
                    Some(Ok(Event::Lagged)) => {
                        tracing::warn!(channel = %name, "gossip subscription lagged");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(channel = %name, "gossip subscription failed: {e}");
                        break;
                    }
                    None => break,
                }
            }
            lock(&seen).clear();
        });

        lock(&self.topics).insert(
            channel.to_string(),
            Topic {
                sender,
                neighbors,
                cancel,
            },
        );
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.drop_topic(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_running()?;
        let sender = lock(&self.topics)
            .get(channel)
            .map(|topic| topic.sender.clone())
            .ok_or_else(|| TransportError::Publish {
                channel: channel.to_string(),
                reason: "not subscribed".into(),
            })?;
        sender
            .broadcast(Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| TransportError::Publish {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn peer_count(&self) -> usize {
        if self.stopped.load(Ordering::SeqCst) {
            return 0;
        }
        let topics = lock(&self.topics);
        if topics.is_empty() {
            return lock(&self.dialed).len();
        }
        let mut peers = HashSet::new();
        for topic in topics.values() {
            peers.extend(lock(&topic.neighbors).iter().copied());
        }
        peers.len()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let channels: Vec<String> = lock(&self.topics).keys().cloned().collect();
        for channel in channels {
            self.drop_topic(&channel);
        }
        lock(&self.dialed).clear();
    }
}
