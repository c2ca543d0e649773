//! Communication primitives for `tolliver`: node identity, peer
//! connections, and the registry of live peers.

pub mod handshake;
pub mod message;
pub mod socket;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::io::{AsyncWriteExt, WriteHalf};
use futures::lock::Mutex;
use parking_lot::{Mutex as SyncMutex, RwLock};
use uuid::Uuid;

use crate::communication::socket::Transport;
use crate::error::*;

/// A `NodeId` uniquely identifies an instance in the fabric.
///
/// Minted once on first start and persisted in the ledger, so it is
/// stable across restarts.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct NodeId([u8; NodeId::LENGTH]);

impl NodeId {
    /// The size of the raw representation of a `NodeId` in bytes.
    pub const LENGTH: usize = 16;

    /// Mints a fresh, time-ordered node id.
    pub fn generate() -> Self {
        NodeId(Uuid::now_v7().into_bytes())
    }

    pub fn from_bytes(raw: [u8; Self::LENGTH]) -> Self {
        NodeId(raw)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl From<Uuid> for NodeId {
    #[inline]
    fn from(id: Uuid) -> NodeId {
        NodeId(id.into_bytes())
    }
}

impl From<NodeId> for Uuid {
    #[inline]
    fn from(id: NodeId) -> Uuid {
        Uuid::from_bytes(id.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", Uuid::from_bytes(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0), f)
    }
}

/// A declared interest in a (channel, key) topic.
///
/// An empty string in either component is a wildcard for that
/// component.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Subscription {
    pub channel: String,
    pub key: String,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, key: impl Into<String>) -> Self {
        Subscription {
            channel: channel.into(),
            key: key.into(),
        }
    }

    /// Whether this subscription matches the concrete topic
    /// `(channel, key)`.
    pub fn matches(&self, channel: &str, key: &str) -> bool {
        (self.channel.is_empty() || self.channel == channel)
            && (self.key.is_empty() || self.key == key)
    }
}

/// A live, handshake-completed connection to a peer instance.
///
/// Holds the write half of the transport; the read half is owned by the
/// connection's dedicated read task. At most one `PeerConnection` exists
/// per peer node id.
pub struct PeerConnection {
    id: NodeId,
    subscriptions: SyncMutex<Vec<Subscription>>,
    sink: Mutex<WriteHalf<Transport>>,
}

impl PeerConnection {
    pub fn new(id: NodeId, subscriptions: Vec<Subscription>, sink: WriteHalf<Transport>) -> Self {
        PeerConnection {
            id,
            subscriptions: SyncMutex::new(subscriptions),
            sink: Mutex::new(sink),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Writes a full frame to the peer, looping until the kernel has
    /// accepted every byte.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.write_all(frame).await?;
        sink.flush().await?;
        Ok(())
    }

    /// A snapshot of the peer's current subscription set.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().clone()
    }

    pub fn add_subscriptions(&self, subs: &[Subscription]) {
        let mut current = self.subscriptions.lock();
        for sub in subs {
            if !current.contains(sub) {
                current.push(sub.clone());
            }
        }
    }

    pub fn remove_subscriptions(&self, subs: &[Subscription]) {
        let mut current = self.subscriptions.lock();
        current.retain(|sub| !subs.contains(sub));
    }
}

/// The table of live peer connections, keyed by peer node id.
///
/// Routing takes the read lock; connection setup and teardown take the
/// write lock.
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<NodeId, Arc<PeerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a fresh connection. If a connection for the same peer
    /// is already present the new one is rejected and the original kept.
    //
    // TODO: revisit whether replacing the registered connection is the
    // better policy, on the grounds that the older one is likely stale.
    pub fn insert(&self, conn: Arc<PeerConnection>) -> Result<()> {
        let mut peers = self.peers.write();
        if peers.contains_key(&conn.id()) {
            return Err(Error::wrapped(
                ErrorKind::DuplicatePeer,
                format!("peer {} is already connected", conn.id()),
            ));
        }
        peers.insert(conn.id(), conn);
        Ok(())
    }

    pub fn remove(&self, id: NodeId) -> Option<Arc<PeerConnection>> {
        self.peers.write().remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(&id).cloned()
    }

    /// A snapshot of every live connection.
    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
