//! The tolliver instance: the embedder facing surface, backed by the
//! accept loop, the per-connection read loops, and the retry loop.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_tls::{TlsAcceptor, TlsConnector};
use futures::io::{AsyncReadExt, ReadHalf};
use futures::lock::Mutex;
use futures_timer::Delay;
use tracing::{debug, error, trace, warn};

use crate::communication::handshake;
use crate::communication::message::{
    self,
    ControlOp,
    FrameTag,
    Reader,
    RegularMessage,
    ACK_SUCCESS,
    CONTROL_CHANNEL,
    CURRENT_VERSION,
    UNRELIABLE_MESSAGE_ID,
};
use crate::communication::socket::{self, Listener, Transport};
use crate::communication::{ConnectionRegistry, NodeId, PeerConnection, Subscription};
use crate::config::InstanceConfig;
use crate::error::*;
use crate::ledger::Ledger;
use crate::router::CallbackTable;

/// A participant in the fabric: simultaneously a client and a server,
/// holding one long-lived connection per peer.
///
/// `Instance` is a cheap handle; clones share the same underlying
/// state. It must be created from within a tokio runtime, which hosts
/// its background tasks.
#[derive(Clone)]
pub struct Instance {
    shared: Arc<Shared>,
}

#[derive(Copy, Clone)]
enum Role {
    Dialer,
    Acceptor,
}

struct Shared {
    id: NodeId,
    registry: ConnectionRegistry,
    ledger: Ledger,
    callbacks: CallbackTable,
    // the async mutex serializes concurrent subscribes so each
    // broadcast observes a consistent list
    subscriptions: Mutex<Vec<Subscription>>,
    connector: TlsConnector,
    local_addr: Option<SocketAddr>,
}

impl Instance {
    /// Bootstraps an instance: opens the ledger (minting the node id on
    /// first start), binds the listener unless configured client-only,
    /// starts the retry loop, and dials every configured remote.
    ///
    /// Failures to dial configured remotes are logged, not fatal; the
    /// embedder can dial again with [`Instance::new_connection`].
    pub async fn new(config: InstanceConfig) -> Result<Instance> {
        let (client_config, server_config) = config.tls_configs()?;
        let connector: TlsConnector = client_config.into();
        let acceptor: TlsAcceptor = server_config.into();

        let (ledger, id) = Ledger::open(&config.ledger_path)?;

        let listener = match config.listen {
            Some(addr) => Some(
                socket::bind(addr)
                    .await
                    .wrapped_msg(ErrorKind::Communication, &format!("binding {}", addr))?,
            ),
            None => None,
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr().wrapped(ErrorKind::Communication)?),
            None => None,
        };

        let shared = Arc::new(Shared {
            id,
            registry: ConnectionRegistry::new(),
            ledger,
            callbacks: CallbackTable::new(),
            subscriptions: Mutex::new(Vec::new()),
            connector,
            local_addr,
        });

        if let Some(listener) = listener {
            tokio::spawn(Shared::accept_loop(
                Arc::downgrade(&shared),
                listener,
                acceptor,
            ));
        }
        tokio::spawn(Shared::retry_loop(
            Arc::downgrade(&shared),
            config.retry_interval,
        ));

        let instance = Instance { shared };
        for (addr, server_name) in &config.peers {
            if let Err(e) = instance.new_connection(*addr, server_name).await {
                warn!(address = %addr, error = %e, "failed to dial configured remote");
            }
        }
        Ok(instance)
    }

    /// The persistent identity of this instance.
    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// The address the listener is bound on, if any. Useful when
    /// configured with an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Dials a remote, runs the TLS and tolliver handshakes, and
    /// registers the resulting connection.
    pub async fn new_connection(&self, addr: SocketAddr, server_name: &str) -> Result<NodeId> {
        let sock = socket::connect(addr)
            .await
            .wrapped_msg(ErrorKind::Dial, &format!("dialing {}", addr))?;
        let stream = self
            .shared
            .connector
            .connect(server_name, sock)
            .await
            .wrapped_msg(ErrorKind::Dial, &format!("tls session with {}", addr))?;
        self.shared.clone().establish(Box::new(stream), Role::Dialer).await
    }

    /// Declares interest in `(channel, key)` and announces it to every
    /// connected peer. The reserved control channel cannot be
    /// subscribed to.
    ///
    /// The subscription lives for the lifetime of the instance only; it
    /// is re-announced inside the handshake of every new connection.
    pub async fn subscribe(&self, channel: &str, key: &str) -> Result<()> {
        reject_reserved(channel)?;
        let mut subs = self.shared.subscriptions.lock().await;
        let sub = Subscription::new(channel, key);
        if subs.contains(&sub) {
            return Ok(());
        }
        subs.push(sub.clone());
        self.shared
            .broadcast_control(ControlOp::Subscribe, &[sub])
            .await;
        Ok(())
    }

    /// Withdraws a previous subscription and announces the withdrawal.
    pub async fn unsubscribe(&self, channel: &str, key: &str) -> Result<()> {
        reject_reserved(channel)?;
        let mut subs = self.shared.subscriptions.lock().await;
        let sub = Subscription::new(channel, key);
        let before = subs.len();
        subs.retain(|existing| *existing != sub);
        if subs.len() == before {
            return Ok(());
        }
        self.shared
            .broadcast_control(ControlOp::Unsubscribe, &[sub])
            .await;
        Ok(())
    }

    /// Registers a callback invoked with the body of every incoming
    /// message matching the `(channel, key)` pattern. Empty strings are
    /// wildcards. Several callbacks may share one pattern.
    pub fn register<F>(&self, channel: &str, key: &str, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.shared.callbacks.register(channel, key, Arc::new(callback));
    }

    /// Publishes `body` on `(channel, key)` with at-least-once
    /// semantics, returning the assigned message id.
    ///
    /// The message and one delivery row per subscribed peer are
    /// persisted before anything is written to the network; peers that
    /// are currently unreachable receive the message from the retry
    /// loop once they reconnect.
    pub async fn send(&self, channel: &str, key: &str, body: &[u8]) -> Result<u64> {
        let shared = &self.shared;
        let recipients = shared.ledger.subscribers_for(channel, key)?;
        let message_id = shared.ledger.save_message(channel, key, body, &recipients)?;

        let frame = message::encode_regular(message_id, channel, key, body);
        for recipient in &recipients {
            if let Some(conn) = shared.registry.get(*recipient) {
                if let Err(e) = conn.write_frame(&frame).await {
                    debug!(
                        peer = %recipient,
                        error = %e,
                        "initial delivery failed, leaving it to the retry loop"
                    );
                }
            }
        }
        Ok(message_id)
    }

    /// Publishes `body` on `(channel, key)` best-effort: nothing is
    /// persisted, no acknowledgement is expected, and peers that are
    /// unreachable right now never see the message.
    pub async fn unreliable_send(&self, channel: &str, key: &str, body: &[u8]) -> Result<()> {
        let shared = &self.shared;
        let recipients = shared.ledger.subscribers_for(channel, key)?;
        let frame = message::encode_regular(UNRELIABLE_MESSAGE_ID, channel, key, body);
        for recipient in &recipients {
            if let Some(conn) = shared.registry.get(*recipient) {
                if let Err(e) = conn.write_frame(&frame).await {
                    debug!(peer = %recipient, error = %e, "unreliable send failed");
                }
            }
        }
        Ok(())
    }
}

impl Shared {
    /// Completes a fresh transport into a registered peer connection:
    /// runs the handshake, inserts into the registry, replaces the
    /// peer's subscriber rows with the announced snapshot, and spawns
    /// the connection's read task.
    async fn establish(self: Arc<Self>, transport: Transport, role: Role) -> Result<NodeId> {
        let (read, mut sink) = transport.split();
        let mut reader = Reader::new(read);

        let local_subs = self.subscriptions.lock().await.clone();
        let peer = match role {
            Role::Dialer => {
                handshake::dial(&mut reader, &mut sink, CURRENT_VERSION, self.id, &local_subs)
                    .await?
            }
            Role::Acceptor => {
                handshake::accept(&mut reader, &mut sink, CURRENT_VERSION, self.id, &local_subs)
                    .await?
            }
        };

        if peer.id == self.id {
            return Err(Error::wrapped(
                ErrorKind::DuplicatePeer,
                "handshake completed against our own node id",
            ));
        }

        let conn = Arc::new(PeerConnection::new(
            peer.id,
            peer.subscriptions.clone(),
            sink,
        ));
        self.registry.insert(conn.clone()).map_err(|e| {
            warn!(peer = %peer.id, "rejecting duplicate connection");
            e
        })?;
        if let Err(e) = self
            .ledger
            .replace_subscriber_snapshot(peer.id, &peer.subscriptions)
        {
            self.registry.remove(peer.id);
            return Err(e);
        }

        debug!(peer = %peer.id, "peer connection established");
        tokio::spawn(self.clone().read_loop(conn, reader));
        Ok(peer.id)
    }

    /// The per-connection frame loop. Ends silently on transport or
    /// protocol errors, removing the peer from the registry; the retry
    /// loop covers anything undelivered once the peer reconnects.
    async fn read_loop(
        self: Arc<Self>,
        conn: Arc<PeerConnection>,
        mut reader: Reader<ReadHalf<Transport>>,
    ) {
        let peer = conn.id();
        loop {
            let tag = match reader.read_tag().await {
                Ok(tag) => tag,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "connection closed");
                    break;
                }
            };
            let handled = match tag {
                FrameTag::Regular => self.handle_regular(&conn, &mut reader).await,
                FrameTag::Ack => self.handle_ack(&conn, &mut reader).await,
                tag => {
                    debug!(peer = %peer, ?tag, "handshake frame in the message loop");
                    break;
                }
            };
            if let Err(e) = handled {
                debug!(peer = %peer, error = %e, "tearing down connection");
                break;
            }
        }
        self.registry.remove(peer);
    }

    async fn handle_regular(
        &self,
        conn: &Arc<PeerConnection>,
        reader: &mut Reader<ReadHalf<Transport>>,
    ) -> Result<()> {
        let msg = reader.read_regular().await?;

        let accepted = if msg.channel == CONTROL_CHANNEL {
            self.handle_control(conn, &msg)
        } else {
            self.dispatch(&msg);
            true
        };

        if accepted && msg.message_id != UNRELIABLE_MESSAGE_ID {
            let ack = message::encode_ack(ACK_SUCCESS, msg.message_id);
            conn.write_frame(&ack).await?;
        }
        Ok(())
    }

    /// Applies a subscription notice from the control channel to the
    /// peer's in-memory set and to the subscriber rows in the ledger.
    /// A body whose encoded length disagrees with the frame is dropped
    /// without tearing the connection down, and is not acknowledged.
    fn handle_control(&self, conn: &Arc<PeerConnection>, msg: &RegularMessage) -> bool {
        let control = match message::decode_control(&msg.body) {
            Ok(control) => control,
            Err(e) => {
                warn!(peer = %conn.id(), error = %e, "dropping malformed control message");
                return false;
            }
        };

        let persisted = match control.op {
            ControlOp::Subscribe => {
                conn.add_subscriptions(&control.subscriptions);
                control.subscriptions.iter().try_for_each(|sub| {
                    self.ledger
                        .record_subscriber(&sub.channel, &sub.key, conn.id())
                })
            }
            ControlOp::Unsubscribe => {
                conn.remove_subscriptions(&control.subscriptions);
                control.subscriptions.iter().try_for_each(|sub| {
                    self.ledger
                        .forget_subscriber(&sub.channel, &sub.key, conn.id())
                })
            }
        };
        if let Err(e) = persisted {
            error!(peer = %conn.id(), error = %e, "failed to persist subscription change");
        }
        true
    }

    /// Invokes every registered callback matching the message topic.
    /// Callback panics are caught and logged; they never abort the
    /// read loop.
    fn dispatch(&self, msg: &RegularMessage) {
        for callback in self.callbacks.matching(&msg.channel, &msg.key) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&msg.body)));
            if outcome.is_err() {
                error!(
                    channel = %msg.channel,
                    key = %msg.key,
                    "message callback panicked"
                );
            }
        }
    }

    async fn handle_ack(
        &self,
        conn: &Arc<PeerConnection>,
        reader: &mut Reader<ReadHalf<Transport>>,
    ) -> Result<()> {
        let ack = reader.read_ack().await?;
        // anything but a successful ack of a reliable id is dropped
        if ack.status != ACK_SUCCESS || ack.message_id == UNRELIABLE_MESSAGE_ID {
            return Ok(());
        }
        if let Err(e) = self.ledger.ack(ack.message_id, conn.id()) {
            error!(peer = %conn.id(), error = %e, "failed to clear acknowledged delivery");
        }
        Ok(())
    }

    /// Announces a local subscription change to every connected peer.
    /// Announcements are best-effort: a peer that misses one learns the
    /// full set in its next handshake.
    async fn broadcast_control(&self, op: ControlOp, subs: &[Subscription]) {
        let body = message::encode_control(op, subs);
        let frame = message::encode_regular(UNRELIABLE_MESSAGE_ID, CONTROL_CHANNEL, "", &body);
        for conn in self.registry.all() {
            if let Err(e) = conn.write_frame(&frame).await {
                debug!(peer = %conn.id(), error = %e, "failed to announce subscription change");
            }
        }
    }

    async fn accept_loop(shared: Weak<Shared>, listener: Listener, acceptor: TlsAcceptor) {
        loop {
            let sock = match listener.accept().await {
                Ok(sock) => sock,
                Err(e) => {
                    debug!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => break,
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(sock).await {
                    Ok(stream) => {
                        if let Err(e) = shared.establish(Box::new(stream), Role::Acceptor).await {
                            debug!(error = %e, "inbound connection failed");
                        }
                    }
                    Err(e) => debug!(error = %e, "inbound tls session failed"),
                }
            });
        }
    }

    /// Wakes every `interval` and re-sends each outstanding delivery
    /// whose recipient is currently connected. Rows are only ever
    /// removed by incoming acks, so receivers may observe duplicates.
    async fn retry_loop(shared: Weak<Shared>, interval: Duration) {
        loop {
            Delay::new(interval).await;
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => break,
            };
            let pending = match shared.ledger.pending_deliveries() {
                Ok(pending) => pending,
                Err(e) => {
                    error!(error = %e, "failed to read outstanding deliveries");
                    continue;
                }
            };
            for delivery in pending {
                let conn = match shared.registry.get(delivery.recipient) {
                    Some(conn) => conn,
                    None => continue,
                };
                trace!(
                    peer = %delivery.recipient,
                    message_id = delivery.message_id,
                    "re-sending unacknowledged delivery"
                );
                let frame = message::encode_regular(
                    delivery.message_id,
                    &delivery.channel,
                    &delivery.key,
                    &delivery.body,
                );
                if let Err(e) = conn.write_frame(&frame).await {
                    debug!(peer = %delivery.recipient, error = %e, "re-send failed");
                }
            }
        }
    }
}

fn reject_reserved(channel: &str) -> Result<()> {
    if channel == CONTROL_CHANNEL {
        return Err(Error::wrapped(
            ErrorKind::ReservedChannel,
            format!("the \"{}\" channel is reserved", CONTROL_CHANNEL),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use parking_lot::Mutex as SyncMutex;
    use rustls::ClientConfig;
    use tempfile::TempDir;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use crate::config;

    /// An instance wired for in-memory transports: no listener, no real
    /// TLS, a fast retry loop.
    fn test_instance(dir: &TempDir, name: &str) -> Instance {
        let (ledger, id) = Ledger::open(&dir.path().join(format!("{}.sqlite", name))).unwrap();
        let shared = Arc::new(Shared {
            id,
            registry: ConnectionRegistry::new(),
            ledger,
            callbacks: CallbackTable::new(),
            subscriptions: Mutex::new(Vec::new()),
            connector: TlsConnector::from(ClientConfig::new()),
            local_addr: None,
        });
        tokio::spawn(Shared::retry_loop(
            Arc::downgrade(&shared),
            Duration::from_millis(50),
        ));
        Instance { shared }
    }

    /// Connects two instances over an in-memory duplex pipe, running
    /// the full handshake on both sides.
    async fn link(dialer: &Instance, acceptor: &Instance) {
        let (dialed, accepted) = try_link(dialer, acceptor).await;
        dialed.unwrap();
        accepted.unwrap();
    }

    async fn try_link(dialer: &Instance, acceptor: &Instance) -> (Result<NodeId>, Result<NodeId>) {
        let (da, ab) = tokio::io::duplex(64 * 1024);
        let dial_side: Transport = Box::new(da.compat());
        let accept_side: Transport = Box::new(ab.compat());
        futures::join!(
            dialer.shared.clone().establish(dial_side, Role::Dialer),
            acceptor.shared.clone().establish(accept_side, Role::Acceptor),
        )
    }

    fn sever(a: &Instance, b: &Instance) {
        a.shared.registry.remove(b.id()).unwrap();
        b.shared.registry.remove(a.id()).unwrap();
    }

    fn collector(instance: &Instance, channel: &str, key: &str) -> Arc<SyncMutex<Vec<Vec<u8>>>> {
        let received = Arc::new(SyncMutex::new(Vec::new()));
        let sink = received.clone();
        instance.register(channel, key, move |body| sink.lock().push(body.to_vec()));
        received
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn await_subscriber(publisher: &Instance, channel: &str, key: &str, peer: NodeId) {
        let ledger = &publisher.shared.ledger;
        eventually("subscription to propagate", || {
            ledger.subscribers_for(channel, key).unwrap().contains(&peer)
        })
        .await;
    }

    #[tokio::test]
    async fn happy_path_delivery_and_ack() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");
        let received = collector(&b, "test", "key");

        link(&a, &b).await;
        b.subscribe("test", "key").await.unwrap();
        await_subscriber(&a, "test", "key", b.id()).await;

        let message_id = a.send("test", "key", b"Hello World!").await.unwrap();
        assert!(message_id >= 1);

        eventually("delivery", || !received.lock().is_empty()).await;
        assert_eq!(received.lock()[0], b"Hello World!");

        eventually("ack to clear the ledger", || {
            a.shared.ledger.pending_deliveries().unwrap().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn wildcard_subscription_fans_out() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");
        let received = collector(&b, "ch", "");

        link(&a, &b).await;
        b.subscribe("ch", "").await.unwrap();
        await_subscriber(&a, "ch", "k1", b.id()).await;

        a.send("ch", "k1", b"first").await.unwrap();
        a.send("ch", "k2", b"second").await.unwrap();

        eventually("both deliveries", || received.lock().len() >= 2).await;
        let bodies = received.lock();
        assert!(bodies.contains(&b"first".to_vec()));
        assert!(bodies.contains(&b"second".to_vec()));
    }

    #[tokio::test]
    async fn handshake_snapshot_announces_subscriptions() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");
        let received = collector(&b, "test", "key");

        // subscribed before any connection exists; the snapshot rides
        // in the handshake
        b.subscribe("test", "key").await.unwrap();
        link(&a, &b).await;

        assert!(a
            .shared
            .ledger
            .subscribers_for("test", "key")
            .unwrap()
            .contains(&b.id()));

        a.send("test", "key", b"snapshotted").await.unwrap();
        eventually("delivery", || !received.lock().is_empty()).await;
    }

    #[tokio::test]
    async fn retry_redelivers_once_the_peer_reconnects() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");
        let received = collector(&b, "test", "");

        link(&a, &b).await;
        b.subscribe("test", "").await.unwrap();
        await_subscriber(&a, "test", "k", b.id()).await;
        sever(&a, &b);

        // published into the void: the row is recorded, nothing is live
        a.send("test", "k", b"redelivered").await.unwrap();
        assert_eq!(a.shared.ledger.pending_deliveries().unwrap().len(), 1);

        link(&a, &b).await;
        eventually("retry delivery", || !received.lock().is_empty()).await;
        assert_eq!(received.lock()[0], b"redelivered");
        eventually("row to clear", || {
            a.shared.ledger.pending_deliveries().unwrap().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn unreliable_send_is_fire_and_forget() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");
        let received = collector(&b, "test", "key");

        link(&a, &b).await;
        b.subscribe("test", "key").await.unwrap();
        await_subscriber(&a, "test", "key", b.id()).await;
        sever(&a, &b);

        a.unreliable_send("test", "key", b"lost").await.unwrap();
        assert!(a.shared.ledger.pending_deliveries().unwrap().is_empty());

        // even after reconnecting, nothing is ever re-sent
        link(&a, &b).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(received.lock().is_empty());
    }

    #[tokio::test]
    async fn reserved_channel_is_rejected() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");

        let err = a.subscribe(CONTROL_CHANNEL, "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReservedChannel);
        assert!(a.shared.subscriptions.lock().await.is_empty());

        let err = a.unsubscribe(CONTROL_CHANNEL, "key").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReservedChannel);
    }

    #[tokio::test]
    async fn unsubscribe_stops_routing() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");

        link(&a, &b).await;
        b.subscribe("test", "key").await.unwrap();
        await_subscriber(&a, "test", "key", b.id()).await;

        b.unsubscribe("test", "key").await.unwrap();
        let ledger = &a.shared.ledger;
        eventually("withdrawal to propagate", || {
            ledger.subscribers_for("test", "key").unwrap().is_empty()
        })
        .await;

        // no recipients, so nothing outstanding
        a.send("test", "key", b"to nobody").await.unwrap();
        assert!(a.shared.ledger.pending_deliveries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_connection_is_rejected() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");

        link(&a, &b).await;
        let (dialed, accepted) = try_link(&a, &b).await;
        assert_eq!(dialed.unwrap_err().kind(), ErrorKind::DuplicatePeer);
        assert_eq!(accepted.unwrap_err().kind(), ErrorKind::DuplicatePeer);

        assert_eq!(a.shared.registry.len(), 1);
        assert_eq!(b.shared.registry.len(), 1);
    }

    #[tokio::test]
    async fn connecting_to_ourselves_is_rejected() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");

        let (dialed, accepted) = try_link(&a, &a).await;
        assert_eq!(dialed.unwrap_err().kind(), ErrorKind::DuplicatePeer);
        assert_eq!(accepted.unwrap_err().kind(), ErrorKind::DuplicatePeer);
        assert!(a.shared.registry.is_empty());
    }

    #[tokio::test]
    async fn callback_panic_does_not_kill_the_read_loop() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");
        let b = test_instance(&dir, "b");

        b.register("test", "", |_| panic!("boom"));
        let received = collector(&b, "test", "");

        link(&a, &b).await;
        b.subscribe("test", "").await.unwrap();
        await_subscriber(&a, "test", "k", b.id()).await;

        a.send("test", "k", b"one").await.unwrap();
        a.send("test", "k", b"two").await.unwrap();

        eventually("both deliveries despite the panics", || {
            received.lock().len() >= 2
        })
        .await;
    }

    fn tls_config(dir: &TempDir, name: &str) -> InstanceConfig {
        let base = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/certs");
        let ca = config::load_certs(&base.join("ca.pem")).unwrap();
        let chain = config::load_certs(&base.join("instance.pem")).unwrap();
        let key = config::load_private_key(&base.join("instance.key")).unwrap();

        let mut cfg = InstanceConfig::new(ca, chain, key);
        cfg.ledger_path = dir.path().join(format!("{}.sqlite", name));
        cfg.retry_interval = Duration::from_millis(50);
        cfg.listen = None;
        cfg
    }

    #[tokio::test]
    async fn tls_loopback_round_trip() {
        let dir = TempDir::new().unwrap();

        let mut server_cfg = tls_config(&dir, "server");
        server_cfg.listen = Some(([127, 0, 0, 1], 0).into());
        let server = Instance::new(server_cfg).await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = Instance::new(tls_config(&dir, "client")).await.unwrap();
        let received = collector(&client, "test", "key");

        let peer = client.new_connection(addr, "localhost").await.unwrap();
        assert_eq!(peer, server.id());

        client.subscribe("test", "key").await.unwrap();
        await_subscriber(&server, "test", "key", client.id()).await;

        server.send("test", "key", b"over tls").await.unwrap();
        eventually("delivery", || !received.lock().is_empty()).await;
        assert_eq!(received.lock()[0], b"over tls");

        eventually("ack to clear the ledger", || {
            server.shared.ledger.pending_deliveries().unwrap().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn dial_failure_surfaces_as_dial_error() {
        let dir = TempDir::new().unwrap();
        let a = test_instance(&dir, "a");

        // nothing listens on port 1
        let err = a
            .new_connection(([127, 0, 0, 1], 1).into(), "localhost")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dial);
    }
}
