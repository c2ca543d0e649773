//! The durable ledger backing at-least-once delivery: the local node
//! identity, per-peer subscriber rows, and outstanding message
//! deliveries.

use std::convert::TryInto;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::communication::{NodeId, Subscription};
use crate::error::*;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS instance (
    uuid BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS subscription (
    channel TEXT NOT NULL,
    key     TEXT NOT NULL,
    peer_id BLOB NOT NULL,
    UNIQUE (channel, key, peer_id)
);
CREATE TABLE IF NOT EXISTS message (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    key     TEXT NOT NULL,
    data    BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS delivery (
    message_id   INTEGER NOT NULL,
    recipient_id BLOB NOT NULL,
    UNIQUE (message_id, recipient_id)
);
";

/// One outstanding delivery, joined with the message it belongs to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingDelivery {
    pub recipient: NodeId,
    pub message_id: u64,
    pub channel: String,
    pub key: String,
    pub body: Vec<u8>,
}

/// Handle to the persistent store. All access funnels through one
/// connection behind a mutex.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Opens the ledger at `path`, creating the schema if absent, and
    /// returns it together with the local node id. A fresh id is minted
    /// and persisted on first start; afterwards the stored one is
    /// returned unchanged.
    pub fn open(path: &Path) -> Result<(Self, NodeId)> {
        let conn = Connection::open(path).wrapped(ErrorKind::Ledger)?;
        conn.execute_batch(SCHEMA).wrapped(ErrorKind::Ledger)?;
        let id = Self::load_or_mint_id(&conn)?;
        Ok((
            Ledger {
                conn: Mutex::new(conn),
            },
            id,
        ))
    }

    fn load_or_mint_id(conn: &Connection) -> Result<NodeId> {
        let stored: Option<Vec<u8>> = conn
            .query_row("SELECT uuid FROM instance", [], |row| row.get(0))
            .optional()
            .wrapped(ErrorKind::Ledger)?;
        match stored {
            Some(raw) => {
                let raw: [u8; NodeId::LENGTH] = raw
                    .try_into()
                    .simple_msg(ErrorKind::Ledger, "stored node id has the wrong width")?;
                Ok(NodeId::from_bytes(raw))
            }
            None => {
                let id = NodeId::generate();
                conn.execute(
                    "INSERT INTO instance (uuid) VALUES (?1)",
                    params![&id.as_bytes()[..]],
                )
                .wrapped(ErrorKind::Ledger)?;
                Ok(id)
            }
        }
    }

    /// Records that `peer` is subscribed to `(channel, key)`. Inserting
    /// an existing row is a no-op.
    pub fn record_subscriber(&self, channel: &str, key: &str, peer: NodeId) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO subscription (channel, key, peer_id) VALUES (?1, ?2, ?3)",
                params![channel, key, &peer.as_bytes()[..]],
            )
            .wrapped(ErrorKind::Ledger)?;
        Ok(())
    }

    pub fn forget_subscriber(&self, channel: &str, key: &str, peer: NodeId) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM subscription WHERE channel = ?1 AND key = ?2 AND peer_id = ?3",
                params![channel, key, &peer.as_bytes()[..]],
            )
            .wrapped(ErrorKind::Ledger)?;
        Ok(())
    }

    /// Replaces everything known about `peer`'s subscriptions with the
    /// snapshot it announced in a fresh handshake, so interests dropped
    /// while disconnected do not linger.
    pub fn replace_subscriber_snapshot(&self, peer: NodeId, subs: &[Subscription]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().wrapped(ErrorKind::Ledger)?;
        tx.execute(
            "DELETE FROM subscription WHERE peer_id = ?1",
            params![&peer.as_bytes()[..]],
        )
        .wrapped(ErrorKind::Ledger)?;
        for sub in subs {
            tx.execute(
                "INSERT OR IGNORE INTO subscription (channel, key, peer_id) VALUES (?1, ?2, ?3)",
                params![sub.channel, sub.key, &peer.as_bytes()[..]],
            )
            .wrapped(ErrorKind::Ledger)?;
        }
        tx.commit().wrapped(ErrorKind::Ledger)
    }

    /// The set of peers whose subscription matches an outgoing
    /// `(channel, key)` topic, applying the wildcard rule on the stored
    /// side.
    pub fn subscribers_for(&self, channel: &str, key: &str) -> Result<Vec<NodeId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT peer_id FROM subscription \
                 WHERE (channel = ?1 OR channel = '') AND (key = ?2 OR key = '')",
            )
            .wrapped(ErrorKind::Ledger)?;
        let rows = stmt
            .query_map(params![channel, key], |row| row.get::<_, Vec<u8>>(0))
            .wrapped(ErrorKind::Ledger)?;

        let mut peers = Vec::new();
        for raw in rows {
            let raw: [u8; NodeId::LENGTH] = raw
                .wrapped(ErrorKind::Ledger)?
                .try_into()
                .simple_msg(ErrorKind::Ledger, "stored node id has the wrong width")?;
            peers.push(NodeId::from_bytes(raw));
        }
        Ok(peers)
    }

    /// Persists a reliable message and one delivery row per recipient,
    /// atomically, returning the assigned message id (always >= 1).
    ///
    /// With no recipients there is nobody to ever acknowledge, so the
    /// message row is not kept; the id is still assigned and unique.
    pub fn save_message(
        &self,
        channel: &str,
        key: &str,
        body: &[u8],
        recipients: &[NodeId],
    ) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().wrapped(ErrorKind::Ledger)?;
        tx.execute(
            "INSERT INTO message (channel, key, data) VALUES (?1, ?2, ?3)",
            params![channel, key, body],
        )
        .wrapped(ErrorKind::Ledger)?;
        let id = tx.last_insert_rowid();
        for recipient in recipients {
            tx.execute(
                "INSERT OR IGNORE INTO delivery (message_id, recipient_id) VALUES (?1, ?2)",
                params![id, &recipient.as_bytes()[..]],
            )
            .wrapped(ErrorKind::Ledger)?;
        }
        if recipients.is_empty() {
            tx.execute("DELETE FROM message WHERE id = ?1", params![id])
                .wrapped(ErrorKind::Ledger)?;
        }
        tx.commit().wrapped(ErrorKind::Ledger)?;
        Ok(id as u64)
    }

    /// Removes the delivery row for `(message_id, recipient)`, and the
    /// message row itself once its last delivery is acknowledged. Acking
    /// an absent row is not an error.
    pub fn ack(&self, message_id: u64, recipient: NodeId) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().wrapped(ErrorKind::Ledger)?;
        tx.execute(
            "DELETE FROM delivery WHERE message_id = ?1 AND recipient_id = ?2",
            params![message_id as i64, &recipient.as_bytes()[..]],
        )
        .wrapped(ErrorKind::Ledger)?;
        tx.execute(
            "DELETE FROM message WHERE id = ?1 \
             AND NOT EXISTS (SELECT 1 FROM delivery WHERE message_id = ?1)",
            params![message_id as i64],
        )
        .wrapped(ErrorKind::Ledger)?;
        tx.commit().wrapped(ErrorKind::Ledger)
    }

    /// Every outstanding delivery, joined with its stored message.
    pub fn pending_deliveries(&self) -> Result<Vec<PendingDelivery>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT d.recipient_id, d.message_id, m.channel, m.key, m.data \
                 FROM delivery d JOIN message m ON m.id = d.message_id",
            )
            .wrapped(ErrorKind::Ledger)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })
            .wrapped(ErrorKind::Ledger)?;

        let mut pending = Vec::new();
        for row in rows {
            let (recipient, message_id, channel, key, body) = row.wrapped(ErrorKind::Ledger)?;
            let recipient: [u8; NodeId::LENGTH] = recipient
                .try_into()
                .simple_msg(ErrorKind::Ledger, "stored node id has the wrong width")?;
            pending.push(PendingDelivery {
                recipient: NodeId::from_bytes(recipient),
                message_id: message_id as u64,
                channel,
                key,
                body,
            });
        }
        Ok(pending)
    }
}
