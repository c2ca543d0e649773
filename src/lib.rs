//! A peer-to-peer, mutually authenticated messaging fabric.
//!
//! Every participating [`Instance`] acts simultaneously as client and
//! server: it dials other instances, accepts incoming dials, and
//! exchanges typed binary frames over a single long-lived TLS protected
//! TCP connection per peer. Publishers address messages to a
//! `(channel, key)` topic; subscribers declare interest in topics, with
//! empty strings as wildcards. Reliable publishes are recorded in a
//! durable ledger and re-sent until every recipient that was subscribed
//! at publish time has acknowledged, so delivery is at least once even
//! across crashes and reconnections.

pub mod communication;
pub mod config;
pub mod error;
pub mod instance;
pub mod ledger;
pub mod router;

pub use crate::communication::message::{CONTROL_CHANNEL, CURRENT_VERSION};
pub use crate::communication::{NodeId, Subscription};
pub use crate::config::{load_certs, load_private_key, InstanceConfig, DEFAULT_PORT};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::instance::Instance;
