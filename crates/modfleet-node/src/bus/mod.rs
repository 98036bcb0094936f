//! Message Bus
//!
//! Abstraction over the pub/sub transport used for the control plane and
//! module I/O. Topics are `/`-separated; subscription filters support the
//! MQTT wildcards `+` (one level) and `#` (this level and everything below).
//!
//! - `MessageBus`: publish/subscribe on an established session
//! - `BusConnector`: opens sessions, with credentials and a last will
//! - `local`: in-process broker implementing both
//! - `mqtt`: connector for an external MQTT broker

pub mod local;
pub mod mqtt;

pub use local::LocalBroker;
pub use mqtt::{BusEndpoint, MqttConnector};

use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("client id `{0}` is already connected")]
    ClientIdInUse(String),
    #[error("session closed")]
    SessionClosed,
    #[error("invalid bus uri `{0}`")]
    InvalidUri(String),
}

/// A message as seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: String,
    pub token: Option<String>,
    /// Published by the broker when the session ends.
    pub last_will: Option<BusMessage>,
}

/// Operations on an established session.
///
/// Calls do not wait for delivery; messages published from one session are
/// delivered in publish order.
pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    fn subscribe(&self, filter: &str) -> Result<(), BusError>;
    fn unsubscribe(&self, filter: &str) -> Result<(), BusError>;
}

/// An open session: the publishing handle and the inbound message stream.
pub struct BusSession {
    pub client: Arc<dyn MessageBus>,
    pub inbox: mpsc::UnboundedReceiver<BusMessage>,
}

pub trait BusConnector: Send + Sync {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'static, Result<BusSession, BusError>>;
}

/// MQTT-style topic filter matching.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("realm/proc/reg", "realm/proc/reg"));
        assert!(!topic_matches("realm/proc/reg", "realm/proc/reg/x"));
        assert!(!topic_matches("realm/proc/control", "realm/proc/control/node-a"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("realm/proc/control/node-a/#", "realm/proc/control/node-a"));
        assert!(topic_matches("realm/proc/control/node-a/#", "realm/proc/control/node-a/x/y"));
        assert!(!topic_matches("realm/proc/control/node-a/#", "realm/proc/control/node-b"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("realm/+/reg", "realm/proc/reg"));
        assert!(!topic_matches("realm/+/reg", "realm/proc/x/reg"));
        assert!(!topic_matches("realm/+", "realm"));
    }
}
