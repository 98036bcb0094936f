//! Duplex Port
//!
//! Message channel between a module and its relay, alongside the byte rings.
//! The node sends `Bind` on the module end before the module starts, which
//! tells the relay where stdout goes and which channels to wire.

use crate::ioring::{ModuleSide, RelaySide};
use crate::model::ChannelBinding;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMessage {
    /// Wire the relay for a starting module.
    Bind {
        stdout_topic: String,
        channels: Vec<ChannelBinding>,
    },
    /// Module output on a writable channel path.
    Publish { path: String, payload: Vec<u8> },
    /// Bus message delivered to a readable channel path.
    Deliver { path: String, payload: Vec<u8> },
}

/// One end of a duplex channel.
pub struct Port {
    pub tx: mpsc::UnboundedSender<PortMessage>,
    pub rx: mpsc::UnboundedReceiver<PortMessage>,
}

impl Port {
    /// Send to the peer. Returns false once the peer end is gone.
    pub fn send(&self, message: PortMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Create a connected pair of ports.
pub fn duplex() -> (Port, Port) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (Port { tx: a_tx, rx: b_rx }, Port { tx: b_tx, rx: a_rx })
}

/// Everything an execution context gets to talk to the outside world.
pub struct ModuleEndpoint {
    pub io: ModuleSide,
    pub port: Port,
}

/// Everything the relay gets for one module.
pub struct RelayEndpoint {
    pub io: RelaySide,
    pub port: Port,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_is_crossed() {
        let (mut left, mut right) = duplex();
        assert!(left.send(PortMessage::Publish {
            path: "/out".to_string(),
            payload: b"hi".to_vec(),
        }));
        assert!(right.send(PortMessage::Deliver {
            path: "/in".to_string(),
            payload: b"yo".to_vec(),
        }));

        assert!(matches!(right.rx.recv().await, Some(PortMessage::Publish { path, .. }) if path == "/out"));
        assert!(matches!(left.rx.recv().await, Some(PortMessage::Deliver { path, .. }) if path == "/in"));

        drop(right);
        assert!(!left.send(PortMessage::Bind {
            stdout_topic: String::new(),
            channels: Vec::new(),
        }));
        assert!(left.rx.recv().await.is_none());
    }
}
