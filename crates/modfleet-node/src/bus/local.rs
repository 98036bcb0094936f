//! In-process Broker
//!
//! A `BusConnector` that routes messages between sessions of the same
//! process. Used by the standalone node and by tests.
//!
//! - duplicate client ids are refused
//! - the last will is published when a session is dropped
//! - `close()` ends all sessions and refuses further connections

use super::{topic_matches, BusConnector, BusError, BusMessage, BusSession, ConnectOptions, MessageBus};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Session {
    client_id: String,
    filters: Vec<String>,
    inbox: mpsc::UnboundedSender<BusMessage>,
    last_will: Option<BusMessage>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<u64, Session>,
    next_session: u64,
    closed: bool,
}

impl BrokerState {
    fn route(&self, message: &BusMessage) {
        for session in self.sessions.values() {
            if session.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                let _ = session.inbox.send(message.clone());
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct LocalBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop every session and refuse new ones. Wills are not published.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.sessions.clear();
        debug!("Local broker closed");
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock().sessions.values().any(|s| s.client_id == client_id)
    }

    pub fn open(&self, options: ConnectOptions) -> Result<BusSession, BusError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BusError::Refused("broker closed".to_string()));
        }
        if state.sessions.values().any(|s| s.client_id == options.client_id) {
            return Err(BusError::ClientIdInUse(options.client_id));
        }

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            Session {
                client_id: options.client_id.clone(),
                filters: Vec::new(),
                inbox: tx,
                last_will: options.last_will,
            },
        );
        debug!(client_id = %options.client_id, username = %options.username, "Session opened");

        Ok(BusSession {
            client: Arc::new(LocalClient {
                id,
                broker: self.clone(),
            }),
            inbox: rx,
        })
    }
}

impl BusConnector for LocalBroker {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'static, Result<BusSession, BusError>> {
        future::ready(self.open(options)).boxed()
    }
}

struct LocalClient {
    id: u64,
    broker: LocalBroker,
}

impl MessageBus for LocalClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let state = self.broker.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(BusError::SessionClosed);
        }
        trace!(topic = %topic, bytes = payload.len(), "Publish");
        state.route(&BusMessage::new(topic, payload));
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        let mut state = self.broker.lock();
        let session = state.sessions.get_mut(&self.id).ok_or(BusError::SessionClosed)?;
        if !session.filters.iter().any(|f| f == filter) {
            session.filters.push(filter.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        let mut state = self.broker.lock();
        let session = state.sessions.get_mut(&self.id).ok_or(BusError::SessionClosed)?;
        session.filters.retain(|f| f != filter);
        Ok(())
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        if let Some(session) = state.sessions.remove(&self.id) {
            debug!(client_id = %session.client_id, "Session closed");
            if let Some(will) = session.last_will {
                state.route(&will);
            }
        }
    }
}
