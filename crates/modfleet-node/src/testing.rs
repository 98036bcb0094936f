//! Test doubles shared by unit tests.

use crate::bus::{BusConnector, BusMessage, BusSession, ConnectOptions, LocalBroker};
use crate::execution::{ExecutionContext, ExecutionEngine, ExecutionEvent, StartInstruction};
use modfleet_core::{ModuleEndpoint, Signal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Engine whose modules run until they receive quit, then finish with a
/// fixed snapshot.
#[derive(Clone, Default)]
pub struct FakeEngine {
    snapshot: Option<Vec<u8>>,
    spawned: Arc<Mutex<Vec<StartInstruction>>>,
    stopped: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn with_snapshot(snapshot: &[u8]) -> Self {
        Self {
            snapshot: Some(snapshot.to_vec()),
            ..Self::default()
        }
    }

    pub fn spawned(&self) -> Vec<StartInstruction> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ExecutionEngine for FakeEngine {
    fn spawn(
        &self,
        start: StartInstruction,
        endpoint: ModuleEndpoint,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Box<dyn ExecutionContext> {
        self.spawned.lock().unwrap().push(start.clone());
        let snapshot = self.snapshot.clone();
        let uuid = start.uuid;
        let task = tokio::spawn(async move {
            let ModuleEndpoint { io, port } = endpoint;
            let mut signals = io.signals;
            let _ = events.send(ExecutionEvent::started(uuid));
            loop {
                if matches!(signals.recv().await, Signal::Quit | Signal::Kill) {
                    break;
                }
            }
            let _ = events.send(ExecutionEvent::finished(uuid, snapshot, Some(0)));
            // stay alive like a real context until released
            let _keep = (port, io.stdout, io.stdin);
            std::future::pending::<()>().await;
        });
        Box::new(FakeContext {
            task,
            stopped: self.stopped.clone(),
            done: false,
        })
    }
}

struct FakeContext {
    task: JoinHandle<()>,
    stopped: Arc<AtomicUsize>,
    done: bool,
}

impl ExecutionContext for FakeContext {
    fn stop(&mut self) {
        if !self.done {
            self.done = true;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            self.task.abort();
        }
    }
}

/// Bus session that records everything matching its filters.
pub struct Spy {
    session: BusSession,
}

impl Spy {
    pub async fn connect(broker: &LocalBroker, filters: &[&str]) -> Self {
        let session = broker
            .connect(ConnectOptions {
                client_id: format!("spy-{}", uuid::Uuid::new_v4()),
                username: "non_auth".to_string(),
                token: None,
                last_will: None,
            })
            .await
            .unwrap();
        for filter in filters {
            session.client.subscribe(filter).unwrap();
        }
        Self { session }
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        self.session.client.publish(topic, payload).unwrap();
    }

    pub async fn next(&mut self) -> BusMessage {
        tokio::time::timeout(Duration::from_secs(5), self.session.inbox.recv())
            .await
            .expect("timed out waiting for bus message")
            .expect("bus session closed")
    }

    /// Next message without a deadline, for tests running on paused time.
    pub async fn recv(&mut self) -> BusMessage {
        self.session.inbox.recv().await.expect("bus session closed")
    }

    /// Next message on `topic`, skipping others.
    pub async fn next_on(&mut self, topic: &str) -> BusMessage {
        loop {
            let message = self.next().await;
            if message.topic == topic {
                return message;
            }
        }
    }

    pub fn drain(&mut self) -> Vec<BusMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.session.inbox.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Let spawned tasks run until the runtime is idle.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds, failing after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Records the level and `event_type` of every tracing event emitted on the
/// current thread while its guard is held.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl EventLog {
    pub fn capture(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// Events of `event_type` logged at `min` or more severe.
    pub fn count(&self, event_type: &str, min: Level) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, kind)| kind == event_type && *level <= min)
            .count()
    }
}

impl<S: Subscriber> Layer<S> for EventLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventTypeVisitor(None);
        event.record(&mut visitor);
        if let Some(kind) = visitor.0 {
            self.events.lock().unwrap().push((*event.metadata().level(), kind));
        }
    }
}

struct EventTypeVisitor(Option<String>);

impl Visit for EventTypeVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "event_type" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "event_type" && self.0.is_none() {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}
