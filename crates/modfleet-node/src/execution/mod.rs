//! Execution Engines
//!
//! The node hands each module to an `ExecutionEngine`, which runs it inside
//! an `ExecutionContext` and reports back on a per-context event channel.
//! Modules talk to the outside world only through their `ModuleEndpoint`
//! (stdin/stdout rings, signal word, duplex port).

pub mod process;

pub use process::ProcessEngine;

use modfleet_core::{ChannelBinding, ModuleEndpoint};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything an engine needs to start one module instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInstruction {
    pub uuid: Uuid,
    pub binary_ref: String,
    pub stdout_topic: String,
    pub stdin_topic: String,
    pub args: Option<String>,
    pub env: Option<String>,
    pub channels: Vec<ChannelBinding>,
    pub wait_state: bool,
    /// Snapshot to resume from.
    pub injected_memory: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEventKind {
    Started,
    /// The module stopped. `memory` is present when the runtime captured a
    /// snapshot in response to a quit signal.
    Finished {
        memory: Option<Vec<u8>>,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub uuid: Uuid,
    pub kind: ExecutionEventKind,
}

impl ExecutionEvent {
    pub fn started(uuid: Uuid) -> Self {
        Self {
            uuid,
            kind: ExecutionEventKind::Started,
        }
    }

    pub fn finished(uuid: Uuid, memory: Option<Vec<u8>>, exit_code: Option<i32>) -> Self {
        Self {
            uuid,
            kind: ExecutionEventKind::Finished { memory, exit_code },
        }
    }
}

/// A running module instance.
pub trait ExecutionContext: Send {
    /// Release the context. Idempotent; called after completion and on shutdown.
    fn stop(&mut self);
}

pub trait ExecutionEngine: Send + Sync + 'static {
    fn spawn(
        &self,
        start: StartInstruction,
        endpoint: ModuleEndpoint,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Box<dyn ExecutionContext>;
}
