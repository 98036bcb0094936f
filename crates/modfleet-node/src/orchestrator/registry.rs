//! Module Registry
//!
//! Per-module bookkeeping owned by the control loop, keyed by module uuid.

use crate::config::Topics;
use crate::execution::ExecutionContext;
use modfleet_core::{ModuleEndpoint, ModuleSpec, Signal, SignalSender};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Lifecycle of a hosted module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Registered, waiting for a create that carries its state.
    Provisioning,
    Running,
    /// Quit raised; waiting for the completion.
    Terminating,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Provisioning => "provisioning",
            ModuleState::Running => "running",
            ModuleState::Terminating => "terminating",
        };
        f.write_str(s)
    }
}

/// Topics derived for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTopics {
    /// Where the relay announces the module's exit
    pub notify: String,
    pub stdin: String,
    pub stdout: String,
}

impl ModuleTopics {
    pub fn new(topics: &Topics, uuid: &Uuid) -> Self {
        Self {
            notify: topics.registration.clone(),
            stdin: topics.stdin(uuid),
            stdout: topics.stdout(uuid),
        }
    }
}

pub struct ModuleEntry {
    pub spec: ModuleSpec,
    pub topics: ModuleTopics,
    pub state: ModuleState,
    pub redirect_to: Option<String>,
    pub termination_started_at: Option<Instant>,
    /// Instance number of the current execution context.
    pub instance: Option<u64>,
    pub context: Option<Box<dyn ExecutionContext>>,
    /// Module end of the I/O channel until handed to an engine.
    pub endpoint: Option<ModuleEndpoint>,
    pub signals: SignalSender,
}

impl ModuleEntry {
    pub fn new(spec: ModuleSpec, topics: ModuleTopics, endpoint: ModuleEndpoint, signals: SignalSender) -> Self {
        Self {
            spec,
            topics,
            state: ModuleState::Provisioning,
            redirect_to: None,
            termination_started_at: None,
            instance: None,
            context: None,
            endpoint: Some(endpoint),
            signals,
        }
    }

    pub fn raise(&self, signal: Signal) {
        self.signals.raise(signal);
    }
}

/// Serializable view of a module entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub uuid: Uuid,
    pub name: String,
    pub filename: String,
    pub filetype: String,
    pub state: ModuleState,
    pub instance: Option<u64>,
    pub redirect_to: Option<String>,
}

impl From<&ModuleEntry> for ModuleSummary {
    fn from(entry: &ModuleEntry) -> Self {
        Self {
            uuid: entry.spec.uuid,
            name: entry.spec.name.clone(),
            filename: entry.spec.filename.clone(),
            filetype: entry.spec.filetype.to_string(),
            state: entry.state,
            instance: entry.instance,
            redirect_to: entry.redirect_to.clone(),
        }
    }
}

#[derive(Default)]
pub struct ModuleRegistry {
    entries: HashMap<Uuid, ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.entries.contains_key(uuid)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&ModuleEntry> {
        self.entries.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut ModuleEntry> {
        self.entries.get_mut(uuid)
    }

    pub fn insert(&mut self, entry: ModuleEntry) {
        self.entries.insert(entry.spec.uuid, entry);
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<ModuleEntry> {
        self.entries.remove(uuid)
    }

    /// Remove the entry only if `instance` is its current execution.
    pub fn remove_instance(&mut self, uuid: &Uuid, instance: u64) -> Option<ModuleEntry> {
        match self.entries.get(uuid) {
            Some(entry) if entry.instance == Some(instance) => self.entries.remove(uuid),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ModuleEntry> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }

    pub fn summaries(&self) -> Vec<ModuleSummary> {
        let mut summaries: Vec<ModuleSummary> = self.entries.values().map(ModuleSummary::from).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.uuid.cmp(&b.uuid)));
        summaries
    }
}
