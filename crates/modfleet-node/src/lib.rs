//! modfleet node
//!
//! Per-node module manager: registers the node with its realm, provisions
//! and supervises modules, relays their I/O over the bus and live-migrates
//! them between nodes.

pub mod api;
pub mod bus;
pub mod config;
pub mod devsched;
pub mod error;
pub mod execution;
pub mod node;
pub mod observability;
pub mod orchestrator;
pub mod registrar;
pub mod relay;

#[cfg(test)]
pub(crate) mod testing;

pub use config::NodeConfig;
pub use error::{NodeError, ProvisionError};
pub use node::{Node, NodeBuilder, NodeHandle};
pub use orchestrator::NodeSnapshot;
pub use registrar::RegistrationState;
