//! Core shared types for modfleet
//!
//! This crate contains the control-plane data model, the JSON control
//! message codec and the shared-memory I/O rings used between a module's
//! execution context and its relay.

pub mod codec;
pub mod identity;
pub mod ioring;
pub mod model;
pub mod port;

pub use codec::{Action, CodecError, ControlMessage, MessageType, ObjectType, Outcome, ResultCode};
pub use identity::{parse_canonical_uuid, IdentityError};
pub use ioring::{IoChannel, ModuleSide, RelaySide, RingClosed, RingReader, RingWriter, Signal, SignalReceiver, SignalSender};
pub use model::{
    Affinity, ChannelBinding, ChannelMode, ChannelParams, ChannelTransport, FileType, Instantiation,
    ModuleSpec, NodeRecord, ParentRef, ProgramRequest, ProgramSpec,
};
pub use port::{duplex, ModuleEndpoint, Port, PortMessage, RelayEndpoint};
