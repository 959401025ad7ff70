//! The transport multiplexer: a broker/router pair moving framed messages
//! between the controller and a tree of remote contexts.
//!
//! Every transport (ssh, docker, podman, local) is a subprocess trunk with
//! piped stdio. The broker thread owns the routing table and the pending
//! call map; host workers talk to it over channels and block on replies.
//! Contexts layered behind an existing one (jump hosts, sudo wrappers,
//! bootstrapped interpreters) are spawned by the remote agent on request
//! and announce their route upward.

pub mod broker;
pub mod context;
pub mod file_service;
pub mod frame;
pub mod router;
pub mod spawn;

pub use broker::Broker;
pub use context::Context;
pub use file_service::FileService;
pub use frame::{ContextId, Frame, Message, CONTROLLER};
pub use router::Router;
