//! CCCC kernel: the data model and filesystem substrate shared by the
//! daemon, the CLI, and the IM bridge.
//!
//! Everything here is process-agnostic. Single-writer guarantees live in the
//! daemon; this crate provides the atomic-write, locking, and ledger
//! primitives those guarantees are built on.

pub mod active;
pub mod actor;
pub mod blobs;
pub mod error;
pub mod event;
pub mod fsutil;
pub mod global_events;
pub mod group;
pub mod inbox;
pub mod ipc;
pub mod ledger;
pub mod lock;
pub mod messaging;
pub mod paths;
pub mod permissions;
pub mod registry;
pub mod retention;
pub mod scope;
pub mod seq;
pub mod settings;
pub mod template;
pub mod timeutil;
pub mod transcript;

pub use actor::{Actor, ActorRole, ActorSubmit, RunnerKind};
pub use error::{OpError, OpResult};
pub use event::{ChatMessageData, Event};
pub use group::{Group, GroupDoc};
pub use ipc::{DaemonRequest, DaemonResponse};
pub use registry::Registry;
pub use scope::ScopeIdentity;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
