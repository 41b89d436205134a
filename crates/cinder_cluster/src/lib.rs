//! Coordinator cluster-membership core for cinder.
//!
//! The coordinator keeps the authoritative, versioned directory of every
//! server in the cluster. This crate provides that directory and the
//! machinery around it:
//!
//! - identity issue and the UP -> CRASHED -> DOWN lifecycle
//! - durable two-phase operations over a replicated log, so a restarted
//!   coordinator can replay whatever it finds logged
//! - ping-verified failure detection
//! - replication-group formation for backups
//! - ordered, adaptive-concurrency propagation of list updates to every
//!   member that accepts them
//!
//! RPC transports, the recovery manager, and the durable log service live
//! outside this crate behind the traits in `transport` and `durable_log`.

pub mod directory;
pub mod durable_log;
pub mod entry;
pub mod error;
pub mod ids;
pub mod tracker;
pub mod transport;
mod updater;
pub mod wire;

pub use directory::{DirectoryConfig, MembershipDirectory};
pub use durable_log::{DurableLog, LogEntryId, LogRecord, MemoryLog};
pub use entry::{ServerEntry, ServerStatus};
pub use error::{Error, Result};
pub use ids::{ServerId, Service, ServiceMask};
pub use tracker::{ServerChange, ServerTracker};
pub use transport::{MasterRecovery, PingTransport, UpdateRpc, UpdateTransport};
pub use wire::{ListKind, ServerListMessage, WireEntry};
