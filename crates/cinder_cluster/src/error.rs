//! Error types for cinder_cluster.

use crate::ids::ServerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The id is not (or no longer) in the server list.
    #[error("unknown server {0}")]
    UnknownServer(ServerId),

    /// Direct-index access past the end of the slot vector.
    #[error("index {0} beyond server list length")]
    IndexOutOfRange(u32),

    /// The RPC target stopped accepting membership updates.
    #[error("server not up")]
    ServerNotUp,

    /// Propagated from the durable log adapter.
    #[error("durable log: {0}")]
    DurableLog(String),
}
