//! Wire form of the server list pushed to cluster members.
//!
//! Entries are emitted in slot order and recipients apply them in order,
//! which is what guarantees that the removal of a replaced server id is
//! seen before the addition of its successor.

use serde::{Deserialize, Serialize};

use crate::entry::ServerStatus;
use crate::ids::{ServerId, ServiceMask};

/// Whether a message snapshots the whole list or carries one version's
/// delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    FullList,
    Update,
}

/// One server as disseminated to the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    pub services: ServiceMask,
    pub server_id: ServerId,
    pub locator: String,
    pub status: ServerStatus,
    pub expected_read_mbps: u32,
    pub replication_id: u64,
}

/// A versioned server-list message: either a full snapshot for a member
/// that has never been updated, or the delta committed at `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListMessage {
    pub version: u64,
    pub kind: ListKind,
    pub servers: Vec<WireEntry>,
}
