//! Traits over the RPC and recovery collaborators the directory drives.
//!
//! The real transport, ping service, and recovery manager live outside
//! this crate; the directory only needs these narrow surfaces.

use std::time::Duration;

use crate::entry::ServerEntry;
use crate::error::Result;
use crate::ids::ServerId;
use crate::wire::ServerListMessage;

/// Handle to one in-flight server-list push. Dropping the handle cancels
/// the RPC.
pub trait UpdateRpc: Send {
    /// Poll for completion without blocking. `None` while in flight.
    /// `Ok(version)` is the member's newly acknowledged list version;
    /// `Err(ServerNotUp)` reports that the target was downed while the
    /// push was in flight.
    fn poll(&mut self) -> Option<Result<u64>>;
}

/// Starts membership pushes toward cluster members.
pub trait UpdateTransport: Send + Sync {
    fn start_update(
        &self,
        target: ServerId,
        locator: &str,
        message: ServerListMessage,
    ) -> Box<dyn UpdateRpc>;
}

/// Liveness probe used by the failure detector.
pub trait PingTransport: Send + Sync {
    /// True when the server answered within `timeout`.
    fn ping(&self, target: ServerId, locator: &str, timeout: Duration) -> bool;
}

/// Entry point into the master recovery machinery. Invoked with a snapshot
/// of the entry taken before it was marked crashed.
pub trait MasterRecovery: Send + Sync {
    fn start_master_recovery(&self, crashed: &ServerEntry);
}
