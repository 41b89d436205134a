//! Per-server membership records.

use serde::{Deserialize, Serialize};

use crate::durable_log::LogEntryId;
use crate::ids::{Service, ServerId, ServiceMask};
use crate::wire::WireEntry;

/// Lifecycle of a server in the directory. Transitions only move forward:
/// UP -> CRASHED -> DOWN. A slot may be reissued with a fresh generation
/// after DOWN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Up,
    Crashed,
    Down,
}

/// The coordinator's authoritative record for one server, plus the
/// propagation bookkeeping the background updater needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerEntry {
    pub server_id: ServerId,
    pub locator: String,
    pub services: ServiceMask,
    pub status: ServerStatus,
    /// Storage read bandwidth; nonzero only for backups.
    pub expected_read_mbps: u32,
    /// 0 = not in a replication group.
    pub replication_id: u64,
    /// Opaque blob consumed by master recovery.
    pub master_recovery_info: Vec<u8>,
    /// Last cluster version this member acknowledged; 0 = never updated.
    pub(crate) list_version: u64,
    /// Target version of an in-flight push, or 0 when idle.
    pub(crate) being_updated: u64,
    /// Durable-log entry ids of the latest authoritative records; 0 = none.
    pub(crate) info_log_id: LogEntryId,
    pub(crate) update_log_id: LogEntryId,
}

impl ServerEntry {
    pub(crate) fn new(server_id: ServerId, locator: String, services: ServiceMask) -> Self {
        Self {
            server_id,
            locator,
            services,
            status: ServerStatus::Up,
            expected_read_mbps: 0,
            replication_id: 0,
            master_recovery_info: Vec::new(),
            list_version: 0,
            being_updated: 0,
            info_log_id: 0,
            update_log_id: 0,
        }
    }

    /// Reservation placeholder installed by id generation; overwritten by
    /// the add that follows, or released by a remove.
    pub(crate) fn placeholder(server_id: ServerId) -> Self {
        Self::new(server_id, String::new(), ServiceMask::EMPTY)
    }

    pub fn is_master(&self) -> bool {
        self.services.has(Service::Master)
    }

    pub fn is_backup(&self) -> bool {
        self.services.has(Service::Backup)
    }

    pub(crate) fn has_membership(&self) -> bool {
        self.services.has(Service::Membership)
    }

    /// Wire form of this entry. Non-backups always report zero read
    /// bandwidth regardless of what the record carries.
    pub(crate) fn to_wire(&self) -> WireEntry {
        WireEntry {
            services: self.services,
            server_id: self.server_id,
            locator: self.locator.clone(),
            status: self.status,
            expected_read_mbps: if self.is_backup() {
                self.expected_read_mbps
            } else {
                0
            },
            replication_id: self.replication_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_zeroes_read_speed_for_non_backups() {
        let mut entry = ServerEntry::new(
            ServerId::new(1, 1),
            "tcp:1".to_string(),
            ServiceMask::of(&[Service::Master]),
        );
        entry.expected_read_mbps = 100;
        assert_eq!(entry.to_wire().expected_read_mbps, 0);

        entry.services = ServiceMask::of(&[Service::Backup]);
        assert_eq!(entry.to_wire().expected_read_mbps, 100);
    }

    #[test]
    fn placeholder_reserves_with_empty_services() {
        let placeholder = ServerEntry::placeholder(ServerId::new(4, 2));
        assert_eq!(placeholder.status, ServerStatus::Up);
        assert!(placeholder.services.is_empty());
        assert!(placeholder.locator.is_empty());
    }
}
