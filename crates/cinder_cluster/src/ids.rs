//! Server identities and service capability masks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit server identity: a 32-bit slot index in the low half and a
/// 32-bit reuse generation in the high half. Index 0 is reserved and a
/// valid id always has generation >= 1, so the all-zero word doubles as
/// the invalid sentinel. Equality is bitwise.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(u64);

impl ServerId {
    pub const INVALID: ServerId = ServerId(0);

    pub fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_valid(self) -> bool {
        self.generation() >= 1
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation())
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({self})")
    }
}

/// A capability a server can offer to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    /// Hosts tablets and serves reads/writes.
    Master,
    /// Stores segment replicas for masters.
    Backup,
    /// Accepts pushed server-list updates.
    Membership,
    /// Answers liveness probes.
    Ping,
    /// Management RPCs.
    Admin,
}

impl Service {
    fn bit(self) -> u32 {
        match self {
            Service::Master => 1 << 0,
            Service::Backup => 1 << 1,
            Service::Membership => 1 << 2,
            Service::Ping => 1 << 3,
            Service::Admin => 1 << 4,
        }
    }

    const ALL: [Service; 5] = [
        Service::Master,
        Service::Backup,
        Service::Membership,
        Service::Ping,
        Service::Admin,
    ];
}

/// Small set over `Service`, serializable to a 32-bit word on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceMask(u32);

impl ServiceMask {
    pub const EMPTY: ServiceMask = ServiceMask(0);

    pub fn of(services: &[Service]) -> Self {
        services.iter().fold(Self::EMPTY, |mask, s| mask.with(*s))
    }

    #[must_use]
    pub fn with(self, service: Service) -> Self {
        Self(self.0 | service.bit())
    }

    pub fn has(self, service: Service) -> bool {
        self.0 & service.bit() != 0
    }

    pub fn intersects(self, other: ServiceMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Wire form: the raw bit word.
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl fmt::Display for ServiceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for service in Service::ALL {
            if self.has(service) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{service:?}")?;
                first = false;
            }
        }
        if first {
            write!(f, "(none)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceMask({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_splits_into_index_and_generation() {
        let id = ServerId::new(3, 7);
        assert_eq!(id.index(), 3);
        assert_eq!(id.generation(), 7);
        assert_eq!(id.to_string(), "3.7");
    }

    #[test]
    fn invalid_id_has_generation_zero() {
        assert!(!ServerId::INVALID.is_valid());
        assert!(!ServerId::new(5, 0).is_valid());
        assert!(ServerId::new(0, 1).is_valid());
    }

    #[test]
    fn equality_is_bitwise() {
        assert_ne!(ServerId::new(1, 1), ServerId::new(1, 2));
        assert_eq!(ServerId::new(1, 2), ServerId::from_u64(ServerId::new(1, 2).as_u64()));
    }

    #[test]
    fn mask_round_trips_through_bits() {
        let mask = ServiceMask::of(&[Service::Master, Service::Membership]);
        assert!(mask.has(Service::Master));
        assert!(mask.has(Service::Membership));
        assert!(!mask.has(Service::Backup));
        assert_eq!(ServiceMask::from_bits(mask.bits()), mask);
    }

    #[test]
    fn intersects_requires_common_service() {
        let storage = ServiceMask::of(&[Service::Master, Service::Backup]);
        assert!(ServiceMask::of(&[Service::Backup]).intersects(storage));
        assert!(!ServiceMask::of(&[Service::Membership]).intersects(storage));
        assert!(!ServiceMask::EMPTY.intersects(storage));
    }

    #[test]
    fn display_lists_services() {
        let mask = ServiceMask::of(&[Service::Master, Service::Backup]);
        assert_eq!(mask.to_string(), "Master|Backup");
        assert_eq!(ServiceMask::EMPTY.to_string(), "(none)");
    }
}
