// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifiers for adapters, remote ports and the targets behind them.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// Define a newtype for a process-unique run-time identifier. Values are handed
// out from a global counter and are never reused within a process, so they
// are only meaningful for as long as the process lives.
//
// This macro takes syntax matching the newtype definition primarily so that
// grepping for the newtype like `struct AdapterId` finds corresponding macro
// invocations.
macro_rules! define_id {
    {
        $(#[$meta_items:meta])*
        pub struct $id_name:ident($visibility:vis u32);
    } => {
        ::paste::paste! {
            $(#[$meta_items])*
            pub struct $id_name($visibility u32);

            impl $id_name {
                pub const INVALID: $id_name = $id_name(u32::MAX);
                pub fn new() -> Self {
                    static [<_NEXT_ $id_name:upper>]: ::std::sync::atomic::AtomicU32 =
                        ::std::sync::atomic::AtomicU32::new(0);

                    let id = [<_NEXT_ $id_name:upper>].fetch_add(
                        1,
                        ::std::sync::atomic::Ordering::Relaxed
                    );
                    $id_name(id)
                }
            }
        }
    }
}

define_id! {
    /// Identifies one adapter (physical or virtual) for the life of the
    /// process. This is the first element of every [`TargetAddress`] handed
    /// to the storage stack.
    ///
    /// [`TargetAddress`]: crate::TargetAddress
    #[derive(
        Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
        Deserialize,
    )]
    #[serde(transparent)]
    pub struct AdapterId(pub u32);
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric target id used by the storage stack to address the logical target
/// behind a remote port. Stable for an identity while its adapter lives.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-adapter sequence number of a remote port object. Never reused.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct RportNumber(pub u32);

impl fmt::Display for RportNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-adapter sequence number of a virtual adapter.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct VportNumber(pub u32);

impl fmt::Display for VportNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 64-bit world wide name, used for both node and port names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Wwn(pub u64);

impl Wwn {
    /// Marker for a name that is not (or no longer) known.
    pub const UNKNOWN: Wwn = Wwn(u64::MAX);

    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

impl fmt::Display for Wwn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_known() {
            return write!(f, "unknown");
        }
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid world wide name {0:?}")]
pub struct WwnParseError(String);

impl FromStr for Wwn {
    type Err = WwnParseError;

    /// Accepts `unknown`, colon-separated bytes (`20:00:00:25:b5:00:00:01`),
    /// or a bare hex value with an optional `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || WwnParseError(s.to_string());
        if s == "unknown" {
            return Ok(Wwn::UNKNOWN);
        }
        if s.contains(':') {
            let mut value = 0u64;
            let mut count = 0;
            for part in s.split(':') {
                if part.is_empty() || part.len() > 2 {
                    return Err(err());
                }
                let byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
                value = (value << 8) | u64::from(byte);
                count += 1;
            }
            if count != 8 {
                return Err(err());
            }
            return Ok(Wwn(value));
        }
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() || digits.len() > 16 {
            return Err(err());
        }
        u64::from_str_radix(digits, 16).map(Wwn).map_err(|_| err())
    }
}

impl TryFrom<String> for Wwn {
    type Error = WwnParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Wwn> for String {
    fn from(value: Wwn) -> Self {
        value.to_string()
    }
}

/// Fabric address of a port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u32);

impl PortId {
    pub const UNKNOWN: PortId = PortId(u32::MAX);
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNKNOWN {
            write!(f, "unknown")
        } else {
            write!(f, "{:#08x}", self.0)
        }
    }
}

bitflags! {
    /// Protocol roles a remote port currently plays. An empty set is the
    /// "unknown" role.
    #[derive(
        Copy,
        Clone,
        Debug,
        Default,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
    )]
    pub struct RportRoles: u32 {
        const FCP_TARGET = 0x1;
        const FCP_INITIATOR = 0x2;
        const IP_PORT = 0x4;
    }
}

impl RportRoles {
    pub fn is_target(&self) -> bool {
        self.contains(RportRoles::FCP_TARGET)
    }
}

bitflags! {
    /// Fibre Channel classes of service. Empty means unspecified.
    #[derive(
        Copy,
        Clone,
        Debug,
        Default,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
    )]
    pub struct ClassOfService: u32 {
        const CLASS_1 = 0x02;
        const CLASS_2 = 0x04;
        const CLASS_3 = 0x08;
    }
}

/// Fabric-level identity of a remote endpoint, as reported by discovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePortIdentity {
    pub node_name: Wwn,
    pub port_name: Wwn,
    pub port_id: PortId,
    pub roles: RportRoles,
}

impl RemotePortIdentity {
    pub fn new(
        node_name: Wwn,
        port_name: Wwn,
        port_id: PortId,
        roles: RportRoles,
    ) -> Self {
        Self { node_name, port_name, port_id, roles }
    }
}

/// Per-adapter counters for numeric target ids and object sequence numbers.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next_target_id: u32,
    next_rport_number: u32,
    next_vport_number: u32,
}

impl IdAllocator {
    /// Consume the next numeric target id, or `None` once the id space is
    /// exhausted.
    pub(crate) fn alloc_target(&mut self) -> Option<TargetId> {
        let id = self.next_target_id;
        self.next_target_id = id.checked_add(1)?;
        Some(TargetId(id))
    }

    /// Hand back a target id which nobody outside the allocating call has
    /// observed. Only the most recent allocation can be returned; anything
    /// older stays consumed.
    pub(crate) fn release_target(&mut self, id: TargetId) -> bool {
        if id.0.checked_add(1) == Some(self.next_target_id) {
            self.next_target_id = id.0;
            true
        } else {
            false
        }
    }

    pub(crate) fn alloc_rport(&mut self) -> RportNumber {
        let n = self.next_rport_number;
        self.next_rport_number = n.wrapping_add(1);
        RportNumber(n)
    }

    pub(crate) fn alloc_vport(&mut self) -> VportNumber {
        let n = self.next_vport_number;
        self.next_vport_number = n.wrapping_add(1);
        VportNumber(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wwn_display_and_parse() {
        let wwn = Wwn(0x2000_0025_b500_0001);
        assert_eq!(wwn.to_string(), "20:00:00:25:b5:00:00:01");
        assert_eq!("20:00:00:25:b5:00:00:01".parse::<Wwn>().unwrap(), wwn);
        assert_eq!("0x20000025b5000001".parse::<Wwn>().unwrap(), wwn);
        assert_eq!("20000025b5000001".parse::<Wwn>().unwrap(), wwn);
        assert_eq!("unknown".parse::<Wwn>().unwrap(), Wwn::UNKNOWN);
        assert_eq!(Wwn::UNKNOWN.to_string(), "unknown");
    }

    #[test]
    fn wwn_rejects_garbage() {
        assert!("".parse::<Wwn>().is_err());
        assert!("20:00:00".parse::<Wwn>().is_err());
        assert!("20:00:00:25:b5:00:00:01:02".parse::<Wwn>().is_err());
        assert!("0x".parse::<Wwn>().is_err());
        assert!("zz".parse::<Wwn>().is_err());
        assert!("0x1234567890abcdef0".parse::<Wwn>().is_err());
    }

    #[test]
    fn adapter_ids_are_unique() {
        let a = AdapterId::new();
        let b = AdapterId::new();
        assert_ne!(a, b);
        assert_ne!(a, AdapterId::INVALID);
    }

    #[test]
    fn target_release_only_undoes_latest() {
        let mut ids = IdAllocator::default();
        let t0 = ids.alloc_target().unwrap();
        let t1 = ids.alloc_target().unwrap();
        assert_eq!((t0, t1), (TargetId(0), TargetId(1)));

        assert!(!ids.release_target(t0));
        assert!(ids.release_target(t1));
        assert_eq!(ids.alloc_target(), Some(TargetId(1)));
    }

    #[test]
    fn target_space_exhaustion() {
        let mut ids =
            IdAllocator { next_target_id: u32::MAX - 1, ..Default::default() };
        assert_eq!(ids.alloc_target(), Some(TargetId(u32::MAX - 1)));
        assert_eq!(ids.alloc_target(), None);
        assert_eq!(ids.next_target_id, u32::MAX);
    }

    #[test]
    fn roles() {
        assert!(RportRoles::FCP_TARGET.is_target());
        let both = RportRoles::FCP_TARGET | RportRoles::FCP_INITIATOR;
        assert!(both.is_target());
        assert!(!RportRoles::FCP_INITIATOR.is_target());
        assert!(!RportRoles::empty().is_target());
    }
}
