// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use enumset::{enum_set, EnumSet, EnumSetType};

/// A QUIC version the engine knows how to route packets for.
#[derive(Debug, EnumSetType, strum::Display)]
pub enum Version {
    /// Legacy gQUIC with the old public-header layout.
    Q043,
    /// Transitional version with IETF-style headers; connections are
    /// always keyed by address (TCID0).
    Q046,
    /// QUIC version 1 (RFC 9000).
    V1,
}

impl Version {
    pub const SUPPORTED: EnumSet<Self> = enum_set!(Self::Q043 | Self::Q046 | Self::V1);

    #[must_use]
    pub const fn wire_id(self) -> u32 {
        match self {
            Self::Q043 => 0x5130_3433,
            Self::Q046 => 0x5130_3436,
            Self::V1 => 0x0000_0001,
        }
    }

    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        Self::SUPPORTED.iter().find(|s| s.wire_id() == v)
    }

    /// Versions with the gQUIC public-header layout.
    #[must_use]
    pub const fn uses_legacy_header(self) -> bool {
        matches!(self, Self::Q043)
    }

    /// Versions that never put a source CID on the wire, forcing the
    /// registry into address-keyed mode.
    #[must_use]
    pub const fn forces_tcid0(self) -> bool {
        matches!(self, Self::Q046)
    }
}

#[cfg(test)]
mod tests {
    use super::Version;

    #[test]
    fn wire_roundtrip() {
        for v in Version::SUPPORTED {
            assert_eq!(Version::from_wire(v.wire_id()), Some(v));
        }
        assert_eq!(Version::from_wire(0xdead_beef), None);
    }

    #[test]
    fn names() {
        assert_eq!(Version::Q043.to_string(), "Q043");
        assert_eq!(Version::V1.to_string(), "V1");
    }

    #[test]
    fn predicates() {
        assert!(Version::Q043.uses_legacy_header());
        assert!(Version::Q046.forces_tcid0());
        assert!(!Version::V1.forces_tcid0());
        assert!(!Version::V1.uses_legacy_header());
    }
}
