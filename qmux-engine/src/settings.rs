// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use enumset::{enum_set, EnumSet};
use qmux_common::Role;

use crate::{version::Version, Error, Res};

/// Smallest flow-control window either direction will accept.
pub const MIN_FLOW_CONTROL_WINDOW: u32 = 16 * 1024;
/// Longest idle timeout a peer may be offered, in seconds.
pub const MAX_IDLE_TIMEOUT: u32 = 600;
pub const MIN_SCID_LEN: usize = 4;
pub const MAX_SCID_LEN: usize = 18;
/// Number of elements the HTTP/3 priority tree can hold; unidirectional
/// streams and placeholders share it.
pub const H3_PRIO_TREE_CAPACITY: u64 = 256;

/// Engine configuration. Immutable once an [`crate::Engine`] is built
/// from it; [`EngineSettings::validate`] is what construction runs.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// The set of QUIC versions offered to peers. Must intersect
    /// [`Version::SUPPORTED`].
    pub versions: EnumSet<Version>,
    /// Length of locally generated source CIDs. Zero is legal only for
    /// clients and switches the registry to address-keyed mode;
    /// otherwise the value must lie in
    /// [`MIN_SCID_LEN`]`..=`[`MAX_SCID_LEN`].
    pub scid_len: usize,
    /// Initial connection flow-control window in bytes.
    pub cfcw: u32,
    /// Initial per-stream flow-control window in bytes.
    pub sfcw: u32,
    /// Idle timeout offered to peers, in seconds. At most
    /// [`MAX_IDLE_TIMEOUT`].
    pub idle_timeout: u32,
    /// Egress processing deadline in microseconds; once a processing
    /// round has run longer than this, no new batches are started.
    /// Zero disables the deadline.
    pub proc_time_thresh: u64,
    /// Accept peers that negotiate zero-length connection IDs on legacy
    /// versions, keying those connections by address.
    pub support_tcid0: bool,
    /// Honor legacy public resets and IETF stateless resets.
    pub honor_prst: bool,
    /// Let connections pace their packet emission.
    pub pace_packets: bool,
    /// Carry ECN markings on outgoing datagrams.
    pub ecn: bool,
    /// Initial maximum number of peer-initiated bidirectional streams.
    /// Together with `h3_placeholders`, bounded by the HTTP/3 priority
    /// tree capacity.
    pub init_max_streams_bidi: u64,
    /// Initial maximum number of peer-initiated unidirectional streams.
    /// Bounded the same way as `init_max_streams_bidi`.
    pub init_max_streams_uni: u64,
    /// Number of HTTP/3 priority placeholders to advertise.
    pub h3_placeholders: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            versions: enum_set!(Version::V1),
            scid_len: 8,
            cfcw: 3 * 1024 * 1024,
            sfcw: 1024 * 1024,
            idle_timeout: 30,
            proc_time_thresh: 0,
            support_tcid0: true,
            honor_prst: false,
            pace_packets: true,
            ecn: true,
            init_max_streams_bidi: 100,
            init_max_streams_uni: 100,
            h3_placeholders: 5,
        }
    }
}

impl EngineSettings {
    /// Check every configured value against its documented constraint.
    ///
    /// # Errors
    /// [`Error::BadSettings`] naming the first offending option.
    pub fn validate(&self, role: Role) -> Res<()> {
        if (self.versions & Version::SUPPORTED).is_empty() {
            return Err(Error::BadSettings(
                "no supported QUIC version is offered".into(),
            ));
        }
        if self.scid_len == 0 {
            if role.is_server() {
                return Err(Error::BadSettings(
                    "servers cannot use zero-length source CIDs".into(),
                ));
            }
        } else if !(MIN_SCID_LEN..=MAX_SCID_LEN).contains(&self.scid_len) {
            return Err(Error::BadSettings(format!(
                "scid_len must be 0 or in [{MIN_SCID_LEN}, {MAX_SCID_LEN}], not {}",
                self.scid_len
            )));
        }
        if self.cfcw < MIN_FLOW_CONTROL_WINDOW {
            return Err(Error::BadSettings(format!(
                "cfcw must be at least {MIN_FLOW_CONTROL_WINDOW}"
            )));
        }
        if self.sfcw < MIN_FLOW_CONTROL_WINDOW {
            return Err(Error::BadSettings(format!(
                "sfcw must be at least {MIN_FLOW_CONTROL_WINDOW}"
            )));
        }
        if self.idle_timeout > MAX_IDLE_TIMEOUT {
            return Err(Error::BadSettings(format!(
                "idle_timeout must not exceed {MAX_IDLE_TIMEOUT} seconds"
            )));
        }
        if self.init_max_streams_uni.saturating_add(self.h3_placeholders) > H3_PRIO_TREE_CAPACITY {
            return Err(Error::BadSettings(format!(
                "init_max_streams_uni plus h3_placeholders must not exceed {H3_PRIO_TREE_CAPACITY}"
            )));
        }
        if self.init_max_streams_bidi.saturating_add(self.h3_placeholders) > H3_PRIO_TREE_CAPACITY {
            return Err(Error::BadSettings(format!(
                "init_max_streams_bidi plus h3_placeholders must not exceed {H3_PRIO_TREE_CAPACITY}"
            )));
        }
        Ok(())
    }

    /// Whether the registry keys connections by local address instead of
    /// by CID: a forced-TCID0 version is offered, a legacy-header
    /// version is offered with TCID0 support, or source CIDs are
    /// zero-length.
    #[must_use]
    pub fn hashes_by_address(&self) -> bool {
        self.versions.iter().any(Version::forces_tcid0)
            || (self.support_tcid0 && self.versions.iter().any(Version::uses_legacy_header))
            || self.scid_len == 0
    }
}

#[cfg(test)]
mod tests {
    use enumset::enum_set;
    use qmux_common::Role;

    use super::{EngineSettings, MAX_IDLE_TIMEOUT, MIN_FLOW_CONTROL_WINDOW};
    use crate::{Error, Version};

    #[test]
    fn defaults_validate() {
        let s = EngineSettings::default();
        assert!(s.validate(Role::Client).is_ok());
        assert!(s.validate(Role::Server).is_ok());
        assert!(!s.hashes_by_address());
    }

    #[test]
    fn rejects_empty_versions() {
        let s = EngineSettings {
            versions: enum_set!(),
            ..EngineSettings::default()
        };
        assert!(matches!(s.validate(Role::Client), Err(Error::BadSettings(_))));
    }

    #[test]
    fn scid_len_rules() {
        let mut s = EngineSettings {
            scid_len: 0,
            ..EngineSettings::default()
        };
        assert!(s.validate(Role::Client).is_ok());
        assert!(s.hashes_by_address());
        assert!(s.validate(Role::Server).is_err());
        s.scid_len = 3;
        assert!(s.validate(Role::Client).is_err());
        s.scid_len = 19;
        assert!(s.validate(Role::Client).is_err());
        s.scid_len = 18;
        assert!(s.validate(Role::Client).is_ok());
    }

    #[test]
    fn flow_control_minimums() {
        let mut s = EngineSettings {
            cfcw: MIN_FLOW_CONTROL_WINDOW - 1,
            ..EngineSettings::default()
        };
        assert!(s.validate(Role::Client).is_err());
        s.cfcw = MIN_FLOW_CONTROL_WINDOW;
        s.sfcw = 1;
        assert!(s.validate(Role::Client).is_err());
    }

    #[test]
    fn idle_timeout_cap() {
        let s = EngineSettings {
            idle_timeout: MAX_IDLE_TIMEOUT + 1,
            ..EngineSettings::default()
        };
        assert!(s.validate(Role::Client).is_err());
    }

    #[test]
    fn priority_tree_capacity() {
        let uni = EngineSettings {
            init_max_streams_uni: 252,
            h3_placeholders: 5,
            ..EngineSettings::default()
        };
        assert!(uni.validate(Role::Client).is_err());
        let bidi = EngineSettings {
            init_max_streams_bidi: 300,
            ..EngineSettings::default()
        };
        assert!(bidi.validate(Role::Client).is_err());
        let at_cap = EngineSettings {
            init_max_streams_bidi: 251,
            init_max_streams_uni: 251,
            h3_placeholders: 5,
            ..EngineSettings::default()
        };
        assert!(at_cap.validate(Role::Client).is_ok());
    }

    #[test]
    fn address_mode_triggers() {
        let legacy = EngineSettings {
            versions: enum_set!(Version::Q043 | Version::V1),
            ..EngineSettings::default()
        };
        assert!(legacy.hashes_by_address());
        let no_tcid0 = EngineSettings {
            support_tcid0: false,
            ..legacy.clone()
        };
        assert!(!no_tcid0.hashes_by_address());
        let forced = EngineSettings {
            versions: enum_set!(Version::Q046),
            support_tcid0: false,
            ..EngineSettings::default()
        };
        assert!(forced.hashes_by_address());
    }
}
