// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration types validated at `cp_setup`/`pd_setup` (component N,
//! §10.3).

use crate::codec::PdId;
use crate::error::OsdpError;
use bitflags::bitflags;

bitflags! {
    /// Per-PD behavior flags (`osdp_pd_info.flags` in §6).
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct PdFlags: u32 {
        /// Refuse plaintext traffic once capability detection is complete.
        const ENFORCE_SECURE = 1 << 0;
        /// Allow installing the diagnostic default SCBK.
        const INSTALL_MODE = 1 << 1;
        /// Drop unsolicited replies rather than treating them as a phy check error.
        const IGN_UNSOLICITED = 1 << 2;
        /// Surface `NOTIFICATION` events to the event callback.
        const ENABLE_NOTIFICATION = 1 << 3;
        /// Record every sent/received packet via the pcap writer.
        const CAPTURE_PACKETS = 1 << 4;
        /// Tolerate a zero-length encrypted data block from non-conformant peers.
        const ALLOW_EMPTY_ENCRYPTED_DATA_BLOCK = 1 << 5;
        /// Use CRC-16 instead of the one-byte checksum trailer.
        const USE_CRC = 1 << 6;
        /// Omit the MARK byte (both peers must agree out of band).
        const SKIP_MARK_BYTE = 1 << 7;
        /// This channel is shared with other PDs; serialize access.
        const CHN_SHARED = 1 << 8;
        /// Diagnostic only: disable sequence-number validation.
        const SKIP_SEQ_CHECK = 1 << 9;
    }
}

/// A single PD's static configuration, supplied to `cp_setup` (one per
/// attached PD) or `pd_setup` (the sole descriptor).
#[derive(Copy, Clone, Debug)]
pub struct PdInfo {
    pub address: u8,
    pub baud_rate: u32,
    pub flags: PdFlags,
    pub id: PdId,
    /// The PD's own secure channel base key, if it has one provisioned
    /// out-of-band. `None` means "derive from identity + master key", the
    /// default path described in §4.D.
    pub scbk: Option<[u8; 16]>,
    /// Shared master key used to derive `scbk` from `PD_CLIENT_UID` when no
    /// `scbk` is provisioned directly and `INSTALL_MODE` is not set (§4.D).
    pub master_key: Option<[u8; 16]>,
}

/// Baud rates the PHY is specified to run at (§10.3); matches the original
/// implementation's accepted set (9600/38400/115200).
pub const VALID_BAUD_RATES: [u32; 3] = [9600, 38400, 115200];

impl PdInfo {
    /// Validates address range, baud rate, and flag combinations per §10.3.
    /// Does not mutate; callers store the validated struct as-is.
    pub fn validate(&self) -> Result<(), OsdpError> {
        if self.address > 0x7E {
            return Err(OsdpError::InvalidConfig);
        }
        if !VALID_BAUD_RATES.contains(&self.baud_rate) {
            return Err(OsdpError::InvalidConfig);
        }
        if self.flags.contains(PdFlags::ENFORCE_SECURE)
            && !self.flags.contains(PdFlags::INSTALL_MODE)
            && self.scbk.is_none()
            && self.master_key.is_none()
        {
            // ENFORCE_SECURE with no install-mode default key, no provisioned
            // SCBK, and no master key to derive one from can never establish
            // a secure channel.
            return Err(OsdpError::InvalidConfig);
        }
        Ok(())
    }
}

/// Bound on the number of PDs a single CP context may manage (the original
/// implementation's 7-bit address space minus the broadcast address).
pub const MAX_PD: usize = 126;
