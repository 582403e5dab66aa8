// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet PHY: build outgoing frames, scan and validate incoming ones
//! (component E, §4.E).

use crate::codec::NakReason;
use crate::crypto::{self, SC_KEY_LEN};
use crate::error::PhyError;
use crate::ring::RxRing;
use crate::wire::{self, ADDR_BROADCAST, ADDR_MASK, ADDR_PD_TO_CP_BIT, CTRL_CRC_BIT, CTRL_SCB_BIT, CTRL_SEQ_MASK, MARK, SOM};
use log::{error, trace};

/// SCB (Security Control Block) type byte values.
pub mod scs {
    pub const CHLNG: u8 = 0x11;
    pub const CCRYPT: u8 = 0x12;
    pub const SCRYPT: u8 = 0x13;
    pub const RMAC_I: u8 = 0x14;
    pub const MAC_CP: u8 = 0x15;
    pub const MAC_PD: u8 = 0x16;
    pub const ENC_CP: u8 = 0x17;
    pub const ENC_PD: u8 = 0x18;
}

/// Which direction a packet travels; determines the address MSB and which
/// pair of SCS codes (handshake or steady-state) applies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Cp,
    Pd,
}

/// Secure-channel parameters needed to finish building or scanning a packet.
/// `None` means SC is not active / not attempted for this packet.
pub struct ScContext<'a> {
    pub s_enc: &'a [u8; SC_KEY_LEN],
    pub s_mac1: &'a [u8; SC_KEY_LEN],
    pub s_mac2: &'a [u8; SC_KEY_LEN],
    /// The running MAC this side will chain from (previous own MAC when
    /// transmitting; previous peer MAC when receiving).
    pub chain_mac: &'a [u8; 16],
    pub allow_empty_encrypted_block: bool,
}

/// Describes how to frame the outgoing packet: whether to emit MARK, which
/// trailer to use, and, if SC is active, which SCS code and key material to
/// apply.
pub struct BuildOptions<'a> {
    pub role: Role,
    pub address: u8,
    pub seq: u8,
    pub use_crc: bool,
    pub skip_mark_byte: bool,
    /// `Some(scs_type)` to attach an SCB. Handshake packets (0x11..0x14)
    /// carry no MAC/encryption; 0x15..0x18 do, driven by `sc`.
    pub scb: Option<(u8, Option<ScContext<'a>>)>,
}

/// Appends MARK/SOM/header/SCB/payload/trailer for `id` + `payload` into
/// `out`, returning the number of bytes written, or `PhyError::Build` if it
/// would not fit. The new running MAC (if SC was active) is returned so the
/// caller can store it as its own MAC for the next packet.
pub fn build_packet(
    opts: &BuildOptions,
    id: u8,
    payload: &[u8],
    out: &mut [u8],
    max_len: usize,
) -> Result<(usize, Option<[u8; 16]>), PhyError> {
    let mut pos = 0usize;
    if !opts.skip_mark_byte {
        if pos >= out.len() {
            return Err(PhyError::Build);
        }
        out[pos] = MARK;
        pos += 1;
    }
    let header_start = pos;
    if pos >= out.len() {
        return Err(PhyError::Build);
    }
    out[pos] = wire::SOM;
    pos += 1;

    let addr_byte = (opts.address & ADDR_MASK)
        | if opts.role == Role::Pd { ADDR_PD_TO_CP_BIT } else { 0 };
    if pos >= out.len() {
        return Err(PhyError::Build);
    }
    out[pos] = addr_byte;
    pos += 1;

    // Length field placeholder, patched in below.
    let len_pos = pos;
    pos += 2;

    let mut control = opts.seq & CTRL_SEQ_MASK;
    if opts.use_crc {
        control |= CTRL_CRC_BIT;
    }
    if opts.scb.is_some() {
        control |= CTRL_SCB_BIT;
    }
    if pos >= out.len() {
        return Err(PhyError::Build);
    }
    out[pos] = control;
    pos += 1;

    let mut new_mac = None;

    if let Some((scs_type, sc)) = &opts.scb {
        let scb_len_pos = pos;
        pos += 1; // SCB length byte, patched below
        if pos >= out.len() {
            return Err(PhyError::Build);
        }
        out[pos] = *scs_type;
        pos += 1;

        if pos >= out.len() {
            return Err(PhyError::Build);
        }
        out[pos] = id;
        let id_pos = pos;
        pos += 1;

        let payload_start = pos;
        if pos + payload.len() > out.len() {
            return Err(PhyError::Build);
        }
        out[pos..pos + payload.len()].copy_from_slice(payload);
        pos += payload.len();

        if let Some(sc) = sc {
            if *scs_type == scs::ENC_CP || *scs_type == scs::ENC_PD {
                let mut padded = [0u8; wire::PACKET_BUF_SIZE];
                let padded_len = crypto::pad_to_blocks(&out[payload_start..pos], &mut padded);
                if payload_start + padded_len > out.len() {
                    return Err(PhyError::Build);
                }
                crypto::encrypt_data(sc.s_enc, sc.chain_mac, &padded[..padded_len], &mut out[payload_start..payload_start + padded_len]);
                pos = payload_start + padded_len;
            }
            // MAC is computed over id byte + (plaintext or ciphertext)
            // payload, padded to a 16-byte boundary.
            let mac_region_len = pos - id_pos;
            let mut mac_padded = [0u8; wire::PACKET_BUF_SIZE];
            let padded_len = crypto::pad_to_blocks(&out[id_pos..pos], &mut mac_padded);
            let mac = crypto::compute_mac(sc.s_mac1, sc.s_mac2, sc.chain_mac, &mac_padded[..padded_len]);
            if pos + 4 > out.len() {
                return Err(PhyError::Build);
            }
            out[pos..pos + 4].copy_from_slice(&mac[0..4]);
            pos += 4;
            new_mac = Some(mac);
        }

        // SCB length byte covers only the SCB field itself (length + type);
        // challenge/cryptogram data rides as ordinary command payload.
        out[scb_len_pos] = 2;
    } else {
        if pos >= out.len() {
            return Err(PhyError::Build);
        }
        out[pos] = id;
        pos += 1;
        if pos + payload.len() > out.len() {
            return Err(PhyError::Build);
        }
        out[pos..pos + payload.len()].copy_from_slice(payload);
        pos += payload.len();
    }

    let trailer_len = if opts.use_crc { 2 } else { 1 };
    if pos + trailer_len > out.len() {
        return Err(PhyError::Build);
    }
    let total_len = (pos + trailer_len) - header_start;
    out[len_pos] = (total_len & 0xFF) as u8;
    out[len_pos + 1] = ((total_len >> 8) & 0xFF) as u8;

    if opts.use_crc {
        let c = wire::crc16(&out[header_start..pos]);
        out[pos] = (c & 0xFF) as u8;
        out[pos + 1] = (c >> 8) as u8;
        pos += 2;
    } else {
        let c = wire::checksum(&out[header_start..pos]);
        out[pos] = c;
        pos += 1;
    }

    if pos > max_len {
        return Err(PhyError::Build);
    }

    Ok((pos, new_mac))
}

/// A successfully scanned and validated incoming packet.
pub struct ScannedPacket<'a> {
    pub address: u8,
    pub broadcast: bool,
    pub seq: u8,
    pub scs_type: Option<u8>,
    pub id: u8,
    pub payload: &'a [u8],
    pub new_mac: Option<[u8; 16]>,
    /// Total bytes consumed from the ring buffer for this packet (does not
    /// include a leading MARK byte, already dropped by the caller).
    pub consumed: usize,
}

/// Attempts to scan one packet out of `ring`. `scratch` is working storage
/// at least `PACKET_BUF_SIZE` bytes, used to assemble and (if applicable)
/// decrypt the packet in place.
///
/// On success, the packet bytes (including any in-place decryption) live in
/// `scratch[..consumed_payload_region]`; `ScannedPacket::payload` borrows
/// from `scratch`.
pub fn scan_packet<'a, const N: usize>(
    ring: &mut RxRing<N>,
    scratch: &'a mut [u8],
    role: Role,
    own_address: u8,
    expected_seq: u8,
    skip_seq_check: bool,
    sc: Option<&ScContext>,
) -> Result<ScannedPacket<'a>, PhyError> {
    // Drop leading bytes (and an optional MARK) until a SOM is found at the
    // front of the buffer.
    loop {
        match ring.peek(0) {
            None => return Err(PhyError::Wait),
            Some(MARK) => {
                ring.pop();
                continue;
            }
            Some(b) if b == SOM => break,
            Some(_) => {
                ring.pop();
                continue;
            }
        }
    }

    if ring.len() < wire::PACKET_MIN_LEN {
        trace!("scan_packet: {} bytes buffered, waiting for header", ring.len());
        return Err(PhyError::Wait);
    }

    let addr_byte = ring.peek(1).ok_or(PhyError::Wait)?;
    let len_lo = ring.peek(2).ok_or(PhyError::Wait)?;
    let len_hi = ring.peek(3).ok_or(PhyError::Wait)?;
    let total_len = len_lo as usize | (len_hi as usize) << 8;

    if !(wire::PACKET_MIN_LEN..=wire::PACKET_BUF_SIZE).contains(&total_len) {
        ring.pop();
        return Err(PhyError::Check);
    }
    if ring.len() < total_len {
        return Err(PhyError::Wait);
    }

    let pd_to_cp = addr_byte & ADDR_PD_TO_CP_BIT != 0;
    let expect_pd_to_cp = role == Role::Cp;
    if pd_to_cp != expect_pd_to_cp {
        ring.pop();
        return Err(PhyError::Check);
    }

    if total_len > scratch.len() {
        ring.drop_front(total_len);
        return Err(PhyError::Check);
    }
    ring.take(&mut scratch[..total_len], total_len);
    let buf = &mut scratch[..total_len];

    let address = addr_byte & ADDR_MASK;
    let broadcast = address == ADDR_BROADCAST;
    if role == Role::Pd && address != own_address && !broadcast {
        return Err(PhyError::Skip);
    }
    if role == Role::Cp && address != own_address {
        return Err(PhyError::Check);
    }

    let control = buf[4];
    let use_crc = control & CTRL_CRC_BIT != 0;
    let has_scb = control & CTRL_SCB_BIT != 0;
    let seq = control & CTRL_SEQ_MASK;

    let trailer_ok = if use_crc {
        wire::crc16_valid(buf)
    } else {
        wire::checksum_valid(buf)
    };
    if !trailer_ok {
        return Err(PhyError::Check);
    }
    let trailer_len = if use_crc { 2 } else { 1 };
    let body_end = total_len - trailer_len;

    // Sequence check: seq 0 is always a resync; a repeat of the last
    // accepted seq (sequence cycles through 1, 2, 3) is a benign retransmit.
    // `SKIP_SEQ_CHECK` bypasses this entirely for diagnostic/shared-bus use.
    let previous_seq = if expected_seq <= 1 { 3 } else { expected_seq - 1 };
    if !skip_seq_check && seq != 0 && seq != expected_seq && seq != previous_seq {
        return Err(PhyError::Nack(NakReason::SeqNum));
    }

    let mut pos = 5usize;
    let mut scs_type = None;
    let mut new_mac = None;

    if has_scb {
        if pos + 2 > body_end {
            return Err(PhyError::Check);
        }
        let _scb_len = buf[pos];
        let t = buf[pos + 1];
        scs_type = Some(t);
        pos += 2;

        if t >= scs::MAC_CP {
            let sc = sc.ok_or(PhyError::ScCondition)?;
            let id_pos = pos;
            let mac_start = body_end - 4;
            if mac_start < id_pos {
                return Err(PhyError::Check);
            }
            let mut mac_padded = [0u8; wire::PACKET_BUF_SIZE];
            let padded_len = crypto::pad_to_blocks(&buf[id_pos..mac_start], &mut mac_padded);
            let mac = crypto::compute_mac(sc.s_mac1, sc.s_mac2, sc.chain_mac, &mac_padded[..padded_len]);
            if mac[0..4] != buf[mac_start..mac_start + 4] {
                error!("mac mismatch on incoming packet, scs=0x{t:02x}");
                return Err(PhyError::ScCondition);
            }
            new_mac = Some(mac);

            if t == scs::ENC_CP || t == scs::ENC_PD {
                let cipher_start = id_pos + 1;
                if cipher_start > mac_start {
                    return Err(PhyError::Check);
                }
                let cipher_len = mac_start - cipher_start;
                if cipher_len % 16 != 0 {
                    return Err(PhyError::Check);
                }
                if cipher_len > 0 {
                    let mut plain = [0u8; wire::PACKET_BUF_SIZE];
                    crypto::decrypt_data(sc.s_enc, sc.chain_mac, &buf[cipher_start..mac_start], &mut plain[..cipher_len]);
                    buf[cipher_start..mac_start].copy_from_slice(&plain[..cipher_len]);
                    let unpadded = crypto::unpad(&buf[cipher_start..mac_start], sc.allow_empty_encrypted_block)
                        .map_err(|_| PhyError::ScCondition)?;
                    let id = buf[id_pos];
                    let consumed = total_len;
                    return Ok(ScannedPacket {
                        address,
                        broadcast,
                        seq,
                        scs_type,
                        id,
                        payload: &scratch[cipher_start..cipher_start + unpadded],
                        new_mac,
                        consumed,
                    });
                } else if !sc.allow_empty_encrypted_block {
                    return Err(PhyError::ScCondition);
                }
            }
        }
    }

    let id_pos = pos;
    if id_pos >= body_end {
        return Err(PhyError::Check);
    }
    let id = buf[id_pos];
    let payload_end = if scs_type.map(|t| t >= scs::MAC_CP).unwrap_or(false) {
        body_end - 4
    } else {
        body_end
    };
    let consumed = total_len;
    Ok(ScannedPacket {
        address,
        broadcast,
        seq,
        scs_type,
        id,
        payload: &scratch[id_pos + 1..payload_end],
        new_mac,
        consumed,
    })
}
