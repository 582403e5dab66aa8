// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level constants and integrity primitives (components A/B framing
//! constants and the CRC-16/checksum trailers).

use crc::{Algorithm, Crc};

/// Mark byte, sent (optionally) immediately before every `SOM`.
pub const MARK: u8 = 0xFF;
/// Start-of-message byte.
pub const SOM: u8 = 0x53;

/// Minimum valid packet length (SOM..checksum, no mark byte, no SCB, no
/// payload): address(1) + length(2) + control(1) + id(1) + checksum(1).
pub const PACKET_MIN_LEN: usize = 6;
/// Maximum packet length, matching `OSDP_PACKET_BUF_SIZE` in the original
/// implementation.
pub const PACKET_BUF_SIZE: usize = 512;

/// Mask isolating the sequence-number bits of the control byte.
pub const CTRL_SEQ_MASK: u8 = 0x03;
/// Control-byte bit selecting CRC-16 (set) vs. checksum (clear) trailer.
pub const CTRL_CRC_BIT: u8 = 0x04;
/// Control-byte bit indicating a Security Control Block follows the header.
pub const CTRL_SCB_BIT: u8 = 0x08;

/// MSB of the on-wire address byte: 0 for CP→PD, 1 for PD→CP.
pub const ADDR_PD_TO_CP_BIT: u8 = 0x80;
/// Mask isolating the 7-bit bus address.
pub const ADDR_MASK: u8 = 0x7F;
/// Broadcast address (CP→PD only).
pub const ADDR_BROADCAST: u8 = 0x7F;

/// CRC-16/ITU-T (a.k.a. CRC-16/X-25 poly with a non-standard init) used by
/// OSDP: polynomial 0x1021, initial value 0x1D0F, no reflection, no xorout.
const OSDP_CRC16: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x1D0F,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x0000,
    residue: 0x0000,
};

static CRC16: Crc<u16> = Crc::<u16>::new(&OSDP_CRC16);

/// Computes the OSDP CRC-16/ITU-T over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Computes the OSDP checksum trailer: the two's-complement of the byte sum
/// of `data`, i.e. the value that makes `sum(data) + checksum == 0 (mod 256)`.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Verifies a trailing checksum byte against the preceding bytes.
pub fn checksum_valid(data_with_trailer: &[u8]) -> bool {
    data_with_trailer
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        == 0
}

/// Verifies a trailing CRC-16 (little-endian) against the preceding bytes.
pub fn crc16_valid(data_with_trailer: &[u8]) -> bool {
    if data_with_trailer.len() < 2 {
        return false;
    }
    let (body, trailer) = data_with_trailer.split_at(data_with_trailer.len() - 2);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    crc16(body) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_empty_is_zero() {
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn checksum_roundtrip() {
        let data = [0x65, 0x08, 0x00, 0x05, 0x60];
        let c = checksum(&data);
        let mut with_trailer = data.to_vec();
        with_trailer.push(c);
        assert!(checksum_valid(&with_trailer));
    }

    #[test]
    fn checksum_detects_single_bit_flip() {
        let mut body = vec![0x65, 0x08, 0x00, 0x05, 0x60];
        let c = checksum(&body);
        body.push(c);
        assert!(checksum_valid(&body));
        body[2] ^= 0x01;
        assert!(!checksum_valid(&body));
    }

    #[test]
    fn crc16_roundtrip() {
        let data = b"hello, osdp";
        let c = crc16(data);
        let mut buf = data.to_vec();
        buf.extend_from_slice(&c.to_le_bytes());
        assert!(crc16_valid(&buf));
        // Flipping a single bit anywhere must invalidate the trailer.
        buf[0] ^= 0x01;
        assert!(!crc16_valid(&buf));
    }
}
