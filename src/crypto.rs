// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure-channel cryptographic primitives (component D).
//!
//! OSDP's secure channel is not an off-the-shelf AES-CBC-MAC: the MAC chain
//! mixes two distinct keys (`s_mac1` for all but the last block, `s_mac2`
//! for the last), and the IV for data encryption is the bitwise complement
//! of the peer's running MAC rather than a transmitted nonce. None of that
//! matches a `cipher`-crate mode, so this module drives the raw `Aes128`
//! block cipher directly, one block at a time, the way the original
//! protocol's reference implementation does.

use crate::error::ScError;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use aes::Block;

/// Length in bytes of every key and MAC value in the secure channel.
pub const SC_KEY_LEN: usize = 16;
pub const SC_RANDOM_LEN: usize = 8;

/// The diagnostic default SCBK used during install mode: ASCII
/// `"0123456789:;<=>?"`, i.e. bytes 0x30..=0x3F.
pub const SCBK_DEFAULT: [u8; SC_KEY_LEN] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F,
];

fn aes_ecb_encrypt_block(key: &[u8; SC_KEY_LEN], data: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new_from_slice(key).expect("key is exactly 16 bytes");
    let mut block = Block::clone_from_slice(data);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn aes_ecb_decrypt_block(key: &[u8; SC_KEY_LEN], data: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new_from_slice(key).expect("key is exactly 16 bytes");
    let mut block = Block::clone_from_slice(data);
    cipher.decrypt_block(&mut block);
    block.into()
}

fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn complement16(a: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = !a[i];
    }
    out
}

/// Derives the 8-byte `PD_CLIENT_UID` from a PD's identity record:
/// `{vendor[0], vendor[1], model, version, serial[0..4]}`.
pub fn pd_client_uid(
    vendor_code: &[u8; 3],
    model: u8,
    version: u8,
    serial_number: &[u8; 4],
) -> [u8; 8] {
    [
        vendor_code[0],
        vendor_code[1],
        model,
        version,
        serial_number[0],
        serial_number[1],
        serial_number[2],
        serial_number[3],
    ]
}

/// Derives a PD's SCBK from its 8-byte `PD_CLIENT_UID` and the shared
/// master key: `AES_ECB_Enc(master_key, uid || complement(uid))` (§4.D,
/// the non-install-mode path).
pub fn compute_scbk(master_key: &[u8; SC_KEY_LEN], pd_client_uid: &[u8; 8]) -> [u8; SC_KEY_LEN] {
    let mut block = [0u8; 16];
    block[0..8].copy_from_slice(pd_client_uid);
    for i in 0..8 {
        block[8 + i] = !pd_client_uid[i];
    }
    aes_ecb_encrypt_block(master_key, &block)
}

/// The session key material derived from SCBK and `cp_random` (§4.D).
#[derive(Copy, Clone, Debug, Default)]
pub struct SessionKeys {
    pub s_enc: [u8; SC_KEY_LEN],
    pub s_mac1: [u8; SC_KEY_LEN],
    pub s_mac2: [u8; SC_KEY_LEN],
}

fn key_derivation_block(selector: u8, sub: u8, cp_random: &[u8; SC_RANDOM_LEN]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = selector;
    block[1] = sub;
    block[2..8].copy_from_slice(&cp_random[0..6]);
    block
}

impl SessionKeys {
    /// Derives `s_enc`, `s_mac1`, `s_mac2` from `scbk` and `cp_random`.
    pub fn derive(scbk: &[u8; SC_KEY_LEN], cp_random: &[u8; SC_RANDOM_LEN]) -> Self {
        Self {
            s_enc: aes_ecb_encrypt_block(scbk, &key_derivation_block(0x01, 0x82, cp_random)),
            s_mac1: aes_ecb_encrypt_block(scbk, &key_derivation_block(0x01, 0x01, cp_random)),
            s_mac2: aes_ecb_encrypt_block(scbk, &key_derivation_block(0x01, 0x02, cp_random)),
        }
    }
}

/// Computes `cp_cryptogram = AES_ECB_Enc(s_enc, pd_random || cp_random)`.
pub fn cp_cryptogram(
    s_enc: &[u8; SC_KEY_LEN],
    pd_random: &[u8; SC_RANDOM_LEN],
    cp_random: &[u8; SC_RANDOM_LEN],
) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..8].copy_from_slice(pd_random);
    block[8..16].copy_from_slice(cp_random);
    aes_ecb_encrypt_block(s_enc, &block)
}

/// Computes `pd_cryptogram = AES_ECB_Enc(s_enc, cp_random || pd_random)`.
pub fn pd_cryptogram(
    s_enc: &[u8; SC_KEY_LEN],
    cp_random: &[u8; SC_RANDOM_LEN],
    pd_random: &[u8; SC_RANDOM_LEN],
) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..8].copy_from_slice(cp_random);
    block[8..16].copy_from_slice(pd_random);
    aes_ecb_encrypt_block(s_enc, &block)
}

/// Seeds `r_mac = AES_ECB_Enc(s_mac2, AES_ECB_Enc(s_mac1, cp_cryptogram))`.
pub fn seed_r_mac(
    s_mac1: &[u8; SC_KEY_LEN],
    s_mac2: &[u8; SC_KEY_LEN],
    cp_cryptogram: &[u8; 16],
) -> [u8; 16] {
    let inner = aes_ecb_encrypt_block(s_mac1, cp_cryptogram);
    aes_ecb_encrypt_block(s_mac2, &inner)
}

/// Pads `data` with an `0x80` marker then zeroes to the next 16-byte
/// boundary, appending the padded blocks to `out`. Returns the number of
/// bytes written.
pub fn pad_to_blocks(data: &[u8], out: &mut [u8]) -> usize {
    let padded_len = ((data.len() + 1 + 15) / 16) * 16;
    out[..data.len()].copy_from_slice(data);
    out[data.len()] = 0x80;
    for b in out.iter_mut().take(padded_len).skip(data.len() + 1) {
        *b = 0;
    }
    padded_len
}

/// Strips an `0x80`-then-zeroes pad marker from a decrypted block run,
/// returning the unpadded length. `ScError::BadPadding` if no marker byte is
/// found, or `ScError::EmptyEncryptedBlock` if the unpadded length is zero.
pub fn unpad(data: &[u8], allow_empty: bool) -> Result<usize, ScError> {
    let mut i = data.len();
    while i > 0 {
        i -= 1;
        match data[i] {
            0x00 => continue,
            0x80 => {
                if i == 0 && !allow_empty {
                    return Err(ScError::EmptyEncryptedBlock);
                }
                return Ok(i);
            }
            _ => return Err(ScError::BadPadding),
        }
    }
    Err(ScError::BadPadding)
}

/// Computes the running MAC over `data` (already padded to a multiple of 16
/// bytes), chained from `iv` (the peer/own previous MAC per §4.D), under
/// `s_mac1` for every block but the last and `s_mac2` for the last.
///
/// Returns the full 16-byte MAC; callers truncate to the low 4 bytes for the
/// wire trailer.
pub fn compute_mac(
    s_mac1: &[u8; SC_KEY_LEN],
    s_mac2: &[u8; SC_KEY_LEN],
    iv: &[u8; 16],
    data: &[u8],
) -> [u8; 16] {
    debug_assert!(data.len() % 16 == 0 && !data.is_empty());
    let n_blocks = data.len() / 16;
    let mut chain = *iv;
    for (i, chunk) in data.chunks_exact(16).enumerate() {
        let mut block16 = [0u8; 16];
        block16.copy_from_slice(chunk);
        let xored = xor16(&chain, &block16);
        chain = if i + 1 == n_blocks {
            aes_ecb_encrypt_block(s_mac2, &xored)
        } else {
            aes_ecb_encrypt_block(s_mac1, &xored)
        };
    }
    chain
}

/// Encrypts `plaintext` (already pad-block-aligned) in AES-CBC under
/// `s_enc`, with IV = complement of `peer_mac`. Writes ciphertext into
/// `out`, which must be at least `plaintext.len()` bytes.
pub fn encrypt_data(s_enc: &[u8; SC_KEY_LEN], peer_mac: &[u8; 16], plaintext: &[u8], out: &mut [u8]) {
    debug_assert!(plaintext.len() % 16 == 0);
    let mut iv = complement16(peer_mac);
    for (chunk, out_chunk) in plaintext.chunks_exact(16).zip(out.chunks_exact_mut(16)) {
        let mut block16 = [0u8; 16];
        block16.copy_from_slice(chunk);
        let xored = xor16(&iv, &block16);
        let ciphertext = aes_ecb_encrypt_block(s_enc, &xored);
        out_chunk.copy_from_slice(&ciphertext);
        iv = ciphertext;
    }
}

/// Decrypts `ciphertext` (block-aligned) in AES-CBC under `s_enc`, with IV =
/// complement of `peer_mac`. Writes plaintext into `out`.
pub fn decrypt_data(s_enc: &[u8; SC_KEY_LEN], peer_mac: &[u8; 16], ciphertext: &[u8], out: &mut [u8]) {
    debug_assert!(ciphertext.len() % 16 == 0);
    let mut iv = complement16(peer_mac);
    for (chunk, out_chunk) in ciphertext.chunks_exact(16).zip(out.chunks_exact_mut(16)) {
        let mut block16 = [0u8; 16];
        block16.copy_from_slice(chunk);
        let decrypted = aes_ecb_decrypt_block(s_enc, &block16);
        let plain = xor16(&decrypted, &iv);
        out_chunk.copy_from_slice(&plain);
        iv = block16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pd_client_uid_matches_spec_vector() {
        // From the SC handshake scenario: vendor=0x00031337, model=153,
        // version=1 (implied by the expected uid), serial=0x01020304.
        let uid = pd_client_uid(&[0x37, 0x13, 0x03], 153, 0x01, &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(uid, [0x37, 0x13, 0x99, 0x01, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn compute_scbk_is_deterministic_and_key_dependent() {
        let uid = [0x37, 0x13, 0x99, 0x01, 0x04, 0x03, 0x02, 0x01];
        let mkey_a = [0x11; 16];
        let mkey_b = [0x22; 16];
        let a1 = compute_scbk(&mkey_a, &uid);
        let a2 = compute_scbk(&mkey_a, &uid);
        let b = compute_scbk(&mkey_b, &uid);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn session_keys_are_distinct() {
        let scbk = SCBK_DEFAULT;
        let cp_random = [1, 2, 3, 4, 5, 6, 7, 8];
        let keys = SessionKeys::derive(&scbk, &cp_random);
        assert_ne!(keys.s_enc, keys.s_mac1);
        assert_ne!(keys.s_mac1, keys.s_mac2);
        assert_ne!(keys.s_enc, keys.s_mac2);
    }

    #[test]
    fn session_keys_are_deterministic() {
        let scbk = SCBK_DEFAULT;
        let cp_random = [1, 2, 3, 4, 5, 6, 7, 8];
        let a = SessionKeys::derive(&scbk, &cp_random);
        let b = SessionKeys::derive(&scbk, &cp_random);
        assert_eq!(a.s_enc, b.s_enc);
        assert_eq!(a.s_mac1, b.s_mac1);
        assert_eq!(a.s_mac2, b.s_mac2);
    }

    #[test]
    fn cryptograms_agree_between_cp_and_pd() {
        let scbk = SCBK_DEFAULT;
        let cp_random = [1, 2, 3, 4, 5, 6, 7, 8];
        let pd_random = [8, 7, 6, 5, 4, 3, 2, 1];
        let keys = SessionKeys::derive(&scbk, &cp_random);

        // Both sides derive the same keys (PD learns cp_random off the
        // wire) and must compute the same two cryptograms independently.
        let keys_pd_side = SessionKeys::derive(&scbk, &cp_random);
        let cpc_cp = cp_cryptogram(&keys.s_enc, &pd_random, &cp_random);
        let cpc_pd = cp_cryptogram(&keys_pd_side.s_enc, &pd_random, &cp_random);
        assert_eq!(cpc_cp, cpc_pd);

        let pdc_cp = pd_cryptogram(&keys.s_enc, &cp_random, &pd_random);
        let pdc_pd = pd_cryptogram(&keys_pd_side.s_enc, &cp_random, &pd_random);
        assert_eq!(pdc_cp, pdc_pd);

        // The two cryptograms differ from each other (different block order).
        assert_ne!(cpc_cp, pdc_cp);
    }

    #[test]
    fn r_mac_seed_is_deterministic() {
        let scbk = SCBK_DEFAULT;
        let cp_random = [1, 2, 3, 4, 5, 6, 7, 8];
        let pd_random = [8, 7, 6, 5, 4, 3, 2, 1];
        let keys = SessionKeys::derive(&scbk, &cp_random);
        let cpc = cp_cryptogram(&keys.s_enc, &pd_random, &cp_random);
        let r1 = seed_r_mac(&keys.s_mac1, &keys.s_mac2, &cpc);
        let r2 = seed_r_mac(&keys.s_mac1, &keys.s_mac2, &cpc);
        assert_eq!(r1, r2);
    }

    #[test]
    fn pad_and_unpad_roundtrip() {
        let data = b"hello osdp";
        let mut buf = [0u8; 32];
        let n = pad_to_blocks(data, &mut buf);
        assert_eq!(n, 16);
        let unpadded = unpad(&buf[..n], false).unwrap();
        assert_eq!(unpadded, data.len());
        assert_eq!(&buf[..unpadded], data);
    }

    #[test]
    fn unpad_rejects_missing_marker() {
        let buf = [0u8; 16];
        assert_eq!(unpad(&buf, false), Err(ScError::BadPadding));
    }

    #[test]
    fn unpad_rejects_empty_block_unless_allowed() {
        let mut buf = [0u8; 16];
        buf[0] = 0x80;
        assert_eq!(unpad(&buf, false), Err(ScError::EmptyEncryptedBlock));
        assert_eq!(unpad(&buf, true), Ok(0));
    }

    #[test]
    fn mac_chain_detects_single_bit_flip() {
        let s_mac1 = [0x11; 16];
        let s_mac2 = [0x22; 16];
        let iv = [0u8; 16];
        let mut data = [0u8; 32];
        data[0] = 0xAB;
        let mac1 = compute_mac(&s_mac1, &s_mac2, &iv, &data);
        data[5] ^= 0x01;
        let mac2 = compute_mac(&s_mac1, &s_mac2, &iv, &data);
        assert_ne!(mac1, mac2);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let s_enc = [0x55; 16];
        let peer_mac = [0xAA; 16];
        let mut plaintext = [0u8; 32];
        plaintext[0] = 1;
        plaintext[16] = 2;
        let mut ciphertext = [0u8; 32];
        encrypt_data(&s_enc, &peer_mac, &plaintext, &mut ciphertext);
        assert_ne!(ciphertext, plaintext);
        let mut decrypted = [0u8; 32];
        decrypt_data(&s_enc, &peer_mac, &ciphertext, &mut decrypted);
        assert_eq!(decrypted, plaintext);
    }
}
