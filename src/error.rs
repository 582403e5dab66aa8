// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns one of the small `Copy`
//! enums below rather than a boxed/allocating error type. Component-local
//! errors (`PhyError`, `ScError`, ...) compose upward into [`OsdpError`] via
//! `From` so callers at the public API boundary only ever see one type.

use core::fmt;
use derive_more::From;

/// Errors produced while scanning or building a packet (component E).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhyError {
    /// Not enough bytes buffered yet to make a decision; try again next tick.
    Wait,
    /// Bytes were consumed but did not belong to this PD (foreign traffic on
    /// a shared channel); caller should keep scanning.
    Skip,
    /// Header or trailer failed structural validation (bad SOM, length out
    /// of range, bad CRC/checksum).
    Check,
    /// A syntactically well-formed packet addressed to us still requires a
    /// NAK reply with the given reason.
    Nack(super::codec::NakReason),
    /// A PD busy reply was recognized; the CP should retry later.
    Busy,
    /// The outgoing packet would not fit in the peer's announced RX size.
    Build,
    /// Secure channel validation on the incoming packet failed.
    ScCondition,
}

impl fmt::Display for PhyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhyError::Wait => "wait: partial packet",
            PhyError::Skip => "skip: foreign packet",
            PhyError::Check => "check: malformed packet",
            PhyError::Nack(_) => "nack: packet requires a NAK reply",
            PhyError::Busy => "busy: peer signalled busy",
            PhyError::Build => "build: packet exceeds peer rx size",
            PhyError::ScCondition => "sc: secure channel condition violated",
        };
        f.write_str(s)
    }
}

/// Errors produced by the secure channel engine (component D).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScError {
    /// MAC verification failed on an incoming packet.
    MacMismatch,
    /// Cryptogram verification failed during the handshake.
    CryptogramMismatch,
    /// Ciphertext length was not a multiple of the AES block size, or its
    /// padding marker (`0x80` followed by zeroes) was missing.
    BadPadding,
    /// An encrypted data block was empty and the PD does not allow it.
    EmptyEncryptedBlock,
    /// Secure channel is not active but the caller required it.
    NotActive,
}

impl fmt::Display for ScError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScError::MacMismatch => "mac: verification failed",
            ScError::CryptogramMismatch => "sc: cryptogram mismatch",
            ScError::BadPadding => "sc: bad ciphertext padding",
            ScError::EmptyEncryptedBlock => "sc: empty encrypted data block",
            ScError::NotActive => "sc: secure channel not active",
        };
        f.write_str(s)
    }
}

/// Errors produced while encoding/decoding a command or reply payload
/// (component F).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer too small to hold the encoded payload.
    BufferTooSmall,
    /// Not enough bytes to decode a complete payload.
    Truncated,
    /// A length field (e.g. `TEXT.length`, `KEYSET.length`) exceeded its
    /// protocol maximum.
    FieldTooLong,
    /// Command/reply ID byte did not match any known type.
    UnknownId(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::BufferTooSmall => f.write_str("codec: buffer too small"),
            CodecError::Truncated => f.write_str("codec: truncated payload"),
            CodecError::FieldTooLong => f.write_str("codec: field exceeds protocol maximum"),
            CodecError::UnknownId(id) => write!(f, "codec: unknown id 0x{id:02x}"),
        }
    }
}

/// Errors produced by the bounded command/event queues.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The fixed-size slab has no free slots.
    Full,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => f.write_str("queue: pool exhausted"),
        }
    }
}

/// Errors produced by the file-transfer engine (component G).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileError {
    /// No transfer is in progress for this PD.
    NoSession,
    /// A transfer is already in progress; a second one was requested.
    AlreadyInProgress,
    /// The user's `file_ops.open`/`read`/`write`/`close` callback failed.
    UserCallback,
    /// Consecutive chunk failures exceeded `OSDP_FILE_ERROR_RETRY_MAX`.
    RetryLimitExceeded,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileError::NoSession => "file: no transfer in progress",
            FileError::AlreadyInProgress => "file: transfer already in progress",
            FileError::UserCallback => "file: user callback failed",
            FileError::RetryLimitExceeded => "file: retry limit exceeded",
        };
        f.write_str(s)
    }
}

/// Errors surfaced at the public API boundary (component J).
#[derive(Copy, Clone, Debug, PartialEq, Eq, From)]
pub enum OsdpError {
    Phy(PhyError),
    Sc(ScError),
    Codec(CodecError),
    Queue(QueueError),
    File(FileError),
    /// `address` was outside `0..=0x7E`, or a CP was configured with zero or
    /// more than 126 PDs.
    InvalidConfig,
    /// The PD index passed to a public entry point is out of range.
    InvalidPd,
    /// The PD is disabled; the operation requires it to be enabled.
    PdDisabled,
}

impl fmt::Display for OsdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsdpError::Phy(e) => write!(f, "{e}"),
            OsdpError::Sc(e) => write!(f, "{e}"),
            OsdpError::Codec(e) => write!(f, "{e}"),
            OsdpError::Queue(e) => write!(f, "{e}"),
            OsdpError::File(e) => write!(f, "{e}"),
            OsdpError::InvalidConfig => f.write_str("invalid configuration"),
            OsdpError::InvalidPd => f.write_str("pd index out of range"),
            OsdpError::PdDisabled => f.write_str("pd is disabled"),
        }
    }
}
