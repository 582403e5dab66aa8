// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command/reply codec (component F).
//!
//! Per the design notes, wire structures are *not* derived from Rust memory
//! layout: every payload has a hand-written `encode`/`decode` pair with an
//! explicit byte order, matching how the protocol actually puts bytes on the
//! wire (little-endian throughout, except the firmware-version field of
//! `Pdid`, which is big-endian).

use crate::error::CodecError;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Maximum length of a `TEXT` command's character data.
pub const TEXT_MAX_LEN: usize = 32;
/// Maximum length of a `KEYSET` command's key material.
pub const KEYSET_MAX_LEN: usize = 16;

/// CP → PD command identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandId {
    Poll = 0x60,
    Id = 0x61,
    Cap = 0x62,
    Lstat = 0x64,
    Istat = 0x65,
    Ostat = 0x66,
    Rstat = 0x67,
    Out = 0x68,
    Led = 0x69,
    Buz = 0x6A,
    Text = 0x6B,
    Tdset = 0x6D,
    Comset = 0x6E,
    Bioread = 0x73,
    Biomatch = 0x74,
    Keyset = 0x75,
    Chlng = 0x76,
    Scrypt = 0x77,
    Acurxsize = 0x7B,
    Filetransfer = 0x7C,
    Mfg = 0x80,
    Abort = 0xA2,
    Keepactive = 0xA7,
}

impl CommandId {
    pub fn from_u8(id: u8) -> Option<Self> {
        FromPrimitive::from_u8(id)
    }
}

/// PD → CP reply identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ReplyId {
    Ack = 0x40,
    Nak = 0x41,
    Pdid = 0x45,
    Pdcap = 0x46,
    Lstatr = 0x48,
    Istatr = 0x49,
    Ostatr = 0x4A,
    Rstatr = 0x4B,
    Raw = 0x50,
    Fmt = 0x51,
    Keypad = 0x53,
    Com = 0x54,
    Bioreadr = 0x57,
    Biomatchr = 0x58,
    Ccrypt = 0x76,
    RmacI = 0x78,
    Busy = 0x79,
    Ftstat = 0x7A,
    Mfgrep = 0x90,
    Xrd = 0xB1,
}

impl ReplyId {
    pub fn from_u8(id: u8) -> Option<Self> {
        FromPrimitive::from_u8(id)
    }
}

/// Reasons a PD may give for sending a `NAK` reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum NakReason {
    None = 0x00,
    MsgChk = 0x01,
    CmdLen = 0x02,
    CmdUnknown = 0x03,
    SeqNum = 0x04,
    ScUnsup = 0x05,
    ScCond = 0x06,
    BioType = 0x07,
    BioFmt = 0x08,
    Record = 0x09,
}

impl NakReason {
    pub fn from_u8(id: u8) -> Option<Self> {
        FromPrimitive::from_u8(id)
    }
}

fn put_u16_le(out: &mut [u8], v: u16) {
    out[0] = (v & 0xFF) as u8;
    out[1] = (v >> 8) as u8;
}

fn get_u16_le(buf: &[u8]) -> u16 {
    buf[0] as u16 | (buf[1] as u16) << 8
}

fn put_u32_le(out: &mut [u8], v: u32) {
    out[0] = (v & 0xFF) as u8;
    out[1] = ((v >> 8) & 0xFF) as u8;
    out[2] = ((v >> 16) & 0xFF) as u8;
    out[3] = ((v >> 24) & 0xFF) as u8;
}

fn get_u32_le(buf: &[u8]) -> u32 {
    buf[0] as u32 | (buf[1] as u32) << 8 | (buf[2] as u32) << 16 | (buf[3] as u32) << 24
}

fn require(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

fn require_out(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        Err(CodecError::BufferTooSmall)
    } else {
        Ok(())
    }
}

/// `CMD_OUT` — output control.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CmdOutput {
    pub output_no: u8,
    pub control_code: u8,
    pub tmr_count: u16,
}

impl CmdOutput {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 4)?;
        out[0] = self.output_no;
        out[1] = self.control_code;
        put_u16_le(&mut out[2..4], self.tmr_count);
        Ok(4)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 4)?;
        Ok(Self {
            output_no: buf[0],
            control_code: buf[1],
            tmr_count: get_u16_le(&buf[2..4]),
        })
    }
}

/// One of the two parameter blocks inside `CMD_LED`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct LedParams {
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub on_color: u8,
    pub off_color: u8,
    pub timer: u16,
}

impl LedParams {
    fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 6)?;
        out[0] = self.control_code;
        out[1] = self.on_count;
        out[2] = self.off_count;
        out[3] = self.on_color;
        out[4] = self.off_color;
        put_u16_le(&mut out[5..7], self.timer);
        Ok(6)
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 6)?;
        Ok(Self {
            control_code: buf[0],
            on_count: buf[1],
            off_count: buf[2],
            on_color: buf[3],
            off_color: buf[4],
            timer: get_u16_le(&buf[5..7]),
        })
    }
}

/// One "permanent" LED parameter block (no timer field).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct LedPermParams {
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub on_color: u8,
    pub off_color: u8,
}

impl LedPermParams {
    fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 5)?;
        out[0] = self.control_code;
        out[1] = self.on_count;
        out[2] = self.off_count;
        out[3] = self.on_color;
        out[4] = self.off_color;
        Ok(5)
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 5)?;
        Ok(Self {
            control_code: buf[0],
            on_count: buf[1],
            off_count: buf[2],
            on_color: buf[3],
            off_color: buf[4],
        })
    }
}

/// `CMD_LED`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct CmdLed {
    pub reader: u8,
    pub led_no: u8,
    pub temporary: LedParams,
    pub permanent: LedPermParams,
}

impl CmdLed {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 2 + 6 + 5)?;
        out[0] = self.reader;
        out[1] = self.led_no;
        let n = self.temporary.encode(&mut out[2..])?;
        let n2 = self.permanent.encode(&mut out[2 + n..])?;
        Ok(2 + n + n2)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 2 + 6 + 5)?;
        Ok(Self {
            reader: buf[0],
            led_no: buf[1],
            temporary: LedParams::decode(&buf[2..])?,
            permanent: LedPermParams::decode(&buf[8..])?,
        })
    }
}

/// `CMD_BUZ`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct CmdBuzzer {
    pub reader: u8,
    pub tone_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub rep_count: u8,
}

impl CmdBuzzer {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 5)?;
        out[0] = self.reader;
        out[1] = self.tone_code;
        out[2] = self.on_count;
        out[3] = self.off_count;
        out[4] = self.rep_count;
        Ok(5)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 5)?;
        Ok(Self {
            reader: buf[0],
            tone_code: buf[1],
            on_count: buf[2],
            off_count: buf[3],
            rep_count: buf[4],
        })
    }
}

/// `CMD_TEXT`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CmdText {
    pub reader: u8,
    pub cmd: u8,
    pub temp_time: u8,
    pub row: u8,
    pub col: u8,
    pub length: u8,
    pub data: [u8; TEXT_MAX_LEN],
}

impl Default for CmdText {
    fn default() -> Self {
        Self {
            reader: 0,
            cmd: 0,
            temp_time: 0,
            row: 0,
            col: 0,
            length: 0,
            data: [0; TEXT_MAX_LEN],
        }
    }
}

impl CmdText {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        if self.length as usize > TEXT_MAX_LEN {
            return Err(CodecError::FieldTooLong);
        }
        require_out(out, 6 + self.length as usize)?;
        out[0] = self.reader;
        out[1] = self.cmd;
        out[2] = self.temp_time;
        out[3] = self.row;
        out[4] = self.col;
        out[5] = self.length;
        out[6..6 + self.length as usize].copy_from_slice(&self.data[..self.length as usize]);
        Ok(6 + self.length as usize)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 6)?;
        let length = buf[5];
        if length as usize > TEXT_MAX_LEN {
            return Err(CodecError::FieldTooLong);
        }
        require(buf, 6 + length as usize)?;
        let mut data = [0u8; TEXT_MAX_LEN];
        data[..length as usize].copy_from_slice(&buf[6..6 + length as usize]);
        Ok(Self {
            reader: buf[0],
            cmd: buf[1],
            temp_time: buf[2],
            row: buf[3],
            col: buf[4],
            length,
            data,
        })
    }
}

/// `CMD_COMSET` / reply `COM` — both share the same `addr, baud` layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ComSet {
    pub addr: u8,
    pub baud: u32,
}

impl ComSet {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 5)?;
        out[0] = self.addr;
        put_u32_le(&mut out[1..5], self.baud);
        Ok(5)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 5)?;
        Ok(Self {
            addr: buf[0],
            baud: get_u32_le(&buf[1..5]),
        })
    }
}

/// `CMD_KEYSET`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CmdKeyset {
    pub key_type: u8,
    pub length: u8,
    pub data: [u8; KEYSET_MAX_LEN],
}

impl Default for CmdKeyset {
    fn default() -> Self {
        Self {
            key_type: 0,
            length: 0,
            data: [0; KEYSET_MAX_LEN],
        }
    }
}

impl CmdKeyset {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        if self.length as usize > KEYSET_MAX_LEN {
            return Err(CodecError::FieldTooLong);
        }
        require_out(out, 2 + self.length as usize)?;
        out[0] = self.key_type;
        out[1] = self.length;
        out[2..2 + self.length as usize].copy_from_slice(&self.data[..self.length as usize]);
        Ok(2 + self.length as usize)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 2)?;
        let length = buf[1];
        if length as usize > KEYSET_MAX_LEN {
            return Err(CodecError::FieldTooLong);
        }
        require(buf, 2 + length as usize)?;
        let mut data = [0u8; KEYSET_MAX_LEN];
        data[..length as usize].copy_from_slice(&buf[2..2 + length as usize]);
        Ok(Self {
            key_type: buf[0],
            length,
            data,
        })
    }
}

/// `REPLY_PDID`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct PdId {
    pub vendor_code: [u8; 3],
    pub model: u8,
    pub version: u8,
    pub serial_number: [u8; 4],
    /// Big-endian on the wire, unlike every other multi-byte field.
    pub firmware_version: [u8; 3],
}

impl PdId {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 12)?;
        out[0..3].copy_from_slice(&self.vendor_code);
        out[3] = self.model;
        out[4] = self.version;
        out[5..9].copy_from_slice(&self.serial_number);
        out[9..12].copy_from_slice(&self.firmware_version);
        Ok(12)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 12)?;
        let mut vendor_code = [0u8; 3];
        vendor_code.copy_from_slice(&buf[0..3]);
        let mut serial_number = [0u8; 4];
        serial_number.copy_from_slice(&buf[5..9]);
        let mut firmware_version = [0u8; 3];
        firmware_version.copy_from_slice(&buf[9..12]);
        Ok(Self {
            vendor_code,
            model: buf[3],
            version: buf[4],
            serial_number,
            firmware_version,
        })
    }
}

/// A single capability table entry inside `REPLY_PDCAP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct CapEntry {
    pub function_code: u8,
    pub compliance_level: u8,
    pub num_items: u8,
}

/// `CAP_COMMUNICATION_SECURITY` function code, per the capability table.
pub const CAP_COMMUNICATION_SECURITY: u8 = 0x09;
/// `CAP_RECEIVE_BUFFERSIZE` function code.
pub const CAP_RECEIVE_BUFFERSIZE: u8 = 0x0A;
/// `CAP_LARGEST_COMBINED_MESSAGE_SIZE` function code.
pub const CAP_LARGEST_COMBINED_MESSAGE_SIZE: u8 = 0x0B;

/// Bound on the number of capability entries we track (the mandatory set
/// plus the optional ones named in this spec comfortably fits in this).
pub const MAX_CAP_ENTRIES: usize = 16;

pub fn encode_pdcap(entries: &[CapEntry], out: &mut [u8]) -> Result<usize, CodecError> {
    require_out(out, entries.len() * 3)?;
    for (i, e) in entries.iter().enumerate() {
        out[i * 3] = e.function_code;
        out[i * 3 + 1] = e.compliance_level;
        out[i * 3 + 2] = e.num_items;
    }
    Ok(entries.len() * 3)
}

pub fn decode_pdcap(
    buf: &[u8],
    out: &mut [CapEntry; MAX_CAP_ENTRIES],
) -> Result<usize, CodecError> {
    if buf.len() % 3 != 0 {
        return Err(CodecError::Truncated);
    }
    let n = (buf.len() / 3).min(MAX_CAP_ENTRIES);
    for i in 0..n {
        out[i] = CapEntry {
            function_code: buf[i * 3],
            compliance_level: buf[i * 3 + 1],
            num_items: buf[i * 3 + 2],
        };
    }
    Ok(n)
}

/// `REPLY_RAW` — raw card data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReplyRaw {
    pub reader: u8,
    pub format: u8,
    pub bit_count: u16,
    pub data: [u8; 64],
}

impl Default for ReplyRaw {
    fn default() -> Self {
        Self {
            reader: 0,
            format: 0,
            bit_count: 0,
            data: [0; 64],
        }
    }
}

impl ReplyRaw {
    pub fn byte_count(&self) -> usize {
        (self.bit_count as usize).div_ceil(8)
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let n = self.byte_count();
        require_out(out, 4 + n)?;
        out[0] = self.reader;
        out[1] = self.format;
        put_u16_le(&mut out[2..4], self.bit_count);
        out[4..4 + n].copy_from_slice(&self.data[..n]);
        Ok(4 + n)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 4)?;
        let bit_count = get_u16_le(&buf[2..4]);
        let n = (bit_count as usize).div_ceil(8);
        require(buf, 4 + n)?;
        if n > 64 {
            return Err(CodecError::FieldTooLong);
        }
        let mut data = [0u8; 64];
        data[..n].copy_from_slice(&buf[4..4 + n]);
        Ok(Self {
            reader: buf[0],
            format: buf[1],
            bit_count,
            data,
        })
    }
}

/// `CMD_MFG` / `REPLY_MFGREP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mfg {
    pub vendor_code: [u8; 3],
    pub length: u8,
    pub data: [u8; 64],
}

impl Default for Mfg {
    fn default() -> Self {
        Self {
            vendor_code: [0; 3],
            length: 0,
            data: [0; 64],
        }
    }
}

impl Mfg {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 3 + self.length as usize)?;
        out[0..3].copy_from_slice(&self.vendor_code);
        out[3..3 + self.length as usize].copy_from_slice(&self.data[..self.length as usize]);
        Ok(3 + self.length as usize)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 3)?;
        let length = (buf.len() - 3).min(64) as u8;
        if buf.len() - 3 > 64 {
            return Err(CodecError::FieldTooLong);
        }
        let mut vendor_code = [0u8; 3];
        vendor_code.copy_from_slice(&buf[0..3]);
        let mut data = [0u8; 64];
        data[..length as usize].copy_from_slice(&buf[3..3 + length as usize]);
        Ok(Self {
            vendor_code,
            length,
            data,
        })
    }
}

/// `CMD_FILETRANSFER`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileTransferFragment<'a> {
    pub file_type: u8,
    pub size: u32,
    pub offset: u32,
    pub data: &'a [u8],
}

impl<'a> FileTransferFragment<'a> {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 11 + self.data.len())?;
        out[0] = self.file_type;
        put_u32_le(&mut out[1..5], self.size);
        put_u32_le(&mut out[5..9], self.offset);
        put_u16_le(&mut out[9..11], self.data.len() as u16);
        out[11..11 + self.data.len()].copy_from_slice(self.data);
        Ok(11 + self.data.len())
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        require(buf, 11)?;
        let length = get_u16_le(&buf[9..11]) as usize;
        require(buf, 11 + length)?;
        Ok(Self {
            file_type: buf[0],
            size: get_u32_le(&buf[1..5]),
            offset: get_u32_le(&buf[5..9]),
            data: &buf[11..11 + length],
        })
    }
}

/// `REPLY_FTSTAT` status codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FtStatusCode {
    Ok,
    Processed,
    Rebooting,
    Finishing,
    Abort,
    Other(i16),
}

impl FtStatusCode {
    pub fn to_i16(self) -> i16 {
        match self {
            FtStatusCode::Ok => 0,
            FtStatusCode::Processed => 1,
            FtStatusCode::Rebooting => 2,
            FtStatusCode::Finishing => 3,
            FtStatusCode::Abort => -1,
            FtStatusCode::Other(v) => v,
        }
    }

    pub fn from_i16(v: i16) -> Self {
        match v {
            0 => FtStatusCode::Ok,
            1 => FtStatusCode::Processed,
            2 => FtStatusCode::Rebooting,
            3 => FtStatusCode::Finishing,
            -1 => FtStatusCode::Abort,
            other => FtStatusCode::Other(other),
        }
    }

    pub fn is_error(self) -> bool {
        self.to_i16() < 0
    }
}

/// `REPLY_FTSTAT`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FtStat {
    pub control: u8,
    pub delay_ms: u16,
    pub status: FtStatusCode,
}

impl FtStat {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 5)?;
        out[0] = self.control;
        put_u16_le(&mut out[1..3], self.delay_ms);
        let raw = self.status.to_i16() as u16;
        put_u16_le(&mut out[3..5], raw);
        Ok(5)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 5)?;
        let raw = get_u16_le(&buf[3..5]) as i16;
        Ok(Self {
            control: buf[0],
            delay_ms: get_u16_le(&buf[1..3]),
            status: FtStatusCode::from_i16(raw),
        })
    }
}

/// `CMD_ACURXSIZE` — the CP's RX buffer announcement to the PD, sent once
/// right after capability detection (§4.H, the dual of the
/// `RECEIVE_BUFFERSIZE` capability the PD advertises back). The PD stores
/// this to size its own replies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct AcuRxSize {
    pub rx_size: u16,
}

impl AcuRxSize {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        require_out(out, 2)?;
        put_u16_le(out, self.rx_size);
        Ok(2)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require(buf, 2)?;
        Ok(Self {
            rx_size: get_u16_le(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_match_wire_values() {
        assert_eq!(CommandId::Poll as u8, 0x60);
        assert_eq!(CommandId::Keepactive as u8, 0xA7);
        assert_eq!(CommandId::from_u8(0x60), Some(CommandId::Poll));
        assert_eq!(CommandId::from_u8(0xFE), None);
    }

    #[test]
    fn reply_ids_match_wire_values() {
        assert_eq!(ReplyId::Ack as u8, 0x40);
        assert_eq!(ReplyId::Xrd as u8, 0xB1);
        assert_eq!(ReplyId::from_u8(0x45), Some(ReplyId::Pdid));
    }

    #[test]
    fn out_roundtrip() {
        let cmd = CmdOutput {
            output_no: 2,
            control_code: 1,
            tmr_count: 0x1234,
        };
        let mut buf = [0u8; 4];
        let n = cmd.encode(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [2, 1, 0x34, 0x12]);
        assert_eq!(CmdOutput::decode(&buf).unwrap(), cmd);
    }

    #[test]
    fn led_roundtrip() {
        let cmd = CmdLed {
            reader: 0,
            led_no: 1,
            temporary: LedParams {
                control_code: 1,
                on_count: 10,
                off_count: 10,
                on_color: 1,
                off_color: 0,
                timer: 200,
            },
            permanent: LedPermParams {
                control_code: 0,
                on_count: 0,
                off_count: 0,
                on_color: 0,
                off_color: 0,
            },
        };
        let mut buf = [0u8; 13];
        let n = cmd.encode(&mut buf).unwrap();
        assert_eq!(n, 13);
        assert_eq!(CmdLed::decode(&buf).unwrap(), cmd);
    }

    #[test]
    fn text_rejects_oversized_length_field() {
        let mut cmd = CmdText::default();
        cmd.length = 255; // beyond TEXT_MAX_LEN
        let mut buf = [0u8; 64];
        assert_eq!(cmd.encode(&mut buf), Err(CodecError::FieldTooLong));
    }

    #[test]
    fn text_roundtrip() {
        let mut cmd = CmdText {
            reader: 0,
            cmd: 1,
            temp_time: 5,
            row: 1,
            col: 1,
            length: 5,
            data: [0; TEXT_MAX_LEN],
        };
        cmd.data[..5].copy_from_slice(b"hello");
        let mut buf = [0u8; 6 + TEXT_MAX_LEN];
        let n = cmd.encode(&mut buf).unwrap();
        assert_eq!(CmdText::decode(&buf[..n]).unwrap(), cmd);
    }

    #[test]
    fn pdid_roundtrip_matches_spec_vector() {
        // From the spec's ID/PDID scenario.
        let id = PdId {
            vendor_code: [0xA1, 0xA2, 0xA3],
            model: 0xB1,
            version: 0xC1,
            serial_number: [0xD1, 0xD2, 0xD3, 0xD4],
            firmware_version: [0xE1, 0xE2, 0xE3],
        };
        let mut buf = [0u8; 12];
        id.encode(&mut buf).unwrap();
        assert_eq!(
            buf,
            [0xA1, 0xA2, 0xA3, 0xB1, 0xC1, 0xD1, 0xD2, 0xD3, 0xD4, 0xE1, 0xE2, 0xE3]
        );
        assert_eq!(PdId::decode(&buf).unwrap(), id);
    }

    #[test]
    fn keyset_rejects_oversized_key() {
        let cmd = CmdKeyset {
            key_type: 1,
            length: 17,
            data: [0; KEYSET_MAX_LEN],
        };
        let mut buf = [0u8; 32];
        assert_eq!(cmd.encode(&mut buf), Err(CodecError::FieldTooLong));
    }

    #[test]
    fn pdcap_roundtrip() {
        let entries = [
            CapEntry {
                function_code: CAP_COMMUNICATION_SECURITY,
                compliance_level: 1,
                num_items: 1,
            },
            CapEntry {
                function_code: CAP_RECEIVE_BUFFERSIZE,
                compliance_level: 0,
                num_items: 1,
            },
        ];
        let mut buf = [0u8; 6];
        encode_pdcap(&entries, &mut buf).unwrap();
        let mut decoded = [CapEntry::default(); MAX_CAP_ENTRIES];
        let n = decode_pdcap(&buf, &mut decoded).unwrap();
        assert_eq!(n, 2);
        assert_eq!(decoded[0], entries[0]);
        assert_eq!(decoded[1], entries[1]);
    }

    #[test]
    fn file_transfer_fragment_roundtrip() {
        let data = b"0123456789abcde\n";
        let frag = FileTransferFragment {
            file_type: 1,
            size: 3200,
            offset: 0,
            data,
        };
        let mut buf = [0u8; 64];
        let n = frag.encode(&mut buf).unwrap();
        let decoded = FileTransferFragment::decode(&buf[..n]).unwrap();
        assert_eq!(decoded.size, 3200);
        assert_eq!(decoded.offset, 0);
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn ftstat_roundtrip_with_negative_status() {
        let stat = FtStat {
            control: 0,
            delay_ms: 50,
            status: FtStatusCode::Abort,
        };
        let mut buf = [0u8; 5];
        stat.encode(&mut buf).unwrap();
        let decoded = FtStat::decode(&buf).unwrap();
        assert_eq!(decoded.status.to_i16(), -1);
        assert!(decoded.status.is_error());
    }
}
