// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External collaborator interfaces (component J/§6): the byte channel, the
//! monotonic clock, and the file-transfer I/O hooks. The core never knows
//! how bytes reach the wire, never reads a wall clock directly, and never
//! touches a filesystem; it only calls through these traits.

/// A non-blocking byte transport, one instance per PD (or shared across PDs
/// on the same bus when `CHN_SHARED` is set).
pub trait Channel {
    /// Writes as much of `buf` as the transport can currently accept.
    /// Returns the number of bytes actually written; may be less than
    /// `buf.len()` (the PHY retries within the same tick).
    fn send(&mut self, buf: &[u8]) -> usize;

    /// Reads as many bytes as are currently available, up to `buf.len()`.
    /// Returns 0 if nothing is available. Never blocks.
    fn recv(&mut self, buf: &mut [u8]) -> usize;

    /// Discards any buffered, unread receive bytes. Called on PHY errors and
    /// immediately before a fresh send.
    fn flush(&mut self);
}

/// Monotonic wall clock, the sole source of timing for the cooperative
/// scheduler (§5).
pub trait Clock {
    /// Milliseconds since an arbitrary, fixed epoch. Must be monotonic
    /// non-decreasing across the life of a context.
    fn millis_now(&self) -> i64;
}

/// Per-PD file-transfer I/O hooks (§4.G), supplied only if the application
/// uses `FILETRANSFER`.
pub trait FileOps {
    /// Opens `file_id` for the transfer about to start. On the receiving
    /// side, `size` is an in/out parameter: the callee may adjust it to the
    /// final known size.
    fn open(&mut self, file_id: i32, size: &mut u32) -> Result<(), ()>;

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read.
    fn read(&mut self, buf: &mut [u8], offset: u32) -> Result<usize, ()>;

    /// Writes `buf` at `offset`.
    fn write(&mut self, buf: &[u8], offset: u32) -> Result<(), ()>;

    /// Closes the file at the end of (or upon cancellation of) a transfer.
    fn close(&mut self) -> Result<(), ()>;
}
